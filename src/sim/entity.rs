//! Entities, their behaviour hooks and the id-indexed arena
//!
//! An entity is shared as an [`EntityHandle`] (`Arc<Entity>`). Everything the
//! worker threads mutate lives behind the entity's state mutex; the activity
//! flag is an atomic so stale grid nodes can be rejected without locking.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;

use super::collider::Collider;
use super::shape::{Shape, Transform};
use super::world::EntityCtx;
use crate::error::SimError;
use crate::pool::{FreeList, PoolId, PoolSource, Poolable};

/// Stable entity identifier; 0 marks a dead grid node and is never issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityId(pub u32);

impl EntityId {
    pub const NONE: EntityId = EntityId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a collision handler learns about the other party
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub other: EntityId,
    /// The other entity's self tags
    pub other_tags: u16,
    /// Grid generation of the older of the two registrations
    pub generation: u64,
}

/// Gameplay hooks supplied by the game
pub trait Behavior: Send {
    /// Advance one frame; runs in the update phase
    fn update(&mut self, ctx: &EntityCtx<'_>, transform: &mut Transform, dt: f32);

    /// Called once per colliding pair per frame; runs in the collision phase
    fn handle_collision(&mut self, _ctx: &EntityCtx<'_>, _contact: &Contact) {}

    /// Reset per-use state when handed out of a pool
    fn reinitialise(&mut self, _transform: &Transform) {}
}

/// Behaviour for things that never move on their own
#[derive(Debug, Default)]
pub struct Inert;

impl Behavior for Inert {
    fn update(&mut self, _ctx: &EntityCtx<'_>, _transform: &mut Transform, _dt: f32) {}
}

pub struct EntityState {
    pub transform: Transform,
    pub collider: Option<Collider>,
    pub behavior: Box<dyn Behavior>,
}

/// Renderable state captured in the snapshot phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub position: [f32; 2],
    pub rotation: f32,
    pub tags: u16,
}

pub struct Entity {
    id: EntityId,
    active: AtomicBool,
    retiring: AtomicBool,
    pool: OnceLock<PoolId>,
    state: Mutex<EntityState>,
    snapshot: Mutex<EntitySnapshot>,
}

pub type EntityHandle = Arc<Entity>;

impl Entity {
    /// New entities start inactive
    pub fn new(id: EntityId, state: EntityState) -> Self {
        let snapshot = snapshot_of(id, &state);
        Self {
            id,
            active: AtomicBool::new(false),
            retiring: AtomicBool::new(false),
            pool: OnceLock::new(),
            state: Mutex::new(state),
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Pool this entity returns to, if any
    pub fn pool(&self) -> Option<PoolId> {
        self.pool.get().copied()
    }

    pub(crate) fn bind_pool(&self, id: PoolId) {
        if let Some(existing) = self.pool.get() {
            debug_assert_eq!(*existing, id, "entity moved between pools");
            return;
        }
        let _ = self.pool.set(id);
    }

    /// Claim the right to schedule this entity's cleanup; false if already claimed
    pub(crate) fn mark_retiring(&self) -> bool {
        !self.retiring.swap(true, Ordering::AcqRel)
    }

    pub fn lock(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        *self.snapshot.lock()
    }

    pub(crate) fn capture_snapshot(&self) {
        let snap = snapshot_of(self.id, &self.state.lock());
        *self.snapshot.lock() = snap;
    }
}

fn snapshot_of(id: EntityId, state: &EntityState) -> EntitySnapshot {
    EntitySnapshot {
        id,
        position: state.transform.position.to_array(),
        rotation: state.transform.rotation,
        tags: state.collider.as_ref().map_or(0, |c| c.self_tags()),
    }
}

impl Poolable for Entity {
    fn activate(&self) {
        self.retiring.store(false, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("pool", &self.pool())
            .finish()
    }
}

/// Lock two entities in ascending id order, returning guards in argument order
///
/// Every code path that holds two entity locks goes through here.
pub fn lock_pair_ordered<'a>(
    a: &'a Entity,
    b: &'a Entity,
) -> (MutexGuard<'a, EntityState>, MutexGuard<'a, EntityState>) {
    debug_assert_ne!(a.id, b.id, "entity paired with itself");
    if a.id < b.id {
        let ga = a.state.lock();
        let gb = b.state.lock();
        (ga, gb)
    } else {
        let gb = b.state.lock();
        let ga = a.state.lock();
        (ga, gb)
    }
}

/// Builds a fresh behaviour for each manufactured entity
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn Behavior> + Send + Sync>;

/// Template for the entities of one pool
#[derive(Clone)]
pub struct EntityPrototype {
    pub shape: Shape,
    pub self_tags: u16,
    pub other_tags: u16,
    pub behavior: BehaviorFactory,
}

impl EntityPrototype {
    pub fn new<F>(shape: Shape, self_tags: u16, other_tags: u16, behavior: F) -> Self
    where
        F: Fn() -> Box<dyn Behavior> + Send + Sync + 'static,
    {
        Self {
            shape,
            self_tags,
            other_tags,
            behavior: Arc::new(behavior),
        }
    }

    pub fn instantiate(&self, id: EntityId, transform: Transform) -> Entity {
        Entity::new(
            id,
            EntityState {
                transform,
                collider: Some(Collider::new(self.shape.clone(), self.self_tags, self.other_tags)),
                behavior: (self.behavior)(),
            },
        )
    }
}

/// Pool source that registers each new entity in the arena
pub struct EntityFactory {
    arena: Arc<EntityArena>,
    prototype: EntityPrototype,
}

impl EntityFactory {
    pub fn new(arena: Arc<EntityArena>, prototype: EntityPrototype) -> Self {
        Self { arena, prototype }
    }
}

impl PoolSource<EntityHandle> for EntityFactory {
    fn manufacture(&self) -> Result<EntityHandle, SimError> {
        self.arena
            .spawn(|id| self.prototype.instantiate(id, Transform::default()))
    }

    fn discard(&self, item: EntityHandle) {
        self.arena.retire(item.id());
    }
}

/// Fixed-capacity id → entity table
pub struct EntityArena {
    slots: Box<[RwLock<Option<EntityHandle>>]>,
    next: AtomicU32,
    recycled: FreeList<EntityId>,
    live: AtomicUsize,
}

impl EntityArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
            next: AtomicU32::new(1),
            recycled: FreeList::new(),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate an id and store the entity built for it
    pub fn spawn(&self, build: impl FnOnce(EntityId) -> Entity) -> Result<EntityHandle, SimError> {
        let id = match self.recycled.pop() {
            Some(id) => id,
            None => {
                let capacity = self.capacity() as u32;
                let raw = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n <= capacity).then_some(n + 1)
                    })
                    .map_err(|_| {
                        log::error!("Entity arena full ({capacity} entities)");
                        SimError::ArenaFull {
                            capacity: capacity as usize,
                        }
                    })?;
                EntityId(raw)
            }
        };

        let handle = Arc::new(build(id));
        debug_assert_eq!(handle.id(), id, "entity built with a foreign id");
        *self.slots[Self::index(id)].write() = Some(Arc::clone(&handle));
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    pub fn get(&self, id: EntityId) -> Option<EntityHandle> {
        if id.is_none() {
            return None;
        }
        self.slots.get(Self::index(id))?.read().clone()
    }

    /// Drop the arena's reference and recycle the id
    pub fn retire(&self, id: EntityId) -> Option<EntityHandle> {
        if id.is_none() {
            return None;
        }
        let handle = self.slots.get(Self::index(id))?.write().take()?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.recycled.push(id);
        Some(handle)
    }

    fn index(id: EntityId) -> usize {
        id.0 as usize - 1
    }
}
