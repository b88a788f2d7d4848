//! Shared simulation context
//!
//! Owns the entity arena, the collision grid, the object pools and the
//! active set. Phase jobs capture an `Arc<World>`; behaviour hooks receive an
//! [`EntityCtx`] borrowing it.
//!
//! The active set is only written by the driver during cleanup. Everything
//! else queues additions and removals on lock-free queues.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use parking_lot::RwLock;

use super::entity::{
    Entity, EntityArena, EntityFactory, EntityHandle, EntityId, EntityPrototype, EntitySnapshot,
    EntityState,
};
use super::grid::{CollisionGrid, SlotId};
use super::phase_box::CellMetrics;
use super::shape::Transform;
use crate::error::{GridError, SimError};
use crate::jobs::{Counter, Declaration, Job, Priority, SchedulerHandle};
use crate::pool::{ObjectPool, PoolManager, Poolable};
use crate::settings::{PoolConfig, SimConfig};

/// Running totals, readable from any thread
#[derive(Debug, Default)]
pub struct WorldStats {
    pub contacts: AtomicU64,
    pub grid_faults: AtomicU64,
    pub retired: AtomicU64,
    pub spawned: AtomicU64,
}

pub struct World {
    config: SimConfig,
    metrics: CellMetrics,
    arena: Arc<EntityArena>,
    grid: CollisionGrid,
    pools: PoolManager<EntityHandle>,
    scheduler: SchedulerHandle,
    phase_counter: Arc<Counter>,
    active: RwLock<Vec<EntityHandle>>,
    pending_add: SegQueue<EntityHandle>,
    pending_remove: SegQueue<EntityId>,
    frame: AtomicU64,
    // f32 bits
    dt: AtomicU32,
    retire_job: Arc<dyn Job>,
    stats: WorldStats,
}

impl World {
    pub fn new(config: SimConfig, scheduler: SchedulerHandle) -> Result<Arc<Self>, SimError> {
        config.validate()?;
        let grid = CollisionGrid::from_config(&config)?;
        let arena = Arc::new(EntityArena::new(config.max_entities));
        let metrics = CellMetrics::from_config(&config);
        let dt = config.max_delta_time;

        Ok(Arc::new_cyclic(|weak: &Weak<World>| {
            let weak = weak.clone();
            let retire_job: Arc<dyn Job> = Arc::new(move |param: usize| {
                if let Some(world) = weak.upgrade() {
                    world.finish_retire(EntityId(param as u32));
                }
            });
            Self {
                config,
                metrics,
                arena,
                grid,
                pools: PoolManager::new(),
                scheduler,
                phase_counter: Arc::new(Counter::new(0)),
                active: RwLock::new(Vec::new()),
                pending_add: SegQueue::new(),
                pending_remove: SegQueue::new(),
                frame: AtomicU64::new(0),
                dt: AtomicU32::new(dt.to_bits()),
                retire_job,
                stats: WorldStats::default(),
            }
        }))
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CellMetrics {
        &self.metrics
    }

    pub fn arena(&self) -> &EntityArena {
        &self.arena
    }

    pub fn grid(&self) -> &CollisionGrid {
        &self.grid
    }

    pub fn pools(&self) -> &PoolManager<EntityHandle> {
        &self.pools
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn stats(&self) -> &WorldStats {
        &self.stats
    }

    pub(crate) fn phase_counter(&self) -> &Arc<Counter> {
        &self.phase_counter
    }

    /// Frame currently being updated
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn dt(&self) -> f32 {
        f32::from_bits(self.dt.load(Ordering::Acquire))
    }

    // === Entities ===

    /// Register a pool of entities built from `prototype`
    pub fn create_pool(
        &self,
        name: &str,
        prototype: EntityPrototype,
        config: Option<&PoolConfig>,
    ) -> Result<Arc<ObjectPool<EntityHandle>>, SimError> {
        let factory = EntityFactory::new(Arc::clone(&self.arena), prototype);
        self.pools
            .create_pool(name, Box::new(factory), config.unwrap_or(&self.config.pool))
    }

    /// Create a non-pooled entity; it joins the active set at the next cleanup
    pub fn spawn_entity(&self, state: EntityState) -> Result<EntityHandle, SimError> {
        let handle = self.arena.spawn(|id| Entity::new(id, state))?;
        handle.capture_snapshot();
        handle.activate();
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.pending_add.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Take an entity from a named pool and place it at `transform`
    pub fn request_pooled_entity(&self, pool: &str, transform: Transform) -> Result<EntityHandle, SimError> {
        let pool = self
            .pools
            .by_name(pool)
            .ok_or_else(|| SimError::UnknownPool(pool.to_string()))?;
        let handle = pool.acquire()?;
        handle.bind_pool(pool.id());
        {
            let mut state = handle.lock();
            state.transform = transform;
            state.behavior.reinitialise(&transform);
        }
        handle.capture_snapshot();
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.pending_add.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Pull an entity out of the grid and hand it back to its pool (or free
    /// its arena slot if it was not pooled)
    pub fn return_to_pool(&self, handle: EntityHandle) {
        if let Some(collider) = handle.lock().collider.as_mut() {
            collider.clear_from_grid(&self.grid);
        }
        let id = handle.id();
        match handle.pool() {
            Some(pool) => self.pools.release(pool, handle),
            None => {
                handle.deactivate();
                self.arena.retire(id);
            }
        }
        self.pending_remove.push(id);
        self.stats.retired.fetch_add(1, Ordering::Relaxed);
    }

    /// Schedule cleanup of `id` in the next phase (use from collision handlers)
    pub fn retire(&self, id: EntityId) {
        if let Some(decl) = self.retire_declaration(id) {
            self.scheduler.submit_to_next_phase(decl);
        }
    }

    /// Schedule cleanup of `id` two phases out (use from update hooks)
    pub fn retire_delayed(&self, id: EntityId) {
        if let Some(decl) = self.retire_declaration(id) {
            self.scheduler.submit_delayed(decl);
        }
    }

    fn retire_declaration(&self, id: EntityId) -> Option<Declaration> {
        let entity = self.arena.get(id)?;
        if !entity.is_active() || !entity.mark_retiring() {
            return None;
        }
        Some(
            Declaration::new(Arc::clone(&self.retire_job), id.0 as usize)
                .with_priority(Priority::High)
                .with_counter(Arc::clone(&self.phase_counter)),
        )
    }

    fn finish_retire(&self, id: EntityId) {
        match self.arena.get(id) {
            Some(handle) if handle.is_active() => self.return_to_pool(handle),
            _ => log::debug!("Entity {id} already gone at cleanup"),
        }
    }

    // === Grid ===

    pub fn register_entity_in_grid(
        &self,
        id: EntityId,
        x: u32,
        y: u32,
        self_tags: u16,
        other_tags: u16,
    ) -> Result<SlotId, GridError> {
        self.grid.insert(id, x, y, self_tags, other_tags)
    }

    pub fn unregister_entity_from_grid(&self, slot: SlotId, x: u32, y: u32) {
        self.grid.remove(slot, x, y)
    }

    // === Jobs ===

    /// Run a job in the current phase (not counted by the phase barrier)
    pub fn submit_job(&self, decl: Declaration) {
        self.scheduler.submit(decl);
    }

    /// Run a job in the next phase; the phase barrier waits for it
    pub fn submit_job_next_phase(&self, decl: Declaration) {
        self.scheduler
            .submit_to_next_phase(decl.with_counter(Arc::clone(&self.phase_counter)));
    }

    /// Run a job two phases out; the phase barrier waits for it
    pub fn submit_job_delayed(&self, decl: Declaration) {
        self.scheduler
            .submit_delayed(decl.with_counter(Arc::clone(&self.phase_counter)));
    }

    // === Phase work ===

    /// Update slice `index` of `slices`
    pub(crate) fn update_slice(&self, index: usize, slices: usize) {
        let active = self.active.read();
        let range = slice_range(active.len(), index, slices);
        let dt = self.dt();
        for entity in &active[range] {
            if !entity.is_active() {
                continue;
            }
            let mut guard = entity.lock();
            if !entity.is_active() {
                continue;
            }
            let state = &mut *guard;
            let ctx = EntityCtx::new(self, entity.id());
            state.behavior.update(&ctx, &mut state.transform, dt);
            if let Some(collider) = state.collider.as_mut() {
                let result = collider.update_in_grid(
                    &self.grid,
                    entity.id(),
                    &state.transform,
                    &self.metrics,
                    self.config.movement_epsilon,
                );
                if result.is_err() {
                    self.stats.grid_faults.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Resolve collisions in cell range `index` of `slices`
    pub(crate) fn collide_slice(&self, index: usize, slices: usize) {
        let range = slice_range(self.grid.cell_count(), index, slices);
        let hits = self.grid.resolve_cell_range(self, range);
        self.stats.contacts.fetch_add(hits as u64, Ordering::Relaxed);
    }

    /// Capture snapshots for slice `index` of `slices`
    pub(crate) fn snapshot_slice(&self, index: usize, slices: usize) {
        let active = self.active.read();
        let range = slice_range(active.len(), index, slices);
        for entity in &active[range] {
            entity.capture_snapshot();
        }
    }

    /// Apply queued removals then additions; driver only, during cleanup
    pub(crate) fn apply_pending_changes(&self) -> bool {
        let mut removed = HashSet::new();
        while let Some(id) = self.pending_remove.pop() {
            removed.insert(id);
        }
        let mut added = Vec::new();
        while let Some(handle) = self.pending_add.pop() {
            added.push(handle);
        }
        if removed.is_empty() && added.is_empty() {
            return false;
        }

        let mut active = self.active.write();
        active.retain(|e| !removed.contains(&e.id()));
        active.extend(added.into_iter().filter(|e| e.is_active()));
        active.sort_by_key(|e| e.id());
        active.dedup_by_key(|e| e.id());
        log::debug!(
            "Active set now {} entities ({} removed)",
            active.len(),
            removed.len()
        );
        true
    }

    /// Publish the next frame's number and delta time; driver only
    pub(crate) fn begin_frame(&self, frame: u64, dt: f32) {
        let dt = dt.clamp(0.0, self.config.max_delta_time);
        self.dt.store(dt.to_bits(), Ordering::Release);
        self.frame.store(frame, Ordering::Release);
        self.grid.set_generation(frame);
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn active_ids(&self) -> Vec<EntityId> {
        self.active.read().iter().map(|e| e.id()).collect()
    }

    /// Last captured snapshot of every active entity
    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.active
            .read()
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.snapshot())
            .collect()
    }
}

/// Contiguous share `index` of `len` items split `slices` ways
pub(crate) fn slice_range(len: usize, index: usize, slices: usize) -> Range<usize> {
    let slices = slices.max(1);
    let start = len * index / slices;
    let end = len * (index + 1) / slices;
    start.min(len)..end.min(len)
}

/// Handle passed to behaviour hooks
#[derive(Clone, Copy)]
pub struct EntityCtx<'a> {
    world: &'a World,
    id: EntityId,
}

impl<'a> EntityCtx<'a> {
    pub fn new(world: &'a World, id: EntityId) -> Self {
        Self { world, id }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn world(&self) -> &'a World {
        self.world
    }

    pub fn frame(&self) -> u64 {
        self.world.frame()
    }

    pub fn config(&self) -> &'a SimConfig {
        &self.world.config
    }

    /// Retire this entity at the next phase (collision handlers)
    pub fn retire(&self) {
        self.world.retire(self.id);
    }

    /// Retire this entity two phases out (update hooks)
    pub fn retire_delayed(&self) {
        self.world.retire_delayed(self.id);
    }

    pub fn spawn(&self, pool: &str, transform: Transform) -> Result<EntityHandle, SimError> {
        self.world.request_pooled_entity(pool, transform)
    }
}
