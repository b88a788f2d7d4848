//! Frame cycle: Update → Collision → Cleanup → Snapshot
//!
//! A single self-requeuing transition job stages each phase's job set into
//! the scheduler's buffer and then blocks in
//! [`SchedulerHandle::advance_phase`] until the running phase drains. The
//! driver thread (whoever calls [`Simulation::step`]) holds one share of the
//! phase counter in every phase but Update, which is where it does its own
//! single-threaded work: applying active-set changes during cleanup and
//! publishing the next frame's delta time during snapshot.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::Backoff;

use super::entity::EntitySnapshot;
use super::world::World;
use crate::error::SimError;
use crate::jobs::{Declaration, Job, Priority, Scheduler};
use crate::settings::SimConfig;

/// Stages of one frame, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Update,
    Collision,
    Cleanup,
    Snapshot,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Update, Phase::Collision, Phase::Cleanup, Phase::Snapshot];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the driver thread holds a share of this phase's counter
    pub fn includes_driver(self) -> bool {
        !matches!(self, Phase::Update)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Update => "update",
            Phase::Collision => "collision",
            Phase::Cleanup => "cleanup",
            Phase::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The fixed job declarations for one phase
pub struct PhaseSet {
    pub phase: Phase,
    pub jobs: Vec<Declaration>,
}

impl PhaseSet {
    /// `slices` declarations of `work`, each counted by the world's phase counter
    fn sliced(world: &Arc<World>, phase: Phase, slices: usize, work: fn(&World, usize, usize)) -> Self {
        let weak = Arc::downgrade(world);
        let task: Arc<dyn Job> = Arc::new(move |index: usize| {
            if let Some(world) = weak.upgrade() {
                work(&world, index, slices);
            }
        });
        let jobs = (0..slices)
            .map(|i| Declaration::new(Arc::clone(&task), i).with_counter(Arc::clone(world.phase_counter())))
            .collect();
        Self { phase, jobs }
    }

    fn build_all(world: &Arc<World>) -> [PhaseSet; 4] {
        let slices = world.config().worker_threads;
        [
            Self::sliced(world, Phase::Update, slices, World::update_slice),
            Self::sliced(world, Phase::Collision, slices, World::collide_slice),
            Self::sliced(world, Phase::Cleanup, 1, |world, _, _| world.grid().clear_completed()),
            Self::sliced(world, Phase::Snapshot, slices, World::snapshot_slice),
        ]
    }
}

/// The job that perpetually stages the next phase
struct PhaseTransition {
    me: Weak<PhaseTransition>,
    world: Weak<World>,
    sets: [PhaseSet; 4],
    next: AtomicUsize,
}

impl PhaseTransition {
    fn new(world: &Arc<World>) -> Arc<Self> {
        let sets = PhaseSet::build_all(world);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            world: Arc::downgrade(world),
            sets,
            next: AtomicUsize::new(0),
        })
    }

    fn declaration(self: &Arc<Self>) -> Declaration {
        let task: Arc<dyn Job> = Arc::clone(self) as Arc<dyn Job>;
        Declaration::new(task, 0).with_priority(Priority::Critical)
    }
}

impl Job for PhaseTransition {
    fn run(&self, _param: usize) {
        let (Some(me), Some(world)) = (self.me.upgrade(), self.world.upgrade()) else {
            return;
        };
        let set = &self.sets[self.next.fetch_add(1, Ordering::AcqRel) % Phase::ALL.len()];
        let scheduler = world.scheduler();

        scheduler.submit_batch_to_next_phase(
            set.jobs
                .iter()
                .cloned()
                .chain(std::iter::once(me.declaration())),
        );
        if !scheduler.advance_phase(world.phase_counter(), set.phase.includes_driver()) {
            log::debug!("Transition into {} abandoned at shutdown", set.phase);
        }
    }
}

/// Owns the scheduler and world and drives frames from the calling thread
pub struct Simulation {
    world: Arc<World>,
    scheduler: Scheduler,
    frame: u64,
    running: bool,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let scheduler = Scheduler::new(config.worker_threads)?;
        let world = World::new(config, scheduler.handle())?;
        Ok(Self {
            world,
            scheduler,
            frame: 0,
            running: false,
        })
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Frames fully driven so far
    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Register upkeep, publish queued entities and launch the first update
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;

        let weak = Arc::downgrade(&self.world);
        self.scheduler.add_upkeep(Declaration::from_fn(
            move |_| {
                if let Some(world) = weak.upgrade() {
                    world.pools().maintain_next();
                }
            },
            0,
        ));

        self.world.apply_pending_changes();
        self.world.begin_frame(0, self.world.dt());

        let transition = PhaseTransition::new(&self.world);
        let counter = self.world.phase_counter();
        counter.set(1);
        self.scheduler.submit(transition.declaration());
        counter.decrement();

        log::info!(
            "Simulation started: {} entities, {} workers",
            self.world.active_count(),
            self.scheduler.worker_count()
        );
    }

    /// Finish the current frame and launch the next one with `dt`
    ///
    /// Returns once the next frame's update phase is running; snapshots are
    /// stable until the following call. Returns false after shutdown.
    pub fn step(&mut self, dt: f32) -> bool {
        if !self.running {
            if self.scheduler.is_shutdown() {
                return false;
            }
            self.start();
        }

        let world = Arc::clone(&self.world);
        let next = self.frame + 1;
        let completed = self.arrive(Phase::Collision, || {})
            && self.arrive(Phase::Cleanup, || {
                world.apply_pending_changes();
            })
            && self.arrive(Phase::Snapshot, || world.begin_frame(next, dt));
        if !completed {
            self.running = false;
            return false;
        }
        self.frame = next;
        true
    }

    /// Step `frames` times with a fixed `dt`; returns the frames completed
    pub fn run_frames(&mut self, frames: u64, dt: f32) -> u64 {
        let mut done = 0;
        while done < frames && self.step(dt) {
            done += 1;
        }
        done
    }

    /// Last captured state of every active entity
    pub fn snapshot(&self) -> Vec<EntitySnapshot> {
        self.world.snapshots()
    }

    /// Stop the workers; the in-flight update phase finishes first
    pub fn stop(&mut self) {
        if self.scheduler.is_shutdown() {
            return;
        }
        self.scheduler.shutdown();
        self.running = false;
        log::info!("Simulation stopped after {} frames", self.frame);
    }

    /// Wait for `phase` of the current frame to reach the driver's share,
    /// run `work`, then release the barrier
    fn arrive(&self, phase: Phase, work: impl FnOnce()) -> bool {
        let expected = self.frame * Phase::ALL.len() as u64 + phase.index() as u64 + 1;
        let counter = self.world.phase_counter();
        let backoff = Backoff::new();
        loop {
            if self.scheduler.is_shutdown() {
                return false;
            }
            let transitions = self.scheduler.transitions();
            debug_assert!(transitions <= expected, "phase ran ahead of the driver");
            if transitions == expected && counter.is_at(1) && self.scheduler.has_buffered_work() {
                break;
            }
            backoff.snooze();
        }
        work();
        counter.decrement();
        true
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::collider::Collider;
    use crate::sim::entity::{Behavior, Contact, EntityPrototype, EntityState, Inert};
    use crate::sim::shape::{Shape, Transform};
    use crate::sim::world::EntityCtx;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;

    const DT: f32 = 1.0 / 60.0;

    fn config() -> SimConfig {
        SimConfig {
            worker_threads: 3,
            max_entities: 256,
            ..Default::default()
        }
    }

    /// Counts updates and records the frame of each collision
    struct Recorder {
        updates: Arc<AtomicU64>,
        contacts: Arc<Mutex<Vec<u64>>>,
    }

    impl Behavior for Recorder {
        fn update(&mut self, _ctx: &EntityCtx<'_>, _transform: &mut Transform, _dt: f32) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_collision(&mut self, ctx: &EntityCtx<'_>, _contact: &Contact) {
            self.contacts.lock().push(ctx.frame());
        }
    }

    fn recorder(sim: &Simulation, shape: Shape, at: Transform, self_tags: u16, other_tags: u16) -> Recorder {
        let updates = Arc::new(AtomicU64::new(0));
        let contacts = Arc::new(Mutex::new(Vec::new()));
        sim.world()
            .spawn_entity(EntityState {
                transform: at,
                collider: Some(Collider::new(shape, self_tags, other_tags)),
                behavior: Box::new(Recorder {
                    updates: Arc::clone(&updates),
                    contacts: Arc::clone(&contacts),
                }),
            })
            .unwrap();
        Recorder { updates, contacts }
    }

    #[test]
    fn test_phase_order_and_driver_flags() {
        assert_eq!(Phase::ALL.map(Phase::index), [0, 1, 2, 3]);
        assert!(!Phase::Update.includes_driver());
        assert!(Phase::Collision.includes_driver());
        assert!(Phase::Cleanup.includes_driver());
        assert!(Phase::Snapshot.includes_driver());
    }

    #[test]
    fn test_rejects_single_worker() {
        let config = SimConfig {
            worker_threads: 1,
            ..Default::default()
        };
        assert!(matches!(Simulation::new(config), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn test_each_step_updates_every_entity_once() {
        let mut sim = Simulation::new(config()).unwrap();
        let probes: Vec<_> = (0..10)
            .map(|i| recorder(&sim, Shape::circle(2.0), Transform::at(30.0 + 60.0 * i as f32, 30.0), 0b10, 0))
            .collect();

        assert_eq!(sim.run_frames(20, DT), 20);
        assert_eq!(sim.frames(), 20);
        assert_eq!(sim.world().frame(), 20);
        sim.stop();

        for probe in probes {
            let updates = probe.updates.load(Ordering::SeqCst);
            // Frame 20's update may or may not have run before the stop
            assert!((20..=21).contains(&updates), "{updates} updates");
        }
    }

    #[test]
    fn test_single_cell_pair_handled_once_per_frame() {
        let mut sim = Simulation::new(config()).unwrap();
        let a = recorder(&sim, Shape::circle(5.0), Transform::at(100.0, 100.0), 0b1000, 0b0100);
        let b = recorder(&sim, Shape::circle(5.0), Transform::at(106.0, 100.0), 0b0100, 0b1000);

        sim.run_frames(50, DT);
        sim.stop();

        let expected: Vec<u64> = (0..50).collect();
        assert_eq!(*a.contacts.lock(), expected);
        assert_eq!(*b.contacts.lock(), expected);
    }

    #[test]
    fn test_multi_cell_pair_handled_once_per_frame() {
        let mut sim = Simulation::new(config()).unwrap();
        // Cells are 66.7 wide; both boxes cover cells (1..=2, 1..=2)
        let a = recorder(&sim, Shape::rect(50.0, 50.0), Transform::at(133.0, 133.0), 0b1000, 0b0100);
        let b = recorder(&sim, Shape::rect(50.0, 50.0), Transform::at(140.0, 140.0), 0b0100, 0b1000);

        sim.run_frames(50, DT);
        let grid = sim.world().grid();
        assert_eq!(grid.occupied_slots(), 8);
        sim.stop();

        let expected: Vec<u64> = (0..50).collect();
        assert_eq!(*a.contacts.lock(), expected);
        assert_eq!(*b.contacts.lock(), expected);
    }

    /// Hops between two cells every frame and checks contact generations
    struct Hopper {
        offset: f32,
        hits: Arc<AtomicU64>,
        stale: Arc<AtomicU64>,
    }

    impl Behavior for Hopper {
        fn update(&mut self, ctx: &EntityCtx<'_>, transform: &mut Transform, _dt: f32) {
            let x = if ctx.frame() % 2 == 0 { 100.0 } else { 300.0 };
            transform.position.x = x + self.offset;
        }

        fn handle_collision(&mut self, ctx: &EntityCtx<'_>, contact: &Contact) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if contact.generation != ctx.frame() {
                self.stale.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_collision_always_sees_this_frames_inserts() {
        let mut sim = Simulation::new(config()).unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        let stale = Arc::new(AtomicU64::new(0));
        for (offset, self_tags, other_tags) in [(0.0, 0b1000, 0b0100), (3.0, 0b0100, 0b1000)] {
            sim.world()
                .spawn_entity(EntityState {
                    transform: Transform::at(100.0 + offset, 100.0),
                    collider: Some(Collider::new(Shape::circle(4.0), self_tags, other_tags)),
                    behavior: Box::new(Hopper {
                        offset,
                        hits: Arc::clone(&hits),
                        stale: Arc::clone(&stale),
                    }),
                })
                .unwrap();
        }

        assert_eq!(sim.run_frames(1_000, DT), 1_000);
        sim.stop();

        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2_000);
    }

    /// Retires itself on any contact
    struct Fragile;

    impl Behavior for Fragile {
        fn update(&mut self, _ctx: &EntityCtx<'_>, _transform: &mut Transform, _dt: f32) {}

        fn handle_collision(&mut self, ctx: &EntityCtx<'_>, _contact: &Contact) {
            ctx.retire();
        }
    }

    #[test]
    fn test_retired_from_collision_returns_to_pool() {
        let mut sim = Simulation::new(config()).unwrap();
        let pool = sim
            .world()
            .create_pool(
                "fragile",
                EntityPrototype::new(Shape::circle(5.0), 0b1000, 0b0100, || Box::new(Fragile)),
                None,
            )
            .unwrap();
        let rock = sim
            .world()
            .request_pooled_entity("fragile", Transform::at(100.0, 100.0))
            .unwrap();
        let wall = recorder(&sim, Shape::rect(10.0, 10.0), Transform::at(108.0, 100.0), 0b0100, 0b1000);

        sim.run_frames(3, DT);
        assert!(!rock.is_active());
        assert_eq!(sim.world().active_count(), 1);
        assert_eq!(*wall.contacts.lock(), vec![0]);
        assert!(pool.total_count() > 0);
    }

    /// Leaves through the delayed path once past `frame`
    struct Expiring {
        frame: u64,
    }

    impl Behavior for Expiring {
        fn update(&mut self, ctx: &EntityCtx<'_>, _transform: &mut Transform, _dt: f32) {
            if ctx.frame() >= self.frame {
                ctx.retire_delayed();
            }
        }
    }

    #[test]
    fn test_retire_delayed_frees_arena_slot() {
        let mut sim = Simulation::new(config()).unwrap();
        let entity = sim
            .world()
            .spawn_entity(EntityState {
                transform: Transform::at(50.0, 50.0),
                collider: None,
                behavior: Box::new(Expiring { frame: 2 }),
            })
            .unwrap();
        let id = entity.id();

        sim.run_frames(2, DT);
        assert_eq!(sim.world().active_count(), 1);
        sim.run_frames(1, DT);
        assert_eq!(sim.world().active_count(), 0);
        assert!(sim.world().arena().get(id).is_none());
        assert!(!entity.is_active());
    }

    #[test]
    fn test_next_phase_jobs_hold_the_barrier() {
        let mut sim = Simulation::new(config()).unwrap();
        let ran = Arc::new(AtomicU64::new(0));
        sim.start();
        let counted = Arc::clone(&ran);
        sim.world().submit_job_next_phase(Declaration::from_fn(
            move |_| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                counted.fetch_add(1, Ordering::SeqCst);
            },
            0,
        ));
        // The frame cannot finish before the slow job does
        assert!(sim.step(DT));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_unblocks_step() {
        let mut sim = Simulation::new(config()).unwrap();
        sim.run_frames(2, DT);
        sim.stop();
        assert!(!sim.step(DT));
        assert_eq!(sim.run_frames(5, DT), 0);
        assert_eq!(sim.frames(), 2);
    }

    #[test]
    fn test_pooled_spawn_joins_after_cleanup() {
        let mut sim = Simulation::new(config()).unwrap();
        sim.world()
            .create_pool(
                "dust",
                EntityPrototype::new(Shape::circle(1.0), 0b10, 0, || Box::new(Inert)),
                None,
            )
            .unwrap();
        sim.start();
        let dust = sim.world().request_pooled_entity("dust", Transform::at(5.0, 5.0)).unwrap();
        assert!(dust.is_active());
        assert_eq!(sim.world().active_count(), 0);
        sim.step(DT);
        assert_eq!(sim.world().active_ids(), vec![dust.id()]);
        assert_eq!(sim.snapshot().len(), 1);
    }
}
