//! Demo gameplay on top of the simulation core
//!
//! Asteroids drift and wrap, split into two smaller ones when a projectile
//! hits them, and are fed in from off screen by a spawner entity. A ship on
//! autopilot spins in place and fires. Nothing here is needed by the core;
//! it exists so the headless binary and the integration tests have a
//! realistic workload.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::Serialize;

use crate::error::SimError;
use crate::{heading_to_dir, normalize_angle};
use crate::settings::PoolConfig;
use crate::sim::{
    Behavior, Collider, Contact, EntityCtx, EntityHandle, EntityPrototype, EntityState, Shape,
    Transform, World,
};

// === Collision tags ===

pub const SHIP_SELF_TAGS: u16 = 0x8000;
pub const SHIP_OTHER_TAGS: u16 = 0x4000;
pub const PROJECTILE_SELF_TAGS: u16 = 0x9000;
pub const PROJECTILE_OTHER_TAGS: u16 = 0x6000;
pub const ASTEROID_SELF_TAGS: u16 = 0x6000;
pub const ASTEROID_OTHER_TAGS: u16 = 0x9000;
/// Carried by anything that breaks asteroids apart
pub const DAMAGE_TAG: u16 = 0x1000;

// === Pools ===

pub const ASTEROID_LARGE_POOL: &str = "asteroid_large";
pub const ASTEROID_MEDIUM_POOL: &str = "asteroid_medium";
pub const ASTEROID_SMALL_POOL: &str = "asteroid_small";
pub const PROJECTILE_POOL: &str = "projectile";

// === Tuning ===

pub const PROJECTILE_SPEED: f32 = 500.0;
pub const PROJECTILE_RADIUS: f32 = 3.0;
/// Projectiles this close to the edge are removed instead of wrapping
pub const SCREEN_MARGIN: f32 = 5.0;
pub const ASTEROID_SPIN: f32 = 40.0 * std::f32::consts::PI / 180.0;
/// Seconds before a fresh asteroid starts wrapping (it spawns off screen)
pub const ASTEROID_WRAP_DELAY: f32 = 3.0;
pub const ASTEROID_SCORE: u64 = 10;
pub const SHIP_TURN_RATE: f32 = 170.0 * std::f32::consts::PI / 180.0;
pub const SHIP_FIRE_COOLDOWN: f32 = 0.25;
pub const SHIP_LIVES: i32 = 3;
pub const SHIP_INVULNERABLE_TIME: f32 = 3.0;
pub const SPAWN_COOLDOWN: f32 = 3.0;

/// Shared counters the demo behaviours report into
#[derive(Debug, Default)]
pub struct ArcadeStats {
    pub score: AtomicU64,
    pub asteroids_spawned: AtomicU64,
    pub asteroids_split: AtomicU64,
    pub projectiles_fired: AtomicU64,
    pub ship_hits: AtomicU64,
}

/// Point-in-time copy of [`ArcadeStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArcadeReport {
    pub score: u64,
    pub asteroids_spawned: u64,
    pub asteroids_split: u64,
    pub projectiles_fired: u64,
    pub ship_hits: u64,
}

impl ArcadeStats {
    pub fn report(&self) -> ArcadeReport {
        ArcadeReport {
            score: self.score.load(Ordering::Relaxed),
            asteroids_spawned: self.asteroids_spawned.load(Ordering::Relaxed),
            asteroids_split: self.asteroids_split.load(Ordering::Relaxed),
            projectiles_fired: self.projectiles_fired.load(Ordering::Relaxed),
            ship_hits: self.ship_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsteroidSize {
    Small,
    Medium,
    Large,
}

impl AsteroidSize {
    pub fn radius(self) -> f32 {
        match self {
            AsteroidSize::Small => 20.0,
            AsteroidSize::Medium => 36.0,
            AsteroidSize::Large => 60.0,
        }
    }

    pub fn pool_name(self) -> &'static str {
        match self {
            AsteroidSize::Small => ASTEROID_SMALL_POOL,
            AsteroidSize::Medium => ASTEROID_MEDIUM_POOL,
            AsteroidSize::Large => ASTEROID_LARGE_POOL,
        }
    }

    /// What a hit breaks this size into, and how far apart the halves start
    pub fn fragments(self) -> Option<(AsteroidSize, f32)> {
        match self {
            AsteroidSize::Large => Some((AsteroidSize::Medium, 40.0)),
            AsteroidSize::Medium => Some((AsteroidSize::Small, 25.0)),
            AsteroidSize::Small => None,
        }
    }
}

/// Hands out distinct RNG streams from one seed
#[derive(Debug)]
struct SeedSource {
    base: u64,
    next: AtomicU64,
}

impl SeedSource {
    fn new(base: u64) -> Self {
        Self {
            base,
            next: AtomicU64::new(0),
        }
    }

    fn rng(&self) -> Pcg32 {
        let stream = self.next.fetch_add(1, Ordering::Relaxed);
        Pcg32::seed_from_u64(self.base.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }
}

pub struct Asteroid {
    size: AsteroidSize,
    bounds: Vec2,
    drift: Vec2,
    lifetime: f32,
    // Cached by update for the collision handler
    position: Vec2,
    rotation: f32,
    broken: bool,
    rng: Pcg32,
    stats: Arc<ArcadeStats>,
}

impl Asteroid {
    fn new(size: AsteroidSize, bounds: Vec2, rng: Pcg32, stats: Arc<ArcadeStats>) -> Self {
        Self {
            size,
            bounds,
            drift: Vec2::ZERO,
            lifetime: 0.0,
            position: Vec2::ZERO,
            rotation: 0.0,
            broken: false,
            rng,
            stats,
        }
    }

    fn break_apart(&mut self, ctx: &EntityCtx<'_>) {
        self.broken = true;
        ctx.retire();
        self.stats.score.fetch_add(ASTEROID_SCORE, Ordering::Relaxed);
        self.stats.asteroids_split.fetch_add(1, Ordering::Relaxed);

        let Some((fragment, spread)) = self.size.fragments() else {
            return;
        };
        let offset = heading_to_dir(self.rotation) * spread;
        for position in [self.position + offset, self.position - offset] {
            if let Err(e) = ctx.spawn(fragment.pool_name(), Transform::new(position, 0.0)) {
                log::warn!("Asteroid {} could not split: {e}", ctx.id());
            }
        }
    }
}

impl Behavior for Asteroid {
    fn update(&mut self, _ctx: &EntityCtx<'_>, transform: &mut Transform, dt: f32) {
        let mut position = transform.position + self.drift * dt;
        if self.lifetime > ASTEROID_WRAP_DELAY {
            position = wrap(position, self.bounds);
        }
        transform.position = position;
        transform.rotation = normalize_angle(transform.rotation + ASTEROID_SPIN * dt);
        self.lifetime += dt;
        self.position = transform.position;
        self.rotation = transform.rotation;
    }

    fn handle_collision(&mut self, ctx: &EntityCtx<'_>, contact: &Contact) {
        // Ships collide too, but only damage splits
        if !self.broken && contact.other_tags & DAMAGE_TAG != 0 {
            self.break_apart(ctx);
        }
    }

    fn reinitialise(&mut self, transform: &Transform) {
        let half = self.bounds / 2.0;
        let mut toward_center = |coord: f32, mid: f32| {
            let speed: f32 = self.rng.random_range(20.0..80.0);
            if coord > mid { -speed } else { speed }
        };
        self.drift = Vec2::new(
            toward_center(transform.position.x, half.x),
            toward_center(transform.position.y, half.y),
        );
        self.lifetime = 0.0;
        self.position = transform.position;
        self.rotation = transform.rotation;
        self.broken = false;
    }
}

fn wrap(mut p: Vec2, bounds: Vec2) -> Vec2 {
    if p.x < 0.0 {
        p.x += bounds.x;
    } else if p.x > bounds.x {
        p.x -= bounds.x;
    }
    if p.y < 0.0 {
        p.y += bounds.y;
    } else if p.y > bounds.y {
        p.y -= bounds.y;
    }
    p
}

pub struct Projectile {
    bounds: Vec2,
    velocity: Vec2,
}

impl Behavior for Projectile {
    fn update(&mut self, ctx: &EntityCtx<'_>, transform: &mut Transform, dt: f32) {
        let p = transform.position;
        let inside = p.x >= SCREEN_MARGIN
            && p.x <= self.bounds.x - SCREEN_MARGIN
            && p.y >= SCREEN_MARGIN
            && p.y <= self.bounds.y - SCREEN_MARGIN;
        if inside {
            transform.position += self.velocity * dt;
        } else {
            ctx.retire_delayed();
        }
    }

    fn handle_collision(&mut self, ctx: &EntityCtx<'_>, _contact: &Contact) {
        ctx.retire();
    }

    fn reinitialise(&mut self, transform: &Transform) {
        self.velocity = heading_to_dir(transform.rotation) * PROJECTILE_SPEED;
    }
}

/// Player ship flown by a trivial autopilot: turn and fire
pub struct Ship {
    fire_cooldown: f32,
    since_fire: f32,
    since_hit: f32,
    lives: i32,
    home: Vec2,
    recenter: bool,
    stats: Arc<ArcadeStats>,
}

impl Ship {
    pub fn new(home: Vec2, stats: Arc<ArcadeStats>) -> Self {
        Self {
            fire_cooldown: SHIP_FIRE_COOLDOWN,
            since_fire: 0.0,
            since_hit: SHIP_INVULNERABLE_TIME,
            lives: SHIP_LIVES,
            home,
            recenter: false,
            stats,
        }
    }

    /// Triangle pointing up the screen
    pub fn hull() -> Shape {
        Shape::polygon(vec![
            Vec2::new(0.0, -20.0),
            Vec2::new(14.0, 14.0),
            Vec2::new(-14.0, 14.0),
        ])
    }
}

impl Behavior for Ship {
    fn update(&mut self, ctx: &EntityCtx<'_>, transform: &mut Transform, dt: f32) {
        if self.recenter {
            *transform = Transform::new(self.home, 0.0);
            self.recenter = false;
        }
        self.since_hit += dt;
        self.since_fire += dt;
        transform.rotation = normalize_angle(transform.rotation + SHIP_TURN_RATE * dt);

        if self.lives >= 0 && self.since_fire > self.fire_cooldown {
            let muzzle = transform.position + heading_to_dir(transform.rotation) * 20.0;
            match ctx.spawn(PROJECTILE_POOL, Transform::new(muzzle, transform.rotation)) {
                Ok(_) => {
                    self.stats.projectiles_fired.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::warn!("Ship could not fire: {e}"),
            }
            self.since_fire = 0.0;
        }
    }

    fn handle_collision(&mut self, _ctx: &EntityCtx<'_>, _contact: &Contact) {
        if self.since_hit < SHIP_INVULNERABLE_TIME {
            return;
        }
        self.stats.ship_hits.fetch_add(1, Ordering::Relaxed);
        self.lives -= 1;
        self.since_hit = 0.0;
        if self.lives < 0 {
            log::info!("Game over");
        } else {
            log::info!("Ship hit, {} lives left", self.lives);
            self.recenter = true;
        }
    }
}

/// Feeds large asteroids in from just past a random screen edge
pub struct AsteroidSpawner {
    cooldown: f32,
    timer: f32,
    bounds: Vec2,
    rng: Pcg32,
    stats: Arc<ArcadeStats>,
}

impl AsteroidSpawner {
    pub fn new(cooldown: f32, bounds: Vec2, seed: u64, stats: Arc<ArcadeStats>) -> Self {
        Self {
            cooldown,
            timer: 0.0,
            bounds,
            rng: Pcg32::seed_from_u64(seed),
            stats,
        }
    }

    fn offscreen_point(&mut self) -> Vec2 {
        let x = self.rng.random_range(0.0..self.bounds.x);
        let y = self.rng.random_range(0.0..self.bounds.y);
        match self.rng.random_range(0..4) {
            0 => Vec2::new(x, -SCREEN_MARGIN),
            1 => Vec2::new(x, self.bounds.y + SCREEN_MARGIN),
            2 => Vec2::new(-SCREEN_MARGIN, y),
            _ => Vec2::new(self.bounds.x + SCREEN_MARGIN, y),
        }
    }
}

impl Behavior for AsteroidSpawner {
    fn update(&mut self, ctx: &EntityCtx<'_>, _transform: &mut Transform, dt: f32) {
        self.timer += dt;
        if self.timer <= self.cooldown {
            return;
        }
        self.timer = 0.0;
        let at = self.offscreen_point();
        match ctx.spawn(ASTEROID_LARGE_POOL, Transform::new(at, 0.0)) {
            Ok(_) => {
                self.stats.asteroids_spawned.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("Asteroid spawn failed: {e}"),
        }
    }
}

/// Register the asteroid and projectile pools
pub fn spawn_arcade_pools(
    world: &World,
    pool: &PoolConfig,
    seed: u64,
    stats: &Arc<ArcadeStats>,
) -> Result<(), SimError> {
    let bounds = Vec2::new(world.config().world_width, world.config().world_height);
    let seeds = Arc::new(SeedSource::new(seed));

    for size in [AsteroidSize::Large, AsteroidSize::Medium, AsteroidSize::Small] {
        let seeds = Arc::clone(&seeds);
        let stats = Arc::clone(stats);
        let prototype = EntityPrototype::new(
            Shape::circle(size.radius()),
            ASTEROID_SELF_TAGS,
            ASTEROID_OTHER_TAGS,
            move || -> Box<dyn Behavior> {
                Box::new(Asteroid::new(size, bounds, seeds.rng(), Arc::clone(&stats)))
            },
        );
        world.create_pool(size.pool_name(), prototype, Some(pool))?;
    }

    let prototype = EntityPrototype::new(
        Shape::circle(PROJECTILE_RADIUS),
        PROJECTILE_SELF_TAGS,
        PROJECTILE_OTHER_TAGS,
        move || -> Box<dyn Behavior> {
            Box::new(Projectile {
                bounds,
                velocity: Vec2::ZERO,
            })
        },
    );
    world.create_pool(PROJECTILE_POOL, prototype, Some(pool))?;
    Ok(())
}

/// Non-pooled ship at the center of the play area
pub fn spawn_ship(world: &World, stats: &Arc<ArcadeStats>) -> Result<EntityHandle, SimError> {
    let home = Vec2::new(world.config().world_width, world.config().world_height) / 2.0;
    world.spawn_entity(EntityState {
        transform: Transform::new(home, 0.0),
        collider: Some(Collider::new(Ship::hull(), SHIP_SELF_TAGS, SHIP_OTHER_TAGS)),
        behavior: Box::new(Ship::new(home, Arc::clone(stats))),
    })
}

/// Collider-less entity that drives asteroid waves from the update phase
pub fn spawn_spawner(
    world: &World,
    cooldown: f32,
    seed: u64,
    stats: &Arc<ArcadeStats>,
) -> Result<EntityHandle, SimError> {
    let bounds = Vec2::new(world.config().world_width, world.config().world_height);
    world.spawn_entity(EntityState {
        transform: Transform::default(),
        collider: None,
        behavior: Box::new(AsteroidSpawner::new(cooldown, bounds, seed, Arc::clone(stats))),
    })
}

/// Pools, ship, spawner and an opening wave of `asteroids` large rocks
pub fn install_arcade(world: &World, seed: u64, asteroids: usize) -> Result<Arc<ArcadeStats>, SimError> {
    let stats = Arc::new(ArcadeStats::default());
    spawn_arcade_pools(world, &world.config().pool, seed, &stats)?;
    spawn_ship(world, &stats)?;
    spawn_spawner(world, SPAWN_COOLDOWN, seed ^ 0x5EED, &stats)?;

    let mut rng = Pcg32::seed_from_u64(seed);
    let (w, h) = (world.config().world_width, world.config().world_height);
    for _ in 0..asteroids {
        // Keep the opening wave away from the ship
        let angle: f32 = rng.random_range(0.0..TAU);
        let distance = rng.random_range(0.3f32..0.45) * w.min(h);
        let at = Vec2::new(w, h) / 2.0 + heading_to_dir(angle) * distance;
        world.request_pooled_entity(ASTEROID_LARGE_POOL, Transform::new(at, angle))?;
        stats.asteroids_spawned.fetch_add(1, Ordering::Relaxed);
    }
    log::info!("Arcade installed with {asteroids} asteroids (seed {seed})");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SimConfig;
    use crate::sim::Simulation;
    use std::f32::consts::FRAC_PI_2;

    const DT: f32 = 1.0 / 60.0;

    fn sim() -> (Simulation, Arc<ArcadeStats>) {
        let sim = Simulation::new(SimConfig {
            worker_threads: 3,
            max_entities: 512,
            ..Default::default()
        })
        .unwrap();
        let stats = Arc::new(ArcadeStats::default());
        spawn_arcade_pools(sim.world(), &PoolConfig::default(), 7, &stats).unwrap();
        (sim, stats)
    }

    fn interested(a: (u16, u16), b: (u16, u16)) -> bool {
        (a.0 & b.1) | (b.0 & a.1) != 0
    }

    #[test]
    fn test_tag_matrix() {
        let ship = (SHIP_SELF_TAGS, SHIP_OTHER_TAGS);
        let shot = (PROJECTILE_SELF_TAGS, PROJECTILE_OTHER_TAGS);
        let rock = (ASTEROID_SELF_TAGS, ASTEROID_OTHER_TAGS);
        assert!(interested(shot, rock));
        assert!(interested(ship, rock));
        assert!(!interested(ship, shot));
        assert!(!interested(rock, rock));
        assert!(!interested(shot, shot));
        assert_eq!(PROJECTILE_SELF_TAGS & DAMAGE_TAG, DAMAGE_TAG);
        assert_eq!(SHIP_SELF_TAGS & DAMAGE_TAG, 0);
    }

    #[test]
    fn test_fragments_shrink_to_nothing() {
        assert_eq!(AsteroidSize::Large.fragments().map(|f| f.0), Some(AsteroidSize::Medium));
        assert_eq!(AsteroidSize::Medium.fragments().map(|f| f.0), Some(AsteroidSize::Small));
        assert_eq!(AsteroidSize::Small.fragments(), None);
        assert!(AsteroidSize::Small.radius() < AsteroidSize::Medium.radius());
    }

    #[test]
    fn test_wrap() {
        let bounds = Vec2::new(800.0, 600.0);
        assert_eq!(wrap(Vec2::new(-10.0, 610.0), bounds), Vec2::new(790.0, 10.0));
        assert_eq!(wrap(Vec2::new(400.0, 300.0), bounds), Vec2::new(400.0, 300.0));
    }

    #[test]
    fn test_reinitialise_drifts_toward_center() {
        let stats = Arc::new(ArcadeStats::default());
        let mut rock = Asteroid::new(
            AsteroidSize::Large,
            Vec2::new(800.0, 800.0),
            Pcg32::seed_from_u64(1),
            stats,
        );
        rock.reinitialise(&Transform::at(700.0, 100.0));
        assert!((-80.0..=-20.0).contains(&rock.drift.x));
        assert!((20.0..=80.0).contains(&rock.drift.y));
    }

    #[test]
    fn test_projectile_heads_along_rotation() {
        let mut shot = Projectile {
            bounds: Vec2::new(800.0, 800.0),
            velocity: Vec2::ZERO,
        };
        shot.reinitialise(&Transform::new(Vec2::ZERO, 0.0));
        assert!(shot.velocity.x.abs() < 1e-3);
        assert!((shot.velocity.y + PROJECTILE_SPEED).abs() < 1e-3);
    }

    #[test]
    fn test_projectile_splits_large_asteroid() {
        let (mut sim, stats) = sim();
        let rock = sim
            .world()
            .request_pooled_entity(ASTEROID_LARGE_POOL, Transform::at(400.0, 400.0))
            .unwrap();
        let shot = sim
            .world()
            .request_pooled_entity(PROJECTILE_POOL, Transform::at(400.0, 480.0))
            .unwrap();

        sim.run_frames(10, DT);

        assert!(!rock.is_active());
        assert!(!shot.is_active());
        let report = stats.report();
        assert_eq!(report.asteroids_split, 1);
        assert_eq!(report.score, ASTEROID_SCORE);

        let mediums = sim
            .snapshot()
            .iter()
            .filter(|s| s.tags == ASTEROID_SELF_TAGS)
            .count();
        assert_eq!(mediums, 2);
        assert_eq!(sim.world().active_count(), 2);
    }

    #[test]
    fn test_projectile_leaves_screen_through_delayed_retire() {
        let (mut sim, _stats) = sim();
        let shot = sim
            .world()
            .request_pooled_entity(PROJECTILE_POOL, Transform::new(Vec2::new(790.0, 400.0), FRAC_PI_2))
            .unwrap();
        sim.run_frames(5, DT);
        assert!(!shot.is_active());
        assert_eq!(sim.world().active_count(), 0);
    }

    #[test]
    fn test_ship_fires_on_cooldown() {
        let (mut sim, stats) = sim();
        spawn_ship(sim.world(), &stats).unwrap();
        sim.run_frames(60, DT);
        let fired = stats.report().projectiles_fired;
        assert!(fired >= 3, "fired {fired}");
        assert!(sim.world().active_count() > 1);
    }

    #[test]
    fn test_spawner_feeds_asteroids() {
        let (mut sim, stats) = sim();
        spawn_spawner(sim.world(), 0.2, 3, &stats).unwrap();
        sim.run_frames(60, DT);
        assert!(stats.report().asteroids_spawned >= 2);
    }

    #[test]
    fn test_install_arcade_runs() {
        let mut sim = Simulation::new(SimConfig {
            worker_threads: 4,
            ..Default::default()
        })
        .unwrap();
        let stats = install_arcade(sim.world(), 42, 6).unwrap();
        assert_eq!(sim.run_frames(120, DT), 120);
        assert!(stats.report().projectiles_fired > 0);
        assert_eq!(sim.world().stats().grid_faults.load(Ordering::Relaxed), 0);
    }
}
