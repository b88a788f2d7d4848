//! Asteroids Core - concurrent simulation core for an asteroids-style arcade game
//!
//! Core modules:
//! - `jobs`: Phase-based worker pool (counters, declarations, scheduler)
//! - `pool`: Lock-free object pools for recycling short-lived entities
//! - `sim`: Collision grid, GJK narrow phase, entities, world and phase cycle
//! - `arcade`: Small gameplay collaborators used by the headless demo
//! - `settings`: Startup configuration

pub mod arcade;
pub mod error;
pub mod jobs;
pub mod pool;
pub mod settings;
pub mod sim;

pub use error::{GridError, SimError};
pub use settings::{PoolConfig, SimConfig};

use glam::Vec2;

/// Simulation configuration defaults
pub mod consts {
    /// Play area dimensions
    pub const WORLD_WIDTH: f32 = 800.0;
    pub const WORLD_HEIGHT: f32 = 800.0;

    /// Collision grid resolution (cells per axis)
    pub const GRID_RESOLUTION: u32 = 12;
    /// Node slots per grid cell (must fit the 32-bit occupancy mask)
    pub const SLOTS_PER_CELL: u32 = 16;
    /// Hard ceiling on slots per cell
    pub const MAX_SLOTS_PER_CELL: u32 = 32;

    /// Worker threads in the job system
    pub const WORKER_THREADS: usize = 8;

    /// Entity arena capacity
    pub const MAX_ENTITIES: usize = 4096;

    /// Minimum movement (position units / radians) before grid re-registration
    pub const MOVEMENT_EPSILON: f32 = 0.1;

    /// Largest delta time fed to a single update phase (seconds)
    pub const MAX_DELTA_TIME: f32 = 0.05;

    /// Object pool defaults
    pub const POOL_GROWTH_INCREMENT: usize = 3;
    pub const POOL_INITIAL_COUNT: usize = 10;
    pub const POOL_LOW_WATERMARK: f32 = 0.2;
    pub const POOL_HIGH_WATERMARK: f32 = 0.5;
    pub const POOL_MIN_FREE: usize = 5;
}

/// Normalized angle to [-π, π)
#[inline]
pub fn normalize_angle(mut angle: f32) -> f32 {
    use std::f32::consts::PI;
    while angle >= PI {
        angle -= 2.0 * PI;
    }
    while angle < -PI {
        angle += 2.0 * PI;
    }
    angle
}

/// Unit direction for a heading angle (radians, 0 = up the screen)
#[inline]
pub fn heading_to_dir(angle: f32) -> Vec2 {
    Vec2::new(angle.sin(), -angle.cos())
}
