//! Simulation configuration
//!
//! Startup constants for the grid, the worker pool and the object pools.
//! Everything has a default from [`crate::consts`]; a JSON document only needs
//! the fields it wants to override.

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::error::SimError;

/// Entity density presets (trade memory for headroom)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DensityPreset {
    Sparse,
    #[default]
    Standard,
    Dense,
}

impl DensityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            DensityPreset::Sparse => "Sparse",
            DensityPreset::Standard => "Standard",
            DensityPreset::Dense => "Dense",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sparse" => Some(DensityPreset::Sparse),
            "standard" | "std" => Some(DensityPreset::Standard),
            "dense" => Some(DensityPreset::Dense),
            _ => None,
        }
    }

    /// Node slots reserved per grid cell
    pub fn slots_per_cell(&self) -> u32 {
        match self {
            DensityPreset::Sparse => 8,
            DensityPreset::Standard => SLOTS_PER_CELL,
            DensityPreset::Dense => MAX_SLOTS_PER_CELL,
        }
    }

    /// Entities each pool starts with
    pub fn initial_pool_count(&self) -> usize {
        match self {
            DensityPreset::Sparse => 4,
            DensityPreset::Standard => POOL_INITIAL_COUNT,
            DensityPreset::Dense => 32,
        }
    }
}

/// Per-archetype object pool tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Entities constructed when an empty pool is hit
    pub growth_increment: usize,
    /// Entities constructed when the pool is created
    pub initial_count: usize,
    /// Grow by one when free/total drops below this
    pub low_watermark: f32,
    /// Shrink by one when free/total rises above this
    pub high_watermark: f32,
    /// Absolute floor of free entities kept around
    pub min_free: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            growth_increment: POOL_GROWTH_INCREMENT,
            initial_count: POOL_INITIAL_COUNT,
            low_watermark: POOL_LOW_WATERMARK,
            high_watermark: POOL_HIGH_WATERMARK,
            min_free: POOL_MIN_FREE,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.growth_increment == 0 {
            return Err(SimError::InvalidConfig(
                "pool growth_increment must be at least 1".into(),
            ));
        }
        if !(self.low_watermark > 0.0 && self.high_watermark > self.low_watermark) {
            return Err(SimError::InvalidConfig(format!(
                "pool watermarks must satisfy 0 < low < high (got {} / {})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// Startup configuration for the whole core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Density preset the slot and pool sizes were derived from
    pub preset: DensityPreset,

    // === Play area ===
    pub world_width: f32,
    pub world_height: f32,

    // === Collision grid ===
    pub grid_width: u32,
    pub grid_height: u32,
    /// Node slots per cell (1..=32)
    pub slots_per_cell: u32,
    /// Movement below this skips grid re-registration
    pub movement_epsilon: f32,

    // === Job system ===
    /// Worker threads; one of them hosts the phase transition job
    pub worker_threads: usize,

    // === Entities ===
    pub max_entities: usize,
    pub max_delta_time: f32,

    // === Pools ===
    pub pool: PoolConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            preset: DensityPreset::Standard,

            world_width: WORLD_WIDTH,
            world_height: WORLD_HEIGHT,

            grid_width: GRID_RESOLUTION,
            grid_height: GRID_RESOLUTION,
            slots_per_cell: SLOTS_PER_CELL,
            movement_epsilon: MOVEMENT_EPSILON,

            worker_threads: WORKER_THREADS,

            max_entities: MAX_ENTITIES,
            max_delta_time: MAX_DELTA_TIME,

            pool: PoolConfig::default(),
        }
    }
}

impl SimConfig {
    /// Create a config from a density preset (applies preset sizes)
    pub fn from_preset(preset: DensityPreset) -> Self {
        let mut config = Self::default();
        config.apply_preset(preset);
        config
    }

    /// Apply a density preset (updates preset-dependent sizes)
    pub fn apply_preset(&mut self, preset: DensityPreset) {
        self.preset = preset;
        self.slots_per_cell = preset.slots_per_cell();
        self.pool.initial_count = preset.initial_pool_count();
    }

    /// Parse a JSON document, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(SimError::InvalidConfig("grid dimensions must be non-zero".into()));
        }
        if self.slots_per_cell == 0 || self.slots_per_cell > MAX_SLOTS_PER_CELL {
            return Err(SimError::InvalidConfig(format!(
                "slots_per_cell must be in 1..={MAX_SLOTS_PER_CELL} (got {})",
                self.slots_per_cell
            )));
        }
        if self.worker_threads < 2 {
            return Err(SimError::InvalidConfig(format!(
                "worker_threads must be at least 2 (got {})",
                self.worker_threads
            )));
        }
        if !(self.world_width > 0.0 && self.world_height > 0.0) {
            return Err(SimError::InvalidConfig("world dimensions must be positive".into()));
        }
        if self.max_entities == 0 || self.max_entities >= u32::MAX as usize {
            return Err(SimError::InvalidConfig("max_entities out of range".into()));
        }
        self.pool.validate()
    }

    /// Width of one grid cell in world units
    pub fn cell_width(&self) -> f32 {
        self.world_width / self.grid_width as f32
    }

    /// Height of one grid cell in world units
    pub fn cell_height(&self) -> f32 {
        self.world_height / self.grid_height as f32
    }

    /// Total number of grid cells
    pub fn cell_count(&self) -> usize {
        (self.grid_width * self.grid_height) as usize
    }
}
