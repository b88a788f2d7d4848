//! Error types for the simulation core
//!
//! Capacity faults are surfaced as values and logged at the call site; they
//! indicate a tuning problem (grid too coarse, arena too small), not a
//! condition the frame loop is expected to recover from.

use thiserror::Error;

/// Collision grid faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GridError {
    /// Every slot in the cell is occupied
    #[error("collision grid cell ({x}, {y}) is full")]
    CellFull { x: u32, y: u32 },
    /// Cell coordinates outside the grid
    #[error("collision grid cell ({x}, {y}) is out of bounds")]
    OutOfBounds { x: u32, y: u32 },
}

/// Top-level simulation errors
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("entity arena is full ({capacity} entities)")]
    ArenaFull { capacity: usize },
    #[error("no object pool named {0:?}")]
    UnknownPool(String),
}
