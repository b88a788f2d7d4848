//! Simulation core: entities, collision detection and the frame cycle
//!
//! - `shape` / `phase_box`: geometry and broad-phase cell bounds
//! - `gjk`: narrow-phase intersection
//! - `grid`: atomic spatial grid and pair resolution
//! - `collider`: per-entity grid registration
//! - `entity` / `world`: entity storage and the shared context
//! - `cycle`: phase transition job and the driver loop

pub mod collider;
pub mod cycle;
pub mod entity;
pub mod gjk;
pub mod grid;
pub mod phase_box;
pub mod shape;
pub mod world;

pub use collider::Collider;
pub use cycle::{Phase, Simulation};
pub use entity::{
    Behavior, Contact, Entity, EntityArena, EntityHandle, EntityId, EntityPrototype, EntitySnapshot,
    EntityState, Inert, lock_pair_ordered,
};
pub use gjk::{WorldShape, intersects};
pub use grid::{CollisionGrid, GridNode, MULTI_CELL_TAG, SlotId};
pub use phase_box::{CellMetrics, PhaseBox, make_phase_box};
pub use shape::{Shape, Transform};
pub use world::{EntityCtx, World, WorldStats};
