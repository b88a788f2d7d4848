//! Uniform spatial grid with an atomic slot allocator per cell
//!
//! Each cell owns a fixed slab of node slots. Occupancy is a 32-bit mask:
//! inserting claims the lowest clear bit with CAS, removing clears it with
//! `fetch_and`. Nodes are packed into a single `AtomicU64`
//! (`entity | self_tags << 32 | other_tags << 48`) so a slot is written and
//! read in one operation.
//!
//! Entities spanning several cells carry [`MULTI_CELL_TAG`] in both masks. A
//! pair where both sides are multi-cell can meet in more than one cell, so it
//! goes through the per-frame completed set; every other pair shares at most
//! one cell and is resolved directly.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::entity::{Contact, EntityId, lock_pair_ordered};
use super::world::{EntityCtx, World};
use crate::consts::MAX_SLOTS_PER_CELL;
use crate::error::{GridError, SimError};
use crate::settings::SimConfig;

/// Reserved tag bit: the entity occupies more than one cell
pub const MULTI_CELL_TAG: u16 = 0b1;

/// Slot index within a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u8);

/// One occupied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridNode {
    pub entity: EntityId,
    pub self_tags: u16,
    pub other_tags: u16,
}

impl GridNode {
    fn pack(self) -> u64 {
        self.entity.0 as u64 | (self.self_tags as u64) << 32 | (self.other_tags as u64) << 48
    }

    fn unpack(raw: u64) -> Option<Self> {
        let entity = EntityId(raw as u32);
        if entity.is_none() {
            return None;
        }
        Some(Self {
            entity,
            self_tags: (raw >> 32) as u16,
            other_tags: (raw >> 48) as u16,
        })
    }
}

pub struct CollisionGrid {
    width: u32,
    height: u32,
    capacity: u32,
    full_mask: u32,
    cells: Box<[AtomicU32]>,
    nodes: Box<[AtomicU64]>,
    stamps: Box<[AtomicU64]>,
    generation: AtomicU64,
    completed: RwLock<HashSet<(EntityId, EntityId)>>,
}

impl CollisionGrid {
    pub fn new(width: u32, height: u32, capacity: u32) -> Result<Self, SimError> {
        if width == 0 || height == 0 {
            return Err(SimError::InvalidConfig("grid dimensions must be non-zero".into()));
        }
        if capacity == 0 || capacity > MAX_SLOTS_PER_CELL {
            return Err(SimError::InvalidConfig(format!(
                "cell capacity must be in 1..={MAX_SLOTS_PER_CELL} (got {capacity})"
            )));
        }
        let cell_count = (width * height) as usize;
        let slot_count = cell_count * capacity as usize;
        Ok(Self {
            width,
            height,
            capacity,
            full_mask: if capacity == 32 { u32::MAX } else { (1 << capacity) - 1 },
            cells: (0..cell_count).map(|_| AtomicU32::new(0)).collect(),
            nodes: (0..slot_count).map(|_| AtomicU64::new(0)).collect(),
            stamps: (0..slot_count).map(|_| AtomicU64::new(0)).collect(),
            generation: AtomicU64::new(0),
            completed: RwLock::new(HashSet::new()),
        })
    }

    pub fn from_config(config: &SimConfig) -> Result<Self, SimError> {
        Self::new(config.grid_width, config.grid_height, config.slots_per_cell)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Claim a slot in cell (x, y) for `entity`
    pub fn insert(
        &self,
        entity: EntityId,
        x: u32,
        y: u32,
        self_tags: u16,
        other_tags: u16,
    ) -> Result<SlotId, GridError> {
        let cell = self.cell_index(x, y).inspect_err(|e| log::error!("{e}"))?;
        let bits = &self.cells[cell];

        let mut current = bits.load(Ordering::Acquire);
        let slot = loop {
            let free = !current & self.full_mask;
            if free == 0 {
                let err = GridError::CellFull { x, y };
                log::error!("{err} (entity {entity})");
                return Err(err);
            }
            let slot = free.trailing_zeros();
            match bits.compare_exchange_weak(
                current,
                current | 1 << slot,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break slot,
                Err(actual) => current = actual,
            }
        };

        let index = self.node_index(cell, slot);
        let node = GridNode {
            entity,
            self_tags,
            other_tags,
        };
        self.nodes[index].store(node.pack(), Ordering::Release);
        self.stamps[index].store(self.generation(), Ordering::Release);
        Ok(SlotId(slot as u8))
    }

    /// Release a slot claimed by [`CollisionGrid::insert`]
    pub fn remove(&self, slot: SlotId, x: u32, y: u32) {
        let Ok(cell) = self.cell_index(x, y) else {
            log::error!("Grid removal outside the grid at ({x}, {y})");
            return;
        };
        let bit = 1u32 << slot.0;
        debug_assert!(bit & self.full_mask != 0, "slot beyond cell capacity");
        self.nodes[self.node_index(cell, slot.0 as u32)].store(0, Ordering::Release);
        let prev = self.cells[cell].fetch_and(!bit, Ordering::AcqRel);
        debug_assert!(prev & bit != 0, "removed an unoccupied slot");
    }

    pub fn node(&self, x: u32, y: u32, slot: SlotId) -> Option<GridNode> {
        let cell = self.cell_index(x, y).ok()?;
        let raw = self.nodes[self.node_index(cell, slot.0 as u32)].load(Ordering::Acquire);
        GridNode::unpack(raw)
    }

    /// Generation the slot was last written in
    pub fn stamp(&self, x: u32, y: u32, slot: SlotId) -> Option<u64> {
        let cell = self.cell_index(x, y).ok()?;
        Some(self.stamps[self.node_index(cell, slot.0 as u32)].load(Ordering::Acquire))
    }

    pub fn occupancy(&self, x: u32, y: u32) -> u32 {
        self.cell_index(x, y)
            .map_or(0, |cell| self.cells[cell].load(Ordering::Acquire))
    }

    /// Occupied slots across the whole grid
    pub fn occupied_slots(&self) -> usize {
        self.cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Forget this frame's multi-cell pairs
    pub fn clear_completed(&self) {
        self.completed.write().clear();
    }

    pub fn completed_len(&self) -> usize {
        self.completed.read().len()
    }

    /// Resolve every interested pair in a contiguous range of cells;
    /// returns the number of pairs whose handlers ran
    pub fn resolve_cell_range(&self, world: &World, cells: Range<usize>) -> usize {
        let end = cells.end.min(self.cells.len());
        let mut hits = 0;
        for cell in cells.start..end {
            let occupied = self.cells[cell].load(Ordering::Acquire);
            if occupied.count_ones() < 2 {
                continue;
            }

            let mut outer = occupied;
            while outer != 0 {
                let i = outer.trailing_zeros();
                outer &= outer - 1;
                let Some(a) = self.load_node(cell, i) else { continue };

                let mut inner = outer;
                while inner != 0 {
                    let j = inner.trailing_zeros();
                    inner &= inner - 1;
                    let Some(b) = self.load_node(cell, j) else { continue };
                    if a.entity == b.entity {
                        continue;
                    }

                    let overlap = (a.self_tags & b.other_tags) | (b.self_tags & a.other_tags);
                    if overlap & !MULTI_CELL_TAG == 0 {
                        continue;
                    }
                    let generation = self.stamps[self.node_index(cell, i)]
                        .load(Ordering::Acquire)
                        .min(self.stamps[self.node_index(cell, j)].load(Ordering::Acquire));
                    if self.resolve_pair(world, a, b, overlap & MULTI_CELL_TAG != 0, generation) {
                        hits += 1;
                    }
                }
            }
        }
        hits
    }

    fn resolve_pair(&self, world: &World, a: GridNode, b: GridNode, multi: bool, generation: u64) -> bool {
        let key = if a.entity < b.entity {
            (a.entity, b.entity)
        } else {
            (b.entity, a.entity)
        };
        if multi && self.completed.read().contains(&key) {
            return false;
        }

        let (Some(ea), Some(eb)) = (world.arena().get(a.entity), world.arena().get(b.entity)) else {
            return false;
        };
        let (mut sa, mut sb) = lock_pair_ordered(&ea, &eb);
        if !ea.is_active() || !eb.is_active() {
            return false;
        }

        let hit = match (sa.collider.as_ref(), sb.collider.as_ref()) {
            (Some(ca), Some(cb)) => ca.intersects(&sa.transform, cb, &sb.transform),
            _ => false,
        };
        if !hit {
            return false;
        }
        if multi && !self.completed.write().insert(key) {
            return false;
        }

        let tags_a = a.self_tags & !MULTI_CELL_TAG;
        let tags_b = b.self_tags & !MULTI_CELL_TAG;
        sa.behavior.handle_collision(
            &EntityCtx::new(world, a.entity),
            &Contact {
                other: b.entity,
                other_tags: tags_b,
                generation,
            },
        );
        sb.behavior.handle_collision(
            &EntityCtx::new(world, b.entity),
            &Contact {
                other: a.entity,
                other_tags: tags_a,
                generation,
            },
        );
        true
    }

    fn load_node(&self, cell: usize, slot: u32) -> Option<GridNode> {
        GridNode::unpack(self.nodes[self.node_index(cell, slot)].load(Ordering::Acquire))
    }

    fn cell_index(&self, x: u32, y: u32) -> Result<usize, GridError> {
        if x >= self.width || y >= self.height {
            return Err(GridError::OutOfBounds { x, y });
        }
        Ok((x + y * self.width) as usize)
    }

    fn node_index(&self, cell: usize, slot: u32) -> usize {
        cell * self.capacity as usize + slot as usize
    }
}
