//! Per-entity collision state and grid registration

use glam::Vec2;

use super::entity::EntityId;
use super::gjk::{self, WorldShape};
use super::grid::{CollisionGrid, MULTI_CELL_TAG, SlotId};
use super::phase_box::{CellMetrics, PhaseBox, make_phase_box};
use super::shape::{Shape, Transform};
use crate::error::GridError;

#[derive(Debug, Clone, Copy)]
struct Registration {
    x: u32,
    y: u32,
    slot: SlotId,
}

/// Shape, tags and the grid slots an entity currently holds
#[derive(Debug, Clone)]
pub struct Collider {
    shape: Shape,
    self_tags: u16,
    other_tags: u16,
    tags_dirty: bool,
    last_transform: Transform,
    phase_box: Option<PhaseBox>,
    registrations: Vec<Registration>,
    world_polygon: Vec<Vec2>,
}

impl Collider {
    /// `self_tags` / `other_tags` must leave bit 0 clear (reserved for the grid)
    pub fn new(shape: Shape, self_tags: u16, other_tags: u16) -> Self {
        debug_assert_eq!(self_tags & MULTI_CELL_TAG, 0, "tag bit 0 is reserved");
        debug_assert_eq!(other_tags & MULTI_CELL_TAG, 0, "tag bit 0 is reserved");
        Self {
            shape,
            self_tags,
            other_tags,
            tags_dirty: true,
            last_transform: Transform::default(),
            phase_box: None,
            registrations: Vec::new(),
            world_polygon: Vec::new(),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn self_tags(&self) -> u16 {
        self.self_tags
    }

    pub fn other_tags(&self) -> u16 {
        self.other_tags
    }

    /// Changing tags forces re-registration on the next update
    pub fn set_tags(&mut self, self_tags: u16, other_tags: u16) {
        debug_assert_eq!((self_tags | other_tags) & MULTI_CELL_TAG, 0, "tag bit 0 is reserved");
        if self_tags != self.self_tags || other_tags != self.other_tags {
            self.self_tags = self_tags;
            self.other_tags = other_tags;
            self.tags_dirty = true;
        }
    }

    pub fn phase_box(&self) -> Option<PhaseBox> {
        self.phase_box
    }

    pub fn is_registered(&self) -> bool {
        !self.registrations.is_empty()
    }

    pub fn world_polygon(&self) -> &[Vec2] {
        &self.world_polygon
    }

    /// Refresh the cached polygon and re-register if the covered cells or the
    /// tags changed. Returns the first insertion failure, after trying every
    /// cell.
    pub fn update_in_grid(
        &mut self,
        grid: &CollisionGrid,
        id: EntityId,
        transform: &Transform,
        metrics: &CellMetrics,
        epsilon: f32,
    ) -> Result<(), GridError> {
        self.shape.world_polygon(transform, &mut self.world_polygon);

        let moved = (transform.position - self.last_transform.position).abs();
        let turned = (transform.rotation - self.last_transform.rotation).abs();
        if self.phase_box.is_some()
            && !self.tags_dirty
            && moved.x < epsilon
            && moved.y < epsilon
            && turned < epsilon
        {
            return Ok(());
        }
        self.last_transform = *transform;

        let new_box = make_phase_box(&self.shape, transform, &self.world_polygon, metrics);
        if self.phase_box == Some(new_box) && !self.tags_dirty {
            return Ok(());
        }

        self.remove_registrations(grid);
        self.tags_dirty = false;
        self.phase_box = Some(new_box);

        let (self_tags, other_tags) = if new_box.is_multi_cell() {
            (self.self_tags | MULTI_CELL_TAG, self.other_tags | MULTI_CELL_TAG)
        } else {
            (self.self_tags, self.other_tags)
        };

        let mut first_error = None;
        for (x, y) in new_box.cells() {
            match grid.insert(id, x, y, self_tags, other_tags) {
                Ok(slot) => self.registrations.push(Registration { x, y, slot }),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            // Retry the missing cells on the next update
            Some(e) => {
                self.tags_dirty = true;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Drop every grid slot; the next update re-inserts
    pub fn clear_from_grid(&mut self, grid: &CollisionGrid) {
        self.remove_registrations(grid);
        self.phase_box = None;
        self.tags_dirty = true;
    }

    fn remove_registrations(&mut self, grid: &CollisionGrid) {
        for reg in self.registrations.drain(..) {
            grid.remove(reg.slot, reg.x, reg.y);
        }
    }

    pub fn world_shape<'a>(&'a self, transform: &Transform) -> WorldShape<'a> {
        match self.shape {
            Shape::Circle { radius } => WorldShape::Circle {
                center: transform.position,
                radius,
            },
            _ => WorldShape::Polygon(&self.world_polygon),
        }
    }

    pub fn intersects(&self, transform: &Transform, other: &Collider, other_transform: &Transform) -> bool {
        gjk::intersects(self.world_shape(transform), other.world_shape(other_transform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> CellMetrics {
        CellMetrics {
            cell_width: 10.0,
            cell_height: 10.0,
            columns: 8,
            rows: 8,
        }
    }

    const EPS: f32 = 0.1;

    #[test]
    fn test_first_update_registers() {
        let grid = CollisionGrid::new(8, 8, 4).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        c.update_in_grid(&grid, EntityId(1), &Transform::at(15.0, 15.0), &metrics(), EPS)
            .unwrap();
        assert!(c.is_registered());
        let node = grid.node(1, 1, SlotId(0)).unwrap();
        assert_eq!(node.entity, EntityId(1));
        assert_eq!(node.self_tags, 0b1000);
    }

    #[test]
    fn test_small_moves_skip_grid() {
        let grid = CollisionGrid::new(8, 8, 4).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        c.update_in_grid(&grid, EntityId(1), &Transform::at(15.0, 15.0), &metrics(), EPS)
            .unwrap();
        grid.set_generation(5);
        c.update_in_grid(&grid, EntityId(1), &Transform::at(15.05, 15.0), &metrics(), EPS)
            .unwrap();
        assert_eq!(grid.stamp(1, 1, SlotId(0)), Some(0));

        // Moved, but still inside the same cell
        c.update_in_grid(&grid, EntityId(1), &Transform::at(16.0, 15.0), &metrics(), EPS)
            .unwrap();
        assert_eq!(grid.stamp(1, 1, SlotId(0)), Some(0));
    }

    #[test]
    fn test_crossing_cells_moves_slots() {
        let grid = CollisionGrid::new(8, 8, 4).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        c.update_in_grid(&grid, EntityId(1), &Transform::at(15.0, 15.0), &metrics(), EPS)
            .unwrap();
        c.update_in_grid(&grid, EntityId(1), &Transform::at(35.0, 15.0), &metrics(), EPS)
            .unwrap();
        assert_eq!(grid.occupancy(1, 1), 0);
        assert_eq!(grid.occupancy(3, 1), 1);
    }

    #[test]
    fn test_multi_cell_flag_in_both_masks() {
        let grid = CollisionGrid::new(8, 8, 4).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        c.update_in_grid(&grid, EntityId(1), &Transform::at(20.0, 15.0), &metrics(), EPS)
            .unwrap();
        assert_eq!(c.phase_box().map(|b| b.cell_count()), Some(2));
        for x in [1, 2] {
            let node = grid.node(x, 1, SlotId(0)).unwrap();
            assert_eq!(node.self_tags, 0b1001);
            assert_eq!(node.other_tags, 0b0101);
        }
    }

    #[test]
    fn test_tag_change_forces_reinsert() {
        let grid = CollisionGrid::new(8, 8, 4).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        let t = Transform::at(15.0, 15.0);
        c.update_in_grid(&grid, EntityId(1), &t, &metrics(), EPS).unwrap();
        c.set_tags(0b1_0000, 0b0100);
        c.update_in_grid(&grid, EntityId(1), &t, &metrics(), EPS).unwrap();
        assert_eq!(grid.node(1, 1, SlotId(0)).unwrap().self_tags, 0b1_0000);
        assert_eq!(grid.occupancy(1, 1), 1);
    }

    #[test]
    fn test_clear_then_update_reinserts() {
        let grid = CollisionGrid::new(8, 8, 4).unwrap();
        let mut c = Collider::new(Shape::rect(3.0, 3.0), 0b1000, 0b0100);
        let t = Transform::at(15.0, 15.0);
        c.update_in_grid(&grid, EntityId(1), &t, &metrics(), EPS).unwrap();
        c.clear_from_grid(&grid);
        assert_eq!(grid.occupied_slots(), 0);
        assert!(!c.is_registered());
        c.update_in_grid(&grid, EntityId(1), &t, &metrics(), EPS).unwrap();
        assert_eq!(grid.occupied_slots(), 1);
    }

    #[test]
    fn test_full_cell_keeps_other_registrations() {
        let grid = CollisionGrid::new(8, 8, 1).unwrap();
        grid.insert(EntityId(9), 2, 1, 0, 0).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        let err = c.update_in_grid(&grid, EntityId(1), &Transform::at(20.0, 15.0), &metrics(), EPS);
        assert_eq!(err, Err(GridError::CellFull { x: 2, y: 1 }));
        assert_eq!(grid.occupancy(1, 1), 1);

        c.clear_from_grid(&grid);
        assert_eq!(grid.occupancy(1, 1), 0);
        assert_eq!(grid.occupancy(2, 1), 1);
    }

    #[test]
    fn test_full_cell_retried_once_freed() {
        let grid = CollisionGrid::new(8, 8, 1).unwrap();
        let blocker = grid.insert(EntityId(9), 2, 1, 0, 0).unwrap();
        let mut c = Collider::new(Shape::circle(2.0), 0b1000, 0b0100);
        let err = c.update_in_grid(&grid, EntityId(1), &Transform::at(20.0, 15.0), &metrics(), EPS);
        assert_eq!(err, Err(GridError::CellFull { x: 2, y: 1 }));

        grid.remove(blocker, 2, 1);
        assert_eq!(grid.occupancy(2, 1), 0);

        // Same box every step, drifting less than a cell
        for step in 1..=10 {
            let at = Transform::at(20.0 + step as f32 * 0.2, 15.0);
            c.update_in_grid(&grid, EntityId(1), &at, &metrics(), EPS).unwrap();
        }
        assert_eq!(grid.occupancy(1, 1), 1);
        assert_eq!(grid.occupancy(2, 1), 1);
        assert_eq!(grid.node(2, 1, SlotId(0)).map(|n| n.entity), Some(EntityId(1)));
    }
}
