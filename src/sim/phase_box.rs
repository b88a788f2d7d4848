//! Broad-phase boxes: the inclusive range of grid cells a shape covers

use glam::{Vec2, Vec4};

use super::shape::{Shape, Transform, rotate_quad};
use crate::settings::SimConfig;

/// Cell size and grid bounds used to bucket world coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMetrics {
    pub cell_width: f32,
    pub cell_height: f32,
    pub columns: u32,
    pub rows: u32,
}

impl CellMetrics {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            cell_width: config.cell_width(),
            cell_height: config.cell_height(),
            columns: config.grid_width,
            rows: config.grid_height,
        }
    }

    /// Column for an x coordinate, clamped to the grid
    pub fn column(&self, x: f32) -> u32 {
        clamp_index(x / self.cell_width, self.columns)
    }

    /// Row for a y coordinate, clamped to the grid
    pub fn row(&self, y: f32) -> u32 {
        clamp_index(y / self.cell_height, self.rows)
    }

    fn bounds(&self, min: Vec2, max: Vec2) -> PhaseBox {
        PhaseBox {
            left: self.column(min.x),
            right: self.column(max.x),
            top: self.row(min.y),
            bottom: self.row(max.y),
        }
    }
}

fn clamp_index(v: f32, len: u32) -> u32 {
    // NaN and negatives land on 0
    if v.is_nan() || v <= 0.0 {
        0
    } else {
        (v as u32).min(len - 1)
    }
}

/// Inclusive cell bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseBox {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl PhaseBox {
    pub fn is_multi_cell(&self) -> bool {
        self.left != self.right || self.top != self.bottom
    }

    pub fn cell_count(&self) -> usize {
        ((self.right - self.left + 1) * (self.bottom - self.top + 1)) as usize
    }

    /// Covered cells in row-major order
    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.top..=self.bottom).flat_map(move |y| (self.left..=self.right).map(move |x| (x, y)))
    }
}

/// Cells covered by `shape` at `transform`
///
/// `world_polygon` must be the shape's current world-space polygon (unused
/// for circles and unrotated boxes).
pub fn make_phase_box(
    shape: &Shape,
    transform: &Transform,
    world_polygon: &[Vec2],
    metrics: &CellMetrics,
) -> PhaseBox {
    let center = transform.position;
    match shape {
        Shape::Circle { radius } => {
            let r = Vec2::splat(*radius);
            metrics.bounds(center - r, center + r)
        }
        Shape::Box { half_extents } => {
            if transform.rotation == 0.0 {
                return metrics.bounds(center - *half_extents, center + *half_extents);
            }
            let (hw, hh) = (half_extents.x, half_extents.y);
            let (sin, cos) = transform.rotation.sin_cos();
            let (xs, ys) = rotate_quad(
                Vec4::new(-hw, -hw, hw, hw),
                Vec4::new(-hh, hh, -hh, hh),
                sin,
                cos,
            );
            let min = Vec2::new(xs.min_element(), ys.min_element());
            let max = Vec2::new(xs.max_element(), ys.max_element());
            metrics.bounds(center + min, center + max)
        }
        Shape::Polygon { .. } => {
            let Some(&first) = world_polygon.first() else {
                return metrics.bounds(center, center);
            };
            let (min, max) = world_polygon
                .iter()
                .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            metrics.bounds(min, max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> CellMetrics {
        // 10 x 10 cells of 10 units
        CellMetrics {
            cell_width: 10.0,
            cell_height: 10.0,
            columns: 10,
            rows: 10,
        }
    }

    #[test]
    fn test_circle_inside_one_cell() {
        let b = make_phase_box(&Shape::circle(2.0), &Transform::at(15.0, 15.0), &[], &metrics());
        assert_eq!(b, PhaseBox { left: 1, right: 1, top: 1, bottom: 1 });
        assert!(!b.is_multi_cell());
    }

    #[test]
    fn test_circle_straddling_corner() {
        let b = make_phase_box(&Shape::circle(2.0), &Transform::at(20.0, 20.0), &[], &metrics());
        assert_eq!(b, PhaseBox { left: 1, right: 2, top: 1, bottom: 2 });
        assert_eq!(b.cell_count(), 4);
        assert_eq!(b.cells().collect::<Vec<_>>(), vec![(1, 1), (2, 1), (1, 2), (2, 2)]);
    }

    #[test]
    fn test_clamped_to_grid() {
        let b = make_phase_box(&Shape::circle(30.0), &Transform::at(-5.0, 99.0), &[], &metrics());
        assert_eq!(b, PhaseBox { left: 0, right: 2, top: 6, bottom: 9 });
    }

    #[test]
    fn test_rotated_box_grows() {
        let shape = Shape::rect(4.0, 4.0);
        let flat = make_phase_box(&shape, &Transform::at(15.0, 15.0), &[], &metrics());
        assert!(!flat.is_multi_cell());

        let turned = Transform::new(Vec2::new(15.0, 15.0), std::f32::consts::FRAC_PI_4);
        let b = make_phase_box(&shape, &turned, &[], &metrics());
        // corners reach 15 ± 5.66
        assert_eq!(b, PhaseBox { left: 0, right: 2, top: 0, bottom: 2 });
    }

    #[test]
    fn test_polygon_uses_world_vertices() {
        let shape = Shape::polygon(vec![Vec2::new(0.0, -12.0), Vec2::new(3.0, 3.0), Vec2::new(-3.0, 3.0)]);
        let t = Transform::at(25.0, 25.0);
        let mut poly = Vec::new();
        shape.world_polygon(&t, &mut poly);
        let b = make_phase_box(&shape, &t, &poly, &metrics());
        assert_eq!(b, PhaseBox { left: 2, right: 2, top: 1, bottom: 2 });
    }
}
