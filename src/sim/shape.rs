//! Collision shapes and their world-space geometry
//!
//! Shapes are stored in local space around the entity origin. Boxes and
//! polygons are turned into world-space vertex lists four vertices at a time
//! with [`rotate_quad`].

use glam::{Vec2, Vec4};
use serde::{Deserialize, Serialize};

/// Position and heading of an entity (rotation in radians)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec2,
    pub rotation: f32,
}

impl Transform {
    pub fn new(position: Vec2, rotation: f32) -> Self {
        Self { position, rotation }
    }

    pub fn at(x: f32, y: f32) -> Self {
        Self::new(Vec2::new(x, y), 0.0)
    }
}

/// Closed set of collision shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Circle { radius: f32 },
    Box { half_extents: Vec2 },
    /// Convex, local-space vertices in winding order
    Polygon { vertices: Vec<Vec2> },
}

impl Shape {
    pub fn circle(radius: f32) -> Self {
        Shape::Circle { radius }
    }

    pub fn rect(half_width: f32, half_height: f32) -> Self {
        Shape::Box {
            half_extents: Vec2::new(half_width, half_height),
        }
    }

    pub fn polygon(vertices: Vec<Vec2>) -> Self {
        Shape::Polygon { vertices }
    }

    pub fn is_circle(&self) -> bool {
        matches!(self, Shape::Circle { .. })
    }

    /// Write world-space vertices into `out` (left empty for circles)
    pub fn world_polygon(&self, transform: &Transform, out: &mut Vec<Vec2>) {
        out.clear();
        match self {
            Shape::Circle { .. } => {}
            Shape::Box { half_extents } => {
                let (hw, hh) = (half_extents.x, half_extents.y);
                let xs = Vec4::new(-hw, hw, hw, -hw);
                let ys = Vec4::new(-hh, -hh, hh, hh);
                push_rotated_quad(xs, ys, transform, out);
            }
            Shape::Polygon { vertices } => {
                let (sin, cos) = transform.rotation.sin_cos();
                let mut chunks = vertices.chunks_exact(4);
                for quad in &mut chunks {
                    let xs = Vec4::new(quad[0].x, quad[1].x, quad[2].x, quad[3].x);
                    let ys = Vec4::new(quad[0].y, quad[1].y, quad[2].y, quad[3].y);
                    push_rotated_quad(xs, ys, transform, out);
                }
                for &v in chunks.remainder() {
                    out.push(rotate_point(v, sin, cos) + transform.position);
                }
            }
        }
    }
}

fn push_rotated_quad(xs: Vec4, ys: Vec4, transform: &Transform, out: &mut Vec<Vec2>) {
    let (xs, ys) = if transform.rotation == 0.0 {
        (xs, ys)
    } else {
        let (sin, cos) = transform.rotation.sin_cos();
        rotate_quad(xs, ys, sin, cos)
    };
    let p = transform.position;
    out.extend((0..4).map(|i| Vec2::new(xs[i] + p.x, ys[i] + p.y)));
}

/// Rotate four points at once (x lanes, y lanes)
#[inline]
pub fn rotate_quad(xs: Vec4, ys: Vec4, sin: f32, cos: f32) -> (Vec4, Vec4) {
    let s = Vec4::splat(sin);
    let c = Vec4::splat(cos);
    (xs * c - ys * s, xs * s + ys * c)
}

#[inline]
pub fn rotate_point(p: Vec2, sin: f32, cos: f32) -> Vec2 {
    Vec2::new(p.x * cos - p.y * sin, p.x * sin + p.y * cos)
}
