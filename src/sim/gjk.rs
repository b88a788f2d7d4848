//! Narrow-phase intersection tests
//!
//! Circle pairs use a squared-distance check. Every other pair runs a 2D
//! boolean GJK over the Minkowski difference, with an orientation flag that
//! tracks which side of the current edge the simplex winds on.

use glam::Vec2;

/// Gives up on degenerate (near-touching) configurations
const MAX_ITERATIONS: usize = 64;

/// A shape already placed in world space
#[derive(Debug, Clone, Copy)]
pub enum WorldShape<'a> {
    Circle { center: Vec2, radius: f32 },
    Polygon(&'a [Vec2]),
}

/// Test two world-space shapes for overlap
pub fn intersects(a: WorldShape<'_>, b: WorldShape<'_>) -> bool {
    match (a, b) {
        (WorldShape::Circle { center: ca, radius: ra }, WorldShape::Circle { center: cb, radius: rb }) => {
            circles_intersect(ca, ra, cb, rb)
        }
        (WorldShape::Circle { center, radius }, WorldShape::Polygon(poly))
        | (WorldShape::Polygon(poly), WorldShape::Circle { center, radius }) => {
            circle_polygon_intersect(center, radius, poly)
        }
        (WorldShape::Polygon(pa), WorldShape::Polygon(pb)) => polygons_intersect(pa, pb),
    }
}

/// Strict: tangent circles do not intersect
#[inline]
pub fn circles_intersect(ca: Vec2, ra: f32, cb: Vec2, rb: f32) -> bool {
    let r = ra + rb;
    ca.distance_squared(cb) < r * r
}

pub fn polygons_intersect(a: &[Vec2], b: &[Vec2]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    gjk(|d| furthest(a, d) - furthest(b, -d), Vec2::ONE)
}

pub fn circle_polygon_intersect(center: Vec2, radius: f32, poly: &[Vec2]) -> bool {
    if poly.is_empty() {
        return false;
    }
    gjk(
        |d| furthest(poly, d) - (center - d * (radius / d.length())),
        Vec2::X,
    )
}

/// Vertex with the largest projection onto `dir`
fn furthest(poly: &[Vec2], dir: Vec2) -> Vec2 {
    let mut best = poly[0];
    let mut best_dot = best.dot(dir);
    for &v in &poly[1..] {
        let d = v.dot(dir);
        if d > best_dot {
            best = v;
            best_dot = d;
        }
    }
    best
}

fn gjk(support: impl Fn(Vec2) -> Vec2, seed: Vec2) -> bool {
    let mut simplex = [support(seed), Vec2::ZERO, Vec2::ZERO];
    let mut len = 1;
    let mut dir = -simplex[0];
    let mut orientation = 1.0_f32;

    for _ in 0..MAX_ITERATIONS {
        // Origin sits on the boundary; treat touching as a miss
        if dir.length_squared() <= f32::EPSILON {
            return false;
        }

        let point = support(dir);
        if point.dot(dir) <= 0.0 {
            return false;
        }
        simplex[len] = point;
        len += 1;

        if len == 3 {
            let ao = -simplex[2];
            let ab = simplex[1] - simplex[2];
            let ac = simplex[0] - simplex[2];

            let ab_perp = ab.perp() * orientation;
            if ab_perp.dot(ao) > 0.0 {
                simplex[0] = simplex[1];
                simplex[1] = simplex[2];
                len = 2;
                dir = ab_perp;
                orientation = -orientation;
                continue;
            }

            let ac_perp = ac.perp() * -orientation;
            if ac_perp.dot(ao) > 0.0 {
                simplex[1] = simplex[2];
                len = 2;
                dir = ac_perp;
                continue;
            }

            return true;
        }

        let ab = simplex[1] - simplex[0];
        let ao = -simplex[0];
        let normal = ab.perp();
        if normal.dot(ao) > 0.0 {
            orientation = 1.0;
            dir = normal;
        } else {
            orientation = -1.0;
            dir = -normal;
        }
    }

    false
}
