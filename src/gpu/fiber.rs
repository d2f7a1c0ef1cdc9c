//! Tube meshes for fiber agents.
//!
//! All fibers of a frame are packed into one vertex/index batch; fiber `i`
//! draws its index range with instance `i` of the fiber instance pool, which
//! carries an identity transform and the fiber's identity pair.

use std::ops::Range;

use glam::Vec3;

use crate::gpu::mesh::Vertex;

/// Ring resolution of fiber tubes.
pub const TUBE_SIDES: u32 = 8;

#[derive(Debug, Default, Clone)]
pub struct FiberBatch {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Index range of each fiber, in pool order.
    pub ranges: Vec<Range<u32>>,
}

impl FiberBatch {
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.ranges.clear();
    }

    /// Append a tube around `points`. Fibers with fewer than two points get an empty range.
    pub fn push_tube(&mut self, points: &[Vec3], radius: f32, sides: u32) {
        let start = self.indices.len() as u32;
        if points.len() >= 2 && sides >= 3 {
            let base = self.vertices.len() as u32;
            let mut normal = initial_normal(points[1] - points[0]);

            for (i, p) in points.iter().enumerate() {
                let tangent = tube_tangent(points, i);
                // Parallel transport keeps rings from twisting
                normal = (normal - tangent * normal.dot(tangent)).normalize_or(initial_normal(tangent));
                let binormal = tangent.cross(normal);

                for s in 0..sides {
                    let angle = std::f32::consts::TAU * s as f32 / sides as f32;
                    let (sin, cos) = angle.sin_cos();
                    let n = normal * cos + binormal * sin;
                    self.vertices.push(Vertex::new((*p + n * radius).to_array(), n.to_array()));
                }
            }

            for ring in 0..points.len() as u32 - 1 {
                let a = base + ring * sides;
                let b = a + sides;
                for s in 0..sides {
                    let next = (s + 1) % sides;
                    self.indices
                        .extend_from_slice(&[a + s, b + s, a + next, a + next, b + s, b + next]);
                }
            }
        }
        self.ranges.push(start..self.indices.len() as u32);
    }
}

fn tube_tangent(points: &[Vec3], i: usize) -> Vec3 {
    let prev = points[i.saturating_sub(1)];
    let next = points[(i + 1).min(points.len() - 1)];
    (next - prev).normalize_or(Vec3::Y)
}

fn initial_normal(tangent: Vec3) -> Vec3 {
    let t = tangent.normalize_or(Vec3::Y);
    let helper = if t.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
    t.cross(helper).normalize_or(Vec3::Z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tube_counts() {
        let mut batch = FiberBatch::default();
        batch.push_tube(&[Vec3::ZERO, Vec3::X, Vec3::new(2.0, 1.0, 0.0)], 0.5, 8);
        assert_eq!(batch.vertices.len(), 24);
        assert_eq!(batch.indices.len(), 2 * 8 * 6);
        assert_eq!(batch.ranges, vec![0..96]);
    }

    #[test]
    fn test_tube_vertices_sit_on_radius() {
        let mut batch = FiberBatch::default();
        batch.push_tube(&[Vec3::ZERO, Vec3::new(0.0, 0.0, 4.0)], 0.25, 6);
        for v in &batch.vertices[..6] {
            let p = Vec3::from(v.position);
            assert_relative_eq!(p.length(), 0.25, epsilon = 1e-5);
            assert_relative_eq!(p.z, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_ranges_follow_fiber_order() {
        let mut batch = FiberBatch::default();
        batch.push_tube(&[Vec3::ZERO, Vec3::X], 0.1, 4);
        batch.push_tube(&[Vec3::ZERO], 0.1, 4);
        batch.push_tube(&[Vec3::ZERO, Vec3::Y], 0.1, 4);
        assert_eq!(batch.ranges, vec![0..24, 24..24, 24..48]);
        assert!(batch.indices[24..].iter().all(|i| *i >= 8));
    }
}
