//! Look-at perspective camera with agent follow.
//!
//! Following an agent eases the look-at target toward the agent each tick and
//! moves the eye by the same amount, so the viewing offset is preserved.

use glam::{Mat4, Vec3, Vec4};

/// Fraction of the remaining distance covered per follow tick.
pub const FOLLOW_LERP_RATE: f32 = 0.2;

/// Follow stops easing once closer than this.
const FOLLOW_SNAP_DISTANCE: f32 = 1e-3;

#[derive(Clone, Debug)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 120.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov: 75.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Place the camera so the whole `[min.., max..]` volume is in view.
    pub fn framing_bounds(bounds: [f32; 6]) -> Self {
        let min = Vec3::new(bounds[0], bounds[1], bounds[2]);
        let max = Vec3::new(bounds[3], bounds[4], bounds[5]);
        let center = (min + max) * 0.5;
        let radius = (max - min).length() * 0.5;
        let mut camera = Self {
            target: center,
            ..Self::default()
        };
        let half_fov = (camera.fov.to_radians() * 0.5).max(1e-3);
        let distance = radius / half_fov.sin();
        camera.position = center + Vec3::Z * distance;
        camera.far = (distance + radius) * 2.0;
        camera
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov.to_radians(), aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self, aspect: f32) -> Mat4 {
        self.projection_matrix(aspect) * self.view_matrix()
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    /// Ease toward `agent_position`. Returns true while still moving.
    pub fn animate_follow(&mut self, agent_position: Vec3) -> bool {
        let offset = agent_position - self.target;
        if offset.length() < FOLLOW_SNAP_DISTANCE {
            return false;
        }
        let step = offset * FOLLOW_LERP_RATE;
        self.target += step;
        self.position += step;
        true
    }

    /// World-space ray through pixel `(x, y)` of a `width` x `height` viewport.
    pub fn screen_ray(&self, x: f32, y: f32, width: u32, height: u32) -> (Vec3, Vec3) {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        let ndc_x = (x + 0.5) / width.max(1) as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y + 0.5) / height.max(1) as f32 * 2.0;
        let inv = self.view_projection_matrix(aspect).inverse();
        // wgpu clip space depth runs 0..1
        let near = inv * Vec4::new(ndc_x, ndc_y, 0.0, 1.0);
        let far = inv * Vec4::new(ndc_x, ndc_y, 1.0, 1.0);
        let near = near.truncate() / near.w;
        let far = far.truncate() / far.w;
        (near, (far - near).normalize_or_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_follow_preserves_offset() {
        let mut camera = Camera::default();
        let offset = camera.position - camera.target;
        assert!(camera.animate_follow(Vec3::new(10.0, 0.0, 0.0)));
        assert_relative_eq!(camera.target.x, 2.0);
        assert_relative_eq!((camera.position - camera.target).z, offset.z);

        for _ in 0..200 {
            camera.animate_follow(Vec3::new(10.0, 0.0, 0.0));
        }
        assert!(!camera.animate_follow(Vec3::new(10.0, 0.0, 0.0)));
        assert_relative_eq!(camera.target.x, 10.0, epsilon = 1e-2);
    }

    #[test]
    fn test_center_ray_points_at_target() {
        let camera = Camera::default();
        let (origin, dir) = camera.screen_ray(49.5, 49.5, 100, 100);
        assert_relative_eq!(dir.z, -1.0, epsilon = 1e-4);
        assert_relative_eq!(origin.x, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_framing_bounds_contains_volume() {
        let camera = Camera::framing_bounds([-10.0, -10.0, -10.0, 10.0, 10.0, 10.0]);
        assert_eq!(camera.target, Vec3::ZERO);
        let radius = Vec3::splat(20.0).length() * 0.5;
        assert!(camera.position.z > radius);
        assert!(camera.far > camera.position.z + radius);
    }
}
