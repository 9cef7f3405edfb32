// src/culling.rs
//! Frustum-sphere culling for the forward drawer.

use glam::{Mat4, Vec3, Vec4};

/// Six inward-facing planes `(normal, distance)`, normalised so that
/// `dot(normal, p) + distance` is a signed distance in world units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Gribb-Hartmann extraction for a `[0, 1]` clip depth range
    /// (what `glam::Mat4::perspective_rh` and wgpu use).
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);

        let planes = [
            r3 + r0, // left
            r3 - r0, // right
            r3 + r1, // bottom
            r3 - r1, // top
            r2,      // near
            r3 - r2, // far
        ]
        .map(normalize_plane);

        Self { planes }
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    /// Conservative: spheres straddling a plane count as visible.
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.truncate().dot(center) + p.w >= -radius)
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let len = plane.truncate().length().max(1e-6);
    plane / len
}

/// Largest axis scale of an affine transform; bounding radii are multiplied
/// by this so non-uniform scaling never shrinks a sphere below its contents.
pub fn max_axis_scale(m: &Mat4) -> f32 {
    m.x_axis
        .truncate()
        .length()
        .max(m.y_axis.truncate().length())
        .max(m.z_axis.truncate().length())
}

/// World-space bounding sphere of local bounds placed by `model`.
pub fn world_sphere(model: &Mat4, local_center: Vec3, local_radius: f32) -> (Vec3, f32) {
    (
        model.transform_point3(local_center),
        local_radius * max_axis_scale(model),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looking_down_negative_z() -> Frustum {
        let proj = Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn sphere_in_front_is_visible() {
        let frustum = looking_down_negative_z();
        assert!(frustum.intersects_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0));
    }

    #[test]
    fn sphere_behind_is_culled() {
        let frustum = looking_down_negative_z();
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0));
    }

    #[test]
    fn sphere_past_far_plane_is_culled() {
        let frustum = looking_down_negative_z();
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, -150.0), 5.0));
    }

    #[test]
    fn straddling_sphere_is_kept() {
        let frustum = looking_down_negative_z();
        // 90 degree fov: the right plane passes through x == -z
        assert!(!frustum.intersects_sphere(Vec3::new(13.0, 0.0, -10.0), 1.0));
        assert!(frustum.intersects_sphere(Vec3::new(10.5, 0.0, -10.0), 1.0));
    }

    #[test]
    fn radius_scales_with_largest_axis() {
        let model = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 4.0, 2.0),
            glam::Quat::from_rotation_y(0.7),
            Vec3::new(3.0, 0.0, 0.0),
        );
        let (center, radius) = world_sphere(&model, Vec3::ZERO, 0.5);
        assert!((radius - 2.0).abs() < 1e-5);
        assert!(center.abs_diff_eq(Vec3::new(3.0, 0.0, 0.0), 1e-6));
    }
}
