//! Projection math shared by every backend.
//!
//! Matrices are `glam::Mat4` (column vectors, `clip = proj * view * pos`).
//! Depth is mapped into the `[0, 1]` range. Perspective projections are
//! reversed so that the near plane lands on 1.0 and the far plane on 0.0,
//! which pairs with a `GreaterEqual` depth test and a depth clear of 0.0.

use glam::{Mat4, Vec4};

/// Near plane of the orthographic (2D) projection.
pub const ORTHO_NEAR: f32 = -10000.0;
/// Far plane of the orthographic (2D) projection.
pub const ORTHO_FAR: f32 = 10000.0;

/// Orthographic projection over `[0, width] x [0, height]` with the origin in
/// the top-left corner, as used for UI drawing.
pub fn calc_ortho_matrix(width: f32, height: f32) -> Mat4 {
    let (near, far) = (ORTHO_NEAR, ORTHO_FAR);
    let (left, right, top, bottom) = (0.0, width, 0.0, height);

    let sx = 2.0 / (right - left);
    let sy = 2.0 / (top - bottom);
    let tx = -(right + left) / (right - left);
    let ty = -(top + bottom) / (top - bottom);

    let sz = 1.0 / (near - far);
    let tz = near / (near - far);

    Mat4::from_cols(
        Vec4::new(sx, 0.0, 0.0, 0.0),
        Vec4::new(0.0, sy, 0.0, 0.0),
        Vec4::new(0.0, 0.0, sz, 0.0),
        Vec4::new(tx, ty, tz, 1.0),
    )
}

/// Field-of-view perspective projection with reversed depth.
///
/// `fov` is the vertical field of view in radians. The conventional `[0, 1]`
/// matrix is built first, then its depth row is flipped with
/// `z' = -z - 1` and `w' = -w` so that depth grows toward the camera.
pub fn calc_perspective_matrix(fov: f32, aspect: f32, z_far: f32, depth_bits: u32) -> Mat4 {
    let z_near = calc_z_near(fov, depth_bits);
    let mut m = conventional_perspective(fov, aspect, z_near, z_far);
    m.z_axis.z = -m.z_axis.z - 1.0;
    m.w_axis.z = -m.w_axis.z;
    m
}

/// Near-plane distance for a field of view (radians).
///
/// Wide fields of view pull the near plane in so geometry right next to the
/// camera is not clipped. Depth buffers under 24 bits always get the largest
/// distance, anything smaller z-fights badly.
pub fn calc_z_near(fov: f32, depth_bits: u32) -> f32 {
    if depth_bits < 24 || fov <= 70.0_f32.to_radians() {
        return 0.05;
    }
    if fov <= 100.0_f32.to_radians() {
        return 0.025;
    }
    if fov <= 150.0_f32.to_radians() {
        return 0.0125;
    }
    0.00390625
}

fn conventional_perspective(fov: f32, aspect: f32, z_near: f32, z_far: f32) -> Mat4 {
    let c = z_near * (0.5 * fov).tan();
    let (left, right) = (-c * aspect, c * aspect);
    let (bottom, top) = (-c, c);

    let x = (2.0 * z_near) / (right - left);
    let y = (2.0 * z_near) / (top - bottom);
    let a = (right + left) / (right - left);
    let b = (top + bottom) / (top - bottom);
    let depth = z_far / (z_near - z_far);

    Mat4::from_cols(
        Vec4::new(x, 0.0, 0.0, 0.0),
        Vec4::new(0.0, y, 0.0, 0.0),
        Vec4::new(a, b, depth, -1.0),
        Vec4::new(0.0, 0.0, z_near * depth, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn ndc_depth(m: &Mat4, view_depth: f32) -> f32 {
        let clip = *m * Vec4::new(0.0, 0.0, -view_depth, 1.0);
        clip.z / clip.w
    }

    #[test]
    fn perspective_depth_is_reversed() {
        let fov = 70.0_f32.to_radians();
        let m = calc_perspective_matrix(fov, 16.0 / 9.0, 512.0, 24);
        let near = calc_z_near(fov, 24);

        assert!((ndc_depth(&m, near) - 1.0).abs() < 1e-4, "near plane should map to 1.0");
        assert!(ndc_depth(&m, 512.0).abs() < 1e-4, "far plane should map to 0.0");

        let mut last = f32::INFINITY;
        for d in [near, 0.5, 1.0, 8.0, 64.0, 200.0, 511.0] {
            let z = ndc_depth(&m, d);
            assert!(z < last, "depth {d} gave {z}, expected below {last}");
            last = z;
        }
    }

    #[test]
    fn z_near_shrinks_with_fov() {
        assert_eq!(calc_z_near(60.0_f32.to_radians(), 24), 0.05);
        assert_eq!(calc_z_near(90.0_f32.to_radians(), 24), 0.025);
        assert_eq!(calc_z_near(120.0_f32.to_radians(), 24), 0.0125);
        assert_eq!(calc_z_near(160.0_f32.to_radians(), 24), 0.00390625);
    }

    #[test]
    fn z_near_ignores_fov_on_shallow_depth_buffers() {
        assert_eq!(calc_z_near(160.0_f32.to_radians(), 16), 0.05);
    }

    #[test]
    fn ortho_maps_top_left_origin() {
        let m = calc_ortho_matrix(640.0, 480.0);
        let tl = m.project_point3(Vec3::new(0.0, 0.0, 0.0));
        let br = m.project_point3(Vec3::new(640.0, 480.0, 0.0));
        assert!((tl.x + 1.0).abs() < 1e-6 && (tl.y - 1.0).abs() < 1e-6);
        assert!((br.x - 1.0).abs() < 1e-6 && (br.y + 1.0).abs() < 1e-6);
    }

    #[test]
    fn ortho_depth_spans_fixed_range() {
        let m = calc_ortho_matrix(100.0, 100.0);
        let near = m.project_point3(Vec3::new(0.0, 0.0, ORTHO_NEAR));
        let far = m.project_point3(Vec3::new(0.0, 0.0, ORTHO_FAR));
        assert!((near.z - 1.0).abs() < 1e-6, "got {}", near.z);
        assert!(far.z.abs() < 1e-6, "got {}", far.z);
    }
}
