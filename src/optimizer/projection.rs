//! Dense inverse-depth reprojection between two keyframes.
//!
//! Every pixel of frame `i` is back-projected with its disparity, moved by
//! the relative pose `G_ij = G_j · G_i⁻¹`, and projected into frame `j`.
//! Jacobians are taken with respect to left perturbations of both poses and
//! with respect to the pixel's disparity.

use nalgebra::{DMatrix, DVector, Vector2, Vector4};

use crate::geometry::{ImageShape, Intrinsics, LieGroup};

/// A point must be at least this far in front of both cameras (in units of
/// the reference depth) to contribute.
pub const MIN_DEPTH: f64 = 0.2;

/// Reprojection of one edge.
#[derive(Debug, Clone)]
pub struct EdgeProjection {
    /// Projected pixel coordinates in frame `j`, one per source pixel.
    pub coords: Vec<Vector2<f64>>,
    /// Whether the point is in front of both cameras.
    pub valid: Vec<bool>,
    /// `2HW × DIM` Jacobian of the coordinates with respect to pose `i`.
    pub ji: DMatrix<f64>,
    /// `2HW × DIM` Jacobian with respect to pose `j`.
    pub jj: DMatrix<f64>,
    /// `2HW` Jacobian with respect to the source pixel's disparity.
    pub jz: DVector<f64>,
}

/// Project frame `i` into frame `j`. Jacobians are left empty when
/// `with_jacobians` is false.
pub fn project_edge<G: LieGroup>(
    pose_i: &G,
    pose_j: &G,
    disparity_i: &DVector<f64>,
    intrinsics_i: &Intrinsics,
    intrinsics_j: &Intrinsics,
    shape: ImageShape,
    with_jacobians: bool,
) -> EdgeProjection {
    let hw = shape.num_pixels();
    let rows = if with_jacobians { 2 * hw } else { 0 };
    let gij = pose_j.compose(&pose_i.inverse());
    // Image of the point at infinity direction (0, 0, 0, 1): the translation.
    let t_ij = gij.act(&Vector4::new(0.0, 0.0, 0.0, 1.0));

    let mut coords = Vec::with_capacity(hw);
    let mut valid = Vec::with_capacity(hw);
    let mut jj: DMatrix<f64> = DMatrix::zeros(rows, G::DIM);
    let mut jz = DVector::zeros(rows);

    for p in 0..hw {
        let (u, v) = shape.pixel(p);
        let x0 = intrinsics_i.back_project(u, v, disparity_i[p]);
        let mut x1 = gij.act(&x0);

        let ok = x1.z > MIN_DEPTH && x0.z > MIN_DEPTH;
        if x1.z < 0.5 * MIN_DEPTH {
            x1.z = 1.0;
        }
        coords.push(intrinsics_j.project(&x1));
        valid.push(ok);

        if !with_jacobians || !ok {
            continue;
        }

        let jp = intrinsics_j.projection_jacobian(&x1);
        let ja = G::action_jacobian(&x1);
        for r in 0..2 {
            let row = 2 * p + r;
            for c in 0..4 {
                let coeff = jp[(r, c)];
                if coeff != 0.0 {
                    for k in 0..G::DIM {
                        jj[(row, k)] += coeff * ja[(c, k)];
                    }
                }
            }
            jz[row] = (0..4).map(|c| jp[(r, c)] * t_ij[c]).sum::<f64>();
        }
    }

    // Perturbing pose i moves G_ij by exp(-Adj(G_ij) δ).
    let ji = if with_jacobians {
        -(&jj * gij.adjoint())
    } else {
        DMatrix::zeros(0, G::DIM)
    };

    EdgeProjection {
        coords,
        valid,
        ji,
        jj,
        jz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn setup() -> (SE3, SE3, DVector<f64>, Intrinsics, ImageShape) {
        let shape = ImageShape::new(3, 4);
        let k = Intrinsics::new(20.0, 20.0, 2.0, 1.5);
        let pose_i = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.01, -0.02, 0.03)),
            Vector3::new(0.1, 0.0, -0.05),
        );
        let pose_j = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(-0.02, 0.04, 0.0)),
            Vector3::new(-0.2, 0.05, 0.1),
        );
        let disp = DVector::from_fn(shape.num_pixels(), |p, _| 0.4 + 0.05 * p as f64);
        (pose_i, pose_j, disp, k, shape)
    }

    #[test]
    fn test_identity_relative_pose_reproduces_pixels() {
        let (pose_i, _, disp, k, shape) = setup();
        let proj = project_edge(&pose_i, &pose_i, &disp, &k, &k, shape, false);
        for p in 0..shape.num_pixels() {
            let (u, v) = shape.pixel(p);
            assert!(proj.valid[p]);
            assert_relative_eq!(proj.coords[p], Vector2::new(u, v), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_pose_jacobians_numerical() {
        let (pose_i, pose_j, disp, k, shape) = setup();
        let proj = project_edge(&pose_i, &pose_j, &disp, &k, &k, shape, true);
        let h = 1e-6;

        for dim in 0..SE3::DIM {
            let mut delta = [0.0; 6];
            delta[dim] = h;
            let plus_i = project_edge(&pose_i.retract(&delta), &pose_j, &disp, &k, &k, shape, false);
            let plus_j = project_edge(&pose_i, &pose_j.retract(&delta), &disp, &k, &k, shape, false);
            delta[dim] = -h;
            let minus_i = project_edge(&pose_i.retract(&delta), &pose_j, &disp, &k, &k, shape, false);
            let minus_j = project_edge(&pose_i, &pose_j.retract(&delta), &disp, &k, &k, shape, false);

            for p in 0..shape.num_pixels() {
                let num_i = (plus_i.coords[p] - minus_i.coords[p]) / (2.0 * h);
                let num_j = (plus_j.coords[p] - minus_j.coords[p]) / (2.0 * h);
                assert_relative_eq!(proj.ji[(2 * p, dim)], num_i.x, epsilon = 1e-4);
                assert_relative_eq!(proj.ji[(2 * p + 1, dim)], num_i.y, epsilon = 1e-4);
                assert_relative_eq!(proj.jj[(2 * p, dim)], num_j.x, epsilon = 1e-4);
                assert_relative_eq!(proj.jj[(2 * p + 1, dim)], num_j.y, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_disparity_jacobian_numerical() {
        let (pose_i, pose_j, disp, k, shape) = setup();
        let proj = project_edge(&pose_i, &pose_j, &disp, &k, &k, shape, true);
        let h = 1e-7;
        let plus = project_edge(&pose_i, &pose_j, &disp.add_scalar(h), &k, &k, shape, false);
        let minus = project_edge(&pose_i, &pose_j, &disp.add_scalar(-h), &k, &k, shape, false);

        for p in 0..shape.num_pixels() {
            let numeric = (plus.coords[p] - minus.coords[p]) / (2.0 * h);
            assert_relative_eq!(proj.jz[2 * p], numeric.x, epsilon = 1e-4);
            assert_relative_eq!(proj.jz[2 * p + 1], numeric.y, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_points_behind_camera_are_invalid() {
        let shape = ImageShape::new(1, 1);
        let k = Intrinsics::new(10.0, 10.0, 0.0, 0.0);
        let disp = DVector::from_element(1, 1.0);
        // Camera j shares the optical center of i but looks backwards.
        let pose_j = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, std::f64::consts::PI, 0.0)),
            Vector3::zeros(),
        );
        let proj = project_edge(&SE3::identity(), &pose_j, &disp, &k, &k, shape, true);
        assert!(!proj.valid[0]);
        assert!(proj.coords[0].iter().all(|v| v.is_finite()));
        assert!(proj.jj.iter().all(|v| *v == 0.0));
    }
}
