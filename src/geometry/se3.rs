//! SE3: 6-DOF rigid body transformation.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3, Vector4};

use super::lie::LieGroup;
use super::so3::{left_jacobian, left_jacobian_inv, skew};

/// Rigid transformation. Transforms points as `p' = R p + t`.
///
/// Keyframe poses are stored world-to-camera (T_cw).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl LieGroup for SE3 {
    const DIM: usize = 6;

    fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    fn exp(tangent: &[f64]) -> Self {
        debug_assert_eq!(tangent.len(), Self::DIM);
        let tau = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let phi = Vector3::new(tangent[3], tangent[4], tangent[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(phi),
            translation: left_jacobian(&phi) * tau,
        }
    }

    fn log(&self) -> Vec<f64> {
        let phi = self.rotation.scaled_axis();
        let tau = left_jacobian_inv(&phi) * self.translation;
        vec![tau.x, tau.y, tau.z, phi.x, phi.y, phi.z]
    }

    fn act(&self, point: &Vector4<f64>) -> Vector4<f64> {
        let p = self.rotation * point.xyz() + self.translation * point.w;
        Vector4::new(p.x, p.y, p.z, point.w)
    }

    fn action_jacobian(point: &Vector4<f64>) -> DMatrix<f64> {
        // d(exp(δ) X)/dδ = [ w I  -[x]× ]
        let mut jac = DMatrix::zeros(4, Self::DIM);
        jac.view_mut((0, 0), (3, 3))
            .copy_from(&(Matrix3::identity() * point.w));
        jac.view_mut((0, 3), (3, 3)).copy_from(&(-skew(&point.xyz())));
        jac
    }

    fn adjoint(&self) -> DMatrix<f64> {
        // Adj = [ R  [t]× R ]
        //       [ 0    R    ]
        let r = self.rotation_matrix();
        let mut adj = DMatrix::zeros(Self::DIM, Self::DIM);
        adj.view_mut((0, 0), (3, 3)).copy_from(&r);
        adj.view_mut((0, 3), (3, 3))
            .copy_from(&(skew(&self.translation) * r));
        adj.view_mut((3, 3), (3, 3)).copy_from(&r);
        adj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.2, -0.1, 0.3)),
            Vector3::new(0.5, -1.0, 2.0),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let pose = sample_pose();
        let composed = pose.compose(&pose.inverse());
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(composed.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let pose = sample_pose();
        let back = SE3::exp(&pose.log());
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-10);
        assert_relative_eq!(back.rotation.coords, pose.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_retract_multiplies_on_the_left() {
        let pose = sample_pose();
        let delta = [0.01, 0.02, -0.01, 0.003, -0.002, 0.001];
        let expected = SE3::exp(&delta).compose(&pose);
        let retracted = pose.retract(&delta);
        assert_relative_eq!(retracted.translation, expected.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_adjoint_matches_conjugation() {
        let pose = sample_pose();
        let delta = [0.03, -0.01, 0.02, 0.01, 0.02, -0.015];
        let lhs = SE3::exp(&delta);
        let lhs = pose.compose(&lhs).compose(&pose.inverse());

        let adj_delta = pose.adjoint() * DVector::from_column_slice(&delta);
        let rhs = SE3::exp(adj_delta.as_slice());

        assert_relative_eq!(lhs.translation, rhs.translation, epsilon = 1e-10);
        assert_relative_eq!(lhs.rotation.coords, rhs.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_action_jacobian_numerical() {
        let point = Vector4::new(0.3, -0.2, 1.0, 0.5);
        let analytic = SE3::action_jacobian(&point);
        let h = 1e-7;
        for k in 0..SE3::DIM {
            let mut delta = [0.0; 6];
            delta[k] = h;
            let plus = SE3::exp(&delta).act(&point);
            delta[k] = -h;
            let minus = SE3::exp(&delta).act(&point);
            let numeric = (plus - minus) / (2.0 * h);
            for row in 0..4 {
                assert_relative_eq!(analytic[(row, k)], numeric[row], epsilon = 1e-6);
            }
        }
    }
}
