//! Similarity pose group Sim(3).
//!
//! Keyframe pose type when monocular scale drift has to be absorbed by the
//! optimizer. The extra tangent coordinate is the log-scale `σ`.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3, Vector4};

use super::lie::LieGroup;
use super::se3::SE3;
use super::so3::{left_jacobian, left_jacobian_inv, skew};

/// Scaled rigid motion acting as `x ↦ s R x + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Lift a rigid pose with the given scale.
    pub fn from_rigid(pose: &SE3, scale: f64) -> Self {
        Self {
            rotation: pose.rotation,
            translation: pose.translation,
            scale,
        }
    }

    /// Drop the scale.
    pub fn rigid_part(&self) -> SE3 {
        SE3::new(self.rotation, self.translation)
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl LieGroup for Sim3 {
    const DIM: usize = 7;

    fn identity() -> Self {
        Self::from_rigid(&SE3::identity(), 1.0)
    }

    // (s₁R₁, t₁) ∘ (s₂R₂, t₂) = (s₁s₂ R₁R₂, s₁R₁t₂ + t₁)
    fn compose(&self, other: &Self) -> Self {
        let rotated = self.rotation * other.translation;
        Self {
            rotation: self.rotation * other.rotation,
            translation: rotated * self.scale + self.translation,
            scale: self.scale * other.scale,
        }
    }

    fn inverse(&self) -> Self {
        let conj = self.rotation.conjugate();
        let inv_scale = self.scale.recip();
        Self {
            translation: conj * self.translation * -inv_scale,
            rotation: conj,
            scale: inv_scale,
        }
    }

    /// Decoupled exponential: rotation and scale are exponentiated
    /// independently and translation goes through the SO(3) left Jacobian.
    /// It agrees with the true Sim(3) exponential to first order.
    fn exp(tangent: &[f64]) -> Self {
        debug_assert_eq!(tangent.len(), Self::DIM);
        let tau = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let phi = Vector3::new(tangent[3], tangent[4], tangent[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(phi),
            translation: left_jacobian(&phi) * tau,
            scale: tangent[6].exp(),
        }
    }

    fn log(&self) -> Vec<f64> {
        let phi = self.rotation.scaled_axis();
        let tau = left_jacobian_inv(&phi) * self.translation;
        vec![tau.x, tau.y, tau.z, phi.x, phi.y, phi.z, self.scale.ln()]
    }

    fn act(&self, point: &Vector4<f64>) -> Vector4<f64> {
        let p = self.scale * (self.rotation * point.xyz()) + self.translation * point.w;
        Vector4::new(p.x, p.y, p.z, point.w)
    }

    fn action_jacobian(point: &Vector4<f64>) -> DMatrix<f64> {
        // d(exp(δ) X)/dδ = [ w I  -[x]×  x ]
        let x = point.xyz();
        let mut jac = DMatrix::zeros(4, Self::DIM);
        jac.view_mut((0, 0), (3, 3))
            .copy_from(&(Matrix3::identity() * point.w));
        jac.view_mut((0, 3), (3, 3)).copy_from(&(-skew(&x)));
        jac.view_mut((0, 6), (3, 1)).copy_from(&x);
        jac
    }

    fn adjoint(&self) -> DMatrix<f64> {
        // Adj = [ sR  [t]× R  -t ]
        //       [ 0     R      0 ]
        //       [ 0     0      1 ]
        let r = self.rotation.to_rotation_matrix().into_inner();
        let mut adj = DMatrix::zeros(Self::DIM, Self::DIM);
        adj.view_mut((0, 0), (3, 3)).copy_from(&(r * self.scale));
        adj.view_mut((0, 3), (3, 3))
            .copy_from(&(skew(&self.translation) * r));
        adj.view_mut((0, 6), (3, 1)).copy_from(&(-self.translation));
        adj.view_mut((3, 3), (3, 3)).copy_from(&r);
        adj[(6, 6)] = 1.0;
        adj
    }
}
