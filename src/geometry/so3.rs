//! SO(3) helpers shared by the SE(3) and Sim(3) maps.
//!
//! The pose groups use left perturbations (`exp(δ) · T`), so the relevant
//! Jacobian is the left Jacobian Jl(φ) that maps the rotation tangent onto
//! the translation part of the exponential.

use nalgebra::{Matrix3, Vector3};

/// Below this angle the Taylor expansions are used.
const TAYLOR_ANGLE: f64 = 1e-6;

/// Cross-product matrix: `skew(v) * u == v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Left Jacobian of SO(3).
///
/// ```text
/// Jl(φ) = I + (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
/// ```
pub fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);

    if theta < TAYLOR_ANGLE {
        return Matrix3::identity() + 0.5 * phi_x;
    }

    let a = (1.0 - theta.cos()) / theta.powi(2);
    let b = (theta - theta.sin()) / theta.powi(3);
    Matrix3::identity() + phi_x * a + phi_x * phi_x * b
}

/// Inverse of the left Jacobian of SO(3).
///
/// ```text
/// Jl⁻¹(φ) = I - 0.5 [φ]× + (1/θ² - (1 + cos θ)/(2θ sin θ)) [φ]×²
/// ```
pub fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);

    if theta < TAYLOR_ANGLE {
        return Matrix3::identity() - 0.5 * phi_x + (1.0 / 12.0) * phi_x * phi_x;
    }

    let coeff = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * phi_x + coeff * phi_x * phi_x
}
