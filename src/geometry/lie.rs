//! Common interface for the pose groups optimized by bundle adjustment.
//!
//! Tangent vectors are ordered `[translation (3), rotation (3), log-scale (1)]`
//! and perturbations are applied on the left:
//!
//! ```text
//! T ⊕ δ = exp(δ) · T
//! ```
//!
//! Points are handled in homogeneous inverse-depth form `X = (x, y, z, w)`,
//! where a back-projected pixel is `(x̄, ȳ, 1, disparity)`. The group acts on
//! the first three coordinates as `s R x + t w` and leaves `w` untouched.

use std::fmt::Debug;

use nalgebra::{DMatrix, Vector4};

/// A rigid or similarity transform usable as a bundle-adjustment pose node.
pub trait LieGroup: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Number of tangent-space parameters (6 for SE(3), 7 for Sim(3)).
    const DIM: usize;

    fn identity() -> Self;

    /// Group composition `self ∘ other`.
    fn compose(&self, other: &Self) -> Self;

    fn inverse(&self) -> Self;

    /// Exponential map from a tangent vector of length [`Self::DIM`].
    fn exp(tangent: &[f64]) -> Self;

    /// Logarithm, the inverse of [`LieGroup::exp`].
    fn log(&self) -> Vec<f64>;

    /// Retraction `exp(δ) · self`.
    fn retract(&self, delta: &[f64]) -> Self {
        Self::exp(delta).compose(self)
    }

    /// Apply the transform to a homogeneous point.
    fn act(&self, point: &Vector4<f64>) -> Vector4<f64>;

    /// 4×DIM Jacobian of `exp(δ) · X` with respect to δ at δ = 0.
    fn action_jacobian(point: &Vector4<f64>) -> DMatrix<f64>;

    /// DIM×DIM adjoint, satisfying `exp(Adj(T) δ) = T exp(δ) T⁻¹`.
    fn adjoint(&self) -> DMatrix<f64>;
}

/// Tangent-space distance between two poses, `‖log(a · b⁻¹)‖`.
pub fn tangent_distance<G: LieGroup>(a: &G, b: &G) -> f64 {
    a.compose(&b.inverse())
        .log()
        .iter()
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt()
}
