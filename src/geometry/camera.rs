//! Pinhole intrinsics and inverse-depth projection.

use nalgebra::{Matrix2x4, Vector2, Vector4};
use serde::{Deserialize, Serialize};

/// Working image resolution. Per-pixel fields are stored row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }

    /// Pixel coordinates `(u, v)` of a row-major index.
    #[inline]
    pub fn pixel(&self, index: usize) -> (f64, f64) {
        ((index % self.width) as f64, (index / self.width) as f64)
    }
}

/// Pinhole camera intrinsics `(fx, fy, cx, cy)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Homogeneous inverse-depth point `((u - cx)/fx, (v - cy)/fy, 1, disparity)`.
    #[inline]
    pub fn back_project(&self, u: f64, v: f64, disparity: f64) -> Vector4<f64> {
        Vector4::new((u - self.cx) / self.fx, (v - self.cy) / self.fy, 1.0, disparity)
    }

    /// Pixel coordinates of a homogeneous point. `w` does not affect the result.
    #[inline]
    pub fn project(&self, point: &Vector4<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        )
    }

    /// Jacobian of [`Intrinsics::project`] with respect to the homogeneous point.
    #[inline]
    pub fn projection_jacobian(&self, point: &Vector4<f64>) -> Matrix2x4<f64> {
        let inv_z = 1.0 / point.z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x4::new(
            self.fx * inv_z,
            0.0,
            -self.fx * point.x * inv_z2,
            0.0,
            0.0,
            self.fy * inv_z,
            -self.fy * point.y * inv_z2,
            0.0,
        )
    }
}
