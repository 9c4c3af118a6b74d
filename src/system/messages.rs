//! Inter-worker message types.
//!
//! These types travel through the stream and mapping queues.

use nalgebra::DVector;

use crate::geometry::Intrinsics;

/// One input frame as delivered by the stream.
#[derive(Debug, Clone)]
pub struct InputFrame {
    /// Position in the input stream.
    pub index: usize,

    /// Timestamp in seconds.
    pub timestamp: f64,

    pub intrinsics: Intrinsics,

    /// Metric depth per pixel, row-major. Non-positive pixels are invalid.
    /// Only honored in the depth modes.
    pub depth: Option<DVector<f64>>,
}

impl InputFrame {
    /// Disparity prior `1 / depth` where the depth is valid, `0` elsewhere.
    pub fn disparity_prior(&self) -> Option<DVector<f64>> {
        self.depth
            .as_ref()
            .map(|depth| depth.map(|z| if z > 0.0 { 1.0 / z } else { 0.0 }))
    }
}
