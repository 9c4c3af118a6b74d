//! Inputs of a windowed bundle-adjustment call and their preconditions.

use nalgebra::{DVector, Vector2};
use thiserror::Error;

use crate::geometry::{ImageShape, Intrinsics, LieGroup};

use super::linear::SolveStatus;
use super::sparse::SparseError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BaError {
    #[error("empty optimization window [{t0}, {t1})")]
    EmptyWindow { t0: usize, t1: usize },
    #[error("window end {t1} exceeds the {len} frames available")]
    WindowOutOfRange { t1: usize, len: usize },
    #[error("edge {edge} ({i} -> {j}) references a frame outside [0, {t1})")]
    EdgeOutOfWindow {
        edge: usize,
        i: usize,
        j: usize,
        t1: usize,
    },
    #[error("{what}: expected length {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame {frame} has no depth prior")]
    MissingPrior { frame: usize },
    #[error(transparent)]
    Sparse(#[from] SparseError),
}

/// Half-open frame range `[t0, t1)` subject to optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub t0: usize,
    pub t1: usize,
}

impl Window {
    pub fn new(t0: usize, t1: usize) -> Self {
        Self { t0, t1 }
    }

    /// First optimized pose. Frame 0 is always held fixed.
    pub fn fixed_prefix(&self) -> usize {
        self.t0.max(1)
    }

    /// Number of pose nodes in the reduced system.
    pub fn num_free_poses(&self) -> usize {
        self.t1.saturating_sub(self.fixed_prefix())
    }
}

/// Correspondence edges `(ii[e], jj[e])` with per-pixel target and confidence.
#[derive(Debug, Clone, Default)]
pub struct EdgeSet {
    pub ii: Vec<usize>,
    pub jj: Vec<usize>,
    /// Predicted pixel coordinates in frame `jj[e]`, one per pixel of `ii[e]`.
    pub targets: Vec<Vec<Vector2<f64>>>,
    /// Per-channel confidence, same layout as `targets`.
    pub weights: Vec<Vec<Vector2<f64>>>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, i: usize, j: usize, target: Vec<Vector2<f64>>, weight: Vec<Vector2<f64>>) {
        self.ii.push(i);
        self.jj.push(j);
        self.targets.push(target);
        self.weights.push(weight);
    }

    pub fn len(&self) -> usize {
        self.ii.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ii.is_empty()
    }

    /// Check array lengths, field sizes and that every edge lies in `[0, t1)`.
    pub fn validate(&self, shape: ImageShape, t1: usize) -> Result<(), BaError> {
        let n = self.ii.len();
        for (what, len) in [("jj", self.jj.len()), ("targets", self.targets.len()), ("weights", self.weights.len())] {
            if len != n {
                return Err(BaError::ShapeMismatch {
                    what,
                    expected: n,
                    actual: len,
                });
            }
        }

        let hw = shape.num_pixels();
        for e in 0..n {
            let (i, j) = (self.ii[e], self.jj[e]);
            if i >= t1 || j >= t1 {
                return Err(BaError::EdgeOutOfWindow { edge: e, i, j, t1 });
            }
            for (what, len) in [("target field", self.targets[e].len()), ("weight field", self.weights[e].len())] {
                if len != hw {
                    return Err(BaError::ShapeMismatch {
                        what,
                        expected: hw,
                        actual: len,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Frame-indexed optimization state, the prefix `[0, t1)` of a keyframe store.
#[derive(Debug, Clone)]
pub struct BaState<G: LieGroup> {
    pub shape: ImageShape,
    /// World-to-camera poses.
    pub poses: Vec<G>,
    pub disparities: Vec<DVector<f64>>,
    pub intrinsics: Vec<Intrinsics>,
    /// Per-pixel structure damping (eta).
    pub damping: Vec<DVector<f64>>,
    /// Externally supplied prior disparity; non-positive pixels carry no prior.
    pub priors: Vec<Option<DVector<f64>>>,
    pub scales: Vec<f64>,
    pub shifts: Vec<f64>,
}

impl<G: LieGroup> BaState<G> {
    pub fn new(shape: ImageShape) -> Self {
        Self {
            shape,
            poses: Vec::new(),
            disparities: Vec::new(),
            intrinsics: Vec::new(),
            damping: Vec::new(),
            priors: Vec::new(),
            scales: Vec::new(),
            shifts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Append one frame with unit scale and zero shift.
    pub fn push_frame(
        &mut self,
        pose: G,
        disparity: DVector<f64>,
        intrinsics: Intrinsics,
        damping: DVector<f64>,
        prior: Option<DVector<f64>>,
    ) {
        self.poses.push(pose);
        self.disparities.push(disparity);
        self.intrinsics.push(intrinsics);
        self.damping.push(damping);
        self.priors.push(prior);
        self.scales.push(1.0);
        self.shifts.push(0.0);
    }

    /// Check that every per-frame array has the same length and pixel count.
    pub fn validate(&self) -> Result<(), BaError> {
        let n = self.poses.len();
        let lens = [
            ("disparities", self.disparities.len()),
            ("intrinsics", self.intrinsics.len()),
            ("damping", self.damping.len()),
            ("priors", self.priors.len()),
            ("scales", self.scales.len()),
            ("shifts", self.shifts.len()),
        ];
        for (what, len) in lens {
            if len != n {
                return Err(BaError::ShapeMismatch {
                    what,
                    expected: n,
                    actual: len,
                });
            }
        }

        let hw = self.shape.num_pixels();
        let fields = self
            .disparities
            .iter()
            .map(|d| ("disparity map", d.len()))
            .chain(self.damping.iter().map(|d| ("damping map", d.len())))
            .chain(self.priors.iter().flatten().map(|d| ("prior map", d.len())));
        for (what, len) in fields {
            if len != hw {
                return Err(BaError::ShapeMismatch {
                    what,
                    expected: hw,
                    actual: len,
                });
            }
        }
        Ok(())
    }
}

/// Summary of one bundle-adjustment call.
#[derive(Debug, Clone)]
pub struct BaReport {
    pub iterations: usize,
    /// Weighted squared reprojection error before the first iteration.
    pub initial_cost: f64,
    /// Weighted squared reprojection error after the last iteration.
    pub final_cost: f64,
    /// Iterations whose step did not come from the preferred factorization.
    pub fallbacks: usize,
    /// Solver path of the last iteration, `None` for diagonal-only solves.
    pub last_status: Option<SolveStatus>,
}
