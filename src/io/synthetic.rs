//! Procedural input sequence with exact ground truth.
//!
//! A camera moves through a box-shaped scene (floor, back wall and a tilted
//! side wall). Depth maps are obtained by ray casting, so correspondences
//! between any two frames can be computed exactly from the ground truth.

use std::sync::Arc;

use anyhow::{bail, Result};
use nalgebra::{DVector, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::correspondence::CorrespondenceSource;
use crate::geometry::{ImageShape, Intrinsics, LieGroup, SE3};
use crate::optimizer::projection::project_edge;
use crate::optimizer::{BaState, EdgeSet};
use crate::system::messages::InputFrame;

/// Ray parameter used when a pixel hits no plane.
const FAR_DEPTH: f64 = 20.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub num_frames: usize,
    pub fps: f64,
    /// Camera center displacement per frame (world frame).
    pub step: [f64; 3],
    /// Yaw increment per frame in radians.
    pub yaw_step: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_frames: 12,
            fps: 10.0,
            step: [0.06, 0.0, 0.04],
            yaw_step: 0.01,
        }
    }
}

/// Plane `normal · X = offset` in world coordinates.
#[derive(Debug, Clone, Copy)]
struct Plane {
    normal: Vector3<f64>,
    offset: f64,
}

fn scene() -> [Plane; 3] {
    [
        // Back wall.
        Plane {
            normal: Vector3::new(0.0, 0.0, 1.0),
            offset: 5.0,
        },
        // Tilted right wall.
        Plane {
            normal: Vector3::new(0.8, 0.0, 0.6),
            offset: 3.2,
        },
        // Floor, y points down.
        Plane {
            normal: Vector3::new(0.0, 1.0, 0.0),
            offset: 1.5,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct SyntheticSequence {
    pub shape: ImageShape,
    pub intrinsics: Intrinsics,
    /// Ground-truth world-to-camera poses.
    pub poses: Vec<SE3>,
    /// Ground-truth disparity maps.
    pub disparities: Vec<DVector<f64>>,
    pub timestamps: Vec<f64>,
}

impl SyntheticSequence {
    pub fn generate(config: &SyntheticConfig, shape: ImageShape, intrinsics: Intrinsics) -> Result<Self> {
        if config.num_frames == 0 {
            bail!("synthetic sequence needs at least one frame");
        }
        if config.fps <= 0.0 {
            bail!("synthetic sequence fps must be positive, got {}", config.fps);
        }

        let step = Vector3::from(config.step);
        let planes = scene();
        let mut poses = Vec::with_capacity(config.num_frames);
        let mut disparities = Vec::with_capacity(config.num_frames);
        let mut timestamps = Vec::with_capacity(config.num_frames);

        for k in 0..config.num_frames {
            let center = step * k as f64;
            let rotation = UnitQuaternion::from_scaled_axis(Vector3::y() * config.yaw_step * k as f64);
            // Camera-to-world, stored inverted.
            let t_wc = SE3::new(rotation, center);
            let r_wc = t_wc.rotation_matrix();

            let disparity = DVector::from_fn(shape.num_pixels(), |p, _| {
                let (u, v) = shape.pixel(p);
                let ray = intrinsics.back_project(u, v, 0.0).xyz();
                let dir = r_wc * ray;
                // Camera-frame ray has unit z, so the ray parameter is the depth.
                let depth = planes
                    .iter()
                    .filter_map(|plane| {
                        let denom = plane.normal.dot(&dir);
                        if denom.abs() < 1e-9 {
                            return None;
                        }
                        let lambda = (plane.offset - plane.normal.dot(&center)) / denom;
                        (lambda > 0.0).then_some(lambda)
                    })
                    .fold(FAR_DEPTH, f64::min);
                1.0 / depth
            });

            poses.push(t_wc.inverse());
            disparities.push(disparity);
            timestamps.push(k as f64 / config.fps);
        }

        Ok(Self {
            shape,
            intrinsics,
            poses,
            disparities,
            timestamps,
        })
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Stream frames carrying metric depth.
    pub fn frames(&self) -> impl Iterator<Item = InputFrame> + '_ {
        (0..self.len()).map(move |index| InputFrame {
            index,
            timestamp: self.timestamps[index],
            intrinsics: self.intrinsics,
            depth: Some(self.disparities[index].map(|d| 1.0 / d)),
        })
    }

    /// Exact correspondence field of frame `i` in frame `j`.
    pub fn correspondence(&self, i: usize, j: usize, confidence: f64) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let proj = project_edge(
            &self.poses[i],
            &self.poses[j],
            &self.disparities[i],
            &self.intrinsics,
            &self.intrinsics,
            self.shape,
            false,
        );
        let weights = proj
            .valid
            .iter()
            .map(|&ok| if ok { Vector2::repeat(confidence) } else { Vector2::zeros() })
            .collect();
        (proj.coords, weights)
    }
}

/// Apply a random left perturbation of at most `magnitude` per tangent
/// coordinate to every pose except the first.
pub fn perturb_poses<G: LieGroup>(poses: &mut [G], magnitude: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for pose in poses.iter_mut().skip(1) {
        let delta: Vec<f64> = (0..G::DIM).map(|_| rng.gen_range(-magnitude..=magnitude)).collect();
        *pose = pose.retract(&delta);
    }
}

/// Multiply every disparity by a random factor in `[1 - spread, 1 + spread]`.
pub fn perturb_disparities(disparities: &mut [DVector<f64>], spread: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for disp in disparities.iter_mut() {
        disp.apply(|d| *d *= 1.0 + rng.gen_range(-spread..=spread));
    }
}

/// Correspondences computed from the ground truth of a [`SyntheticSequence`].
pub struct GroundTruthCorrespondence {
    sequence: Arc<SyntheticSequence>,
    confidence: f64,
}

impl GroundTruthCorrespondence {
    pub fn new(sequence: Arc<SyntheticSequence>, confidence: f64) -> Self {
        Self { sequence, confidence }
    }
}

impl<G: LieGroup> CorrespondenceSource<G> for GroundTruthCorrespondence {
    fn correspondences(
        &mut self,
        frame_ids: &[usize],
        state: &BaState<G>,
        pairs: &[(usize, usize)],
    ) -> Result<EdgeSet> {
        if state.shape != self.sequence.shape {
            bail!(
                "state shape {:?} does not match sequence shape {:?}",
                state.shape,
                self.sequence.shape
            );
        }

        let mut edges = EdgeSet::new();
        for &(i, j) in pairs {
            let (Some(&fi), Some(&fj)) = (frame_ids.get(i), frame_ids.get(j)) else {
                bail!("keyframe pair ({}, {}) has no source frame", i, j);
            };
            if fi >= self.sequence.len() || fj >= self.sequence.len() {
                bail!("frame pair ({}, {}) is outside the sequence", fi, fj);
            }
            let (target, weight) = self.sequence.correspondence(fi, fj, self.confidence);
            edges.push(i, j, target, weight);
        }
        Ok(edges)
    }
}
