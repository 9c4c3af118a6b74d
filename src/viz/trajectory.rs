use anyhow::Result;
use nalgebra::Vector3;
use tracing::debug;

use crate::geometry::LieGroup;
use crate::store::KeyframeStore;

use super::Visualizer;

/// Logs camera centers of keyframes as they appear and tracks the path length.
#[derive(Debug, Default)]
pub struct TrajectoryLogger {
    seen: usize,
    last_center: Option<Vector3<f64>>,
    path_length: f64,
}

impl TrajectoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyframes_seen(&self) -> usize {
        self.seen
    }

    /// Length of the polyline through the camera centers seen so far.
    pub fn path_length(&self) -> f64 {
        self.path_length
    }
}

/// Camera center of a world-to-camera pose.
fn camera_center<G: LieGroup>(pose: &G) -> Vector3<f64> {
    pose.inverse().act(&nalgebra::Vector4::new(0.0, 0.0, 0.0, 1.0)).xyz()
}

impl<G: LieGroup> Visualizer<G> for TrajectoryLogger {
    fn update(&mut self, store: &KeyframeStore<G>) -> Result<bool> {
        let centers: Vec<Vector3<f64>> = store.read(|counter, state| {
            state.poses[self.seen.min(counter)..counter]
                .iter()
                .map(camera_center)
                .collect()
        });
        for center in centers {
            if let Some(last) = self.last_center {
                self.path_length += (center - last).norm();
            }
            debug!(keyframe = self.seen, x = center.x, y = center.y, z = center.z, "keyframe");
            self.last_center = Some(center);
            self.seen += 1;
        }
        Ok(false)
    }
}
