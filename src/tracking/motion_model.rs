//! Pose prediction for new keyframes.

use crate::geometry::LieGroup;

/// Predicts the next world-to-camera pose by applying the left increment
/// observed between the previous two keyframes once more.
#[derive(Debug, Clone)]
pub struct MotionModel<G: LieGroup> {
    /// Last refined pose.
    prev_pose: Option<G>,
    /// Increment `T_k · T_{k-1}⁻¹` between the last two poses.
    velocity: G,
}

impl<G: LieGroup> MotionModel<G> {
    pub fn new() -> Self {
        Self {
            prev_pose: None,
            velocity: G::identity(),
        }
    }

    /// Feed the refined pose of the newest keyframe.
    pub fn update(&mut self, pose: &G) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = pose.compose(&prev.inverse());
        }
        self.prev_pose = Some(pose.clone());
    }

    /// `None` until the first pose is known.
    pub fn predict(&self) -> Option<G> {
        self.prev_pose.as_ref().map(|prev| self.velocity.compose(prev))
    }

    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = G::identity();
    }
}

impl<G: LieGroup> Default for MotionModel<G> {
    fn default() -> Self {
        Self::new()
    }
}
