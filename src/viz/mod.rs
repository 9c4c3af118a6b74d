//! Read-only observers of the running system.
//!
//! Visualizers never write to the keyframe store; each polls it (or a
//! display queue) until the upstream stages finish.

mod displays;
mod trajectory;

use anyhow::Result;

use crate::geometry::LieGroup;
use crate::store::KeyframeStore;

pub use displays::{MappingGui, StreamDisplay};
pub use trajectory::TrajectoryLogger;

pub trait Visualizer<G: LieGroup>: Send {
    /// Observe the current store. Returns `true` when the visualizer is done.
    fn update(&mut self, store: &KeyframeStore<G>) -> Result<bool>;
}
