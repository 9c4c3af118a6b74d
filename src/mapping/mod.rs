//! Dense mapping stage.

pub mod point_cloud;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::geometry::LieGroup;
use crate::store::KeyframeStore;

pub use point_cloud::{keyframe_points, DenseMap, MapFrame, PointCloudMapper};

/// A map built incrementally from the keyframe store.
pub trait Mapper<G: LieGroup>: Send {
    type Map: Clone + Send + Sync + 'static;

    /// Advance the map by one step.
    ///
    /// During the final passes (`final_pass == true`) the return value is the
    /// sentinel: `true` once the map is complete.
    fn step(&mut self, store: &KeyframeStore<G>, final_pass: bool) -> Result<bool>;

    /// Handle to the map being built.
    fn shared_map(&self) -> Arc<RwLock<Self::Map>>;
}
