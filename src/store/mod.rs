//! Keyframe state shared between the workers.

pub mod keyframe_store;

pub use keyframe_store::{KeyframeData, KeyframeStore, StoreError, StoreSnapshot};
