//! Input sources.

pub mod synthetic;

pub use synthetic::{GroundTruthCorrespondence, SyntheticConfig, SyntheticSequence};
