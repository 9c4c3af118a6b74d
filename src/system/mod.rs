//! Worker orchestration.
//!
//! The `SlamSystem` spawns one thread per stage. Workers share the keyframe
//! store and coordinate start-up and shutdown through lifecycle counters.

pub mod backend;
pub mod memory;
pub mod messages;
pub mod shared_state;
mod slam_system;
mod workers;

pub use backend::{variant_plan, Backend, BackendState, RamSafeguard, SafeguardAction};
pub use memory::{MemoryProbe, ScriptedMemoryProbe, SystemMemoryProbe};
pub use messages::InputFrame;
pub use shared_state::{Lifecycle, SharedState, Stage};
pub use slam_system::{RunSummary, SlamSystem, Stages, NUM_WORKERS};
pub use workers::{BackendFactory, MapPayload};
