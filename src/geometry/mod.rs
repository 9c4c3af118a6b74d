//! Geometry utilities: pose groups, SO(3) helpers, pinhole camera.

pub mod camera;
pub mod lie;
pub mod se3;
pub mod sim3;
pub mod so3;

pub use camera::{ImageShape, Intrinsics};
pub use lie::{tangent_distance, LieGroup};
pub use se3::SE3;
pub use sim3::Sim3;
