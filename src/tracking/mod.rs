//! Tracking front end.

pub mod frontend;
pub mod motion_model;

pub use frontend::{DenseFrontEnd, FrontEnd};
pub use motion_model::MotionModel;
