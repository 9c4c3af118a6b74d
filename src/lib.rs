pub mod config;
pub mod correspondence;
pub mod geometry;
pub mod io;
pub mod logger;
pub mod mapping;
pub mod optimizer;
pub mod store;
pub mod system;
pub mod tracking;
pub mod viz;

pub use logger::{init_logger, init_logger_with_level};
