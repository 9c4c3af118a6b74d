//! Dense bundle adjustment.
//!
//! Builds and solves the arrow-structured normal equations of a keyframe
//! window:
//! - Motion-only, structure-only and joint pose/disparity steps
//! - Disparity-prior variants with per-frame scale and shift

pub mod dense_ba;
pub mod hessian;
pub mod linear;
pub mod problem;
pub mod projection;
pub mod sparse;

pub use dense_ba::{bundle_adjustment, residual_cost, BaParams, BaVariant, MIN_DISPARITY};
pub use linear::{LinearSolverKind, SolveStatus};
pub use problem::{BaError, BaReport, BaState, EdgeSet, Window};
pub use projection::MIN_DEPTH;
pub use sparse::{BlockSparseMatrix, BlockVector, SparseError, StructureCoupling};
