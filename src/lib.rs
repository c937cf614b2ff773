//! vetrack: Variational Echo Tracking for radar reflectivity grids
//!
//! This library estimates 2-D motion (U, V) between consecutive reflectivity
//! fields by minimizing a cost that combines reflectivity conservation with
//! smoothness penalties on staggered velocity grids, using a limited-memory
//! quasi-Newton minimizer.

pub mod types;
pub mod params;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{GridGeometry, GridProjection, ScalarField, VetError, VetResult};

pub use params::{ConservationNorm, TrackerParams, TriggerMode};

pub use crate::core::{EchoTracker, MotionEstimate, MotionFieldEstimator};

pub use io::{GridFileSink, GridFileSource};
