//! Core echo tracking modules

pub mod stagger;
pub mod cost;
pub mod lbfgs;
pub mod estimator;
pub mod tracker;

// Re-export main types
pub use stagger::Staggering;
pub use cost::{ConservationWeights, CostBreakdown, CostGradientEvaluator, Evaluation};
pub use lbfgs::{LbfgsMinimizer, Minimizer, MinimizerStatus};
pub use estimator::{
    EstimatorParams, EstimatorState, IterationState, MotionEstimate, MotionFieldEstimator, Termination,
};
pub use tracker::{EchoTracker, FieldSource, PairingOutcome, TrackerStats, VectorSink};
