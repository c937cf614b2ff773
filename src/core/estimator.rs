//! Motion field estimation for one (previous, current) field pairing.

use crate::core::cost::{ConservationWeights, CostBreakdown, CostGradientEvaluator, Evaluation};
use crate::core::lbfgs::{LbfgsMinimizer, Minimizer, MinimizerStatus, Objective};
use crate::core::stagger::{interior_len, pack_interior, unpack_interior, Staggering};
use crate::params::{ConservationNorm, ConstantMotion, SmoothnessWeights, TrackerParams};
use crate::types::{ScalarField, VetError, VetResult};
use chrono::{DateTime, Utc};

/// Numerical settings of the estimator
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorParams {
    /// Minimizer iterations allowed per pairing
    pub max_iterations: usize,
    /// Uniform first-guess motion
    pub first_guess: ConstantMotion,
    pub conservation_weight: f64,
    pub smoothness: SmoothnessWeights,
    /// Minimizer stopping threshold on |g| / max(1, |x|)
    pub convergence_tolerance: f64,
    /// Correction pairs kept by the minimizer
    pub history_depth: usize,
    pub conservation_norm: ConservationNorm,
    /// Keep the final staggered gradient grids in the result
    pub output_gradients: bool,
    /// Log per-iteration diagnostics at info level
    pub debug: bool,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self::from(&TrackerParams::default())
    }
}

impl From<&TrackerParams> for EstimatorParams {
    fn from(params: &TrackerParams) -> Self {
        Self {
            max_iterations: params.max_iterations,
            first_guess: params.constant_motion,
            conservation_weight: params.conservation_constraint_weight,
            smoothness: params.smoothness_constraint_weights,
            convergence_tolerance: params.convergence_tolerance,
            history_depth: params.history_depth,
            conservation_norm: params.conservation_norm,
            output_gradients: params.output_gradients,
            debug: params.debug,
        }
    }
}

/// Where the estimator is in its processing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Initializing,
    Iterating,
    Converged,
    MaxIterationsReached,
    Finalizing,
    Done,
    Failed,
}

/// Why the iteration loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Minimizer reported convergence in this iteration (1-based)
    Converged { iterations: usize },
    /// Budget exhausted; the last accepted iterate is the answer
    MaxIterationsReached,
}

/// Diagnostics for one iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationState {
    pub iteration: usize,
    pub cost: CostBreakdown,
    /// ||dJ/dU|| over the whole U grid
    pub grad_norm_u: f64,
    /// ||dJ/dV|| over the whole V grid
    pub grad_norm_v: f64,
    /// Combined gradient norm
    pub grad_norm: f64,
    /// Cost change since the previous iteration
    pub ffd: f64,
    /// Cost relative to the first iteration
    pub ffr: f64,
    /// Gradient norm relative to the first iteration
    pub ggr: f64,
}

impl IterationState {
    fn from_evaluation(iteration: usize, eval: &Evaluation, history: &[IterationState]) -> Self {
        let (gnu, gnv) = eval.gradient_sums_of_squares();
        let cost = eval.cost;
        let grad_norm = (gnu + gnv).sqrt();

        let (ffd, ffr, ggr) = match (history.first(), history.last()) {
            (Some(first), Some(last)) => (
                cost.total() - last.cost.total(),
                relative(cost.total(), first.cost.total()),
                relative(grad_norm, first.grad_norm),
            ),
            _ => (0.0, 1.0, 1.0),
        };

        Self {
            iteration,
            cost,
            grad_norm_u: gnu.sqrt(),
            grad_norm_v: gnv.sqrt(),
            grad_norm,
            ffd,
            ffr,
            ggr,
        }
    }
}

/// Ratio that stays defined when the reference is zero
fn relative(value: f64, reference: f64) -> f64 {
    if reference != 0.0 {
        value / reference
    } else if value == 0.0 {
        1.0
    } else {
        f64::INFINITY
    }
}

/// Output of one estimation
#[derive(Debug, Clone)]
pub struct MotionEstimate {
    /// U on the base grid
    pub u: ScalarField,
    /// V on the base grid
    pub v: ScalarField,
    /// Final gradient on the staggered U grid, when requested
    pub grad_u: Option<ScalarField>,
    /// Final gradient on the staggered V grid, when requested
    pub grad_v: Option<ScalarField>,
    pub termination: Termination,
    pub history: Vec<IterationState>,
}

impl MotionEstimate {
    pub fn valid_time(&self) -> DateTime<Utc> {
        self.u.timestamp
    }

    pub fn iterations(&self) -> usize {
        self.history.len()
    }

    pub fn initial_cost(&self) -> Option<f64> {
        self.history.first().map(|s| s.cost.total())
    }

    pub fn final_cost(&self) -> Option<f64> {
        self.history.last().map(|s| s.cost.total())
    }

    pub fn converged(&self) -> bool {
        matches!(self.termination, Termination::Converged { .. })
    }
}

/// Estimates U/V motion between two base fields.
///
/// Work arrays are sized from the pairing's grid and reallocated on every
/// call, so consecutive pairings may have different geometry.
pub struct MotionFieldEstimator {
    params: EstimatorParams,
    state: EstimatorState,
}

impl Default for MotionFieldEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionFieldEstimator {
    /// Create an estimator with default parameters
    pub fn new() -> Self {
        Self::with_params(EstimatorParams::default())
    }

    /// Create an estimator with custom parameters
    pub fn with_params(params: EstimatorParams) -> Self {
        Self {
            params,
            state: EstimatorState::Initializing,
        }
    }

    pub fn params(&self) -> &EstimatorParams {
        &self.params
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    /// Estimate motion with uniform conservation weights and the L-BFGS minimizer
    pub fn estimate(&mut self, prev: &ScalarField, curr: &ScalarField) -> VetResult<MotionEstimate> {
        let weights = ConservationWeights::uniform(&curr.geometry, self.params.conservation_weight);
        let (depth, eps) = (self.params.history_depth, self.params.convergence_tolerance);
        self.estimate_with(prev, curr, &weights, |n| LbfgsMinimizer::new(n, depth, eps))
    }

    /// Estimate motion with explicit conservation weights and minimizer.
    ///
    /// `make_minimizer` receives the number of free unknowns.
    /// Every point it hands back must already have been accepted by its own
    /// evaluations of the objective.
    pub fn estimate_with<M, F>(
        &mut self,
        prev: &ScalarField,
        curr: &ScalarField,
        weights: &ConservationWeights,
        make_minimizer: F,
    ) -> VetResult<MotionEstimate>
    where
        M: Minimizer,
        F: FnOnce(usize) -> VetResult<M>,
    {
        self.state = EstimatorState::Initializing;
        let result = self.run(prev, curr, weights, make_minimizer);
        if result.is_err() {
            self.state = EstimatorState::Failed;
        }
        result
    }

    fn run<M, F>(
        &mut self,
        prev: &ScalarField,
        curr: &ScalarField,
        weights: &ConservationWeights,
        make_minimizer: F,
    ) -> VetResult<MotionEstimate>
    where
        M: Minimizer,
        F: FnOnce(usize) -> VetResult<M>,
    {
        let base = curr.geometry;
        if base.nx < 3 || base.ny < 3 {
            return Err(VetError::Shape(format!(
                "Motion estimation needs at least a 3x3 grid, got {}x{}",
                base.nx, base.ny
            )));
        }

        let evaluator = CostGradientEvaluator::new(
            prev,
            curr,
            weights,
            self.params.smoothness,
            self.params.conservation_norm,
        )?;

        let mut u = Staggering::U.allocate(&base, self.params.first_guess.u, curr.timestamp)?;
        let mut v = Staggering::V.allocate(&base, self.params.first_guess.v, curr.timestamp)?;

        let nu = interior_len(&u);
        let nunk = nu + interior_len(&v);
        let mut minimizer = make_minimizer(nunk)?;
        let objective = PackedObjective {
            evaluator: &evaluator,
            u: u.clone(),
            v: v.clone(),
            nu,
        };
        let mut x = vec![0.0; nunk];
        let mut g = vec![0.0; nunk];

        log::info!(
            "Estimating motion on {} between {} and {} ({} unknowns, {} valid cells)",
            base,
            prev.timestamp,
            curr.timestamp,
            nunk,
            evaluator.valid_cells()
        );

        let level = if self.params.debug {
            log::Level::Info
        } else {
            log::Level::Debug
        };

        let mut history: Vec<IterationState> = Vec::with_capacity(self.params.max_iterations);
        let mut termination = Termination::MaxIterationsReached;
        let mut last_eval = None;

        self.state = EstimatorState::Iterating;

        for iteration in 0..self.params.max_iterations {
            let eval = evaluator.evaluate(&u, &v)?;
            let diagnostics = IterationState::from_evaluation(iteration, &eval, &history);

            log::log!(
                level,
                "iteration {}: cost = {:.6e} (reflectivity {:.6e}, smoothness U {:.6e}, V {:.6e})",
                iteration,
                diagnostics.cost.total(),
                diagnostics.cost.conservation,
                diagnostics.cost.smoothness_u,
                diagnostics.cost.smoothness_v
            );
            log::log!(
                level,
                "iteration {}: |g| = {:.6e} (U {:.6e}, V {:.6e}), ffd = {:.6e}, ffr = {:.6e}, ggr = {:.6e}",
                iteration,
                diagnostics.grad_norm,
                diagnostics.grad_norm_u,
                diagnostics.grad_norm_v,
                diagnostics.ffd,
                diagnostics.ffr,
                diagnostics.ggr
            );
            history.push(diagnostics);

            let (x_u, x_v) = x.split_at_mut(nu);
            pack_interior(u.data(), x_u);
            pack_interior(v.data(), x_v);
            let (g_u, g_v) = g.split_at_mut(nu);
            pack_interior(&eval.grad_u, g_u);
            pack_interior(&eval.grad_v, g_v);

            let status = minimizer.step(&objective, &mut x, eval.total_cost(), &g)?;
            log::log!(level, "iteration {}: minimizer flag = {}", iteration, status.iflag());

            let (x_u, x_v) = x.split_at(nu);
            unpack_interior(x_u, u.data_mut());
            unpack_interior(x_v, v.data_mut());
            last_eval = Some(eval);

            if status == MinimizerStatus::Converged {
                termination = Termination::Converged {
                    iterations: iteration + 1,
                };
                break;
            }
        }

        self.state = match termination {
            Termination::Converged { .. } => EstimatorState::Converged,
            Termination::MaxIterationsReached => EstimatorState::MaxIterationsReached,
        };

        match termination {
            Termination::Converged { iterations } => {
                log::info!("Minimization converged after {} iterations", iterations)
            }
            Termination::MaxIterationsReached => log::info!(
                "Minimization stopped at the iteration limit ({})",
                self.params.max_iterations
            ),
        }

        self.state = EstimatorState::Finalizing;

        let out_u = Staggering::U.destagger(&u)?;
        let out_v = Staggering::V.destagger(&v)?;

        let (grad_u, grad_v) = if self.params.output_gradients {
            // After a final step the returned point has not been through the loop
            let eval = match (termination, last_eval) {
                (Termination::Converged { .. }, Some(eval)) => eval,
                _ => evaluator.evaluate(&u, &v)?,
            };
            (
                Some(gradient_field("U grad", &u, eval.grad_u)?),
                Some(gradient_field("V grad", &v, eval.grad_v)?),
            )
        } else {
            (None, None)
        };

        self.state = EstimatorState::Done;

        Ok(MotionEstimate {
            u: out_u,
            v: out_v,
            grad_u,
            grad_v,
            termination,
            history,
        })
    }
}

/// Cost over the packed interior unknowns; boundary nodes keep the first guess
struct PackedObjective<'e, 'a> {
    evaluator: &'e CostGradientEvaluator<'a>,
    u: ScalarField,
    v: ScalarField,
    nu: usize,
}

impl Objective for PackedObjective<'_, '_> {
    fn evaluate(&self, x: &[f64]) -> VetResult<(f64, Vec<f64>)> {
        let (x_u, x_v) = x.split_at(self.nu);
        let mut u = self.u.clone();
        let mut v = self.v.clone();
        unpack_interior(x_u, u.data_mut());
        unpack_interior(x_v, v.data_mut());

        let eval = self.evaluator.evaluate(&u, &v)?;
        let mut g = vec![0.0; x.len()];
        let (g_u, g_v) = g.split_at_mut(self.nu);
        pack_interior(&eval.grad_u, g_u);
        pack_interior(&eval.grad_v, g_v);
        Ok((eval.total_cost(), g))
    }
}

fn gradient_field(name: &str, like: &ScalarField, data: ndarray::Array2<f64>) -> VetResult<ScalarField> {
    Ok(ScalarField::new(name, like.geometry, data, like.missing_value, like.timestamp)?.with_units("none"))
}
