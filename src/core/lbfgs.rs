//! Limited-memory BFGS minimizer stepped one iteration at a time.
//!
//! The estimator owns the iteration loop. It evaluates cost and gradient at
//! `x`, then hands them to [`Minimizer::step`], which either reports
//! convergence or overwrites `x` with the next accepted point. One step runs
//! one `argmin` L-BFGS iteration: a two-loop direction update followed by a
//! More–Thuente line search that evaluates the [`Objective`] at its trial
//! points.

use crate::types::{VetError, VetResult};
use argmin::core::{CostFunction, Error, Gradient, IterState, Problem, Solver, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use std::cell::Cell;

/// Outcome of one minimizer step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerStatus {
    /// Gradient norm fell below the tolerance; `x` holds the solution
    Converged,
    /// Evaluate cost and gradient at the updated `x` and call again
    Continue,
}

impl MinimizerStatus {
    /// Classic integer flag: 0 converged, 1 continue
    pub fn iflag(&self) -> i32 {
        match self {
            MinimizerStatus::Converged => 0,
            MinimizerStatus::Continue => 1,
        }
    }
}

/// Cost and gradient over the packed unknown vector
pub trait Objective {
    fn evaluate(&self, x: &[f64]) -> VetResult<(f64, Vec<f64>)>;
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> VetResult<(f64, Vec<f64>)>,
{
    fn evaluate(&self, x: &[f64]) -> VetResult<(f64, Vec<f64>)> {
        self(x)
    }
}

/// Iteration-level minimizer.
///
/// `f` and `g` are the cost and gradient already evaluated at `x`. Internal
/// failures (line search breakdown, bad input) are reported as
/// `VetError::Minimization` and leave the minimizer unusable for the
/// current problem.
pub trait Minimizer {
    fn step(
        &mut self,
        objective: &dyn Objective,
        x: &mut [f64],
        f: f64,
        g: &[f64],
    ) -> VetResult<MinimizerStatus>;
}

/// Sufficient-decrease constant of the line search
const FTOL: f64 = 1.0e-4;
/// Curvature constant of the line search
const GTOL: f64 = 0.9;
const STPMIN: f64 = 1.0e-20;
const STPMAX: f64 = 1.0e20;
/// Cost evaluations allowed per iteration
const MAXFEV: usize = 20;

type LineSearch = MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64>;

/// L-BFGS with `history_depth` stored correction pairs
pub struct LbfgsMinimizer {
    n: usize,
    m: usize,
    eps: f64,
    solver: LBFGS<LineSearch, Vec<f64>, Vec<f64>, f64>,
    failed: bool,
    iterations: usize,
    evaluations: usize,
}

impl LbfgsMinimizer {
    /// Set up a solver for `n` unknowns
    pub fn new(n: usize, history_depth: usize, eps: f64) -> VetResult<Self> {
        let m = history_depth.max(1);
        let linesearch: LineSearch = MoreThuenteLineSearch::new()
            .with_c(FTOL, GTOL)
            .and_then(|ls| ls.with_bounds(STPMIN, STPMAX))
            .map_err(|e| VetError::Minimization(format!("Invalid line search settings: {}", e)))?;

        Ok(Self {
            n,
            m,
            eps,
            solver: LBFGS::new(linesearch, m),
            failed: false,
            iterations: 0,
            evaluations: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn history_depth(&self) -> usize {
        self.m
    }

    /// Completed quasi-Newton iterations
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Cost evaluations made inside line searches
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    fn fail(&mut self, message: String) -> VetResult<MinimizerStatus> {
        self.failed = true;
        Err(VetError::Minimization(message))
    }

    fn converged(&self, x: &[f64], g: &[f64]) -> bool {
        let gnorm = dot(g, g).sqrt();
        let xnorm = dot(x, x).sqrt().max(1.0);
        gnorm / xnorm <= self.eps
    }
}

impl Minimizer for LbfgsMinimizer {
    fn step(
        &mut self,
        objective: &dyn Objective,
        x: &mut [f64],
        f: f64,
        g: &[f64],
    ) -> VetResult<MinimizerStatus> {
        if self.failed {
            return Err(VetError::Minimization(
                "Minimizer already failed for this problem".to_string(),
            ));
        }
        if self.n == 0 {
            return self.fail("No unknowns to minimize".to_string());
        }
        if x.len() != self.n || g.len() != self.n {
            return self.fail(format!(
                "Expected {} unknowns, got x of {} and g of {}",
                self.n,
                x.len(),
                g.len()
            ));
        }
        if !f.is_finite() {
            return self.fail(format!("Cost is not finite ({})", f));
        }

        if self.converged(x, g) {
            return Ok(MinimizerStatus::Converged);
        }

        let used = Cell::new(0);
        let mut problem = Problem::new(BudgetedObjective {
            inner: objective,
            limit: MAXFEV,
            used: &used,
        });
        let state = IterState::new().param(x.to_vec()).gradient(g.to_vec()).cost(f);

        let result = self.solver.next_iter(&mut problem, state);
        self.evaluations += used.get();

        let mut next = match result {
            Ok((next, _)) => next,
            Err(e) => return self.fail(format!("{:#}", e)),
        };

        let cost = next.get_cost();
        let param = match next.take_param() {
            Some(param) => param,
            None => return self.fail("Line search returned no point".to_string()),
        };
        if !cost.is_finite() || param.len() != self.n || param.iter().any(|v| !v.is_finite()) {
            return self.fail(format!("Line search produced a non-finite point (cost {})", cost));
        }

        x.copy_from_slice(&param);
        self.iterations += 1;
        Ok(MinimizerStatus::Continue)
    }
}

/// Adapts an [`Objective`] to `argmin`, with a cap on cost evaluations
struct BudgetedObjective<'a> {
    inner: &'a dyn Objective,
    limit: usize,
    used: &'a Cell<usize>,
}

impl CostFunction for BudgetedObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        let used = self.used.get() + 1;
        self.used.set(used);
        if used > self.limit {
            return Err(anyhow::anyhow!(
                "Line search exceeded {} evaluations; cost may be unbounded below",
                self.limit
            ));
        }

        let (cost, _) = self.inner.evaluate(param)?;
        if !cost.is_finite() {
            return Err(anyhow::anyhow!("Cost is not finite ({}) at a line search trial", cost));
        }
        Ok(cost)
    }
}

impl Gradient for BudgetedObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        let (_, grad) = self.inner.evaluate(param)?;
        Ok(grad)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
