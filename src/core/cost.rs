//! Cost functional and analytic gradient of the variational echo tracker.
//!
//! The cost combines a reflectivity-conservation term evaluated on interior
//! base-grid cells with second-difference smoothness penalties on the
//! staggered U and V grids.

use crate::params::{ConservationNorm, SmoothnessWeights};
use crate::types::{GridGeometry, ScalarField, VetError, VetResult};
use ndarray::Array2;

/// Per-cell weight on the conservation residual, shaped like the base grid
#[derive(Debug, Clone)]
pub struct ConservationWeights {
    weights: Array2<f64>,
}

impl ConservationWeights {
    /// Same weight on every cell
    pub fn uniform(geometry: &GridGeometry, weight: f64) -> Self {
        Self {
            weights: Array2::from_elem(geometry.shape(), weight),
        }
    }

    /// Spatially varying weights, e.g. to downweight clutter
    pub fn from_array(geometry: &GridGeometry, weights: Array2<f64>) -> VetResult<Self> {
        if weights.dim() != geometry.shape() {
            return Err(VetError::Shape(format!(
                "Weight matrix {:?} does not match base grid {}x{}",
                weights.dim(),
                geometry.nx,
                geometry.ny
            )));
        }
        Ok(Self { weights })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.weights[[y, x]]
    }

    pub fn dim(&self) -> (usize, usize) {
        self.weights.dim()
    }
}

/// Cost split into its parts
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBreakdown {
    pub conservation: f64,
    pub smoothness_u: f64,
    pub smoothness_v: f64,
}

impl CostBreakdown {
    pub fn smoothness(&self) -> f64 {
        self.smoothness_u + self.smoothness_v
    }

    pub fn total(&self) -> f64 {
        self.conservation + self.smoothness()
    }
}

/// Result of one cost/gradient evaluation
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub cost: CostBreakdown,
    /// Gradient with respect to every node of the staggered U grid
    pub grad_u: Array2<f64>,
    /// Gradient with respect to every node of the staggered V grid
    pub grad_v: Array2<f64>,
}

impl Evaluation {
    pub fn total_cost(&self) -> f64 {
        self.cost.total()
    }

    /// Sum of squared gradient components over the U and V grids
    pub fn gradient_sums_of_squares(&self) -> (f64, f64) {
        let gnu = self.grad_u.iter().map(|g| g * g).sum();
        let gnv = self.grad_v.iter().map(|g| g * g).sum();
        (gnu, gnv)
    }
}

/// Evaluates cost and gradient for one (previous, current) field pairing.
///
/// Everything that depends only on the pairing (time step, grid spacing in
/// km, validity of each conservation residual) is computed once here, so
/// `evaluate` is a pure function of the velocity grids.
pub struct CostGradientEvaluator<'a> {
    prev: &'a ScalarField,
    curr: &'a ScalarField,
    weights: &'a ConservationWeights,
    smoothness: SmoothnessWeights,
    norm: ConservationNorm,
    dt: f64,
    dx: f64,
    dy: f64,
    valid: Array2<bool>,
}

impl<'a> CostGradientEvaluator<'a> {
    pub fn new(
        prev: &'a ScalarField,
        curr: &'a ScalarField,
        weights: &'a ConservationWeights,
        smoothness: SmoothnessWeights,
        norm: ConservationNorm,
    ) -> VetResult<Self> {
        if !prev.geometry.same_projection(&curr.geometry) {
            return Err(VetError::ProjectionMismatch(format!(
                "previous field is {}, current field is {}",
                prev.geometry, curr.geometry
            )));
        }

        if weights.dim() != curr.geometry.shape() {
            return Err(VetError::Shape(format!(
                "Weight matrix {:?} does not match base grid {}x{}",
                weights.dim(),
                curr.nx(),
                curr.ny()
            )));
        }

        let dt = prev.seconds_until(curr);
        if dt == 0.0 {
            return Err(VetError::DegenerateTime(curr.timestamp));
        }

        let dx = curr.geometry.dx_km();
        let dy = curr.geometry.dy_km();

        log::debug!("dt = {} s, dx = {} km, dy = {} km", dt, dx, dy);

        let valid = Self::residual_mask(prev, curr);

        Ok(Self {
            prev,
            curr,
            weights,
            smoothness,
            norm,
            dt,
            dx,
            dy,
            valid,
        })
    }

    /// Interior cells whose residual stencil contains no missing data
    fn residual_mask(prev: &ScalarField, curr: &ScalarField) -> Array2<bool> {
        let (nx, ny) = (curr.nx(), curr.ny());
        let mut valid = Array2::from_elem((ny, nx), false);

        for y in 1..ny.saturating_sub(1) {
            for x in 1..nx.saturating_sub(1) {
                valid[[y, x]] = !(curr.missing(x, y)
                    || prev.missing(x, y)
                    || prev.missing(x + 1, y)
                    || prev.missing(x - 1, y)
                    || prev.missing(x, y + 1)
                    || prev.missing(x, y - 1));
            }
        }

        valid
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn dx_km(&self) -> f64 {
        self.dx
    }

    pub fn dy_km(&self) -> f64 {
        self.dy
    }

    /// Number of interior cells contributing to the conservation term
    pub fn valid_cells(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Evaluate the cost and its gradient at the given velocity grids.
    ///
    /// Gradient buffers are freshly zeroed on every call; nodes outside the
    /// loops below keep a zero gradient.
    pub fn evaluate(&self, u: &ScalarField, v: &ScalarField) -> VetResult<Evaluation> {
        self.check_velocity_shapes(u, v)?;

        let mut grad_u = Array2::zeros(u.geometry.shape());
        let mut grad_v = Array2::zeros(v.geometry.shape());

        let conservation = match self.norm {
            ConservationNorm::Linear => {
                self.linear_conservation(u.data(), v.data(), &mut grad_u, &mut grad_v)
            }
            ConservationNorm::Squared => {
                self.squared_conservation(u.data(), v.data(), &mut grad_u, &mut grad_v)
            }
        };

        let smoothness_u = smoothness_cost(u.data(), self.smoothness.u_weight);
        let smoothness_v = smoothness_cost(v.data(), self.smoothness.v_weight);

        match self.norm {
            ConservationNorm::Linear => {
                add_smoothness_gradient(u, self.smoothness.u_weight, &mut grad_u);
                add_smoothness_gradient(v, self.smoothness.v_weight, &mut grad_v);
            }
            ConservationNorm::Squared => {
                add_exact_smoothness_gradient(u.data(), self.smoothness.u_weight, &mut grad_u);
                add_exact_smoothness_gradient(v.data(), self.smoothness.v_weight, &mut grad_v);
            }
        }

        let cost = CostBreakdown {
            conservation,
            smoothness_u,
            smoothness_v,
        };

        log::trace!(
            "cost = {} (reflectivity {}, smoothness U {}, V {})",
            cost.total(),
            conservation,
            smoothness_u,
            smoothness_v
        );

        Ok(Evaluation {
            cost,
            grad_u,
            grad_v,
        })
    }

    fn check_velocity_shapes(&self, u: &ScalarField, v: &ScalarField) -> VetResult<()> {
        let (nx, ny) = (self.curr.nx(), self.curr.ny());

        if (u.nx(), u.ny()) != (nx + 1, ny) {
            return Err(VetError::Shape(format!(
                "U grid is {}x{}, expected {}x{}",
                u.nx(),
                u.ny(),
                nx + 1,
                ny
            )));
        }
        if (v.nx(), v.ny()) != (nx, ny + 1) {
            return Err(VetError::Shape(format!(
                "V grid is {}x{}, expected {}x{}",
                v.nx(),
                v.ny(),
                nx,
                ny + 1
            )));
        }
        Ok(())
    }

    /// Weighted conservation residual at an interior base cell
    #[inline]
    fn residual(&self, u: &Array2<f64>, v: &Array2<f64>, x: usize, y: usize) -> f64 {
        let prev = self.prev.data();
        let curr = self.curr.data();

        self.weights.get(x, y)
            * ((curr[[y, x]] - prev[[y, x]]) / self.dt
                + 0.25 / self.dx * (u[[y, x]] + u[[y, x - 1]]) * (prev[[y, x + 1]] - prev[[y, x - 1]])
                + 0.25 / self.dy * (v[[y, x]] + v[[y - 1, x]]) * (prev[[y + 1, x]] - prev[[y - 1, x]]))
    }

    /// Signed residual sum.
    ///
    /// The gradient is a `0.5 / dx` stencil over neighbouring residual terms
    /// and leaves the outer two U columns and V rows at zero.
    fn linear_conservation(
        &self,
        u: &Array2<f64>,
        v: &Array2<f64>,
        grad_u: &mut Array2<f64>,
        grad_v: &mut Array2<f64>,
    ) -> f64 {
        let (nx, ny) = (self.curr.nx(), self.curr.ny());
        let prev = self.prev.data();

        let mut cost = 0.0;
        for y in 1..ny.saturating_sub(1) {
            for x in 1..nx.saturating_sub(1) {
                if self.valid[[y, x]] {
                    cost += self.residual(u, v, x, y);
                }
            }
        }

        let x_term = |x: usize, y: usize| {
            if self.valid[[y, x]] {
                self.weights.get(x, y) * (prev[[y, x + 1]] - prev[[y, x - 1]])
            } else {
                0.0
            }
        };
        let y_term = |x: usize, y: usize| {
            if self.valid[[y, x]] {
                self.weights.get(x, y) * (prev[[y + 1, x]] - prev[[y - 1, x]])
            } else {
                0.0
            }
        };

        for y in 1..ny.saturating_sub(1) {
            for x in 1..nx.saturating_sub(2) {
                grad_u[[y, x]] = 0.5 / self.dx * (x_term(x, y) + x_term(x + 1, y));
            }
        }

        for y in 1..ny.saturating_sub(2) {
            for x in 1..nx.saturating_sub(1) {
                grad_v[[y, x]] = 0.5 / self.dy * (y_term(x, y) + y_term(x, y + 1));
            }
        }

        cost
    }

    /// Sum of squared residuals with its exact gradient
    fn squared_conservation(
        &self,
        u: &Array2<f64>,
        v: &Array2<f64>,
        grad_u: &mut Array2<f64>,
        grad_v: &mut Array2<f64>,
    ) -> f64 {
        let (nx, ny) = (self.curr.nx(), self.curr.ny());
        let prev = self.prev.data();

        let mut cost = 0.0;
        for y in 1..ny.saturating_sub(1) {
            for x in 1..nx.saturating_sub(1) {
                if !self.valid[[y, x]] {
                    continue;
                }

                let r = self.residual(u, v, x, y);
                cost += r * r;

                let w = self.weights.get(x, y);
                let du = 2.0 * r * w * 0.25 / self.dx * (prev[[y, x + 1]] - prev[[y, x - 1]]);
                let dv = 2.0 * r * w * 0.25 / self.dy * (prev[[y + 1, x]] - prev[[y - 1, x]]);

                grad_u[[y, x]] += du;
                grad_u[[y, x - 1]] += du;
                grad_v[[y, x]] += dv;
                grad_v[[y - 1, x]] += dv;
            }
        }

        cost
    }
}

/// Weighted sum of squared second differences over interior nodes
pub fn smoothness_cost(field: &Array2<f64>, weight: f64) -> f64 {
    let (ny, nx) = field.dim();
    let mut sum = 0.0;

    for y in 1..ny.saturating_sub(1) {
        for x in 1..nx.saturating_sub(1) {
            let c = field[[y, x]];
            let d_yy = field[[y + 1, x]] - 2.0 * c + field[[y - 1, x]];
            let d_xx = field[[y, x + 1]] - 2.0 * c + field[[y, x - 1]];
            sum += weight * (d_yy * d_yy + d_xx * d_xx);
        }
    }

    sum
}

/// Add the smoothness gradient (second difference applied twice).
///
/// Only nodes with two neighbors on every side are updated; neighbors are
/// read through the extrapolating accessor.
pub fn add_smoothness_gradient(field: &ScalarField, weight: f64, grad: &mut Array2<f64>) {
    let (nx, ny) = (field.nx(), field.ny());

    for y in 2..ny.saturating_sub(2) {
        for x in 2..nx.saturating_sub(2) {
            let (xi, yi) = (x as isize, y as isize);
            let f = |dx: isize, dy: isize| field.get(xi + dx, yi + dy);

            let c = f(0, 0);
            let (n, nn, s, ss) = (f(0, 1), f(0, 2), f(0, -1), f(0, -2));
            let (e, ee, w, ww) = (f(1, 0), f(2, 0), f(-1, 0), f(-2, 0));

            let along_y = -2.0 * (n + s - 2.0 * c) + (c + ss - 2.0 * s) + (nn + c - 2.0 * n);
            let along_x = -2.0 * (e + w - 2.0 * c) + (c + ww - 2.0 * w) + (ee + c - 2.0 * e);

            grad[[y, x]] += 2.0 * weight * (along_y + along_x);
        }
    }
}

/// Add the exact gradient of [`smoothness_cost`] at every node.
///
/// Used with the squared norm so the whole gradient matches the cost,
/// including the nodes next to the boundary ring.
pub fn add_exact_smoothness_gradient(field: &Array2<f64>, weight: f64, grad: &mut Array2<f64>) {
    let (ny, nx) = field.dim();

    for y in 1..ny.saturating_sub(1) {
        for x in 1..nx.saturating_sub(1) {
            let c = field[[y, x]];
            let g_yy = 2.0 * weight * (field[[y + 1, x]] - 2.0 * c + field[[y - 1, x]]);
            let g_xx = 2.0 * weight * (field[[y, x + 1]] - 2.0 * c + field[[y, x - 1]]);

            grad[[y + 1, x]] += g_yy;
            grad[[y - 1, x]] += g_yy;
            grad[[y, x + 1]] += g_xx;
            grad[[y, x - 1]] += g_xx;
            grad[[y, x]] -= 2.0 * (g_yy + g_xx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stagger::Staggering;
    use chrono::{Duration, TimeZone, Utc};

    const MISSING: f64 = -999.0;

    fn geometry(nx: usize, ny: usize) -> GridGeometry {
        GridGeometry::flat(nx, ny, 1.0, 1.0).unwrap()
    }

    fn field_from_fn(nx: usize, ny: usize, seconds: i64, f: impl Fn(usize, usize) -> f64) -> ScalarField {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let data = Array2::from_shape_fn((ny, nx), |(y, x)| f(x, y));
        ScalarField::new("DBZ", geometry(nx, ny), data, MISSING, t0 + Duration::seconds(seconds)).unwrap()
    }

    fn velocity(base: &GridGeometry, staggering: Staggering, f: impl Fn(usize, usize) -> f64) -> ScalarField {
        let mut field = staggering.allocate(base, 0.0, Utc::now()).unwrap();
        for y in 0..field.ny() {
            for x in 0..field.nx() {
                field.set(x, y, f(x, y));
            }
        }
        field
    }

    fn pattern(x: usize, y: usize) -> f64 {
        20.0 + 5.0 * ((x as f64) * 0.7).sin() + 3.0 * ((y as f64) * 0.4).cos() + 0.1 * (x * y) as f64
    }

    #[test]
    fn test_zero_dt_is_degenerate() {
        let prev = field_from_fn(5, 5, 0, pattern);
        let curr = field_from_fn(5, 5, 0, pattern);
        let weights = ConservationWeights::uniform(&curr.geometry, 1.0);

        let result = CostGradientEvaluator::new(
            &prev,
            &curr,
            &weights,
            SmoothnessWeights::default(),
            ConservationNorm::Linear,
        );
        assert!(matches!(result, Err(VetError::DegenerateTime(_))));
    }

    #[test]
    fn test_mismatched_geometry_rejected() {
        let prev = field_from_fn(5, 5, 0, pattern);
        let curr = field_from_fn(6, 5, 300, pattern);
        let weights = ConservationWeights::uniform(&curr.geometry, 1.0);

        let result = CostGradientEvaluator::new(
            &prev,
            &curr,
            &weights,
            SmoothnessWeights::default(),
            ConservationNorm::Linear,
        );
        assert!(matches!(result, Err(VetError::ProjectionMismatch(_))));
    }

    #[test]
    fn test_linear_cost_matches_residual_sum() {
        let prev = field_from_fn(6, 5, 0, pattern);
        let curr = field_from_fn(6, 5, 300, |x, y| pattern(x, y) + 0.5 * x as f64);
        let weights = ConservationWeights::uniform(&curr.geometry, 2.0);
        let smoothness = SmoothnessWeights { u_weight: 0.0, v_weight: 0.0 };
        let evaluator =
            CostGradientEvaluator::new(&prev, &curr, &weights, smoothness, ConservationNorm::Linear).unwrap();

        let u = velocity(&curr.geometry, Staggering::U, |x, y| 0.01 * (x + y) as f64);
        let v = velocity(&curr.geometry, Staggering::V, |x, y| -0.02 * (x * y) as f64);
        let eval = evaluator.evaluate(&u, &v).unwrap();

        let mut expected = 0.0;
        for y in 1..4 {
            for x in 1..5 {
                let advect_x = 0.25 * (u.value(x, y) + u.value(x - 1, y)) * (prev.value(x + 1, y) - prev.value(x - 1, y));
                let advect_y = 0.25 * (v.value(x, y) + v.value(x, y - 1)) * (prev.value(x, y + 1) - prev.value(x, y - 1));
                expected += 2.0 * ((curr.value(x, y) - prev.value(x, y)) / 300.0 + advect_x + advect_y);
            }
        }

        assert!((eval.cost.conservation - expected).abs() < 1e-10);
        assert_eq!(eval.cost.smoothness(), 0.0);

        // Gradient follows the 0.5/dx two-cell formula
        let x_term = |x: usize, y: usize| 2.0 * (prev.value(x + 1, y) - prev.value(x - 1, y));
        let expected_gu = 0.5 * (x_term(2, 2) + x_term(3, 2));
        assert!((eval.grad_u[[2, 2]] - expected_gu).abs() < 1e-12);

        // Outer columns are never written
        assert_eq!(eval.grad_u[[2, 0]], 0.0);
        assert_eq!(eval.grad_u[[2, 4]], 0.0);
        assert_eq!(eval.grad_u[[2, 5]], 0.0);
        assert_eq!(eval.grad_v[[0, 2]], 0.0);
        assert_eq!(eval.grad_v[[3, 2]], 0.0);
    }

    #[test]
    fn test_boundary_ring_does_not_contribute() {
        let prev = field_from_fn(6, 6, 0, pattern);
        let curr = field_from_fn(6, 6, 300, |x, y| pattern(x, y) * 1.1);
        let mut perturbed = curr.clone();
        for i in 0..6 {
            perturbed.set(i, 0, 1.0e6);
            perturbed.set(i, 5, -1.0e6);
            perturbed.set(0, i, 42.0);
            perturbed.set(5, i, 17.0);
        }

        let weights = ConservationWeights::uniform(&curr.geometry, 1.0);
        let u = velocity(&curr.geometry, Staggering::U, |x, _| 0.1 * x as f64);
        let v = velocity(&curr.geometry, Staggering::V, |_, y| 0.2 * y as f64);

        for norm in [ConservationNorm::Linear, ConservationNorm::Squared] {
            let base_eval = CostGradientEvaluator::new(&prev, &curr, &weights, SmoothnessWeights::default(), norm)
                .unwrap()
                .evaluate(&u, &v)
                .unwrap();
            let perturbed_eval =
                CostGradientEvaluator::new(&prev, &perturbed, &weights, SmoothnessWeights::default(), norm)
                    .unwrap()
                    .evaluate(&u, &v)
                    .unwrap();

            assert_eq!(base_eval.cost.conservation, perturbed_eval.cost.conservation);
        }
    }

    #[test]
    fn test_missing_data_skips_residuals() {
        let prev_clean = field_from_fn(7, 7, 0, pattern);
        let mut prev = prev_clean.clone();
        prev.set(3, 3, MISSING);
        let curr = field_from_fn(7, 7, 600, |x, y| pattern(x, y) + 1.0);

        let weights = ConservationWeights::uniform(&curr.geometry, 1.0);
        let smoothness = SmoothnessWeights { u_weight: 0.0, v_weight: 0.0 };
        let u = velocity(&curr.geometry, Staggering::U, |x, y| 0.05 * (x + 2 * y) as f64);
        let v = velocity(&curr.geometry, Staggering::V, |x, y| 0.03 * (2 * x + y) as f64);

        let evaluator =
            CostGradientEvaluator::new(&prev, &curr, &weights, smoothness, ConservationNorm::Linear).unwrap();
        let clean =
            CostGradientEvaluator::new(&prev_clean, &curr, &weights, smoothness, ConservationNorm::Linear).unwrap();

        // The missing value knocks out its own cell and its four neighbors
        assert_eq!(evaluator.valid_cells(), 25 - 5);

        let skipped = [(3, 3), (2, 3), (4, 3), (3, 2), (3, 4)];
        let mut expected = 0.0;
        for y in 1..6 {
            for x in 1..6 {
                if !skipped.contains(&(x, y)) {
                    expected += clean.residual(u.data(), v.data(), x, y);
                }
            }
        }

        let eval = evaluator.evaluate(&u, &v).unwrap();
        assert!((eval.cost.conservation - expected).abs() < 1e-10);

        // U(3,3) collects only from cells (3,3) and (4,3), both skipped
        assert_eq!(eval.grad_u[[3, 3]], 0.0);
        // V(3,3) collects only from cells (3,3) and (3,4), both skipped
        assert_eq!(eval.grad_v[[3, 3]], 0.0);

        let squared = CostGradientEvaluator::new(&prev, &curr, &weights, smoothness, ConservationNorm::Squared)
            .unwrap()
            .evaluate(&u, &v)
            .unwrap();
        assert_eq!(squared.grad_u[[3, 3]], 0.0);
        assert_eq!(squared.grad_v[[3, 3]], 0.0);
    }

    #[test]
    fn test_evaluation_is_repeatable() {
        let prev = field_from_fn(8, 6, 0, pattern);
        let curr = field_from_fn(8, 6, 300, |x, y| pattern(x + 1, y));
        let weights = ConservationWeights::uniform(&curr.geometry, 1.0);
        let evaluator = CostGradientEvaluator::new(
            &prev,
            &curr,
            &weights,
            SmoothnessWeights { u_weight: 0.3, v_weight: 0.7 },
            ConservationNorm::Linear,
        )
        .unwrap();

        let u = velocity(&curr.geometry, Staggering::U, |x, y| ((x * 3 + y) % 5) as f64);
        let v = velocity(&curr.geometry, Staggering::V, |x, y| ((x + y * 2) % 4) as f64);

        let first = evaluator.evaluate(&u, &v).unwrap();
        let second = evaluator.evaluate(&u, &v).unwrap();

        assert_eq!(first.cost.total().to_bits(), second.cost.total().to_bits());
        assert_eq!(first.grad_u, second.grad_u);
        assert_eq!(first.grad_v, second.grad_v);
    }

    #[test]
    fn test_squared_gradient_matches_finite_differences() {
        let prev = field_from_fn(9, 8, 0, pattern);
        let curr = field_from_fn(9, 8, 300, |x, y| pattern(x, y) - 0.3 * y as f64);
        let weights = ConservationWeights::uniform(&curr.geometry, 1.5);
        let evaluator = CostGradientEvaluator::new(
            &prev,
            &curr,
            &weights,
            SmoothnessWeights { u_weight: 0.4, v_weight: 0.9 },
            ConservationNorm::Squared,
        )
        .unwrap();

        let u = velocity(&curr.geometry, Staggering::U, |x, y| (0.3 * x as f64).sin() + 0.1 * y as f64);
        let v = velocity(&curr.geometry, Staggering::V, |x, y| (0.5 * y as f64).cos() - 0.05 * x as f64);
        let eval = evaluator.evaluate(&u, &v).unwrap();

        let h = 1.0e-4;
        let cost_at = |u: &ScalarField, v: &ScalarField| evaluator.evaluate(u, v).unwrap().total_cost();

        // Every free node, including those next to the boundary ring
        for y in 1..u.ny() - 1 {
            for x in 1..u.nx() - 1 {
                let (mut up, mut um) = (u.clone(), u.clone());
                up.set(x, y, u.value(x, y) + h);
                um.set(x, y, u.value(x, y) - h);
                let fd = (cost_at(&up, &v) - cost_at(&um, &v)) / (2.0 * h);
                let scale = fd.abs().max(1.0);
                assert!((eval.grad_u[[y, x]] - fd).abs() / scale < 1e-5, "U({}, {})", x, y);
            }
        }
        for y in 1..v.ny() - 1 {
            for x in 1..v.nx() - 1 {
                let (mut vp, mut vm) = (v.clone(), v.clone());
                vp.set(x, y, v.value(x, y) + h);
                vm.set(x, y, v.value(x, y) - h);
                let fd = (cost_at(&u, &vp) - cost_at(&u, &vm)) / (2.0 * h);
                let scale = fd.abs().max(1.0);
                assert!((eval.grad_v[[y, x]] - fd).abs() / scale < 1e-5, "V({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_exact_smoothness_gradient_agrees_away_from_edges() {
        let g = geometry(9, 8);
        let u = velocity(&g, Staggering::U, |x, y| (0.7 * x as f64).sin() * (0.4 * y as f64).cos());

        let mut stencil = Array2::zeros(u.geometry.shape());
        let mut exact = Array2::zeros(u.geometry.shape());
        add_smoothness_gradient(&u, 0.6, &mut stencil);
        add_exact_smoothness_gradient(u.data(), 0.6, &mut exact);

        for y in 2..u.ny() - 2 {
            for x in 2..u.nx() - 2 {
                assert!((stencil[[y, x]] - exact[[y, x]]).abs() < 1e-12, "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_constant_velocity_is_smooth() {
        let g = geometry(6, 6);
        let u = velocity(&g, Staggering::U, |_, _| 5.0);
        let mut grad = Array2::zeros(u.geometry.shape());

        assert_eq!(smoothness_cost(u.data(), 1.0), 0.0);
        add_smoothness_gradient(&u, 1.0, &mut grad);
        assert!(grad.iter().all(|&g| g == 0.0));

        // A linear ramp has zero curvature too
        let ramp = velocity(&g, Staggering::U, |x, y| 0.5 * x as f64 - 0.25 * y as f64);
        assert!(smoothness_cost(ramp.data(), 1.0).abs() < 1e-24);
    }
}
