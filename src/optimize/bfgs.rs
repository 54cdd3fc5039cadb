use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use super::line_search::line_min;
use super::{FitResult, Fittable, GradientSelection, OptimizerConfig};

/// A BFGS quasi-Newton minimizer with an inverse-Hessian update, a
/// derivative-aware Brent line search, and a perturb-and-retry outer loop.
pub struct BFGSOptimizer {
    pub config: OptimizerConfig,
}

impl BFGSOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Runs `minimize` against `fittable`, perturbing and retrying on
    /// non-convergence or an insane result until `max_perturbations` is
    /// exhausted. `cancel` is polled at each outer-loop boundary.
    pub fn minimize(
        &self,
        fittable: &mut dyn Fittable,
        rng: &mut dyn RngCore,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> FitResult {
        let mut total_perturbations = 0u32;
        let mut total_iterations = 0u32;
        let mut used_finite_grads = false;
        let mut log = Vec::new();

        loop {
            let mut gradient_selection = self.config.gradient_selection;
            let mut result = self.run_once(fittable, gradient_selection, cancel);
            total_iterations += result.iterations;

            if gradient_selection == GradientSelection::DefaultToFinite && !result.converged {
                gradient_selection = GradientSelection::FiniteAlways;
                used_finite_grads = true;
                let retry = self.run_once(fittable, gradient_selection, cancel);
                total_iterations += retry.iterations;
                result = retry;
            }

            let cancelled = cancel.load(std::sync::atomic::Ordering::Relaxed);
            fittable.save_fit(&result);
            let sane = !self.config.perform_sanity_checks || fittable.sane();

            if (result.converged && sane) || cancelled || total_perturbations >= self.config.max_perturbations {
                result.iterations = total_iterations;
                result.total_perturbations = total_perturbations;
                result.used_finite_grads = used_finite_grads;
                if cancelled {
                    result.converged = false;
                    result.error_message = Some("Externally interrupted".to_string());
                }
                log.push(format!(
                    "finished after {total_perturbations} perturbation(s), converged={}",
                    result.converged
                ));
                result.log = log;
                return result;
            }

            if !fittable.perturb(rng) {
                result.iterations = total_iterations;
                result.total_perturbations = total_perturbations;
                result.used_finite_grads = used_finite_grads;
                result.error_message = Some("No further perturbations available".to_string());
                log.push("perturbation unavailable, stopping".to_string());
                result.log = log;
                return result;
            }
            total_perturbations += 1;
            if self.config.verbosity > 0 {
                log::info!("Perturbation attempt {total_perturbations}");
            }
            log.push(format!("perturbation attempt {total_perturbations}"));
        }
    }

    /// A single BFGS run to convergence or `max_iterations`, using the
    /// given gradient source.
    fn run_once(
        &self,
        fittable: &dyn Fittable,
        gradient_selection: GradientSelection,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> FitResult {
        let n = fittable.variable_count();
        let mut result = FitResult::new(n);
        let mut x = fittable.variables();

        let mut g = DVector::from_element(n, 0.0);
        let mut f = self.eval_grad(fittable, &x, &mut g, gradient_selection);

        let mut h = DMatrix::identity(n, n);

        let mut iterations = 0u32;
        while iterations < self.config.max_iterations {
            let mut d = -(&h * &g);
            if g.dot(&d) >= 0.0 || d.iter().any(|v| !v.is_finite()) {
                h = DMatrix::identity(n, n);
                d = -g.clone();
            }

            let prev_x = x.clone();
            let fmin = line_min(fittable, &mut x, &d, self.config.verbosity);
            let s = &x - &prev_x;

            let mut g_new = DVector::from_element(n, 0.0);
            let f_new = self.eval_grad(fittable, &x, &mut g_new, gradient_selection);
            let y = &g_new - &g;

            let denom = y.dot(&s);
            if denom.abs() > 1e-300 {
                let rho = 1.0 / denom;
                let hy = &h * &y;
                let term1 = &s * (hy.transpose() * rho);
                let term2 = &hy * (s.transpose() * rho);
                let scalar = rho * rho * y.dot(&hy) + rho;
                let term3 = &s * (s.transpose() * scalar);
                h = &h - term1 - term2 + term3;
            }

            let dx = (&x - &prev_x).norm();
            let df = f_new - f;
            let g_inf = g_new.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));

            iterations += 1;
            if self.config.verbosity > 0 {
                log::info!("Fitting... iteration={iterations}, chi_sq={fmin}");
            }

            let converged_by_tolerance =
                2.0 * (fmin - f).abs() <= self.config.tolerance * (fmin.abs() + f.abs() + self.config.epsilon);
            let converged = converged_by_tolerance
                || dx < self.config.min_x_delta
                || df.abs() < self.config.min_f_delta
                || g_inf < self.config.min_g_norm;

            f = f_new;
            g = g_new;

            let diag_max = h.diagonal().iter().cloned().fold(f64::MIN, f64::max);
            let diag_min = h.diagonal().iter().cloned().fold(f64::MAX, f64::min);
            let condition = diag_max / diag_min;
            if !condition.is_finite() || condition.abs() > self.config.max_condition {
                result.error_message = Some("Hessian condition number exploded".to_string());
                break;
            }

            if converged {
                result.converged = true;
                break;
            }
            if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
        }

        result.iterations = iterations;
        result.value = f;
        result.variables = x.iter().cloned().collect();
        result.inv_hessian = h;
        result
    }

    fn eval_grad(
        &self,
        fittable: &dyn Fittable,
        x: &DVector<f64>,
        grad: &mut DVector<f64>,
        selection: GradientSelection,
    ) -> f64 {
        match selection {
            GradientSelection::AnalyticAlways | GradientSelection::DefaultToFinite => {
                fittable.chi_sq_gradient(x, grad)
            }
            GradientSelection::FiniteAlways => finite_gradient(fittable, x, grad, self.config.epsilon),
        }
    }

    /// Public gradient-check utility (spec'd independently of `minimize`):
    /// compares analytic against central-difference gradients and returns
    /// `true` iff every component agrees within `rel_tol`.
    pub fn check_gradient(fittable: &dyn Fittable, x: &DVector<f64>, rel_tol: f64) -> bool {
        let n = x.len();
        let mut analytic = DVector::from_element(n, 0.0);
        fittable.chi_sq_gradient(x, &mut analytic);

        let mut numeric = DVector::from_element(n, 0.0);
        finite_gradient(fittable, x, &mut numeric, 1e-10);

        for i in 0..n {
            let scale = 1.0_f64.max(analytic[i].abs());
            if (analytic[i] - numeric[i]).abs() / scale >= rel_tol {
                return false;
            }
        }
        true
    }
}

/// Central-difference gradient with a per-component step `h = sqrt(eps) *
/// max(|x_i|, 1)`. Returns chi-square at `x`.
fn finite_gradient(fittable: &dyn Fittable, x: &DVector<f64>, grad: &mut DVector<f64>, epsilon: f64) -> f64 {
    let n = x.len();
    let f = fittable.chi_sq(x);
    let step = epsilon.sqrt();
    for i in 0..n {
        let h = step * x[i].abs().max(1.0);
        let mut plus = x.clone();
        plus[i] += h;
        let mut minus = x.clone();
        minus[i] -= h;
        grad[i] = (fittable.chi_sq(&plus) - fittable.chi_sq(&minus)) / (2.0 * h);
    }
    f
}
