//! BFGS quasi-Newton minimizer with a derivative-aware Brent line search.

pub mod bfgs;
pub mod line_search;
pub mod test_functions;

pub use bfgs::BFGSOptimizer;

use nalgebra::{DMatrix, DVector};

/// The contract the optimizer consumes. [`crate::region::Region`] is the
/// only production implementation; the functions in [`test_functions`]
/// exist purely to verify the optimizer itself.
pub trait Fittable {
    fn variables(&self) -> DVector<f64>;
    fn variable_count(&self) -> usize;
    fn chi_sq(&self, vec: &DVector<f64>) -> f64;
    /// Fills `grad` and returns chi-square at `vec`.
    fn chi_sq_gradient(&self, vec: &DVector<f64>, grad: &mut DVector<f64>) -> f64;
    fn save_fit(&mut self, result: &FitResult);
    fn sane(&self) -> bool;
    /// Randomizes to escape a local minimum; `false` if no more
    /// perturbations are available, ending the optimizer's retry loop.
    fn perturb(&mut self, rng: &mut dyn rand::RngCore) -> bool;
    fn degrees_of_freedom(&self) -> f64;
}

/// Which gradient source the optimizer consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GradientSelection {
    /// Always use the Fittable's analytic gradient.
    AnalyticAlways,
    /// Always derive the gradient by central differences.
    FiniteAlways,
    /// Analytic first pass; if it fails to converge, retry once with finite
    /// differences and add both attempts' iteration counts.
    DefaultToFinite,
}

/// Stop criteria and behavior knobs for [`BFGSOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptimizerConfig {
    pub max_iterations: u32,
    pub min_x_delta: f64,
    pub min_f_delta: f64,
    pub min_g_norm: f64,
    pub max_condition: f64,
    pub use_epsilon_check: bool,
    pub tolerance: f64,
    pub epsilon: f64,
    pub gradient_selection: GradientSelection,
    pub perform_sanity_checks: bool,
    pub max_perturbations: u32,
    pub verbosity: u8,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            min_x_delta: 1e-10,
            min_f_delta: 1e-10,
            min_g_norm: 1e-7,
            max_condition: 1e12,
            use_epsilon_check: true,
            tolerance: 1e-5,
            epsilon: 1e-10,
            gradient_selection: GradientSelection::AnalyticAlways,
            perform_sanity_checks: true,
            max_perturbations: 10,
            verbosity: 0,
        }
    }
}

/// Outcome of a `minimize` call: the converged (or best-so-far) state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FitResult {
    pub variables: Vec<f64>,
    pub inv_hessian: DMatrix<f64>,
    pub iterations: u32,
    pub converged: bool,
    pub value: f64,
    pub total_perturbations: u32,
    pub used_finite_grads: bool,
    pub error_message: Option<String>,
    pub log: Vec<String>,
}

impl FitResult {
    fn new(n: usize) -> Self {
        Self {
            variables: vec![0.0; n],
            inv_hessian: DMatrix::identity(n, n),
            iterations: 0,
            converged: false,
            value: f64::INFINITY,
            total_perturbations: 0,
            used_finite_grads: false,
            error_message: None,
            log: Vec::new(),
        }
    }
}
