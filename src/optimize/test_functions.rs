//! Synthetic [`Fittable`] implementations used to verify the optimizer
//! itself, independent of the Hypermet/Region machinery.

use nalgebra::DVector;
use rand::RngCore;

use super::{FitResult, Fittable};

/// The n-dimensional Rosenbrock function, `sum_{i} 100*(x_{i+1} - x_i^2)^2 + (1 - x_i)^2`.
pub struct Rosenbrock {
    x: DVector<f64>,
}

impl Rosenbrock {
    pub fn new(n: usize) -> Self {
        Self {
            x: DVector::from_element(n, 0.0),
        }
    }

    pub fn from_start(start: Vec<f64>) -> Self {
        Self {
            x: DVector::from_vec(start),
        }
    }
}

impl Fittable for Rosenbrock {
    fn variables(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn variable_count(&self) -> usize {
        self.x.len()
    }

    fn chi_sq(&self, vec: &DVector<f64>) -> f64 {
        let n = vec.len();
        let mut sum = 0.0;
        for i in 0..n - 1 {
            let a = vec[i + 1] - vec[i] * vec[i];
            let b = 1.0 - vec[i];
            sum += 100.0 * a * a + b * b;
        }
        sum
    }

    fn chi_sq_gradient(&self, vec: &DVector<f64>, grad: &mut DVector<f64>) -> f64 {
        grad.fill(0.0);
        let n = vec.len();
        for i in 0..n - 1 {
            let a = vec[i + 1] - vec[i] * vec[i];
            let b = 1.0 - vec[i];
            grad[i] += -400.0 * vec[i] * a - 2.0 * b;
            grad[i + 1] += 200.0 * a;
        }
        self.chi_sq(vec)
    }

    fn save_fit(&mut self, result: &FitResult) {
        self.x = DVector::from_vec(result.variables.clone());
    }

    fn sane(&self) -> bool {
        true
    }

    fn perturb(&mut self, _rng: &mut dyn RngCore) -> bool {
        false
    }

    fn degrees_of_freedom(&self) -> f64 {
        self.x.len() as f64
    }
}

/// A single SineBounded-style variable fit to a constant target, for the
/// "Constant" end-to-end scenario.
pub struct ConstFunction {
    target: f64,
    x: DVector<f64>,
}

impl ConstFunction {
    pub fn new(target: f64, initial: f64) -> Self {
        Self {
            target,
            x: DVector::from_vec(vec![initial]),
        }
    }
}

impl Fittable for ConstFunction {
    fn variables(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn variable_count(&self) -> usize {
        1
    }

    fn chi_sq(&self, vec: &DVector<f64>) -> f64 {
        let d = vec[0] - self.target;
        d * d
    }

    fn chi_sq_gradient(&self, vec: &DVector<f64>, grad: &mut DVector<f64>) -> f64 {
        grad[0] = 2.0 * (vec[0] - self.target);
        self.chi_sq(vec)
    }

    fn save_fit(&mut self, result: &FitResult) {
        self.x = DVector::from_vec(result.variables.clone());
    }

    fn sane(&self) -> bool {
        true
    }

    fn perturb(&mut self, _rng: &mut dyn RngCore) -> bool {
        false
    }

    fn degrees_of_freedom(&self) -> f64 {
        1.0
    }
}

/// `y = slope * x`, a single free slope parameter, used for the "Linear"
/// end-to-end scenario.
pub struct LinearFunction {
    xs: Vec<f64>,
    ys: Vec<f64>,
    slope: DVector<f64>,
}

impl LinearFunction {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>, initial_slope: f64) -> Self {
        Self {
            xs,
            ys,
            slope: DVector::from_vec(vec![initial_slope]),
        }
    }
}

impl Fittable for LinearFunction {
    fn variables(&self) -> DVector<f64> {
        self.slope.clone()
    }

    fn variable_count(&self) -> usize {
        1
    }

    fn chi_sq(&self, vec: &DVector<f64>) -> f64 {
        self.xs
            .iter()
            .zip(&self.ys)
            .map(|(&x, &y)| {
                let resid = y - vec[0] * x;
                resid * resid
            })
            .sum()
    }

    fn chi_sq_gradient(&self, vec: &DVector<f64>, grad: &mut DVector<f64>) -> f64 {
        grad[0] = self
            .xs
            .iter()
            .zip(&self.ys)
            .map(|(&x, &y)| -2.0 * x * (y - vec[0] * x))
            .sum();
        self.chi_sq(vec)
    }

    fn save_fit(&mut self, result: &FitResult) {
        self.slope = DVector::from_vec(result.variables.clone());
    }

    fn sane(&self) -> bool {
        true
    }

    fn perturb(&mut self, _rng: &mut dyn RngCore) -> bool {
        false
    }

    fn degrees_of_freedom(&self) -> f64 {
        (self.xs.len() as f64) - 1.0
    }
}

/// A separable quadratic bowl, `sum_i (x_i - center_i)^2`, for line-search
/// unit tests.
pub struct Quadratic {
    centers: DVector<f64>,
    x: DVector<f64>,
}

impl Quadratic {
    pub fn new(start: Vec<f64>, centers: Vec<f64>) -> Self {
        Self {
            centers: DVector::from_vec(centers),
            x: DVector::from_vec(start),
        }
    }
}

impl Fittable for Quadratic {
    fn variables(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn variable_count(&self) -> usize {
        self.x.len()
    }

    fn chi_sq(&self, vec: &DVector<f64>) -> f64 {
        (vec - &self.centers).norm_squared()
    }

    fn chi_sq_gradient(&self, vec: &DVector<f64>, grad: &mut DVector<f64>) -> f64 {
        for i in 0..vec.len() {
            grad[i] = 2.0 * (vec[i] - self.centers[i]);
        }
        self.chi_sq(vec)
    }

    fn save_fit(&mut self, result: &FitResult) {
        self.x = DVector::from_vec(result.variables.clone());
    }

    fn sane(&self) -> bool {
        true
    }

    fn perturb(&mut self, _rng: &mut dyn RngCore) -> bool {
        false
    }

    fn degrees_of_freedom(&self) -> f64 {
        self.x.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rosenbrock_minimum_is_zero_at_all_ones() {
        let r = Rosenbrock::new(4);
        let ones = DVector::from_element(4, 1.0);
        assert_eq!(r.chi_sq(&ones), 0.0);
    }

    #[test]
    fn const_function_chi_sq_is_zero_at_target() {
        let f = ConstFunction::new(10.0, 30.0);
        let vec = DVector::from_vec(vec![10.0]);
        assert_eq!(f.chi_sq(&vec), 0.0);
    }
}
