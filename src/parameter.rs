use nalgebra::DVector;

use crate::error::FitError;

/// The bijective map between the optimizer's unconstrained `x` and the
/// physical `value` a component actually uses.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Transform {
    /// `value = x`.
    Unbounded,
    /// `value = x^2`, enforces `value >= 0`.
    Positive,
    /// `value = min + (max - min) * (1 + sin(x)) / 2`, enforces `[min, max]`.
    SineBounded { min: f64, max: f64 },
    /// `value = min + (max - min) * (atan(slope * x) / pi + 0.5)`, enforces `[min, max]`.
    ArcTanBounded { min: f64, max: f64, slope: f64 },
    /// Non-negative "gamma": `value = x^2`, same map as `Positive` but kept as
    /// its own tag so callers can distinguish intent (width-like quantities).
    Gam,
}

impl Transform {
    pub fn value_at(&self, x: f64) -> f64 {
        match *self {
            Transform::Unbounded => x,
            Transform::Positive | Transform::Gam => x * x,
            Transform::SineBounded { min, max } => min + (max - min) * (1.0 + x.sin()) / 2.0,
            Transform::ArcTanBounded { min, max, slope } => {
                min + (max - min) * ((slope * x).atan() / std::f64::consts::PI + 0.5)
            }
        }
    }

    pub fn grad_at(&self, x: f64) -> f64 {
        match *self {
            Transform::Unbounded => 1.0,
            Transform::Positive | Transform::Gam => 2.0 * x,
            Transform::SineBounded { min, max } => x.cos() * (max - min) / 2.0,
            Transform::ArcTanBounded { min, max, slope } => {
                (max - min) * slope / (std::f64::consts::PI * (1.0 + (slope * x).powi(2)))
            }
        }
    }

    /// Inverts the forward map. For bounded transforms the target is clamped
    /// into the open interval before inverting, so this never panics or
    /// returns a non-finite `x` for a finite `value`.
    pub fn x_at(&self, value: f64) -> f64 {
        match *self {
            Transform::Unbounded => value,
            Transform::Positive | Transform::Gam => value.max(0.0).sqrt(),
            Transform::SineBounded { min, max } => {
                let frac = if max > min {
                    (2.0 * (value - min) / (max - min) - 1.0).clamp(-1.0, 1.0)
                } else {
                    0.0
                };
                frac.asin()
            }
            Transform::ArcTanBounded { min, max, slope } => {
                let eps = 1e-9;
                let frac = if max > min {
                    ((value - min) / (max - min)).clamp(eps, 1.0 - eps)
                } else {
                    0.5
                };
                ((frac - 0.5) * std::f64::consts::PI).tan() / slope
            }
        }
    }

    fn bounds(&self) -> Option<(f64, f64)> {
        match *self {
            Transform::SineBounded { min, max } => Some((min, max)),
            Transform::ArcTanBounded { min, max, .. } => Some((min, max)),
            Transform::Unbounded | Transform::Positive | Transform::Gam => None,
        }
    }
}

/// A bounded scalar fit variable: the optimizer sees only `x`; every
/// consumer sees `value()` through the parameter's [`Transform`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Parameter {
    transform: Transform,
    x: f64,
    pub to_fit: bool,
    #[serde(skip)]
    index: Option<usize>,
    uncert: f64,
}

impl Parameter {
    pub fn new(transform: Transform) -> Self {
        Self {
            transform,
            x: 0.0,
            to_fit: true,
            index: None,
            uncert: 0.0,
        }
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn set_x(&mut self, x: f64) {
        self.x = x;
    }

    pub fn val(&self) -> f64 {
        self.transform.value_at(self.x)
    }

    pub fn grad(&self) -> f64 {
        self.transform.grad_at(self.x)
    }

    /// Sets `value` by inverting the transform; out-of-range targets are
    /// clamped into the transform's domain rather than producing a
    /// non-finite `x`.
    pub fn set_value(&mut self, value: f64) {
        self.x = self.transform.x_at(value);
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn valid_index(&self) -> bool {
        self.index.is_some()
    }

    pub fn uncert(&self) -> f64 {
        self.uncert
    }

    /// Assigns the next free slot in the global variable vector if
    /// `to_fit`, otherwise clears the index. Rejects a negative counter.
    pub fn update_index(&mut self, counter: &mut i64) -> Result<(), FitError> {
        if *counter < 0 {
            return Err(FitError::NegativeIndex(*counter));
        }
        if self.to_fit {
            self.index = Some(*counter as usize);
            *counter += 1;
        } else {
            self.index = None;
        }
        Ok(())
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        if let Some(i) = self.index {
            fit[i] = self.x;
        }
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        if let Some(i) = self.index {
            self.x = fit[i];
        }
    }

    /// Evaluates `value` at `fit[index]` without mutating `self`; falls
    /// back to the cached `x` when unindexed.
    pub fn val_from(&self, fit: &DVector<f64>) -> f64 {
        match self.index {
            Some(i) => self.transform.value_at(fit[i]),
            None => self.val(),
        }
    }

    /// Evaluates `grad` at `fit[index]` without mutating `self`; falls
    /// back to the cached `x` when unindexed.
    pub fn grad_from(&self, fit: &DVector<f64>) -> f64 {
        match self.index {
            Some(i) => self.transform.grad_at(fit[i]),
            None => self.grad(),
        }
    }

    pub fn get_uncert(&mut self, diagonals: &DVector<f64>, chi_sq_norm: f64) {
        if let Some(i) = self.index {
            self.uncert = (diagonals[i] * self.grad().powi(2) * chi_sq_norm)
                .abs()
                .sqrt();
        }
    }

    /// True if this is a bounded parameter whose value has converged to
    /// within `max(rel_tol * (max - min), abs_tol)` of either bound -- a
    /// sign the fit has wandered onto a degenerate boundary solution.
    /// Unbounded/Positive/Gam parameters are never at an extremum.
    pub fn at_extremum(&self, rel_tol: f64, abs_tol: f64) -> bool {
        match self.transform.bounds() {
            Some((min, max)) => {
                let tol = (rel_tol * (max - min)).max(abs_tol);
                let v = self.val();
                (v - min).abs() < tol || (max - v).abs() < tol
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn central_diff_grad(t: &Transform, x: f64, h: f64) -> f64 {
        (t.value_at(x + h) - t.value_at(x - h)) / (2.0 * h)
    }

    fn sample_xs() -> Vec<f64> {
        let n = 25;
        (0..=n)
            .map(|i| -4.0 * std::f64::consts::PI + 8.0 * std::f64::consts::PI * (i as f64) / (n as f64))
            .collect()
    }

    #[test]
    fn sine_bounded_stays_within_bounds() {
        let t = Transform::SineBounded {
            min: 2.0,
            max: 11.0,
        };
        for x in sample_xs() {
            let v = t.value_at(x);
            assert!((2.0..=11.0).contains(&v), "value {v} out of bounds at x={x}");
        }
    }

    #[test]
    fn arctan_bounded_stays_within_bounds() {
        let t = Transform::ArcTanBounded {
            min: -3.0,
            max: 7.0,
            slope: 0.5,
        };
        for x in sample_xs() {
            let v = t.value_at(x);
            assert!((-3.0..=7.0).contains(&v), "value {v} out of bounds at x={x}");
        }
    }

    #[test]
    fn positive_is_never_negative() {
        let t = Transform::Positive;
        for x in sample_xs() {
            assert!(t.value_at(x) >= 0.0);
        }
    }

    #[test]
    fn sine_bounded_is_bijective_within_range() {
        let t = Transform::SineBounded {
            min: -5.0,
            max: 14.0,
        };
        for i in 1..20 {
            let v = -5.0 + 19.0 * (i as f64) / 20.0;
            let x = t.x_at(v);
            assert_abs_diff_eq!(t.value_at(x), v, epsilon = 1e-12);
        }
    }

    #[test]
    fn arctan_bounded_is_bijective_within_range() {
        let t = Transform::ArcTanBounded {
            min: 0.0,
            max: 9.0,
            slope: 1.3,
        };
        for i in 1..20 {
            let v = 9.0 * (i as f64) / 20.0;
            let x = t.x_at(v);
            assert_abs_diff_eq!(t.value_at(x), v, epsilon = 1e-9);
        }
    }

    #[test]
    fn gradient_matches_central_difference_for_all_variants() {
        let transforms = [
            Transform::Unbounded,
            Transform::Positive,
            Transform::Gam,
            Transform::SineBounded {
                min: -1.0,
                max: 6.0,
            },
            Transform::ArcTanBounded {
                min: -1.0,
                max: 6.0,
                slope: 0.7,
            },
        ];
        let h = 1e-4;
        for t in transforms {
            for x in sample_xs() {
                let analytic = t.grad_at(x);
                let numeric = central_diff_grad(&t, x, h);
                let scale = 1.0_f64.max(analytic.abs());
                assert!(
                    (analytic - numeric).abs() / scale < 1e-5,
                    "grad mismatch for {t:?} at x={x}: analytic={analytic}, numeric={numeric}"
                );
            }
        }
    }

    #[test]
    fn disabled_parameter_never_gets_an_index() {
        let mut p = Parameter::new(Transform::Unbounded);
        p.to_fit = false;
        let mut counter = 0i64;
        p.update_index(&mut counter).unwrap();
        assert!(!p.valid_index());
        assert_eq!(counter, 0);

        let fit = DVector::from_element(1, 99.0);
        p.put(&mut fit.clone());
        let mut p2 = p.clone();
        p2.get(&fit);
        assert_eq!(p2.x(), p.x());
    }

    #[test]
    fn negative_counter_is_rejected() {
        let mut p = Parameter::new(Transform::Unbounded);
        let mut counter = -1i64;
        assert!(p.update_index(&mut counter).is_err());
    }

    #[test]
    fn at_extremum_detects_boundary_convergence() {
        let mut p = Parameter::new(Transform::SineBounded {
            min: 0.0,
            max: 10.0,
        });
        p.set_value(0.0001);
        assert!(p.at_extremum(1e-3, 1e-3));
        p.set_value(5.0);
        assert!(!p.at_extremum(1e-3, 1e-3));
    }
}
