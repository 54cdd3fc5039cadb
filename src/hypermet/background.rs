use nalgebra::DVector;

use crate::error::FitError;
use crate::parameter::{Parameter, Transform};

/// A quadratic background, `base + slope*(x - x_offset) + curve*(x - x_offset)^2`,
/// evaluated relative to a fixed per-region `x_offset` (the window's left
/// edge) to keep the base/slope/curve coefficients well-scaled for the
/// optimizer regardless of where the window sits in the spectrum.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PolyBackground {
    pub base: Parameter,
    pub slope: Parameter,
    pub curve: Parameter,
    pub x_offset: f64,
    pub slope_enabled: bool,
    pub curve_enabled: bool,
}

impl PolyBackground {
    pub fn new(x_offset: f64) -> Self {
        Self {
            base: Parameter::new(Transform::Unbounded),
            slope: Parameter::new(Transform::Unbounded),
            curve: Parameter::new(Transform::Unbounded),
            x_offset,
            slope_enabled: false,
            curve_enabled: false,
        }
    }

    pub fn eval(&self, channel: f64) -> f64 {
        let d = channel - self.x_offset;
        let mut v = self.base.val();
        if self.slope_enabled {
            v += self.slope.val() * d;
        }
        if self.curve_enabled {
            v += self.curve.val() * d * d;
        }
        v
    }

    pub fn eval_at(&self, channel: f64, fit: &DVector<f64>) -> f64 {
        let d = channel - self.x_offset;
        let mut v = self.base.val_from(fit);
        if self.slope_enabled {
            v += self.slope.val_from(fit) * d;
        }
        if self.curve_enabled {
            v += self.curve.val_from(fit) * d * d;
        }
        v
    }

    pub fn eval_grad(&self, channel: f64, grads: &mut DVector<f64>) -> f64 {
        let d = channel - self.x_offset;
        let mut v = self.base.val();
        if let Some(i) = self.base.index() {
            grads[i] += self.base.grad();
        }
        if self.slope_enabled {
            v += self.slope.val() * d;
            if let Some(i) = self.slope.index() {
                grads[i] += self.slope.grad() * d;
            }
        }
        if self.curve_enabled {
            v += self.curve.val() * d * d;
            if let Some(i) = self.curve.index() {
                grads[i] += self.curve.grad() * d * d;
            }
        }
        v
    }

    pub fn eval_grad_at(&self, channel: f64, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64 {
        let d = channel - self.x_offset;
        let mut v = self.base.val_from(fit);
        if let Some(i) = self.base.index() {
            grads[i] += self.base.grad_from(fit);
        }
        if self.slope_enabled {
            v += self.slope.val_from(fit) * d;
            if let Some(i) = self.slope.index() {
                grads[i] += self.slope.grad_from(fit) * d;
            }
        }
        if self.curve_enabled {
            v += self.curve.val_from(fit) * d * d;
            if let Some(i) = self.curve.index() {
                grads[i] += self.curve.grad_from(fit) * d * d;
            }
        }
        v
    }

    pub fn update_indices(&mut self, counter: &mut i64) -> Result<(), FitError> {
        self.base.update_index(counter)?;
        self.slope.to_fit = self.slope_enabled;
        self.slope.update_index(counter)?;
        self.curve.to_fit = self.curve_enabled;
        self.curve.update_index(counter)?;
        Ok(())
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.base.put(fit);
        if self.slope_enabled {
            self.slope.put(fit);
        }
        if self.curve_enabled {
            self.curve.put(fit);
        }
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.base.get(fit);
        if self.slope_enabled {
            self.slope.get(fit);
        }
        if self.curve_enabled {
            self.curve.get(fit);
        }
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chi_sq_norm: f64) {
        self.base.get_uncert(diagonals, chi_sq_norm);
        if self.slope_enabled {
            self.slope.get_uncert(diagonals, chi_sq_norm);
        }
        if self.curve_enabled {
            self.curve.get_uncert(diagonals, chi_sq_norm);
        }
    }
}
