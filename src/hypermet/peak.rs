use nalgebra::DVector;

use super::skew::{Side, SkewComponent};
use super::{Components, PrecalcVals};
use crate::error::FitError;
use crate::parameter::{Parameter, Transform};

/// A single Hypermet peak: a Gaussian core (position, amplitude, width)
/// plus four optional asymmetric add-ons. `width` may be shared with the
/// region default or overridden per-peak via `width_override`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Peak {
    pub position: Parameter,
    pub amplitude: Parameter,
    pub width: Parameter,
    pub width_override: bool,

    pub short_tail: SkewComponent,
    pub right_tail: SkewComponent,
    pub long_tail: SkewComponent,
    pub step: SkewComponent,

    /// Reduced chi-square of the region this peak last belonged to, cached
    /// here so `get_uncerts` can scale the parameter sigmas after a fit.
    #[serde(skip)]
    pub chi_sq_norm: f64,
}

impl Peak {
    /// A new peak at `position` with generous default bounds; all skew
    /// components start disabled.
    pub fn new(position: f64, amplitude: f64, width: f64) -> Self {
        let mut pos = Parameter::new(Transform::Unbounded);
        pos.set_value(position);
        let mut amp = Parameter::new(Transform::Positive);
        amp.set_value(amplitude.max(0.0));
        let mut w = Parameter::new(Transform::Positive);
        w.set_value(width.max(1e-6));

        Self {
            position: pos,
            amplitude: amp,
            width: w,
            width_override: false,
            short_tail: SkewComponent::new_tail(Side::Left),
            right_tail: SkewComponent::new_tail(Side::Right),
            long_tail: SkewComponent::new_tail(Side::Left),
            step: SkewComponent::new_step(Side::Left),
            chi_sq_norm: 1.0,
        }
    }

    /// Binds `position` to a `SineBounded(min, max)` transform, preserving
    /// the current fitted value (clamped into range if necessary). Called by
    /// [`crate::region::Region`] once the data window's extent is known,
    /// since a bare `Peak` has no notion of its containing window.
    pub fn bind_position_to_window(&mut self, min: f64, max: f64) {
        let v = self.position.val().clamp(min, max);
        self.position = Parameter::new(Transform::SineBounded { min, max });
        self.position.set_value(v);
    }

    /// True if every skew component is disabled -- a plain Gaussian peak.
    pub fn is_gaussian_only(&self) -> bool {
        !self.short_tail.enabled && !self.right_tail.enabled && !self.long_tail.enabled && !self.step.enabled
    }

    /// Disables every skew component, collapsing the peak to a pure Gaussian.
    pub fn gaussian_only(&mut self) {
        for skew in self.skews_mut() {
            skew.enabled = false;
        }
    }

    /// Value of just the Gaussian core at `channel`, ignoring any enabled
    /// skew components -- useful for display and for SUM4 cross-checks.
    pub fn gaussian_core(&self, default_width: Option<&Parameter>, channel: f64) -> f64 {
        let width = if self.width_override {
            self.width.val()
        } else {
            default_width.map(|w| w.val()).unwrap_or_else(|| self.width.val())
        };
        let spread = (channel - self.position.val()) / width;
        self.amplitude.val() * (-spread * spread).exp()
    }

    fn precalc_vals(&self, default_width: Option<&Parameter>, channel: f64) -> PrecalcVals {
        let width_param = if self.width_override {
            &self.width
        } else {
            default_width.unwrap_or(&self.width)
        };
        let width = width_param.val();
        let position = self.position.val();
        let amplitude = self.amplitude.val();
        let spread = (channel - position) / width;

        PrecalcVals {
            amplitude,
            half_amplitude: 0.5 * amplitude,
            width,
            spread,
            amp_grad: self.amplitude.grad(),
            width_grad: width_param.grad(),
            pos_grad: self.position.grad(),
            i_amp: self.amplitude.index(),
            i_width: width_param.index(),
            i_pos: self.position.index(),
        }
    }

    fn precalc_vals_at(
        &self,
        default_width: Option<&Parameter>,
        channel: f64,
        fit: &DVector<f64>,
    ) -> PrecalcVals {
        let width_param = if self.width_override {
            &self.width
        } else {
            default_width.unwrap_or(&self.width)
        };
        let width = width_param.val_from(fit);
        let position = self.position.val_from(fit);
        let amplitude = self.amplitude.val_from(fit);
        let spread = (channel - position) / width;

        PrecalcVals {
            amplitude,
            half_amplitude: 0.5 * amplitude,
            width,
            spread,
            amp_grad: self.amplitude.grad_from(fit),
            width_grad: width_param.grad_from(fit),
            pos_grad: self.position.grad_from(fit),
            i_amp: self.amplitude.index(),
            i_width: width_param.index(),
            i_pos: self.position.index(),
        }
    }

    /// Decomposed evaluation at `channel`, for plotting and for SUM4
    /// cross-checks against the pure-Gaussian contribution.
    pub fn components(&self, default_width: Option<&Parameter>, channel: f64) -> Components {
        let pre = self.precalc_vals(default_width, channel);
        let gaussian = pre.amplitude * (-pre.spread * pre.spread).exp();
        Components {
            gaussian,
            short_tail: if self.short_tail.enabled {
                self.short_tail.eval(&pre)
            } else {
                0.0
            },
            right_tail: if self.right_tail.enabled {
                self.right_tail.eval(&pre)
            } else {
                0.0
            },
            long_tail: if self.long_tail.enabled {
                self.long_tail.eval(&pre)
            } else {
                0.0
            },
            step: if self.step.enabled {
                self.step.eval(&pre)
            } else {
                0.0
            },
        }
    }

    pub fn eval(&self, default_width: Option<&Parameter>, channel: f64) -> f64 {
        self.components(default_width, channel).all()
    }

    pub fn eval_at(&self, default_width: Option<&Parameter>, channel: f64, fit: &DVector<f64>) -> f64 {
        let pre = self.precalc_vals_at(default_width, channel, fit);
        let mut total = pre.amplitude * (-pre.spread * pre.spread).exp();
        if self.short_tail.enabled {
            total += self.short_tail.eval_at(&pre, fit);
        }
        if self.right_tail.enabled {
            total += self.right_tail.eval_at(&pre, fit);
        }
        if self.long_tail.enabled {
            total += self.long_tail.eval_at(&pre, fit);
        }
        if self.step.enabled {
            total += self.step.eval_at(&pre, fit);
        }
        total
    }

    /// Accumulates `d(eval)/d(fit[i])` for every fit variable this peak (and
    /// the shared default width, if not overridden) touches.
    pub fn eval_grad(&self, default_width: Option<&Parameter>, channel: f64, grads: &mut DVector<f64>) -> f64 {
        let pre = self.precalc_vals(default_width, channel);
        let gaussian = pre.amplitude * (-pre.spread * pre.spread).exp();

        let gauss_d_width = pre.width_grad * (gaussian * 2.0 * pre.spread * pre.spread / pre.width);
        let gauss_d_pos = pre.pos_grad * (gaussian * 2.0 * pre.spread / pre.width);
        let gauss_d_amp = pre.amp_grad * (gaussian / pre.amplitude.max(f64::MIN_POSITIVE));

        if let Some(i) = pre.i_width {
            grads[i] += gauss_d_width;
        }
        if let Some(i) = pre.i_pos {
            grads[i] += gauss_d_pos;
        }
        if let Some(i) = pre.i_amp {
            grads[i] += gauss_d_amp;
        }

        let mut total = gaussian;
        if self.short_tail.enabled {
            total += self.short_tail.eval_grad(&pre, grads);
        }
        if self.right_tail.enabled {
            total += self.right_tail.eval_grad(&pre, grads);
        }
        if self.long_tail.enabled {
            total += self.long_tail.eval_grad(&pre, grads);
        }
        if self.step.enabled {
            total += self.step.eval_grad(&pre, grads);
        }
        total
    }

    pub fn eval_grad_at(
        &self,
        default_width: Option<&Parameter>,
        channel: f64,
        fit: &DVector<f64>,
        grads: &mut DVector<f64>,
    ) -> f64 {
        let pre = self.precalc_vals_at(default_width, channel, fit);
        let gaussian = pre.amplitude * (-pre.spread * pre.spread).exp();

        let gauss_d_width = pre.width_grad * (gaussian * 2.0 * pre.spread * pre.spread / pre.width);
        let gauss_d_pos = pre.pos_grad * (gaussian * 2.0 * pre.spread / pre.width);
        let gauss_d_amp = pre.amp_grad * (gaussian / pre.amplitude.max(f64::MIN_POSITIVE));

        if let Some(i) = pre.i_width {
            grads[i] += gauss_d_width;
        }
        if let Some(i) = pre.i_pos {
            grads[i] += gauss_d_pos;
        }
        if let Some(i) = pre.i_amp {
            grads[i] += gauss_d_amp;
        }

        let mut total = gaussian;
        if self.short_tail.enabled {
            total += self.short_tail.eval_grad_at(&pre, fit, grads);
        }
        if self.right_tail.enabled {
            total += self.right_tail.eval_grad_at(&pre, fit, grads);
        }
        if self.long_tail.enabled {
            total += self.long_tail.eval_grad_at(&pre, fit, grads);
        }
        if self.step.enabled {
            total += self.step.eval_grad_at(&pre, fit, grads);
        }
        total
    }

    /// True if the step component is oriented as a full-energy peak
    /// (`side = Left`, per the fixed convention).
    pub fn full_energy_peak(&self) -> bool {
        self.step.side == Side::Left
    }

    /// Sets the step component's orientation to match `full_energy`.
    pub fn set_full_energy_peak(&mut self, full_energy: bool) {
        self.step.side = if full_energy { Side::Left } else { Side::Right };
    }

    /// FWHM in channels: `2 * sqrt(ln 2) * width`.
    pub fn fwhm(&self) -> f64 {
        2.0 * std::f64::consts::LN_2.sqrt() * self.width.val()
    }

    pub fn fwhm_energy(&self, cal: &dyn crate::calibration::Calibration) -> f64 {
        self.fwhm() * cal.derivative(self.position.val())
    }

    pub fn peak_position(&self) -> f64 {
        self.position.val()
    }

    pub fn peak_energy(&self, cal: &dyn crate::calibration::Calibration) -> f64 {
        cal.transform(self.peak_position())
    }

    /// Analytic area under the Gaussian core plus the enabled tail skews,
    /// integrated in closed form over the full real line:
    /// `area = A*w*(sqrt(pi) + sum(A_skew * beta_skew * exp(-1/(4*beta_skew^2))))`.
    /// The step component has no finite integral and is excluded. Used as
    /// the Hypermet area estimate to cross-check `Sum4::net_area`.
    pub fn area(&self, default_width: Option<&Parameter>) -> f64 {
        let width = if self.width_override {
            self.width.val()
        } else {
            default_width.map(|w| w.val()).unwrap_or_else(|| self.width.val())
        };
        let amplitude = self.amplitude.val();
        let sqrt_pi = std::f64::consts::PI.sqrt();

        let mut tail_sum = 0.0;
        for tail in [&self.short_tail, &self.right_tail, &self.long_tail] {
            if tail.enabled {
                let a = tail.amplitude.val();
                let beta = tail.slope.val();
                tail_sum += a * beta * (-1.0 / (4.0 * beta * beta)).exp();
            }
        }
        amplitude * width * (sqrt_pi + tail_sum)
    }

    /// Runs `update_index` for each enabled/overridden parameter in a fixed,
    /// deterministic order (position, amplitude, width if overridden, then
    /// each enabled skew component's own parameters).
    pub fn update_indices(&mut self, counter: &mut i64) -> Result<(), FitError> {
        self.position.update_index(counter)?;
        self.amplitude.update_index(counter)?;
        if self.width_override {
            self.width.update_index(counter)?;
        } else {
            self.width.to_fit = false;
            self.width.update_index(counter)?;
        }
        for skew in self.skews_mut() {
            if skew.enabled {
                skew.update_indices(counter)?;
            }
        }
        Ok(())
    }

    fn skews_mut(&mut self) -> [&mut SkewComponent; 4] {
        [
            &mut self.short_tail,
            &mut self.right_tail,
            &mut self.long_tail,
            &mut self.step,
        ]
    }

    fn skews(&self) -> [&SkewComponent; 4] {
        [&self.short_tail, &self.right_tail, &self.long_tail, &self.step]
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.position.put(fit);
        self.amplitude.put(fit);
        // Unconditional: when `width` isn't overridden it has no index
        // (see `update_indices`), so `Parameter::put` is a no-op. The
        // shared default width is written by `Region` through its own
        // `default_peak.put`, not through any one peak's `width` field.
        self.width.put(fit);
        for skew in self.skews() {
            if skew.enabled {
                skew.put(fit);
            }
        }
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.position.get(fit);
        self.amplitude.get(fit);
        self.width.get(fit);
        for skew in self.skews_mut() {
            if skew.enabled {
                skew.get(fit);
            }
        }
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chi_sq_norm: f64) {
        self.chi_sq_norm = chi_sq_norm;
        self.position.get_uncert(diagonals, chi_sq_norm);
        self.amplitude.get_uncert(diagonals, chi_sq_norm);
        self.width.get_uncert(diagonals, chi_sq_norm);
        for skew in self.skews_mut() {
            if skew.enabled {
                skew.get_uncerts(diagonals, chi_sq_norm);
            }
        }
    }

    /// Sanity gate after a fit: none of the to-fit parameters have wandered
    /// onto a bound, by the given tolerances.
    pub fn sane(&self, rel_tol: f64, abs_tol: f64) -> bool {
        if self.amplitude.to_fit && self.amplitude.at_extremum(rel_tol, abs_tol) {
            return false;
        }
        if self.width_override && self.width.to_fit && self.width.at_extremum(rel_tol, abs_tol) {
            return false;
        }
        self.skews()
            .iter()
            .all(|s| s.sane(rel_tol, abs_tol, rel_tol))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub(crate) struct PeakOrd(pub f64);
impl Eq for PeakOrd {}
impl Ord for PeakOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gaussian_only_peak_matches_eval_when_no_skew_enabled() {
        let peak = Peak::new(50.0, 100.0, 3.0);
        assert!(peak.is_gaussian_only());
        for chan in [40.0, 48.0, 50.0, 52.0, 60.0] {
            assert_abs_diff_eq!(peak.eval(None, chan), peak.gaussian_core(None, chan), epsilon = 1e-9);
        }
    }

    #[test]
    fn eval_peaks_at_the_peak_position() {
        let peak = Peak::new(50.0, 100.0, 3.0);
        let at_peak = peak.eval(None, 50.0);
        let off_peak = peak.eval(None, 55.0);
        assert!(at_peak > off_peak);
        assert_abs_diff_eq!(at_peak, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn gradient_matches_central_difference_on_position() {
        let mut peak = Peak::new(50.0, 100.0, 3.0);
        let mut counter = 0i64;
        peak.update_indices(&mut counter).unwrap();
        let n = counter as usize;
        let mut fit = DVector::from_element(n, 0.0);
        peak.put(&mut fit);

        let h = 1e-5;
        let chan = 52.0;
        let base = peak.eval_at(None, chan, &fit);
        let mut grads = DVector::from_element(n, 0.0);
        peak.eval_grad_at(None, chan, &fit, &mut grads);

        let i_pos = peak.position.index().unwrap();
        let mut fit_plus = fit.clone();
        fit_plus[i_pos] += h;
        let mut fit_minus = fit.clone();
        fit_minus[i_pos] -= h;
        let numeric = (peak.eval_at(None, chan, &fit_plus) - peak.eval_at(None, chan, &fit_minus)) / (2.0 * h);

        assert_abs_diff_eq!(grads[i_pos], numeric, epsilon = 1e-3);
        let _ = base;
    }

    #[test]
    fn width_override_keeps_its_own_index() {
        let mut peak = Peak::new(10.0, 5.0, 1.0);
        peak.width_override = true;
        let mut counter = 0i64;
        peak.update_indices(&mut counter).unwrap();
        assert!(peak.width.valid_index());
    }

    #[test]
    fn disabled_skew_components_do_not_consume_indices() {
        let mut peak = Peak::new(10.0, 5.0, 1.0);
        let mut counter = 0i64;
        peak.update_indices(&mut counter).unwrap();
        // position + amplitude only; width not overridden, no skews enabled.
        assert_eq!(counter, 2);
    }

    #[test]
    fn gaussian_only_disables_all_skews() {
        let mut peak = Peak::new(10.0, 5.0, 1.0);
        peak.short_tail.enabled = true;
        peak.step.enabled = true;
        peak.gaussian_only();
        assert!(peak.is_gaussian_only());
    }
}
