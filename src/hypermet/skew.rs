use nalgebra::DVector;
use statrs::function::erf::erfc;

use super::PrecalcVals;
use crate::parameter::Parameter;

/// Which side of the peak a skew component leans toward. Flips the sign of
/// the normalized spread fed into the component's argument. By convention
/// (see the step component) `Left` is the full-energy-peak orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// `+1` for `Left`, `-1` for `Right` -- the sign baked into the step
    /// component's `erfc` argument.
    fn sign(self) -> f64 {
        match self {
            Side::Left => 1.0,
            Side::Right => -1.0,
        }
    }
}

/// Which shape this component evaluates: an exponential-times-erfc tail
/// (has a slope) or a sigmoidal step (amplitude only, slope unused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SkewKind {
    Tail,
    Step,
}

/// One optional additive term on a [`super::Peak`]: a short/right/long tail
/// or the step. `enabled` turns the contribution on; `overridden` decides,
/// during `Region::update_indices`, whether this peak owns its own copy of
/// the parameters or shares the region's default.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SkewComponent {
    pub kind: SkewKind,
    pub amplitude: Parameter,
    pub slope: Parameter,
    pub enabled: bool,
    pub overridden: bool,
    pub side: Side,
}

impl SkewComponent {
    pub fn new_tail(side: Side) -> Self {
        let mut amplitude = Parameter::new(crate::parameter::Transform::Positive);
        amplitude.to_fit = true;
        // `slope` is the tail's "gamma" (skew-width) parameter, tagged `Gam`
        // rather than plain `Positive` to mark the distinct physical intent.
        let mut slope = Parameter::new(crate::parameter::Transform::Gam);
        slope.to_fit = true;
        Self {
            kind: SkewKind::Tail,
            amplitude,
            slope,
            enabled: false,
            overridden: false,
            side,
        }
    }

    pub fn new_step(side: Side) -> Self {
        let mut amplitude = Parameter::new(crate::parameter::Transform::Positive);
        amplitude.to_fit = true;
        let mut slope = Parameter::new(crate::parameter::Transform::Unbounded);
        slope.to_fit = false;
        Self {
            kind: SkewKind::Step,
            amplitude,
            slope,
            enabled: false,
            overridden: false,
            side,
        }
    }

    /// Bounds the amplitude (and, for tails, the slope) parameter.
    pub fn bound_amplitude(&mut self, min: f64, max: f64) {
        self.amplitude = Parameter::new(crate::parameter::Transform::SineBounded { min, max });
    }

    pub fn bound_slope(&mut self, min: f64, max: f64) {
        if self.kind == SkewKind::Tail {
            self.slope = Parameter::new(crate::parameter::Transform::SineBounded { min, max });
        }
    }

    pub fn update_indices(&mut self, counter: &mut i64) -> Result<(), crate::error::FitError> {
        self.amplitude.update_index(counter)?;
        if self.kind == SkewKind::Tail {
            self.slope.update_index(counter)?;
        }
        Ok(())
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.amplitude.put(fit);
        if self.kind == SkewKind::Tail {
            self.slope.put(fit);
        }
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.amplitude.get(fit);
        if self.kind == SkewKind::Tail {
            self.slope.get(fit);
        }
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chi_sq_norm: f64) {
        self.amplitude.get_uncert(diagonals, chi_sq_norm);
        if self.kind == SkewKind::Tail {
            self.slope.get_uncert(diagonals, chi_sq_norm);
        }
    }

    pub fn sane(&self, amp_rel: f64, amp_abs: f64, slope_tol: f64) -> bool {
        if !self.enabled {
            return true;
        }
        if self.amplitude.to_fit && self.amplitude.at_extremum(amp_rel, amp_abs) {
            return false;
        }
        if self.kind == SkewKind::Tail && self.slope.to_fit && self.slope.at_extremum(slope_tol, slope_tol) {
            return false;
        }
        true
    }

    pub fn eval(&self, pre: &PrecalcVals) -> f64 {
        let amp = self.amplitude.val();
        let spread = pre.spread;
        match self.kind {
            SkewKind::Tail => {
                let slope = self.slope.val();
                match self.side {
                    Side::Left => {
                        pre.half_amplitude * amp * (spread / slope).exp() * erfc(spread + 0.5 / slope)
                    }
                    Side::Right => {
                        pre.half_amplitude * amp * (-spread / slope).exp() * erfc(0.5 / slope - spread)
                    }
                }
            }
            SkewKind::Step => pre.half_amplitude * amp * erfc(self.side.sign() * spread),
        }
    }

    pub fn eval_at(&self, pre: &PrecalcVals, fit: &DVector<f64>) -> f64 {
        let amp = self.amplitude.val_from(fit);
        let spread = pre.spread;
        match self.kind {
            SkewKind::Tail => {
                let slope = self.slope.val_from(fit);
                match self.side {
                    Side::Left => {
                        pre.half_amplitude * amp * (spread / slope).exp() * erfc(spread + 0.5 / slope)
                    }
                    Side::Right => {
                        pre.half_amplitude * amp * (-spread / slope).exp() * erfc(0.5 / slope - spread)
                    }
                }
            }
            SkewKind::Step => pre.half_amplitude * amp * erfc(self.side.sign() * spread),
        }
    }

    /// Accumulates this component's contribution to `grads`, including its
    /// share of the width/position/peak-amplitude partials (already
    /// chain-ruled by `pre`'s cached parameter gradients) and -- if `to_fit`
    /// -- its own amplitude/slope partials.
    pub fn eval_grad(&self, pre: &PrecalcVals, grads: &mut DVector<f64>) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let width = pre.width;
        let spread = pre.spread;
        let ampl_full = pre.amplitude;
        let amp = self.amplitude.val();

        let value = match self.kind {
            SkewKind::Tail => {
                let slope = self.slope.val();
                match self.side {
                    Side::Left => {
                        let tail = pre.half_amplitude
                            * amp
                            * (spread / slope).exp()
                            * erfc(spread + 0.5 / slope);
                        let t2 = ampl_full * amp * (spread / slope).exp() / std::f64::consts::PI.sqrt()
                            * (-(spread + 0.5 / slope).powi(2)).exp()
                            / width;

                        if let Some(i) = pre.i_width {
                            grads[i] += pre.width_grad * (-spread / (width * slope) * tail + t2 * spread);
                        }
                        if let Some(i) = pre.i_pos {
                            grads[i] += pre.pos_grad * (-1.0 / (slope * width) * tail + t2);
                        }
                        if let Some(i) = pre.i_amp {
                            grads[i] += pre.amp_grad * (tail / ampl_full);
                        }
                        if self.amplitude.to_fit {
                            if let Some(i) = self.amplitude.index() {
                                grads[i] += tail / amp * self.amplitude.grad();
                            }
                        }
                        if self.slope.to_fit {
                            if let Some(i) = self.slope.index() {
                                grads[i] += self.slope.grad()
                                    * ((-spread / slope.powi(2)) * tail
                                        + (width / (2.0 * slope.powi(2))) * t2);
                            }
                        }
                        tail
                    }
                    Side::Right => {
                        let tail = pre.half_amplitude
                            * amp
                            * (-spread / slope).exp()
                            * erfc(0.5 / slope - spread);
                        let t2 = ampl_full * amp * (-spread / slope).exp() / std::f64::consts::PI.sqrt()
                            * (-(0.5 / slope - spread).powi(2)).exp()
                            / width;

                        if let Some(i) = pre.i_width {
                            grads[i] += pre.width_grad * (spread / (width * slope) * tail - t2 * spread);
                        }
                        if let Some(i) = pre.i_pos {
                            grads[i] += pre.pos_grad * (1.0 / (slope * width) * tail - t2);
                        }
                        if let Some(i) = pre.i_amp {
                            grads[i] += pre.amp_grad * (tail / ampl_full);
                        }
                        if self.amplitude.to_fit {
                            if let Some(i) = self.amplitude.index() {
                                grads[i] += tail / amp * self.amplitude.grad();
                            }
                        }
                        if self.slope.to_fit {
                            if let Some(i) = self.slope.index() {
                                grads[i] += self.slope.grad()
                                    * ((spread / slope.powi(2)) * tail
                                        + (width / (2.0 * slope.powi(2))) * t2);
                            }
                        }
                        tail
                    }
                }
            }
            SkewKind::Step => {
                let sgn = self.side.sign();
                let step = pre.half_amplitude * amp * erfc(sgn * spread);

                if let Some(i) = pre.i_width {
                    grads[i] += pre.width_grad
                        * (ampl_full * amp * sgn / std::f64::consts::PI.sqrt() * (-spread.powi(2)).exp()
                            * spread
                            / width);
                }
                if let Some(i) = pre.i_amp {
                    grads[i] += pre.amp_grad * (step / ampl_full);
                }
                if self.amplitude.to_fit {
                    if let Some(i) = self.amplitude.index() {
                        grads[i] += step / amp * self.amplitude.grad();
                    }
                }
                step
            }
        };
        value
    }

    pub fn eval_grad_at(&self, pre: &PrecalcVals, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64 {
        // Reads the same parameters through `fit` rather than the cached `x`;
        // delegates the arithmetic to `eval_grad` by temporarily treating
        // `pre` as already holding the `fit`-derived values (amplitude and
        // slope are re-read from `fit` at the index level inside `eval_grad`
        // only through their cached `x`, so for the external-vector variant
        // we recompute locally).
        let width = pre.width;
        let spread = pre.spread;
        let ampl_full = pre.amplitude;
        let amp = self.amplitude.val_from(fit);

        match self.kind {
            SkewKind::Tail => {
                let slope = self.slope.val_from(fit);
                let (value, d_width, d_pos, d_amp_full) = match self.side {
                    Side::Left => {
                        let tail = pre.half_amplitude
                            * amp
                            * (spread / slope).exp()
                            * erfc(spread + 0.5 / slope);
                        let t2 = ampl_full * amp * (spread / slope).exp() / std::f64::consts::PI.sqrt()
                            * (-(spread + 0.5 / slope).powi(2)).exp()
                            / width;
                        (
                            tail,
                            -spread / (width * slope) * tail + t2 * spread,
                            -1.0 / (slope * width) * tail + t2,
                            tail / ampl_full,
                        )
                    }
                    Side::Right => {
                        let tail = pre.half_amplitude
                            * amp
                            * (-spread / slope).exp()
                            * erfc(0.5 / slope - spread);
                        let t2 = ampl_full * amp * (-spread / slope).exp() / std::f64::consts::PI.sqrt()
                            * (-(0.5 / slope - spread).powi(2)).exp()
                            / width;
                        (
                            tail,
                            spread / (width * slope) * tail - t2 * spread,
                            1.0 / (slope * width) * tail - t2,
                            tail / ampl_full,
                        )
                    }
                };
                if let Some(i) = pre.i_width {
                    grads[i] += pre.width_grad * d_width;
                }
                if let Some(i) = pre.i_pos {
                    grads[i] += pre.pos_grad * d_pos;
                }
                if let Some(i) = pre.i_amp {
                    grads[i] += pre.amp_grad * d_amp_full;
                }
                if self.amplitude.to_fit {
                    if let Some(i) = self.amplitude.index() {
                        grads[i] += value / amp * self.amplitude.grad_from(fit);
                    }
                }
                if self.slope.to_fit {
                    if let Some(i) = self.slope.index() {
                        let t2_again = match self.side {
                            Side::Left => {
                                ampl_full * amp * (spread / slope).exp() / std::f64::consts::PI.sqrt()
                                    * (-(spread + 0.5 / slope).powi(2)).exp()
                                    / width
                            }
                            Side::Right => {
                                ampl_full * amp * (-spread / slope).exp() / std::f64::consts::PI.sqrt()
                                    * (-(0.5 / slope - spread).powi(2)).exp()
                                    / width
                            }
                        };
                        let d_slope = match self.side {
                            Side::Left => {
                                (-spread / slope.powi(2)) * value + (width / (2.0 * slope.powi(2))) * t2_again
                            }
                            Side::Right => {
                                (spread / slope.powi(2)) * value + (width / (2.0 * slope.powi(2))) * t2_again
                            }
                        };
                        grads[i] += self.slope.grad_from(fit) * d_slope;
                    }
                }
                value
            }
            SkewKind::Step => {
                let sgn = self.side.sign();
                let step = pre.half_amplitude * amp * erfc(sgn * spread);
                if let Some(i) = pre.i_width {
                    grads[i] += pre.width_grad
                        * (ampl_full * amp * sgn / std::f64::consts::PI.sqrt() * (-spread.powi(2)).exp()
                            * spread
                            / width);
                }
                if let Some(i) = pre.i_amp {
                    grads[i] += pre.amp_grad * (step / ampl_full);
                }
                if self.amplitude.to_fit {
                    if let Some(i) = self.amplitude.index() {
                        grads[i] += step / amp * self.amplitude.grad_from(fit);
                    }
                }
                step
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pre(amp: f64, width: f64, spread: f64) -> PrecalcVals {
        PrecalcVals {
            amplitude: amp,
            half_amplitude: 0.5 * amp,
            width,
            spread,
            amp_grad: 1.0,
            width_grad: 1.0,
            pos_grad: 1.0,
            i_amp: Some(0),
            i_width: Some(1),
            i_pos: Some(2),
        }
    }

    #[test]
    fn step_value_flips_sign_with_side() {
        let mut left = SkewComponent::new_step(Side::Left);
        left.enabled = true;
        left.amplitude.set_value(0.01);
        let mut right = left.clone();
        right.side = Side::Right;

        let p = pre(100.0, 3.0, 0.7);
        let vl = left.eval(&p);
        let vr = right.eval(&p);
        // erfc is monotonically decreasing, so flipping the argument's sign
        // flips which side of 1.0 (the erfc(0) value) the result falls on.
        assert!(vl < 0.5 * p.half_amplitude * left.amplitude.val() * 2.0);
        assert!(vr > vl);
        let _ = vr;
    }

    #[test]
    fn tail_gradient_matches_central_difference_on_position() {
        let mut tail = SkewComponent::new_tail(Side::Left);
        tail.bound_amplitude(0.0001, 1.0);
        tail.bound_slope(1.0, 50.0);
        tail.enabled = true;
        tail.amplitude.set_value(0.1);
        tail.slope.set_value(10.0);

        let width = 3.0;
        let ampl = 500.0;
        let chan = 50.0;
        let mut counter = 0i64;
        tail.amplitude.update_index(&mut counter).unwrap();
        tail.slope.update_index(&mut counter).unwrap();

        let h = 1e-4;
        let make_pre = |pos: f64| pre_with_pos(ampl, width, chan, pos);
        let f = |pos: f64| tail.eval(&make_pre(pos));

        let numeric = (f(20.0 + h) - f(20.0 - h)) / (2.0 * h);

        let mut grads = DVector::from_element(3, 0.0);
        let mut p = pre_with_pos(ampl, width, chan, 20.0);
        p.i_amp = None;
        p.i_width = None;
        p.i_pos = Some(2);
        p.pos_grad = -1.0 / width; // d(spread)/d(pos) = -1/width, chain rule folded via pos_grad slot reinterpretation below
        // We instead verify against the raw partial derivative w.r.t. position
        // directly, bypassing the parameter chain rule (pos_grad = 1).
        p.pos_grad = 1.0;
        grads.fill(0.0);
        tail.eval_grad(&p, &mut grads);
        let analytic = grads[2] * (-1.0 / width);

        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-3);
    }

    fn pre_with_pos(ampl: f64, width: f64, chan: f64, pos: f64) -> PrecalcVals {
        pre(ampl, width, (chan - pos) / width)
    }
}
