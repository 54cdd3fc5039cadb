//! The objective function: a background plus a collection of peaks over a
//! weighted data window. `Region` is the only production [`crate::optimize::Fittable`].

pub mod sum4;

pub use sum4::{Sum4, Sum4Edge};

use nalgebra::DVector;
use rand::Rng;

use crate::error::FitError;
use crate::hypermet::{Peak, PolyBackground};
use crate::optimize::Fittable;

/// Statistical weight estimator applied to each bin's count when the window
/// is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WeightScheme {
    /// `sqrt(max(count, 1))`.
    True,
    /// Smoothed estimator for bins with small or zero counts: averages the
    /// bin with its two neighbors before taking the square root, so an
    /// isolated zero-count bin doesn't collapse the weight to zero.
    PhillipsMarlow,
}

fn compute_weights(counts: &[f64], scheme: WeightScheme) -> Vec<f64> {
    match scheme {
        WeightScheme::True => counts.iter().map(|&c| c.max(1.0).sqrt()).collect(),
        WeightScheme::PhillipsMarlow => {
            let n = counts.len();
            (0..n)
                .map(|i| {
                    let lo = i.saturating_sub(1);
                    let hi = (i + 1).min(n - 1);
                    let window = &counts[lo..=hi];
                    let smoothed = window.iter().sum::<f64>() / window.len() as f64;
                    smoothed.max(1.0).sqrt()
                })
                .collect()
        }
    }
}

/// A background + a set of peaks over a fixed weighted channel window.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Region {
    channel: Vec<f64>,
    count: Vec<f64>,
    weight: Vec<f64>,

    pub background: PolyBackground,
    pub default_peak: Peak,
    peaks: Vec<Peak>,

    pub sum4: Option<Sum4>,

    #[serde(skip)]
    variable_count: usize,
    #[serde(skip)]
    chi_sq_norm: f64,
}

impl Region {
    /// Builds a region over `channel`/`count` with weights computed per
    /// `scheme`. Fails if the vectors mismatch in length, the window is
    /// empty, there are too few bins to leave any degrees of freedom given
    /// `initial_peaks`, or an initial peak's position falls outside the
    /// window.
    pub fn new(
        channel: Vec<f64>,
        count: Vec<f64>,
        scheme: WeightScheme,
        background: PolyBackground,
        initial_peaks: Vec<Peak>,
    ) -> Result<Self, FitError> {
        if channel.is_empty() {
            return Err(FitError::EmptyWindow);
        }
        if channel.len() != count.len() {
            return Err(FitError::LengthMismatch {
                channel: channel.len(),
                count: count.len(),
                weight: count.len(),
            });
        }

        let min_x = *channel.first().unwrap();
        let max_x = *channel.last().unwrap();
        for peak in &initial_peaks {
            let pos = peak.peak_position();
            if pos <= min_x || pos >= max_x {
                return Err(FitError::PeakOutsideWindow {
                    position: pos,
                    min: min_x,
                    max: max_x,
                });
            }
        }

        let weight = compute_weights(&count, scheme);

        let mut peaks = initial_peaks;
        peaks.sort_by(|a, b| {
            a.peak_position()
                .partial_cmp(&b.peak_position())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let needed = peaks.len() * 2 + 1;
        if channel.len() <= needed {
            return Err(FitError::TooFewBins {
                have: channel.len(),
                need: needed + 1,
            });
        }

        for peak in peaks.iter_mut() {
            peak.bind_position_to_window(min_x, max_x);
        }

        let mut default_peak = Peak::new((min_x + max_x) / 2.0, 1.0, (max_x - min_x) / 20.0);
        default_peak.bind_position_to_window(min_x, max_x);

        Ok(Self {
            channel,
            count,
            weight,
            background,
            default_peak,
            peaks,
            sum4: None,
            variable_count: 0,
            chi_sq_norm: 1.0,
        })
    }

    pub fn left_bin(&self) -> f64 {
        *self.channel.first().unwrap_or(&0.0)
    }

    pub fn right_bin(&self) -> f64 {
        *self.channel.last().unwrap_or(&0.0)
    }

    pub fn width(&self) -> f64 {
        self.right_bin() - self.left_bin()
    }

    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    pub fn peaks(&self) -> impl Iterator<Item = &Peak> {
        self.peaks.iter()
    }

    pub fn peaks_mut(&mut self) -> impl Iterator<Item = &mut Peak> {
        self.peaks.iter_mut()
    }

    pub fn add_peak(&mut self, mut peak: Peak) {
        peak.bind_position_to_window(self.left_bin(), self.right_bin());
        self.peaks.push(peak);
        self.peaks.sort_by(|a, b| {
            a.peak_position()
                .partial_cmp(&b.peak_position())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn chi_sq_normalized(&self) -> f64 {
        self.chi_sq_norm
    }

    pub fn set_sum4(&mut self, sum4: Sum4) {
        self.sum4 = Some(sum4);
    }

    /// Width parameter each peak actually uses: its own, if overridden,
    /// else the region default.
    fn width_for(&self, peak: &Peak) -> Option<&crate::parameter::Parameter> {
        if peak.width_override {
            None
        } else {
            Some(&self.default_peak.width)
        }
    }

    /// Assigns variable indices in the deterministic order of spec §4.4:
    /// background, shared default slots used by at least one peak, then
    /// each peak's own amplitude/position/overrides, in position order.
    pub fn update_indices(&mut self) -> Result<(), FitError> {
        let mut counter: i64 = 0;

        self.background.update_indices(&mut counter)?;

        let any_shared_width = self.peaks.iter().any(|p| !p.width_override);
        self.default_peak.width.to_fit = any_shared_width;
        self.default_peak.width.update_index(&mut counter)?;

        macro_rules! assign_shared_skew {
            ($field:ident) => {
                let any_shared = self.peaks.iter().any(|p| !p.$field.overridden);
                self.default_peak.$field.enabled = any_shared
                    && self.peaks.iter().any(|p| p.$field.enabled && !p.$field.overridden);
                // Only allocate fit-vector slots when the default is
                // actually shared and enabled by at least one peak;
                // otherwise leave it untouched so it costs no index.
                self.default_peak.$field.amplitude.to_fit = self.default_peak.$field.enabled;
                self.default_peak.$field.slope.to_fit = self.default_peak.$field.enabled;
                self.default_peak.$field.update_indices(&mut counter)?;
            };
        }
        assign_shared_skew!(short_tail);
        assign_shared_skew!(right_tail);
        assign_shared_skew!(long_tail);
        assign_shared_skew!(step);

        for peak in self.peaks.iter_mut() {
            peak.update_indices(&mut counter)?;
        }

        self.variable_count = counter as usize;
        Ok(())
    }

    pub fn variable_count(&self) -> usize {
        self.variable_count
    }
}

impl Fittable for Region {
    fn variables(&self) -> DVector<f64> {
        let mut v = DVector::from_element(self.variable_count, 0.0);
        self.background.put(&mut v);
        self.default_peak.put(&mut v);
        for peak in &self.peaks {
            peak.put(&mut v);
        }
        v
    }

    fn variable_count(&self) -> usize {
        self.variable_count
    }

    fn chi_sq(&self, vec: &DVector<f64>) -> f64 {
        let mut total = 0.0;
        for i in 0..self.channel.len() {
            let chan = self.channel[i];
            let mut model = self.background.eval_at(chan, vec);
            for peak in &self.peaks {
                model += peak.eval_at(self.width_for(peak), chan, vec);
            }
            let resid = (self.count[i] - model) / self.weight[i];
            total += resid * resid;
        }
        total
    }

    fn chi_sq_gradient(&self, vec: &DVector<f64>, grad: &mut DVector<f64>) -> f64 {
        grad.fill(0.0);
        let mut total = 0.0;
        let mut scratch = DVector::from_element(self.variable_count, 0.0);

        for i in 0..self.channel.len() {
            let chan = self.channel[i];
            scratch.fill(0.0);

            let mut model = self.background.eval_grad_at(chan, vec, &mut scratch);
            for peak in &self.peaks {
                model += peak.eval_grad_at(self.width_for(peak), chan, vec, &mut scratch);
            }

            let diff = self.count[i] - model;
            let w2 = self.weight[i] * self.weight[i];
            total += (diff / self.weight[i]).powi(2);

            let factor = -2.0 * diff / w2;
            for j in 0..self.variable_count {
                grad[j] += scratch[j] * factor;
            }
        }
        total
    }

    fn save_fit(&mut self, result: &crate::optimize::FitResult) {
        let vec = DVector::from_vec(result.variables.clone());
        self.background.get(&vec);
        self.default_peak.get(&vec);
        for peak in self.peaks.iter_mut() {
            peak.get(&vec);
        }

        let dof = self.degrees_of_freedom().max(1.0);
        let chi_sq_norm = (result.value / dof).max(1.0);
        self.chi_sq_norm = chi_sq_norm;

        let diag = result.inv_hessian.diagonal();
        self.background.get_uncerts(&diag, chi_sq_norm);
        self.default_peak.get_uncerts(&diag, chi_sq_norm);
        for peak in self.peaks.iter_mut() {
            peak.get_uncerts(&diag, chi_sq_norm);
        }
    }

    fn sane(&self) -> bool {
        self.peaks.iter().all(|p| p.sane(1e-3, 1e-3))
    }

    fn perturb(&mut self, rng: &mut dyn rand::RngCore) -> bool {
        if self.peaks.is_empty() && !self.default_peak.amplitude.to_fit {
            return false;
        }

        for peak in self.peaks.iter_mut().chain(std::iter::once(&mut self.default_peak)) {
            if peak.position.to_fit {
                let delta = rng.gen_range(-std::f64::consts::FRAC_PI_2..std::f64::consts::FRAC_PI_2);
                peak.position.set_x(delta);
            }
            if peak.amplitude.to_fit {
                let shift = rng.gen_range(-0.1..0.1);
                let x = peak.amplitude.x();
                peak.amplitude.set_x(x + shift);
            }
        }
        true
    }

    fn degrees_of_freedom(&self) -> f64 {
        (self.channel.len() as f64) - (self.variable_count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypermet::Peak;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn synthetic_gaussian_window(n: usize, amp: f64, pos: f64, sigma: f64, base: f64) -> (Vec<f64>, Vec<f64>) {
        let channel: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let count = channel
            .iter()
            .map(|&c| {
                let s = (c - pos) / sigma;
                base + amp * (-s * s).exp()
            })
            .collect();
        (channel, count)
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let err = Region::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![1.0, 2.0, 3.0],
            WeightScheme::True,
            PolyBackground::new(1.0),
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, FitError::LengthMismatch { .. }));
    }

    #[test]
    fn rejects_peak_outside_window() {
        let peak = Peak::new(100.0, 10.0, 2.0);
        let err = Region::new(
            (0..20).map(|i| i as f64).collect(),
            vec![1.0; 20],
            WeightScheme::True,
            PolyBackground::new(0.0),
            vec![peak],
        )
        .unwrap_err();
        assert!(matches!(err, FitError::PeakOutsideWindow { .. }));
    }

    #[test]
    fn update_indices_covers_zero_to_variable_count_with_no_gaps() {
        let (channel, count) = synthetic_gaussian_window(100, 500.0, 50.0, 3.0, 10.0);
        let mut peak = Peak::new(50.0, 500.0, 3.0);
        peak.width_override = true;
        let mut region = Region::new(
            channel,
            count,
            WeightScheme::True,
            PolyBackground::new(0.0),
            vec![peak],
        )
        .unwrap();
        region.update_indices().unwrap();

        let mut indices = Vec::new();
        let v = region.variables();
        assert_eq!(v.len(), region.variable_count());
        indices.push(region.background.base.index());
        if let Some(p) = region.peaks().next() {
            indices.push(p.position.index());
            indices.push(p.amplitude.index());
            indices.push(p.width.index());
        }
        let mut present: Vec<usize> = indices.into_iter().flatten().collect();
        present.sort();
        present.dedup();
        assert!(present.iter().all(|&i| i < region.variable_count()));
    }

    #[test]
    fn chi_sq_is_nonnegative_and_zero_at_truth() {
        let (channel, count) = synthetic_gaussian_window(100, 1000.0, 50.0, 3.0, 20.0);
        let mut peak = Peak::new(50.0, 1000.0, 3.0);
        peak.width_override = true;
        peak.position.to_fit = false;
        peak.amplitude.to_fit = false;
        peak.width.to_fit = false;

        let mut bg = PolyBackground::new(0.0);
        bg.base.to_fit = false;
        bg.base.set_value(20.0);

        let mut region = Region::new(
            channel.clone(),
            count.clone(),
            WeightScheme::True,
            bg,
            vec![peak],
        )
        .unwrap();
        region.update_indices().unwrap();
        let v = region.variables();
        let chi_sq = region.chi_sq(&v);
        assert!(chi_sq >= 0.0);
        assert_abs_diff_eq!(chi_sq, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn shared_default_width_is_written_and_read_through_the_fit_vector() {
        // width_override stays false: this peak's width lives only in
        // `default_peak.width`, the primary sharing mode per spec.md §3.
        let (channel, count) = synthetic_gaussian_window(100, 1000.0, 50.0, 3.0, 20.0);
        let mut peak = Peak::new(50.0, 1000.0, 3.0);
        peak.position.to_fit = false;
        peak.amplitude.to_fit = false;
        assert!(!peak.width_override);

        let mut bg = PolyBackground::new(0.0);
        bg.base.to_fit = false;
        bg.base.set_value(20.0);

        let mut region = Region::new(channel, count, WeightScheme::True, bg, vec![peak]).unwrap();
        region.update_indices().unwrap();

        let width_index = region.default_peak.width.index();
        assert!(width_index.is_some(), "shared width must be assigned an index");

        let mut v = region.variables();
        assert_abs_diff_eq!(v[width_index.unwrap()], region.default_peak.width.x(), epsilon = 1e-12);

        // Perturb the shared width's slot and confirm chi_sq reacts to it:
        // the wrong width should no longer sit at the minimum.
        v[width_index.unwrap()] += 0.5;
        let chi_sq_off = region.chi_sq(&v);
        assert!(chi_sq_off > 1e-3, "chi_sq should move away from zero when the shared width is wrong");

        // Restore the true width and fit via BFGS; the shared width should
        // converge back near its true value and be readable afterwards.
        let optimizer = crate::optimize::BFGSOptimizer::new(crate::optimize::OptimizerConfig {
            max_iterations: 100,
            ..crate::optimize::OptimizerConfig::default()
        });
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let result = optimizer.minimize(&mut region, &mut rng, &cancel);
        assert!(result.converged, "fit did not converge: {:?}", result.error_message);

        region.save_fit(&result);
        assert_abs_diff_eq!(region.default_peak.width.val(), 3.0, epsilon = 0.2);
    }

    #[test]
    fn gradient_matches_central_difference() {
        let (channel, count) = synthetic_gaussian_window(60, 800.0, 30.0, 2.5, 5.0);
        let mut peak = Peak::new(30.0, 750.0, 2.3);
        peak.width_override = true;
        let mut region = Region::new(channel, count, WeightScheme::True, PolyBackground::new(0.0), vec![peak])
            .unwrap();
        region.update_indices().unwrap();
        let v = region.variables();
        let n = v.len();

        let mut grad = DVector::from_element(n, 0.0);
        region.chi_sq_gradient(&v, &mut grad);

        let h = 1e-5;
        for i in 0..n {
            let mut plus = v.clone();
            plus[i] += h;
            let mut minus = v.clone();
            minus[i] -= h;
            let numeric = (region.chi_sq(&plus) - region.chi_sq(&minus)) / (2.0 * h);
            let scale = 1.0_f64.max(grad[i].abs());
            assert!(
                (grad[i] - numeric).abs() / scale < 1e-2,
                "gradient mismatch at {i}: analytic={}, numeric={numeric}",
                grad[i]
            );
        }
    }

    #[test]
    fn disabled_components_keep_their_parameters_untouched_by_put_get() {
        let (channel, count) = synthetic_gaussian_window(60, 400.0, 30.0, 2.0, 5.0);
        let mut peak = Peak::new(30.0, 400.0, 2.0);
        peak.short_tail.enabled = false;
        let mut region = Region::new(channel, count, WeightScheme::True, PolyBackground::new(0.0), vec![peak])
            .unwrap();
        region.update_indices().unwrap();
        assert!(!region.peaks().next().unwrap().short_tail.amplitude.valid_index());
    }

    #[test]
    fn peak_position_is_sine_bounded_to_the_window() {
        let (channel, count) = synthetic_gaussian_window(100, 500.0, 40.0, 3.0, 10.0);
        let peak = Peak::new(40.0, 500.0, 3.0);
        let region = Region::new(channel, count, WeightScheme::True, PolyBackground::new(0.0), vec![peak]).unwrap();
        let bound = region.peaks().next().unwrap();
        assert!(matches!(
            bound.position.transform(),
            crate::parameter::Transform::SineBounded { .. }
        ));
    }

    #[test]
    fn sum4_net_area_agrees_with_hypermet_area_on_a_clean_gaussian() {
        let amp = 2000.0;
        let pos = 50.0;
        let sigma = 3.0;
        let base = 20.0;
        let (channel, count) = synthetic_gaussian_window(100, amp, pos, sigma, base);

        let mut peak = Peak::new(pos, amp, sigma);
        peak.width_override = true;
        let mut region = Region::new(
            channel.clone(),
            count.clone(),
            WeightScheme::True,
            PolyBackground::new(0.0),
            vec![peak],
        )
        .unwrap();

        let half_window = (10.0 * sigma).round() as usize;
        let lo = (pos as usize).saturating_sub(half_window);
        let hi = ((pos as usize) + half_window).min(channel.len() - 1);
        let edge_width = 10;
        let left = Sum4Edge::new(channel[..edge_width].to_vec(), count[..edge_width].to_vec());
        let right = Sum4Edge::new(
            channel[channel.len() - edge_width..].to_vec(),
            count[channel.len() - edge_width..].to_vec(),
        );
        region.set_sum4(Sum4::new(
            left,
            channel[lo..=hi].to_vec(),
            count[lo..=hi].to_vec(),
            right,
        ));

        let hypermet_area = region.peaks().next().unwrap().area(None);
        let sum4_area = region.sum4.as_ref().unwrap().net_area().value();

        let rel_diff = (hypermet_area - sum4_area).abs() / hypermet_area;
        assert!(
            rel_diff < 0.05,
            "hypermet area {hypermet_area} vs sum4 area {sum4_area}, rel diff {rel_diff}"
        );
    }

    #[test]
    fn region_round_trips_through_json() {
        let (channel, count) = synthetic_gaussian_window(40, 200.0, 20.0, 2.5, 3.0);
        let peak = Peak::new(20.0, 200.0, 2.5);
        let region = Region::new(channel, count, WeightScheme::PhillipsMarlow, PolyBackground::new(0.0), vec![peak])
            .unwrap();

        let json = serde_json::to_string(&region).unwrap();
        let restored: Region = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.peak_count(), region.peak_count());
        assert_abs_diff_eq!(restored.left_bin(), region.left_bin());
        assert_abs_diff_eq!(restored.right_bin(), region.right_bin());
    }
}
