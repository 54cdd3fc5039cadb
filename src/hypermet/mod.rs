//! The Hypermet peak shape: a Gaussian core plus up to four asymmetric
//! add-ons (short tail, right tail, long tail, step) that model detector
//! response beyond a pure Gaussian.

pub mod background;
pub mod peak;
pub mod skew;

pub use background::PolyBackground;
pub use peak::Peak;
pub use skew::{SkewComponent, SkewKind, Side};

/// Values shared by a peak's Gaussian core and all of its enabled skew
/// components, computed once per channel to avoid repeated parameter
/// lookups: the amplitude/width, their gradients `d(value)/d(x)`, the
/// normalized spread, and the parameter indices these contributions land
/// on.
#[derive(Debug, Clone, Copy)]
pub struct PrecalcVals {
    pub amplitude: f64,
    pub half_amplitude: f64,
    pub width: f64,
    pub spread: f64,
    pub amp_grad: f64,
    pub width_grad: f64,
    pub pos_grad: f64,
    pub i_amp: Option<usize>,
    pub i_width: Option<usize>,
    pub i_pos: Option<usize>,
}

/// The decomposed evaluation of a peak at one channel: the Gaussian core
/// plus each of the four optional skew contributions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Components {
    pub gaussian: f64,
    pub short_tail: f64,
    pub right_tail: f64,
    pub long_tail: f64,
    pub step: f64,
}

impl Components {
    /// Gaussian plus the two peak-side skew components.
    pub fn peak_skews(&self) -> f64 {
        self.gaussian + self.short_tail + self.right_tail
    }

    /// The two background-side components.
    pub fn step_tail(&self) -> f64 {
        self.long_tail + self.step
    }

    pub fn all(&self) -> f64 {
        self.peak_skews() + self.step_tail()
    }
}
