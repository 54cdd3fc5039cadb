use std::error::Error;
use std::fmt::Display;

/// Failures that can occur while constructing the fit inputs.
///
/// Everything that can go wrong *during* a fit (non-convergence, a blown-up
/// Hessian, a cancelled run, ...) is reported through [`crate::optimize::FitResult`]
/// instead of this type -- those are expected outcomes of an optimization, not
/// constructor failures.
#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    /// The data window had zero bins.
    EmptyWindow,
    /// The channel/count/weight vectors did not all have the same length.
    LengthMismatch {
        channel: usize,
        count: usize,
        weight: usize,
    },
    /// The data window was too small to leave any degrees of freedom.
    TooFewBins { have: usize, need: usize },
    /// A peak's initial position did not lie inside the data window.
    PeakOutsideWindow { position: f64, min: f64, max: f64 },
    /// `update_index` was asked to hand out a negative slot.
    NegativeIndex(i64),
}

impl Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitError::EmptyWindow => write!(f, "data window is empty"),
            FitError::LengthMismatch {
                channel,
                count,
                weight,
            } => write!(
                f,
                "channel/count/weight length mismatch: {channel} / {count} / {weight}"
            ),
            FitError::TooFewBins { have, need } => write!(
                f,
                "data window has {have} bins, need at least {need} to leave positive degrees of freedom"
            ),
            FitError::PeakOutsideWindow { position, min, max } => write!(
                f,
                "peak position {position} lies outside the data window ({min}, {max})"
            ),
            FitError::NegativeIndex(idx) => {
                write!(f, "cannot assign negative variable index {idx}")
            }
        }
    }
}

impl Error for FitError {}
