//! A gamma-ray spectrum peak-fitting engine: a polynomial background plus a
//! sum of Hypermet peaks, fitted to a weighted channel/count histogram by a
//! BFGS quasi-Newton optimizer with a derivative-aware Brent line search.

#![warn(clippy::all, rust_2018_idioms)]

pub mod calibration;
pub mod error;
pub mod hypermet;
pub mod optimize;
pub mod parameter;
pub mod region;
pub mod uncertain;

pub use calibration::{Calibration, PolyCalibration};
pub use error::FitError;
pub use hypermet::{Peak, PolyBackground, SkewComponent};
pub use optimize::{BFGSOptimizer, FitResult, Fittable, GradientSelection, OptimizerConfig};
pub use parameter::{Parameter, Transform};
pub use region::{Region, Sum4, Sum4Edge, WeightScheme};
pub use uncertain::UncertainDouble;

/// Test-only logging setup. Installs `env_logger` the first time it's
/// called from a test, but only when `RUST_LOG` is actually set, so a
/// plain `cargo test` run stays quiet.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    if std::env::var_os("RUST_LOG").is_some() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}
