//! Result and error types representing the outcome of optimizing a method.

use crate::settings::SetError;
use core::fmt;
use thiserror::Error;

/// Why a compilation must be restarted with an optimization turned off.
///
/// These are the only recoverable failures the escape analysis and scalar replacement passes
/// produce. The surrounding compiler reacts to them by compiling the method again with the named
/// optimization disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// A second (iterative) run of escape analysis failed; retry with a single run.
    NoIterativeEscapeAnalysis,
    /// Escape analysis as a whole must be disabled.
    NoEscapeAnalysis,
    /// Reducing allocation merges through Phis failed.
    NoReduceAllocationMerges,
}

impl RetryReason {
    /// The retry reason used when escape analysis bails out during its `invocation`-th run.
    pub fn for_invocation(invocation: u32) -> Self {
        if invocation > 0 {
            RetryReason::NoIterativeEscapeAnalysis
        } else {
            RetryReason::NoEscapeAnalysis
        }
    }

    /// The message reported to the compiler driver.
    pub fn message(self) -> &'static str {
        match self {
            RetryReason::NoIterativeEscapeAnalysis => "retry without iterative escape analysis",
            RetryReason::NoEscapeAnalysis => "retry without escape analysis",
            RetryReason::NoReduceAllocationMerges => "retry without allocation-merge reduction",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// An optimization error.
///
/// Structural inconsistencies in the IR are not represented here. Those are bugs and are caught
/// by debug assertions instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptoError {
    /// The compilation has to be restarted without some optimization.
    ///
    /// The graph may have been partially rewritten by the failing pass and must be discarded.
    #[error("{0}")]
    Retry(RetryReason),

    /// The graph grew past the configured live node ceiling.
    #[error("Live node limit exceeded")]
    NodeLimit,

    /// An invalid setting was supplied.
    #[error("Invalid setting: {0}")]
    BadSetting(#[from] SetError),
}

/// A convenient alias for a `Result` that uses `OptoError` as the error type.
pub type OptoResult<T> = Result<T, OptoError>;
