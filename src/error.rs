//! Public error kinds surfaced by the guard entry points.
//!
//! Everything except configuration failures is returned as a value with
//! the full [`PipelineResult`] attached for diagnostics; detector
//! failures never unwind through the public API.

use thiserror::Error;

use crate::config::ConfigError;
use crate::detectors::patterns::PatternError;
use crate::pipeline::PipelineResult;

/// Errors returned by [`LlmGuard`](crate::LlmGuard) entry points.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Configuration construction failed; raised eagerly so an invalid
    /// config can never be observed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// A detector catalogue failed to compile at guard construction.
    #[error("pattern compilation failed: {0}")]
    PatternCompilation(#[from] PatternError),

    /// The input failed the pre-pipeline size check.
    #[error("input too long: {actual} > {max} characters")]
    InputTooLong {
        /// Configured maximum (Unicode scalars).
        max: usize,
        /// Offending length (Unicode scalars).
        actual: usize,
    },

    /// The output failed the pre-pipeline size check.
    #[error("output too long: {actual} > {max} characters")]
    OutputTooLong {
        /// Configured maximum (Unicode scalars).
        max: usize,
        /// Offending length (Unicode scalars).
        actual: usize,
    },

    /// One or more detectors flagged the text at or above threshold.
    #[error("threat detected: {reason} (confidence {confidence:.2})")]
    Detected {
        /// Category of the highest-confidence detection.
        reason: String,
        /// Confidence of that detection.
        confidence: f32,
        /// Full pipeline result for diagnostics.
        result: Box<PipelineResult>,
    },

    /// A detector failed and `continue_on_error` was off, or the pipeline
    /// itself faulted.
    #[error("pipeline failed: {reason}")]
    PipelineError {
        /// What went wrong.
        reason: String,
        /// Full pipeline result for diagnostics.
        result: Box<PipelineResult>,
    },

    /// The advisory pipeline timeout was exceeded.
    #[error("pipeline timed out after {elapsed_ms} ms")]
    PipelineTimeout {
        /// Wall time at the point the budget expired.
        elapsed_ms: u64,
        /// Partial pipeline result collected before expiry.
        result: Box<PipelineResult>,
    },
}
