//! The detector layer: the [`Detector`] trait and the three shipped
//! engines (prompt injection, jailbreak, data leakage).
//!
//! A detector classifies one UTF-8 string as [`Verdict::Safe`] or
//! [`Verdict::Detected`]; it never fails and never blocks. The pipeline
//! wraps every invocation in a panic guard and converts the outcome into a
//! [`DetectorResult`] record with wall-time measurements.

pub mod data_leakage;
pub mod jailbreak;
pub mod patterns;
pub mod prompt_injection;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// IDs of the detectors shipped with this crate, in default input-side
/// execution order. Config validation resolves `enabled_detectors`
/// entries against this list.
pub const KNOWN_DETECTORS: &[&str] = &["prompt_injection", "jailbreak", "data_leakage"];

// ── DetectionDetails ───────────────────────────────────────────────────

/// Payload of a positive detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionDetails {
    /// Aggregated confidence in \[0.0, 1.0\].
    pub confidence: f32,
    /// Category of the strongest signal (e.g. `"instruction_override"`,
    /// `"role_playing"`, `"pii_leakage"`).
    pub category: String,
    /// Names of the catalogue patterns that matched.
    pub patterns_matched: Vec<String>,
    /// Detector-specific metadata. Never contains raw scanned values.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ── Verdict ────────────────────────────────────────────────────────────

/// What a detector concluded about one input.
///
/// This is the detector-facing result type; error capture happens one
/// layer up, in the pipeline's [`DetectorOutcome`].
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Nothing of note was found.
    Safe {
        /// Diagnostic metadata (e.g. `patterns_checked`, `below_threshold`).
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    /// A threat was found at the detector's working confidence.
    Detected(DetectionDetails),
}

impl Verdict {
    /// A safe verdict with no metadata.
    #[must_use]
    pub fn safe() -> Self {
        Self::Safe {
            metadata: serde_json::Map::new(),
        }
    }

    /// A safe verdict carrying diagnostic metadata.
    #[must_use]
    pub fn safe_with(metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self::Safe { metadata }
    }

    /// Returns `true` for [`Verdict::Detected`].
    #[must_use]
    pub fn is_detected(&self) -> bool {
        matches!(self, Self::Detected(_))
    }
}

// ── DetectorOutcome ────────────────────────────────────────────────────

/// Pipeline-level outcome of one detector invocation.
///
/// Extends [`Verdict`] with the error case produced when a detector
/// panics; the panic is caught and downgraded, never propagated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DetectorOutcome {
    /// The detector found nothing.
    Safe {
        /// Diagnostic metadata from the detector.
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    /// The detector found a threat.
    Detected {
        /// The detection payload.
        details: DetectionDetails,
    },
    /// The detector failed; the failure was contained.
    Error {
        /// Panic or failure message.
        message: String,
    },
}

impl DetectorOutcome {
    /// Short label for the outcome variant, for metrics and logs.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Safe { .. } => "safe",
            Self::Detected { .. } => "detected",
            Self::Error { .. } => "error",
        }
    }

    /// Returns `true` for [`DetectorOutcome::Detected`].
    #[must_use]
    pub fn is_detected(&self) -> bool {
        matches!(self, Self::Detected { .. })
    }

    /// Returns `true` for [`DetectorOutcome::Error`].
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The detection payload, when present.
    #[must_use]
    pub fn details(&self) -> Option<&DetectionDetails> {
        match self {
            Self::Detected { details } => Some(details),
            _ => None,
        }
    }
}

impl From<Verdict> for DetectorOutcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Safe { metadata } => Self::Safe { metadata },
            Verdict::Detected(details) => Self::Detected { details },
        }
    }
}

// ── DetectorResult ─────────────────────────────────────────────────────

/// Record of one detector invocation inside a pipeline run.
///
/// Wall time is measured on a monotonic clock and kept in both native
/// form (for telemetry) and integer milliseconds (for the result record),
/// so fast detectors do not round to zero twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorResult {
    /// ID of the detector that produced this record.
    pub detector_id: String,
    /// What the invocation concluded.
    pub outcome: DetectorOutcome,
    /// Native wall time of the invocation.
    pub duration: Duration,
    /// Wall time in integer milliseconds.
    pub duration_ms: u64,
}

// ── Detector trait ─────────────────────────────────────────────────────

/// A text classifier with a stable identity.
///
/// # Contract
///
/// - `detect` does CPU work and map lookups only; it never blocks on I/O.
/// - `detect` must not panic on any UTF-8 input; the pipeline still guards
///   against panics and records them as [`DetectorOutcome::Error`].
/// - Implementations are immutable after construction and safe to share
///   across threads.
pub trait Detector: Send + Sync {
    /// Stable identifier (e.g. `"prompt_injection"`). Used as the result
    /// cache key component and as the metrics label.
    fn id(&self) -> &'static str;

    /// One-line human-readable description.
    fn description(&self) -> &'static str;

    /// Classify `input`.
    fn detect(&self, input: &str) -> Verdict;
}

// ── Tests ──────────────────────────────────────────────────────────────
