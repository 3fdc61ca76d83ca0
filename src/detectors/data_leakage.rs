//! Data-leakage detector: the PII scanner and redactor behind the
//! standard detector interface.
//!
//! Aggregates per-entity confidences into one score: mean, plus a count
//! boost, plus a bump when high-sensitivity kinds (SSN, card numbers) are
//! present, minus a small penalty on very long inputs where incidental
//! matches are likelier. Entity values never appear in the returned
//! metadata; only kind, confidence, and byte offsets survive.

use serde::{Deserialize, Serialize};

use crate::pii::redactor::{PiiRedactor, RedactionOptions, RedactionStrategy};
use crate::pii::scanner::PiiScanner;
use crate::pii::{PiiEntity, PiiKind};

use super::patterns::PatternError;
use super::{DetectionDetails, Detector, Verdict};

// ── DataLeakageConfig ──────────────────────────────────────────────────

/// Configuration for [`DataLeakageDetector`].
///
/// Uses a builder pattern; all setters are `#[must_use]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DataLeakageConfig {
    /// Whether the detector runs at all (default `true`).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Minimum aggregated confidence for a detection (default `0.7`).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Restrict scanning to these kinds; `None` scans everything.
    #[serde(default)]
    pub pii_types: Option<Vec<PiiKind>>,
    /// Whether to include a redacted copy of the input in the detection
    /// metadata (default `false`).
    #[serde(default)]
    pub redact: bool,
    /// Strategy used when `redact` is set.
    #[serde(skip, default)]
    pub redaction_strategy: RedactionStrategy,
}

fn default_enabled() -> bool {
    true
}
fn default_confidence_threshold() -> f32 {
    0.7
}

impl Default for DataLeakageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
            pii_types: None,
            redact: false,
            redaction_strategy: RedactionStrategy::default(),
        }
    }
}

impl DataLeakageConfig {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the detector.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the detection threshold.
    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Restrict scanning to the given kinds.
    #[must_use]
    pub fn pii_types(mut self, kinds: Vec<PiiKind>) -> Self {
        self.pii_types = Some(kinds);
        self
    }

    /// Include a redacted copy of the input in detection metadata.
    #[must_use]
    pub fn redact(mut self, enabled: bool) -> Self {
        self.redact = enabled;
        self
    }

    /// Set the redaction strategy used when `redact` is enabled.
    #[must_use]
    pub fn redaction_strategy(mut self, strategy: RedactionStrategy) -> Self {
        self.redaction_strategy = strategy;
        self
    }
}

// ── DataLeakageDetector ────────────────────────────────────────────────

/// Detector wrapper around [`PiiScanner`] and [`PiiRedactor`].
#[derive(Debug, Clone)]
pub struct DataLeakageDetector {
    scanner: PiiScanner,
    redactor: PiiRedactor,
    enabled: bool,
    confidence_threshold: f32,
    pii_types: Option<Vec<PiiKind>>,
    redact: bool,
}

impl DataLeakageDetector {
    /// Build a detector from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if a scanner regex fails to compile.
    pub fn new(config: DataLeakageConfig) -> Result<Self, PatternError> {
        Ok(Self {
            scanner: PiiScanner::new()?,
            redactor: PiiRedactor::new(RedactionOptions::with_strategy(
                config.redaction_strategy,
            )),
            enabled: config.enabled,
            confidence_threshold: config.confidence_threshold,
            pii_types: config.pii_types,
            redact: config.redact,
        })
    }

    /// Build a detector with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if a scanner regex fails to compile.
    pub fn with_defaults() -> Result<Self, PatternError> {
        Self::new(DataLeakageConfig::default())
    }

    fn scan(&self, input: &str) -> Vec<PiiEntity> {
        match &self.pii_types {
            None => self.scanner.scan(input),
            Some(kinds) => {
                let mut entities: Vec<PiiEntity> = kinds
                    .iter()
                    .flat_map(|k| self.scanner.scan_by_type(input, *k))
                    .collect();
                entities.sort_by_key(|e| e.start);
                entities
            }
        }
    }

    /// Mean entity confidence, boosted by count and sensitive kinds,
    /// penalised on very long inputs, clamped to \[0, 1\].
    #[allow(clippy::cast_precision_loss)]
    fn aggregate(entities: &[PiiEntity], input_chars: usize) -> f32 {
        let avg =
            entities.iter().map(|e| e.confidence).sum::<f32>() / entities.len() as f32;
        let count_boost = (0.02 * (entities.len().saturating_sub(1)) as f32).min(0.10);
        let type_boost = if entities
            .iter()
            .any(|e| matches!(e.kind, PiiKind::Ssn | PiiKind::CreditCard))
        {
            0.05
        } else {
            0.0
        };
        let length_penalty = if input_chars > 1000 { -0.05 } else { 0.0 };
        (avg + count_boost + type_boost + length_penalty).clamp(0.0, 1.0)
    }
}

impl Detector for DataLeakageDetector {
    fn id(&self) -> &'static str {
        "data_leakage"
    }

    fn description(&self) -> &'static str {
        "PII detection (email, phone, SSN, card numbers, IPs, URLs) with \
         optional redaction"
    }

    fn detect(&self, input: &str) -> Verdict {
        if !self.enabled {
            let mut metadata = serde_json::Map::new();
            metadata.insert("enabled".to_string(), serde_json::Value::Bool(false));
            return Verdict::safe_with(metadata);
        }

        let entities = self.scan(input);
        if entities.is_empty() {
            let mut metadata = serde_json::Map::new();
            metadata.insert("pii_count".to_string(), serde_json::Value::from(0));
            return Verdict::safe_with(metadata);
        }

        let confidence = Self::aggregate(&entities, input.chars().count());

        if confidence < self.confidence_threshold {
            let mut metadata = serde_json::Map::new();
            metadata.insert("below_threshold".to_string(), serde_json::Value::Bool(true));
            metadata.insert(
                "confidence".to_string(),
                serde_json::Value::from(f64::from(confidence)),
            );
            metadata.insert(
                "pii_count".to_string(),
                serde_json::Value::from(entities.len()),
            );
            return Verdict::safe_with(metadata);
        }

        let mut kinds: Vec<String> = Vec::new();
        for e in &entities {
            let kind = e.kind.to_string();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        // Offsets and kinds only; raw values must not leave the detector.
        let stripped: Vec<serde_json::Value> = entities
            .iter()
            .map(|e| {
                serde_json::json!({
                    "kind": e.kind.to_string(),
                    "confidence": e.confidence,
                    "start": e.start,
                    "end": e.end,
                })
            })
            .collect();

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "pii_count".to_string(),
            serde_json::Value::from(entities.len()),
        );
        metadata.insert("pii_types".to_string(), serde_json::Value::from(kinds.clone()));
        metadata.insert("entities".to_string(), serde_json::Value::from(stripped));
        if self.redact {
            metadata.insert(
                "redacted_text".to_string(),
                serde_json::Value::from(self.redactor.redact(input, &entities)),
            );
        }

        Verdict::Detected(DetectionDetails {
            confidence,
            category: "pii_leakage".to_string(),
            patterns_matched: kinds,
            metadata,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
