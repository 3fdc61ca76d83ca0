//! Guard configuration: range-checked construction plus file and
//! environment layers.
//!
//! Configuration is resolved in order (later wins):
//!
//! 1. Compiled defaults
//! 2. Config file (`.yaml`/`.yml`, `.toml`, or `.json`)
//! 3. Environment variables (`LLM_GUARD_*`)
//! 4. Builder setter overrides
//!
//! [`GuardConfigBuilder::build`] is the only way to obtain a validated
//! config; an invalid combination never leaves this module.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::detectors::KNOWN_DETECTORS;

// ── ConfigError ────────────────────────────────────────────────────────

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config file at {path}: {source}")]
    FileRead {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a configuration file.
    #[error("failed to parse {format} config: {source}")]
    ParseError {
        /// Format that failed to parse (YAML, TOML, JSON).
        format: String,
        /// Underlying parse error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Unrecognised configuration file extension.
    #[error("unsupported config file format: {message}")]
    UnsupportedFormat {
        /// Description of the problem.
        message: String,
    },

    /// A range or length invariant was violated.
    #[error("config validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// An `enabled_detectors` entry does not name a known detector.
    #[error("unknown detector id '{id}' in enabled_detectors")]
    UnknownDetector {
        /// The unresolvable ID.
        id: String,
    },

    /// An environment variable override could not be parsed.
    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse {
        /// Environment variable key.
        key: String,
        /// Error message.
        message: String,
    },
}

// ── CachingConfig ──────────────────────────────────────────────────────

/// Result/pattern cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct CachingConfig {
    /// Master switch for all caching (default `true`).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cache compiled patterns (default `true`).
    #[serde(default = "default_true")]
    pub pattern_cache: bool,
    /// Cache detector results by input hash (default `true`).
    #[serde(default = "default_true")]
    pub result_cache: bool,
    /// Result entry lifetime in seconds (default 300).
    #[serde(default = "default_result_ttl")]
    #[validate(range(min = 1))]
    pub result_ttl_seconds: u64,
    /// Hard bound on result entries (default 10 000).
    #[serde(default = "default_max_entries")]
    #[validate(range(min = 1))]
    pub max_cache_entries: usize,
    /// Period of the expired-entry sweep task in seconds (default 60).
    #[serde(default = "default_cleanup_interval")]
    #[validate(range(min = 1))]
    pub cleanup_interval_seconds: u64,
}

fn default_true() -> bool {
    true
}
fn default_result_ttl() -> u64 {
    300
}
fn default_max_entries() -> usize {
    10_000
}
fn default_cleanup_interval() -> u64 {
    60
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern_cache: true,
            result_cache: true,
            result_ttl_seconds: default_result_ttl(),
            max_cache_entries: default_max_entries(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

// ── GuardConfig ────────────────────────────────────────────────────────

/// Validated, immutable guard configuration.
///
/// Construct via [`GuardConfig::builder`]; share by reference or clone
/// freely afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case", default)]
pub struct GuardConfig {
    /// Run the prompt-injection detector on inputs (default `true`).
    pub prompt_injection_detection: bool,
    /// Run the jailbreak detector on inputs (default `true`).
    pub jailbreak_detection: bool,
    /// Run the data-leakage detector on outputs (default `true`).
    pub data_leakage_prevention: bool,
    /// Reserved for a future content-moderation detector (default `true`).
    pub content_moderation: bool,
    /// Threshold promoting a detection into the final result (default 0.7).
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f32,
    /// Maximum input length in Unicode scalars (default 10 000).
    #[validate(range(min = 1))]
    pub max_input_length: usize,
    /// Maximum output length in Unicode scalars (default 10 000).
    #[validate(range(min = 1))]
    pub max_output_length: usize,
    /// Explicit detector selection and order; empty means "derive from
    /// the per-detector flags above".
    pub enabled_detectors: Vec<String>,
    /// Caching settings; `None` disables caching entirely.
    pub caching: Option<CachingConfig>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            prompt_injection_detection: true,
            jailbreak_detection: true,
            data_leakage_prevention: true,
            content_moderation: true,
            confidence_threshold: 0.7,
            max_input_length: 10_000,
            max_output_length: 10_000,
            enabled_detectors: Vec::new(),
            caching: None,
        }
    }
}

impl GuardConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::new()
    }

    /// Detector IDs to run on the input side, in execution order.
    ///
    /// The jailbreak detector runs first: its persona and encoding layers
    /// produce the more specific category when both detectors would flag
    /// the same text.
    #[must_use]
    pub fn input_detector_ids(&self) -> Vec<&str> {
        if self.enabled_detectors.is_empty() {
            let mut ids = Vec::new();
            if self.jailbreak_detection {
                ids.push("jailbreak");
            }
            if self.prompt_injection_detection {
                ids.push("prompt_injection");
            }
            ids
        } else {
            self.enabled_detectors
                .iter()
                .map(String::as_str)
                .filter(|id| matches!(*id, "prompt_injection" | "jailbreak"))
                .collect()
        }
    }

    /// Detector IDs to run on the output side, in execution order.
    #[must_use]
    pub fn output_detector_ids(&self) -> Vec<&str> {
        if self.enabled_detectors.is_empty() {
            if self.data_leakage_prevention {
                vec!["data_leakage"]
            } else {
                Vec::new()
            }
        } else {
            self.enabled_detectors
                .iter()
                .map(String::as_str)
                .filter(|id| *id == "data_leakage")
                .collect()
        }
    }

    /// Whether result caching is active.
    #[must_use]
    pub fn result_caching_active(&self) -> bool {
        self.caching
            .as_ref()
            .is_some_and(|c| c.enabled && c.result_cache)
    }

    fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(caching) = &self.caching {
            caching.validate()?;
        }
        for id in &self.enabled_detectors {
            if !KNOWN_DETECTORS.contains(&id.as_str()) {
                return Err(ConfigError::UnknownDetector { id: id.clone() });
            }
        }
        Ok(())
    }
}

// ── GuardConfigBuilder ─────────────────────────────────────────────────

/// Builder for [`GuardConfig`] with file and environment layers.
#[derive(Debug, Default)]
pub struct GuardConfigBuilder {
    base: GuardConfig,
    use_env: bool,
}

impl GuardConfigBuilder {
    /// Start from compiled defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: GuardConfig::default(),
            use_env: false,
        }
    }

    /// Load the base configuration from a YAML, TOML, or JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        self.base = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
                    format: "YAML".to_string(),
                    source: Box::new(e),
                })?
            }
            Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                format: "TOML".to_string(),
                source: Box::new(e),
            })?,
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                    format: "JSON".to_string(),
                    source: Box::new(e),
                })?
            }
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    message: "file extension must be .yaml, .yml, .toml, or .json".to_string(),
                });
            }
        };
        Ok(self)
    }

    /// Apply `LLM_GUARD_*` environment overrides at build time.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Enable or disable prompt-injection detection.
    #[must_use]
    pub fn prompt_injection_detection(mut self, enabled: bool) -> Self {
        self.base.prompt_injection_detection = enabled;
        self
    }

    /// Enable or disable jailbreak detection.
    #[must_use]
    pub fn jailbreak_detection(mut self, enabled: bool) -> Self {
        self.base.jailbreak_detection = enabled;
        self
    }

    /// Enable or disable data-leakage prevention.
    #[must_use]
    pub fn data_leakage_prevention(mut self, enabled: bool) -> Self {
        self.base.data_leakage_prevention = enabled;
        self
    }

    /// Set the detection confidence threshold.
    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.base.confidence_threshold = threshold;
        self
    }

    /// Set the maximum input length (Unicode scalars).
    #[must_use]
    pub fn max_input_length(mut self, length: usize) -> Self {
        self.base.max_input_length = length;
        self
    }

    /// Set the maximum output length (Unicode scalars).
    #[must_use]
    pub fn max_output_length(mut self, length: usize) -> Self {
        self.base.max_output_length = length;
        self
    }

    /// Explicitly select detectors and their order.
    #[must_use]
    pub fn enabled_detectors(mut self, ids: Vec<String>) -> Self {
        self.base.enabled_detectors = ids;
        self
    }

    /// Set the caching section.
    #[must_use]
    pub fn caching(mut self, caching: CachingConfig) -> Self {
        self.base.caching = Some(caching);
        self
    }

    /// Validate and produce the final configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a range invariant fails, an
    /// `enabled_detectors` entry is unknown, or an environment override
    /// cannot be parsed.
    pub fn build(mut self) -> Result<GuardConfig, ConfigError> {
        if self.use_env {
            dotenvy::dotenv().ok();
            self.apply_env()?;
        }
        self.base.validate_all()?;
        Ok(self.base)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
            value.parse().map_err(|_| ConfigError::EnvParse {
                key: key.to_string(),
                message: "must be 'true' or 'false'".to_string(),
            })
        }

        for (key, target) in [
            (
                "LLM_GUARD_PROMPT_INJECTION_DETECTION",
                &mut self.base.prompt_injection_detection,
            ),
            (
                "LLM_GUARD_JAILBREAK_DETECTION",
                &mut self.base.jailbreak_detection,
            ),
            (
                "LLM_GUARD_DATA_LEAKAGE_PREVENTION",
                &mut self.base.data_leakage_prevention,
            ),
            (
                "LLM_GUARD_CONTENT_MODERATION",
                &mut self.base.content_moderation,
            ),
        ] {
            if let Ok(value) = std::env::var(key) {
                *target = parse_bool(key, &value)?;
            }
        }

        if let Ok(value) = std::env::var("LLM_GUARD_CONFIDENCE_THRESHOLD") {
            self.base.confidence_threshold =
                value.parse().map_err(|_| ConfigError::EnvParse {
                    key: "LLM_GUARD_CONFIDENCE_THRESHOLD".to_string(),
                    message: "must be a number in [0.0, 1.0]".to_string(),
                })?;
        }

        for (key, target) in [
            ("LLM_GUARD_MAX_INPUT_LENGTH", &mut self.base.max_input_length),
            (
                "LLM_GUARD_MAX_OUTPUT_LENGTH",
                &mut self.base.max_output_length,
            ),
        ] {
            if let Ok(value) = std::env::var(key) {
                *target = value.parse().map_err(|_| ConfigError::EnvParse {
                    key: key.to_string(),
                    message: "must be a positive integer".to_string(),
                })?;
            }
        }

        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn default_config_validates() {
        let config = GuardConfig::builder().build().unwrap();
        assert!(config.prompt_injection_detection);
        assert!((config.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.max_input_length, 10_000);
        assert!(config.caching.is_none());
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let err = GuardConfig::builder()
            .confidence_threshold(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn zero_max_input_length_rejected() {
        let err = GuardConfig::builder().max_input_length(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unknown_detector_id_rejected() {
        let err = GuardConfig::builder()
            .enabled_detectors(vec!["prompt_injection".to_string(), "psychic".to_string()])
            .build()
            .unwrap_err();
        match err {
            ConfigError::UnknownDetector { id } => assert_eq!(id, "psychic"),
            other => panic!("expected UnknownDetector, got {other}"),
        }
    }

    #[test]
    fn detector_id_partitioning() {
        let config = GuardConfig::builder()
            .enabled_detectors(vec![
                "jailbreak".to_string(),
                "prompt_injection".to_string(),
                "data_leakage".to_string(),
            ])
            .build()
            .unwrap();
        // Explicit list overrides flags and keeps declared order.
        assert_eq!(config.input_detector_ids(), vec!["jailbreak", "prompt_injection"]);
        assert_eq!(config.output_detector_ids(), vec!["data_leakage"]);
    }

    #[test]
    fn flags_derive_detector_sets() {
        let config = GuardConfig::builder()
            .jailbreak_detection(false)
            .build()
            .unwrap();
        assert_eq!(config.input_detector_ids(), vec!["prompt_injection"]);
        assert_eq!(config.output_detector_ids(), vec!["data_leakage"]);
    }

    #[test]
    fn caching_defaults_and_validation() {
        let caching = CachingConfig::default();
        assert_eq!(caching.result_ttl_seconds, 300);
        assert_eq!(caching.max_cache_entries, 10_000);

        let err = GuardConfig::builder()
            .caching(CachingConfig {
                result_ttl_seconds: 0,
                ..CachingConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "confidence_threshold: 0.85\nmax_input_length: 2000\ncaching:\n  result_ttl_seconds: 60",
        )
        .unwrap();

        let config = GuardConfig::builder()
            .with_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert!((config.confidence_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.max_input_length, 2000);
        assert_eq!(config.caching.unwrap().result_ttl_seconds, 60);
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_output_length = 512\njailbreak_detection = false").unwrap();

        let config = GuardConfig::builder()
            .with_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.max_output_length, 512);
        assert!(!config.jailbreak_detection);
    }

    #[test]
    fn unsupported_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = GuardConfig::builder().with_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat { .. }));
    }
}
