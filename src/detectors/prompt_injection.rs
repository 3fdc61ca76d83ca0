//! Layer-1 prompt-injection detector.
//!
//! A static catalogue of 34 patterns across five categories, compiled once
//! into a [`PatternSet`] at construction. Scoring follows
//! [`match_confidence`]: strongest pattern + per-match boost + short-input
//! factor.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::patterns::{
    CustomPattern, PatternError, PatternHit, PatternSet, PatternSeverity, ThreatPattern,
    match_confidence,
};
use super::{DetectionDetails, Detector, Verdict};

// ── InjectionCategory ──────────────────────────────────────────────────

/// High-level classification of an injection pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum InjectionCategory {
    /// Attempts to cancel or replace prior instructions.
    InstructionOverride,
    /// Attempts to exfiltrate the system prompt or hidden rules.
    SystemExtraction,
    /// Abuse of delimiters, special tokens, or markup to forge context.
    DelimiterInjection,
    /// Attempts to flip the model into a privileged or unrestricted mode.
    ModeSwitching,
    /// Attempts to redefine the model's identity or strip its limits.
    RoleManipulation,
}

impl fmt::Display for InjectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstructionOverride => write!(f, "instruction_override"),
            Self::SystemExtraction => write!(f, "system_extraction"),
            Self::DelimiterInjection => write!(f, "delimiter_injection"),
            Self::ModeSwitching => write!(f, "mode_switching"),
            Self::RoleManipulation => write!(f, "role_manipulation"),
        }
    }
}

// ── Built-in catalogue ─────────────────────────────────────────────────

macro_rules! pat {
    ($name:expr, $cat:expr, $re:expr, $sev:expr, $conf:expr) => {
        ThreatPattern {
            name: Cow::Borrowed($name),
            regex_str: Cow::Borrowed($re),
            severity: $sev,
            category: $cat,
            confidence: $conf,
        }
    };
}

/// The full built-in injection catalogue (34 patterns).
#[allow(clippy::too_many_lines)]
#[must_use]
pub fn builtin_patterns() -> Vec<ThreatPattern<InjectionCategory>> {
    use InjectionCategory::{
        DelimiterInjection, InstructionOverride, ModeSwitching, RoleManipulation,
        SystemExtraction,
    };
    use PatternSeverity::{High, Medium};

    vec![
        // ── Instruction override ───────────────────────────────────
        pat!(
            "ignore_previous_instructions",
            InstructionOverride,
            r"(?i)ignore\s+(?:all\s+)?(?:previous|prior|earlier|above)\s+(?:instructions|prompts|commands|rules)",
            High,
            0.95
        ),
        pat!(
            "ignore_rules_general",
            InstructionOverride,
            r"(?i)ignore\s+(?:all\s+)?(?:instructions|rules|filters|safety)",
            High,
            0.82
        ),
        pat!(
            "disregard_previous",
            InstructionOverride,
            r"(?i)(?:disregard|forget|bypass|override)\s+(?:all\s+)?(?:previous|prior|earlier|above)",
            High,
            0.90
        ),
        pat!(
            "bypass_safety_checks",
            InstructionOverride,
            r"(?i)bypass\s+(?:all\s+)?(?:safety|security|rules|checks|filters)",
            High,
            0.90
        ),
        pat!(
            "forget_everything_above",
            InstructionOverride,
            r"(?i)(?:forget|ignore)\s+(?:everything|all)\s+(?:above|before|prior)",
            High,
            0.92
        ),
        pat!(
            "do_not_follow_rules",
            InstructionOverride,
            r"(?i)do\s+not\s+follow\s+(?:your|the|any)\s+(?:instructions|rules|guidelines)",
            High,
            0.85
        ),
        pat!(
            "new_instructions_marker",
            InstructionOverride,
            r"(?i)new\s+instructions?\s*:",
            Medium,
            0.80
        ),
        // ── System extraction ──────────────────────────────────────
        pat!(
            "reveal_system_prompt",
            SystemExtraction,
            r"(?i)(?:show|print|display|reveal|output|tell)\s+(?:me\s+)?(?:your\s+)?(?:system\s+)?(?:prompt|instructions|rules)",
            High,
            0.92
        ),
        pat!(
            "initial_instructions_query",
            SystemExtraction,
            r"(?i)(?:what|tell\s+me)\s+(?:are|were)\s+(?:your\s+)?(?:initial|original|base)\s+(?:instructions|prompt|rules)",
            High,
            0.90
        ),
        pat!(
            "repeat_everything_above",
            SystemExtraction,
            r"(?i)(?:repeat|show|print)\s+(?:everything|all|the\s+text)\s+(?:above|before)",
            High,
            0.85
        ),
        pat!(
            "what_were_you_told",
            SystemExtraction,
            r"(?i)(?:what|tell\s+me).{0,30}(?:were\s+you\s+told|did\s+you\s+receive|are\s+your\s+instructions)",
            High,
            0.82
        ),
        pat!(
            "tell_me_your_rules",
            SystemExtraction,
            r"(?i)tell\s+me\s+your\s+(?:rules|guidelines|constraints)",
            High,
            0.85
        ),
        pat!(
            "reproduce_text_above",
            SystemExtraction,
            r"(?i)reproduce\s+the\s+(?:text|prompt|conversation)\s+above",
            High,
            0.88
        ),
        pat!(
            "start_response_with_quote",
            SystemExtraction,
            r#"(?i)start\s+your\s+(?:response|reply|answer)\s+with\s+["']"#,
            Medium,
            0.72
        ),
        // ── Delimiter injection ────────────────────────────────────
        pat!(
            "fake_boundary_marker",
            DelimiterInjection,
            r"(?i)(?:-{3,}|={3,})\s*(?:end|stop|finish|start|begin|override|new)\s*(?:system|instructions?|prompt|user|admin)",
            High,
            0.88
        ),
        pat!(
            "special_model_tokens",
            DelimiterInjection,
            r"<\|(?:endoftext|startoftext)\|>",
            High,
            0.93
        ),
        pat!(
            "chatml_markers",
            DelimiterInjection,
            r"(?i)<\|im_(?:start|end)\|>",
            High,
            0.90
        ),
        pat!(
            "code_block_role_marker",
            DelimiterInjection,
            r"(?i)```[a-z]*\s*\n?\s*(?:system|user|assistant|admin)\s*:",
            Medium,
            0.80
        ),
        pat!(
            "html_comment_instructions",
            DelimiterInjection,
            r"(?i)<!--[^>]*(?:end|new|stop)[^>]*(?:instructions|system)[^>]*-->",
            Medium,
            0.82
        ),
        pat!(
            "inst_tag",
            DelimiterInjection,
            r"(?i)\[/?INST\]",
            High,
            0.85
        ),
        pat!(
            "end_of_sequence_token",
            DelimiterInjection,
            r"</s>",
            High,
            0.85
        ),
        // ── Mode switching ─────────────────────────────────────────
        pat!(
            "enter_privileged_mode",
            ModeSwitching,
            r"(?i)(?:enter|enable|activate|switch\s+to)\s+(?:in\s+)?(?:debug|developer|admin|unrestricted|bypass)\s+mode",
            High,
            0.90
        ),
        pat!(
            "you_are_now_in_mode",
            ModeSwitching,
            r"(?i)you\s+are\s+now\s+in\s+(?:debug|developer|admin|unrestricted|bypass)\s+mode",
            High,
            0.92
        ),
        pat!(
            "disable_filters",
            ModeSwitching,
            r"(?i)(?:disable|turn\s+off|deactivate)\s+(?:all\s+)?(?:filters|safety|restrictions)",
            High,
            0.88
        ),
        pat!(
            "system_override_code",
            ModeSwitching,
            r"(?i)system\s+override\s+(?:code|password)",
            High,
            0.92
        ),
        pat!(
            "urgent_system_alert",
            ModeSwitching,
            r"(?i)(?:critical|urgent|emergency)\s+(?:system|admin)\s+(?:update|alert|message)",
            Medium,
            0.80
        ),
        pat!(
            "unlock_hidden_mode",
            ModeSwitching,
            r"(?i)unlock\s+(?:hidden|secret)\s+mode",
            High,
            0.85
        ),
        pat!(
            "maintenance_mode_claim",
            ModeSwitching,
            r"(?i)(?:maintenance|diagnostic)\s+mode\s+(?:enabled|activated|required)",
            Medium,
            0.78
        ),
        // ── Role manipulation ──────────────────────────────────────
        pat!(
            "roleplay_unrestricted",
            RoleManipulation,
            r"(?i)(?:you\s+are|act\s+as|pretend|roleplay\s+as)\s+(?:now\s+)?(?:an?\s+)?(?:unrestricted|uncensored|jailbroken)",
            High,
            0.88
        ),
        pat!(
            "dan_persona",
            RoleManipulation,
            r"(?i)(?:you\s+are|become)\s+(?:now\s+)?(?:dan\b|do\s+anything\s+now)",
            High,
            0.95
        ),
        pat!(
            "act_without_limits",
            RoleManipulation,
            r"(?i)(?:act|pretend|roleplay)\s+as\s+if\s+you\s+(?:have\s+no|lack|are\s+without)\s+(?:limitations|restrictions|ethics|guidelines|rules)",
            High,
            0.90
        ),
        pat!(
            "no_restrictions_claim",
            RoleManipulation,
            r"(?i)(?:(?:with|having)\s+(?:no|zero)|without(?:\s+any)?)\s+(?:restrictions|limitations|filters|rules)",
            High,
            0.85
        ),
        pat!(
            "evil_persona",
            RoleManipulation,
            r"(?i)pretend\s+(?:to\s+be|you\s+are)\s+(?:an?\s+)?(?:evil|malicious|rogue)",
            High,
            0.82
        ),
        pat!(
            "override_your_programming",
            RoleManipulation,
            r"(?i)override\s+your\s+programming",
            High,
            0.90
        ),
    ]
}

// ── PromptInjectionConfig ──────────────────────────────────────────────

/// Configuration for [`PromptInjectionDetector`].
///
/// Uses a builder pattern; all setters are `#[must_use]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PromptInjectionConfig {
    /// Whether the detector runs at all (default `true`).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Minimum aggregated confidence for a detection (default `0.7`).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Additional user-provided patterns.
    #[serde(default)]
    pub additional_patterns: Vec<CustomPattern<InjectionCategory>>,
    /// Built-in pattern names to disable.
    #[serde(default)]
    pub disabled_patterns: Vec<String>,
}

fn default_enabled() -> bool {
    true
}
fn default_confidence_threshold() -> f32 {
    0.7
}

impl Default for PromptInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
            additional_patterns: Vec::new(),
            disabled_patterns: Vec::new(),
        }
    }
}

impl PromptInjectionConfig {
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

    /// Add user-provided patterns.
    #[must_use]
    pub fn additional_patterns(
        mut self,
        patterns: Vec<CustomPattern<InjectionCategory>>,
    ) -> Self {
        self.additional_patterns = patterns;
        self
    }

    /// Disable built-in patterns by name.
    #[must_use]
    pub fn disabled_patterns(mut self, names: Vec<String>) -> Self {
        self.disabled_patterns = names;
        self
    }
}

// ── PromptInjectionDetector ────────────────────────────────────────────

/// Pattern-driven prompt-injection detector.
#[derive(Debug, Clone)]
pub struct PromptInjectionDetector {
    patterns: PatternSet<InjectionCategory>,
    enabled: bool,
    confidence_threshold: f32,
}

impl PromptInjectionDetector {
    /// Build a detector from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if any pattern fails to compile.
    pub fn new(config: PromptInjectionConfig) -> Result<Self, PatternError> {
        let patterns = PatternSet::compile(
            builtin_patterns(),
            config.additional_patterns,
            &config.disabled_patterns,
        )?;
        Ok(Self {
            patterns,
            enabled: config.enabled,
            confidence_threshold: config.confidence_threshold,
        })
    }

    /// Build a detector with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if a built-in pattern fails to compile.
    pub fn with_defaults() -> Result<Self, PatternError> {
        Self::new(PromptInjectionConfig::default())
    }

    /// The highest-confidence hit; ties resolve to the earlier catalogue
    /// entry.
    fn top_hit<'h>(hits: &'h [PatternHit<InjectionCategory>]) -> &'h PatternHit<InjectionCategory> {
        hits.iter()
            .reduce(|best, h| if h.confidence > best.confidence { h } else { best })
            .expect("top_hit called with at least one hit")
    }
}

impl Detector for PromptInjectionDetector {
    fn id(&self) -> &'static str {
        "prompt_injection"
    }

    fn description(&self) -> &'static str {
        "Pattern-based detection of instruction override, system extraction, \
         delimiter injection, mode switching, and role manipulation"
    }

    fn detect(&self, input: &str) -> Verdict {
        if !self.enabled {
            let mut metadata = serde_json::Map::new();
            metadata.insert("enabled".to_string(), serde_json::Value::Bool(false));
            return Verdict::safe_with(metadata);
        }

        let hits = self.patterns.scan(input);
        if hits.is_empty() {
            let mut metadata = serde_json::Map::new();
            metadata.insert(
                "patterns_checked".to_string(),
                serde_json::Value::from(self.patterns.len()),
            );
            return Verdict::safe_with(metadata);
        }

        let confidence = match_confidence(&hits, input.chars().count());
        let top = Self::top_hit(&hits);
        let category = top.category;
        let patterns_matched: Vec<String> = hits.iter().map(|h| h.name.to_string()).collect();

        if confidence < self.confidence_threshold {
            let mut metadata = serde_json::Map::new();
            metadata.insert("below_threshold".to_string(), serde_json::Value::Bool(true));
            metadata.insert(
                "confidence".to_string(),
                serde_json::Value::from(f64::from(confidence)),
            );
            metadata.insert(
                "category".to_string(),
                serde_json::Value::from(category.to_string()),
            );
            metadata.insert(
                "patterns_matched".to_string(),
                serde_json::Value::from(patterns_matched),
            );
            return Verdict::safe_with(metadata);
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "patterns_checked".to_string(),
            serde_json::Value::from(self.patterns.len()),
        );
        metadata.insert(
            "match_count".to_string(),
            serde_json::Value::from(hits.len()),
        );
        metadata.insert(
            "severity".to_string(),
            serde_json::Value::from(top.severity.to_string()),
        );

        Verdict::Detected(DetectionDetails {
            confidence,
            category: category.to_string(),
            patterns_matched,
            metadata,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
