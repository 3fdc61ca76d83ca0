//! Multi-layer jailbreak detector.
//!
//! Three independent signal sources feed one aggregation step:
//!
//! 1. **Patterns** - a catalogue across role-playing, hypothetical,
//!    prefix, emotional, and format categories ([`builtin_patterns`]).
//! 2. **Encoding analysis** - best-effort decoding of Base64 runs, `\xNN`
//!    escapes, and leetspeak, looking for bypass vocabulary in the
//!    decoded form.
//! 3. **Personas** - an Aho-Corasick scan for known jailbreak personas
//!    (DAN, AIM, Developer Mode, ...) with word-boundary and framing
//!    context checks.
//!
//! Aggregation takes the strongest signal and boosts when signals span
//! multiple distinct `(source, category)` keys.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use aho_corasick::AhoCorasick;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::patterns::{
    CustomPattern, PatternError, PatternFlags, PatternSet, PatternSeverity, ThreatPattern,
    compile_pattern,
};
use super::{DetectionDetails, Detector, Verdict};

// ── JailbreakCategory ──────────────────────────────────────────────────

/// Technique classification for jailbreak signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum JailbreakCategory {
    /// Persona adoption and role-play framing.
    RolePlaying,
    /// "Hypothetically" / fiction-as-cover scenarios.
    HypotheticalScenario,
    /// Fake system/admin prefixes and tags.
    PrefixInjection,
    /// Appeals to authority, research, or sympathy.
    EmotionalManipulation,
    /// Structured-output tricks that smuggle bypass steps.
    FormatManipulation,
    /// Payloads hidden behind an encoding layer.
    EncodingAttack,
}

impl fmt::Display for JailbreakCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RolePlaying => write!(f, "role_playing"),
            Self::HypotheticalScenario => write!(f, "hypothetical_scenario"),
            Self::PrefixInjection => write!(f, "prefix_injection"),
            Self::EmotionalManipulation => write!(f, "emotional_manipulation"),
            Self::FormatManipulation => write!(f, "format_manipulation"),
            Self::EncodingAttack => write!(f, "encoding_attack"),
        }
    }
}

// ── JailbreakSignal ────────────────────────────────────────────────────

/// Which layer produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Layer 1 catalogue pattern.
    Pattern,
    /// Layer 2 encoding analysis.
    Encoding,
    /// Layer 3 persona match.
    Persona,
}

/// One piece of evidence collected by any layer.
#[derive(Debug, Clone)]
pub struct JailbreakSignal {
    /// Layer that produced this signal.
    pub source: SignalSource,
    /// Technique category of the signal.
    pub category: JailbreakCategory,
    /// Pattern name, encoding label, or persona name.
    pub name: String,
    /// Confidence contributed by this signal.
    pub confidence: f32,
}

// ── Layer 1: built-in catalogue ────────────────────────────────────────

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

/// The built-in jailbreak pattern catalogue.
#[allow(clippy::too_many_lines)]
#[must_use]
pub fn builtin_patterns() -> Vec<ThreatPattern<JailbreakCategory>> {
    use JailbreakCategory::{
        EmotionalManipulation, FormatManipulation, HypotheticalScenario, PrefixInjection,
        RolePlaying,
    };
    use PatternSeverity::{High, Low, Medium};

    vec![
        // ── Role-playing ───────────────────────────────────────────
        pat!(
            "persona_handle",
            RolePlaying,
            r"(?i)you\s+are\s+(?:now\s+)?(?:dan|dude|kevin|aim|chad)\b",
            High,
            0.90
        ),
        pat!(
            "roleplay_no_rules",
            RolePlaying,
            r"(?i)(?:pretend|act\s+as|roleplay).{0,60}(?:unrestricted|uncensored|no\s+rules)",
            High,
            0.88
        ),
        pat!(
            "identity_without_limits",
            RolePlaying,
            r"(?i)(?:you\s+are|you're).{0,40}(?:without|with\s+no)\s+(?:restrictions|limits|rules|ethics|guidelines)",
            High,
            0.88
        ),
        pat!(
            "ignore_safety_guidelines",
            RolePlaying,
            r"(?i)ignore\s+(?:all\s+)?(?:safety|ethical|moral)\s+(?:guidelines|constraints|rules)",
            High,
            0.90
        ),
        // ── Hypothetical scenarios ─────────────────────────────────
        pat!(
            "hypothetically_unrestricted",
            HypotheticalScenario,
            r"(?i)hypothetically.{0,60}(?:no\s+restrictions|unrestricted|allowed\s+to)",
            High,
            0.82
        ),
        pat!(
            "fictional_world_no_rules",
            HypotheticalScenario,
            r"(?i)(?:hypothetical|fictional|alternate)\s+(?:world|reality|scenario).{0,60}(?:no\s+rules|no\s+ethics|no\s+restrictions|allowed)",
            High,
            0.85
        ),
        pat!(
            "imagine_lawless_world",
            HypotheticalScenario,
            r"(?i)imagine\s+(?:a\s+)?(?:scenario|world)\s+where.{0,60}(?:no\s+rules|no\s+ethics|anything)",
            High,
            0.82
        ),
        pat!(
            "fiction_cover_story",
            HypotheticalScenario,
            r"(?i)for\s+a\s+(?:novel|story|book).{0,60}(?:how\s+to|describe).{0,30}(?:hack|break|bypass|explode|weapon)",
            Medium,
            0.80
        ),
        // ── Prefix injection ───────────────────────────────────────
        pat!(
            "bracket_system_tag",
            PrefixInjection,
            r"(?i)\[(?:system|admin|debug|jailbreak)",
            High,
            0.85
        ),
        pat!(
            "double_angle_tag",
            PrefixInjection,
            r"(?i)<<(?:admin|system|debug)",
            High,
            0.85
        ),
        pat!(
            "brace_override_tag",
            PrefixInjection,
            r"(?i)\{\{(?:jailbreak|debug|override)[:=]",
            High,
            0.85
        ),
        pat!(
            "override_activated",
            PrefixInjection,
            r"(?i)(?:system|admin)\s+(?:override|mode)\s+(?:activated|enabled|on)\b",
            High,
            0.88
        ),
        // ── Emotional manipulation (weak on their own) ─────────────
        pat!(
            "educational_purposes",
            EmotionalManipulation,
            r"(?i)(?:educational|academic|research)\s+purposes?\s+only",
            Low,
            0.60
        ),
        pat!(
            "researcher_claim",
            EmotionalManipulation,
            r"(?i)i'?m\s+a\s+researcher\s+studying",
            Low,
            0.60
        ),
        pat!(
            "grandmother_framing",
            EmotionalManipulation,
            r"(?i)my\s+grandmother\s+used\s+to\s+(?:tell|teach)",
            Low,
            0.65
        ),
        pat!(
            "claimed_danger",
            EmotionalManipulation,
            r"(?i)i'?m\s+in\s+danger",
            Low,
            0.60
        ),
        // ── Format manipulation ────────────────────────────────────
        pat!(
            "numbered_bypass_list",
            FormatManipulation,
            r"(?im)^\s*(?:1[.)]|step\s+1|first)[^\n]{0,40}(?:bypass|ignore|disable)",
            Medium,
            0.80
        ),
        pat!(
            "constrained_output_channel",
            FormatManipulation,
            r"(?i)respond\s+only\s+(?:with|in)\s+(?:code|base64|hex|json)",
            Low,
            0.65
        ),
    ]
}

// ── Layer 2: encoding analysis ─────────────────────────────────────────

/// Vocabulary that marks a decoded payload as a bypass attempt.
const BYPASS_TOKENS: &[&str] = &[
    "ignore",
    "bypass",
    "override",
    "jailbreak",
    "unrestricted",
    "disable",
    "safety",
    "restrictions",
];

/// Words that, next to an encoding indicator, suggest the model is being
/// asked to act on the hidden payload.
const TRIGGER_WORDS: &[&str] = &["decode", "execute", "run", "interpret", "process"];

/// Detects payloads hidden behind Base64, hex escapes, or leetspeak.
///
/// ROT13 is deliberately not attempted: every alphabetic string "decodes"
/// under ROT13, so the false-positive rate is unacceptable without a
/// suppression policy.
#[derive(Debug, Clone)]
struct EncodingAnalyzer {
    base64_runs: Regex,
    hex_runs: Regex,
}

impl EncodingAnalyzer {
    fn new() -> Result<Self, PatternError> {
        let flags = PatternFlags {
            case_insensitive: false,
            ..PatternFlags::default()
        };
        Ok(Self {
            base64_runs: compile_pattern(r"[A-Za-z0-9+/]{16,}={0,2}", flags)?,
            hex_runs: compile_pattern(r"(?:\\x[0-9A-Fa-f]{2}){4,}", flags)?,
        })
    }

    fn analyze(&self, text: &str) -> Vec<JailbreakSignal> {
        let mut signals = Vec::new();
        let mut indicator_seen = false;

        for m in self.base64_runs.find_iter(text) {
            indicator_seen = true;
            if let Some(decoded) = decode_base64_lenient(m.as_str())
                && contains_bypass_token(&decoded)
            {
                signals.push(JailbreakSignal {
                    source: SignalSource::Encoding,
                    category: JailbreakCategory::EncodingAttack,
                    name: "base64_payload".to_string(),
                    confidence: 0.80,
                });
                break;
            }
        }

        for m in self.hex_runs.find_iter(text) {
            indicator_seen = true;
            if let Some(decoded) = decode_hex_escapes(m.as_str())
                && contains_bypass_token(&decoded)
            {
                signals.push(JailbreakSignal {
                    source: SignalSource::Encoding,
                    category: JailbreakCategory::EncodingAttack,
                    name: "hex_escape_payload".to_string(),
                    confidence: 0.80,
                });
                break;
            }
        }

        // Leetspeak: only a signal when the decoded form reveals a bypass
        // token that the raw text does not already contain.
        let leet = leet_decode(text);
        let raw_lower = text.to_lowercase();
        if BYPASS_TOKENS
            .iter()
            .any(|t| leet.contains(t) && !raw_lower.contains(t))
        {
            indicator_seen = true;
            signals.push(JailbreakSignal {
                source: SignalSource::Encoding,
                category: JailbreakCategory::EncodingAttack,
                name: "leetspeak_payload".to_string(),
                confidence: 0.80,
            });
        }

        // Undecodable indicator next to an action verb is still suspicious,
        // at much lower confidence.
        if signals.is_empty()
            && indicator_seen
            && TRIGGER_WORDS.iter().any(|t| raw_lower.contains(t))
        {
            signals.push(JailbreakSignal {
                source: SignalSource::Encoding,
                category: JailbreakCategory::EncodingAttack,
                name: "encoded_content_trigger".to_string(),
                confidence: 0.40,
            });
        }

        signals
    }
}

fn contains_bypass_token(decoded: &str) -> bool {
    let lower = decoded.to_lowercase();
    BYPASS_TOKENS.iter().any(|t| lower.contains(t))
}

/// Decode a Base64 candidate, tolerating a truncated tail.
fn decode_base64_lenient(candidate: &str) -> Option<String> {
    let trimmed = &candidate[..candidate.len() - candidate.len() % 4];
    let bytes = BASE64.decode(trimmed).ok()?;
    String::from_utf8(bytes).ok()
}

/// Decode a run of `\xNN` escapes into the bytes they denote.
fn decode_hex_escapes(run: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(run.len() / 4);
    for chunk in run.split("\\x").filter(|c| !c.is_empty()) {
        bytes.push(u8::from_str_radix(chunk.get(..2)?, 16).ok()?);
    }
    String::from_utf8(bytes).ok()
}

/// Map common leet substitutions to letters and lowercase the rest.
fn leet_decode(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '0' => 'o',
            '1' | '!' => 'i',
            '3' => 'e',
            '4' | '@' => 'a',
            '5' | '$' => 's',
            '7' => 't',
            _ => c.to_ascii_lowercase(),
        })
        .collect()
}

// ── Layer 3: persona matching ──────────────────────────────────────────

/// Known jailbreak personas, in canonical spelling.
const PERSONAS: &[&str] = &[
    "DAN",
    "DUDE",
    "KEVIN",
    "AIM",
    "STAN",
    "CHAD",
    "Developer Mode",
    "Evil Confidant",
    "Superior AI",
    "Unrestricted AI",
    "JailBreak",
    "Libre",
];

/// Word-boundary persona scanner with framing context analysis.
#[derive(Debug, Clone)]
struct PersonaMatcher {
    automaton: AhoCorasick,
    framing: Regex,
    rules_context: Regex,
}

impl PersonaMatcher {
    fn new() -> Result<Self, PatternError> {
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(PERSONAS)
            .map_err(|e| PatternError::MatcherBuild {
                name: "persona_catalogue".to_string(),
                reason: e.to_string(),
            })?;
        let flags = PatternFlags::default();
        Ok(Self {
            automaton,
            framing: compile_pattern(
                r"(?:you\s+are|pretend|act\s+as|operating\s+as|now)[\s,.:;!-]*$",
                flags,
            )?,
            rules_context: compile_pattern(
                r"(?:no|without|ignor(?:e[sd]?|ing)|bypass(?:ing|ed)?|break(?:ing)?)\s+(?:all\s+|any\s+|your\s+)?(?:rules|restrictions|safety|guidelines|limits)",
                flags,
            )?,
        })
    }

    fn scan(&self, text: &str) -> Vec<JailbreakSignal> {
        let bytes = text.as_bytes();
        let rules_context = self.rules_context.is_match(text);
        let mut best: std::collections::HashMap<usize, f32> = std::collections::HashMap::new();

        for m in self.automaton.find_overlapping_iter(text) {
            // Word-boundary check around the match span.
            let before = m.start().checked_sub(1).map(|i| bytes[i]);
            let after = bytes.get(m.end()).copied();
            let boundary_ok = |b: Option<u8>| b.is_none_or(|b| !b.is_ascii_alphanumeric());
            if !boundary_ok(before) || !boundary_ok(after) {
                continue;
            }

            let persona = PERSONAS[m.pattern().as_usize()];
            let framed = rules_context || self.framed_before(text, m.start());

            let confidence = if framed {
                0.90
            } else if persona.len() >= 5 {
                // Long names are distinctive enough on their own; short
                // handles (AIM, DAN, ...) collide with ordinary words and
                // need explicit context.
                0.70
            } else {
                continue;
            };

            let slot = best.entry(m.pattern().as_usize()).or_insert(0.0);
            *slot = slot.max(confidence);
        }

        best.into_iter()
            .map(|(idx, confidence)| JailbreakSignal {
                source: SignalSource::Persona,
                category: JailbreakCategory::RolePlaying,
                name: PERSONAS[idx].to_string(),
                confidence,
            })
            .collect()
    }

    /// Whether a framing verb immediately precedes byte offset `start`.
    fn framed_before(&self, text: &str, start: usize) -> bool {
        let mut window_start = start.saturating_sub(40);
        while !text.is_char_boundary(window_start) {
            window_start -= 1;
        }
        self.framing.is_match(&text[window_start..start])
    }
}

// ── JailbreakConfig ────────────────────────────────────────────────────

/// Configuration for [`JailbreakDetector`].
///
/// Uses a builder pattern; all setters are `#[must_use]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JailbreakConfig {
    /// Whether the detector runs at all (default `true`).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Minimum aggregated confidence for a detection (default `0.7`).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Additional user-provided patterns (layer 1 only).
    #[serde(default)]
    pub additional_patterns: Vec<CustomPattern<JailbreakCategory>>,
    /// Built-in pattern names to disable (layer 1 only).
    #[serde(default)]
    pub disabled_patterns: Vec<String>,
}

fn default_enabled() -> bool {
    true
}
fn default_confidence_threshold() -> f32 {
    0.7
}

impl Default for JailbreakConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
            additional_patterns: Vec::new(),
            disabled_patterns: Vec::new(),
        }
    }
}

impl JailbreakConfig {
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
    pub fn additional_patterns(mut self, patterns: Vec<CustomPattern<JailbreakCategory>>) -> Self {
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

// ── JailbreakDetector ──────────────────────────────────────────────────

/// Multi-layer jailbreak detector combining patterns, encoding analysis,
/// and persona matching.
#[derive(Debug, Clone)]
pub struct JailbreakDetector {
    patterns: PatternSet<JailbreakCategory>,
    encoding: EncodingAnalyzer,
    personas: PersonaMatcher,
    enabled: bool,
    confidence_threshold: f32,
}

impl JailbreakDetector {
    /// Build a detector from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if any pattern fails to compile.
    pub fn new(config: JailbreakConfig) -> Result<Self, PatternError> {
        Ok(Self {
            patterns: PatternSet::compile(
                builtin_patterns(),
                config.additional_patterns,
                &config.disabled_patterns,
            )?,
            encoding: EncodingAnalyzer::new()?,
            personas: PersonaMatcher::new()?,
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
        Self::new(JailbreakConfig::default())
    }

    /// Collect signals from all three layers.
    fn collect_signals(&self, input: &str) -> Vec<JailbreakSignal> {
        let mut signals: Vec<JailbreakSignal> = self
            .patterns
            .scan(input)
            .into_iter()
            .map(|h| JailbreakSignal {
                source: SignalSource::Pattern,
                category: h.category,
                name: h.name.to_string(),
                confidence: h.confidence,
            })
            .collect();
        signals.extend(self.encoding.analyze(input));
        signals.extend(self.personas.scan(input));
        signals
    }

    /// Aggregate: strongest signal, boosted when evidence spans multiple
    /// distinct `(source, category)` keys, capped at 1.0.
    fn aggregate(signals: &[JailbreakSignal]) -> (f32, JailbreakCategory) {
        let top = signals
            .iter()
            .reduce(|best, s| if s.confidence > best.confidence { s } else { best })
            .expect("aggregate called with at least one signal");

        let base = top.confidence;
        let distinct: HashSet<(SignalSource, JailbreakCategory)> =
            signals.iter().map(|s| (s.source, s.category)).collect();

        #[allow(clippy::cast_precision_loss)]
        let confidence = if distinct.len() >= 2 {
            (base + 0.10 * distinct.len() as f32).min(1.0)
        } else {
            base
        };

        (confidence, top.category)
    }
}

impl Detector for JailbreakDetector {
    fn id(&self) -> &'static str {
        "jailbreak"
    }

    fn description(&self) -> &'static str {
        "Multi-layer jailbreak detection: technique patterns, encoded-payload \
         analysis, and persona matching"
    }

    fn detect(&self, input: &str) -> Verdict {
        if !self.enabled {
            let mut metadata = serde_json::Map::new();
            metadata.insert("enabled".to_string(), serde_json::Value::Bool(false));
            return Verdict::safe_with(metadata);
        }

        if input.is_empty() {
            let mut metadata = serde_json::Map::new();
            metadata.insert("confidence".to_string(), serde_json::Value::from(0.0));
            return Verdict::safe_with(metadata);
        }

        let signals = self.collect_signals(input);
        if signals.is_empty() {
            let mut metadata = serde_json::Map::new();
            metadata.insert(
                "patterns_checked".to_string(),
                serde_json::Value::from(self.patterns.len()),
            );
            metadata.insert("confidence".to_string(), serde_json::Value::from(0.0));
            return Verdict::safe_with(metadata);
        }

        let (confidence, technique) = Self::aggregate(&signals);
        let matched_patterns: Vec<String> = signals.iter().map(|s| s.name.clone()).collect();

        if confidence < self.confidence_threshold {
            let mut metadata = serde_json::Map::new();
            metadata.insert("below_threshold".to_string(), serde_json::Value::Bool(true));
            metadata.insert(
                "confidence".to_string(),
                serde_json::Value::from(f64::from(confidence)),
            );
            metadata.insert(
                "technique".to_string(),
                serde_json::Value::from(technique.to_string()),
            );
            return Verdict::safe_with(metadata);
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "reason".to_string(),
            serde_json::Value::from("jailbreak_attempt"),
        );
        metadata.insert(
            "technique".to_string(),
            serde_json::Value::from(technique.to_string()),
        );
        metadata.insert(
            "signal_count".to_string(),
            serde_json::Value::from(signals.len()),
        );

        Verdict::Detected(DetectionDetails {
            confidence,
            category: technique.to_string(),
            patterns_matched: matched_patterns,
            metadata,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
