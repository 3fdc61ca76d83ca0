//! Pattern compilation and scoring utilities shared by the regex-driven
//! detectors.
//!
//! [`PatternSet`] compiles a catalogue into a [`RegexSet`] for single-pass
//! multi-pattern scanning. Free functions cover one-off compilation with
//! the crate's default flags, text normalization, and keyword extraction.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use regex::{Regex, RegexBuilder, RegexSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── PatternError ───────────────────────────────────────────────────────

/// Errors raised while compiling catalogue or user-supplied patterns.
#[derive(Debug, Error)]
pub enum PatternError {
    /// A single pattern source failed to compile.
    #[error("invalid regex for pattern '{name}': {source}")]
    Invalid {
        /// Name of the offending pattern.
        name: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// The combined [`RegexSet`] failed to build even though every member
    /// compiled individually (e.g. the compiled-size limit was hit).
    #[error("pattern set failed to build: {0}")]
    SetBuild(#[from] regex::Error),

    /// A non-regex matcher (e.g. a literal automaton) failed to build.
    #[error("matcher '{name}' failed to build: {reason}")]
    MatcherBuild {
        /// Name of the matcher.
        name: String,
        /// Underlying failure, rendered.
        reason: String,
    },
}

// ── PatternSeverity ────────────────────────────────────────────────────

/// Severity attached to a catalogue pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSeverity {
    /// Weak signal, informative on its own.
    Low,
    /// Meaningful signal, usually needs corroboration.
    Medium,
    /// Strong signal, blocks on its own at default thresholds.
    High,
}

impl fmt::Display for PatternSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// ── ThreatPattern ──────────────────────────────────────────────────────

/// A single catalogue entry: a regex source plus scoring metadata.
///
/// Identity is by `name`; catalogues never contain two entries with the
/// same name.
#[derive(Debug, Clone)]
pub struct ThreatPattern<C> {
    /// Unique snake_case identifier (e.g. `"ignore_previous_instructions"`).
    pub name: Cow<'static, str>,
    /// Raw regex source. Built-in sources carry their own `(?i)` flags.
    pub regex_str: Cow<'static, str>,
    /// Severity when this pattern matches.
    pub severity: PatternSeverity,
    /// Detector-specific category of the threat.
    pub category: C,
    /// Base confidence contributed by a match (0.0–1.0).
    pub confidence: f32,
}

/// A user-supplied pattern layered on top of a built-in catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPattern<C> {
    /// Unique identifier.
    pub name: String,
    /// Raw regex source.
    pub regex: String,
    /// Severity when this pattern matches.
    pub severity: PatternSeverity,
    /// Detector-specific category.
    pub category: C,
    /// Base confidence contributed by a match (0.0–1.0).
    pub confidence: f32,
}

impl<C> From<CustomPattern<C>> for ThreatPattern<C> {
    fn from(p: CustomPattern<C>) -> Self {
        Self {
            name: Cow::Owned(p.name),
            regex_str: Cow::Owned(p.regex),
            severity: p.severity,
            category: p.category,
            confidence: p.confidence,
        }
    }
}

// ── PatternHit ─────────────────────────────────────────────────────────

/// One catalogue entry that matched somewhere in the scanned text.
#[derive(Debug, Clone)]
pub struct PatternHit<C> {
    /// Name of the matched pattern.
    pub name: Cow<'static, str>,
    /// Severity of the matched pattern.
    pub severity: PatternSeverity,
    /// Category of the matched pattern.
    pub category: C,
    /// Base confidence of the matched pattern.
    pub confidence: f32,
}

// ── PatternSet ─────────────────────────────────────────────────────────

/// A compiled pattern catalogue.
///
/// Construction validates every member individually (so compile errors
/// name the offending pattern) and then builds one [`RegexSet`] union so
/// that [`scan`](Self::scan) runs all patterns in a single pass over the
/// input.
#[derive(Debug, Clone)]
pub struct PatternSet<C> {
    regex_set: RegexSet,
    patterns: Vec<ThreatPattern<C>>,
}

impl<C: Copy> PatternSet<C> {
    /// Compile a catalogue, optionally filtering out disabled names and
    /// appending user-supplied patterns.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if any pattern fails to compile.
    pub fn compile(
        builtin: Vec<ThreatPattern<C>>,
        custom: Vec<CustomPattern<C>>,
        disabled: &[String],
    ) -> Result<Self, PatternError> {
        let disabled: HashSet<&str> = disabled.iter().map(String::as_str).collect();

        let mut patterns: Vec<ThreatPattern<C>> = builtin
            .into_iter()
            .filter(|p| !disabled.contains(p.name.as_ref()))
            .collect();
        patterns.extend(custom.into_iter().map(ThreatPattern::from));

        for p in &patterns {
            Regex::new(p.regex_str.as_ref()).map_err(|source| PatternError::Invalid {
                name: p.name.to_string(),
                source,
            })?;
        }

        let sources: Vec<&str> = patterns.iter().map(|p| p.regex_str.as_ref()).collect();
        let regex_set = RegexSet::new(&sources)?;

        Ok(Self {
            regex_set,
            patterns,
        })
    }

    /// Number of patterns in the compiled set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Scan `text` and return one [`PatternHit`] per matching pattern, in
    /// catalogue order.
    #[must_use]
    pub fn scan(&self, text: &str) -> Vec<PatternHit<C>> {
        self.regex_set
            .matches(text)
            .into_iter()
            .map(|idx| {
                let p = &self.patterns[idx];
                PatternHit {
                    name: p.name.clone(),
                    severity: p.severity,
                    category: p.category,
                    confidence: p.confidence,
                }
            })
            .collect()
    }
}

// ── One-off compilation ────────────────────────────────────────────────

/// Flags accepted by [`compile_pattern`].
///
/// Case-insensitive matching is on by default; the regex engine is always
/// Unicode-aware.
#[derive(Debug, Clone, Copy)]
pub struct PatternFlags {
    /// Match letters without regard to case (default `true`).
    pub case_insensitive: bool,
    /// Let `^`/`$` match at line boundaries (default `false`).
    pub multi_line: bool,
    /// Let `.` match `\n` (default `false`).
    pub dot_matches_newline: bool,
}

impl Default for PatternFlags {
    fn default() -> Self {
        Self {
            case_insensitive: true,
            multi_line: false,
            dot_matches_newline: false,
        }
    }
}

/// Compile a single regex with the crate's default flags.
///
/// # Errors
///
/// Returns [`PatternError::Invalid`] when the source does not compile;
/// the error carries the source string as the pattern name.
pub fn compile_pattern(source: &str, flags: PatternFlags) -> Result<Regex, PatternError> {
    RegexBuilder::new(source)
        .case_insensitive(flags.case_insensitive)
        .multi_line(flags.multi_line)
        .dot_matches_new_line(flags.dot_matches_newline)
        .unicode(true)
        .build()
        .map_err(|e| PatternError::Invalid {
            name: source.to_string(),
            source: e,
        })
}

/// Every non-overlapping substring of `text` matched by `re`, in order.
#[must_use]
pub fn find_all<'t>(re: &Regex, text: &'t str) -> Vec<&'t str> {
    re.find_iter(text).map(|m| m.as_str()).collect()
}

// ── Scoring ────────────────────────────────────────────────────────────

/// Combine per-pattern base confidences into one score.
///
/// `base` is the strongest matched pattern; each additional match adds
/// 0.05 (capped at +0.20); short inputs get a small boost because a match
/// in little surrounding text is a stronger signal. The result is clamped
/// to 1.0. `input_length` counts Unicode scalars, not bytes.
#[must_use]
pub fn match_confidence<C>(hits: &[PatternHit<C>], input_length: usize) -> f32 {
    if hits.is_empty() {
        return 0.0;
    }

    let base = hits.iter().map(|h| h.confidence).fold(0.0_f32, f32::max);

    #[allow(clippy::cast_precision_loss)]
    let count_boost = (0.05 * (hits.len().saturating_sub(1)) as f32).min(0.20);

    let length_factor = if input_length < 50 {
        0.05
    } else if input_length < 200 {
        0.02
    } else {
        0.0
    };

    (base + count_boost + length_factor).min(1.0)
}

// ── Text utilities ─────────────────────────────────────────────────────

/// Lowercase, trim, and collapse whitespace runs to single spaces.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Options for [`extract_keywords`].
#[derive(Debug, Clone, Copy)]
pub struct KeywordOptions {
    /// Minimum keyword length in characters (default 3).
    pub min_length: usize,
    /// Maximum number of keywords returned (default 10).
    pub max_keywords: usize,
}

impl Default for KeywordOptions {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_keywords: 10,
        }
    }
}

/// Normalize `text`, split on non-word characters, filter by length,
/// deduplicate preserving first occurrence, and take the first N.
#[must_use]
pub fn extract_keywords(text: &str, options: KeywordOptions) -> Vec<String> {
    let normalized = normalize_text(text);
    let mut seen: HashSet<String> = HashSet::new();
    let mut keywords = Vec::new();

    for word in normalized.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if word.chars().count() < options.min_length {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
            if keywords.len() == options.max_keywords {
                break;
            }
        }
    }

    keywords
}

// ── Tests ──────────────────────────────────────────────────────────────
