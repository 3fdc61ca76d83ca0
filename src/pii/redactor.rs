//! Replacement of scanned PII with masked, partial, hashed, placeholder,
//! or caller-defined forms.
//!
//! Replacement is done back-to-front: entities are applied in descending
//! `start` order so earlier byte offsets stay valid while later spans are
//! spliced out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{PiiEntity, PiiKind};

// ── PlaceholderFormat ──────────────────────────────────────────────────

/// Bracket style used by [`RedactionStrategy::Placeholder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderFormat {
    /// `[EMAIL]`
    #[default]
    Square,
    /// `<EMAIL>`
    Angle,
}

// ── RedactionStrategy ──────────────────────────────────────────────────

/// How a matched entity is rewritten.
#[derive(Clone, Default)]
pub enum RedactionStrategy {
    /// Replace the value with the mask character, preserving length.
    #[default]
    Mask,
    /// Type-specific partial display (last-4 digits, masked email local
    /// part, masked leading octets, host-only URLs).
    Partial,
    /// `HASH_` plus the first 8 hex characters of the value's SHA-256.
    Hash,
    /// `[KIND]` or `<KIND>` depending on [`PlaceholderFormat`].
    Placeholder,
    /// Caller-supplied replacement function, applied per entity.
    Custom(Arc<dyn Fn(&PiiEntity) -> String + Send + Sync>),
    /// Per-kind dispatch; kinds without an entry fall back to [`Mask`](Self::Mask).
    Mixed(HashMap<PiiKind, RedactionStrategy>),
}

impl fmt::Debug for RedactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mask => write!(f, "Mask"),
            Self::Partial => write!(f, "Partial"),
            Self::Hash => write!(f, "Hash"),
            Self::Placeholder => write!(f, "Placeholder"),
            Self::Custom(_) => write!(f, "Custom(..)"),
            Self::Mixed(map) => f.debug_tuple("Mixed").field(map).finish(),
        }
    }
}

// ── RedactionOptions ───────────────────────────────────────────────────

/// Options shared by all strategies.
#[derive(Debug, Clone)]
pub struct RedactionOptions {
    /// The strategy to apply (default [`RedactionStrategy::Mask`]).
    pub strategy: RedactionStrategy,
    /// Character used by masking strategies (default `'*'`).
    pub mask_char: char,
    /// Bracket style for placeholders (default square).
    pub placeholder_format: PlaceholderFormat,
}

impl Default for RedactionOptions {
    fn default() -> Self {
        Self {
            strategy: RedactionStrategy::Mask,
            mask_char: '*',
            placeholder_format: PlaceholderFormat::Square,
        }
    }
}

impl RedactionOptions {
    /// Options with the given strategy and defaults otherwise.
    #[must_use]
    pub fn with_strategy(strategy: RedactionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Set the mask character.
    #[must_use]
    pub fn mask_char(mut self, mask_char: char) -> Self {
        self.mask_char = mask_char;
        self
    }

    /// Set the placeholder bracket style.
    #[must_use]
    pub fn placeholder_format(mut self, format: PlaceholderFormat) -> Self {
        self.placeholder_format = format;
        self
    }
}

// ── PiiRedactor ────────────────────────────────────────────────────────

/// Applies a [`RedactionStrategy`] to scanned entities.
#[derive(Debug, Clone, Default)]
pub struct PiiRedactor {
    options: RedactionOptions,
}

impl PiiRedactor {
    /// A redactor with the given options.
    #[must_use]
    pub fn new(options: RedactionOptions) -> Self {
        Self { options }
    }

    /// Rewrite `text`, replacing every entity per the configured strategy.
    ///
    /// Entities must carry offsets into this exact `text`; they are applied
    /// in descending `start` order so remaining offsets stay valid.
    #[must_use]
    pub fn redact(&self, text: &str, entities: &[PiiEntity]) -> String {
        let mut ordered: Vec<&PiiEntity> = entities.iter().collect();
        ordered.sort_by(|a, b| b.start.cmp(&a.start));

        let mut result = text.to_string();
        for entity in ordered {
            let replacement = self.replacement_for(entity, &self.options.strategy);
            result.replace_range(entity.start..entity.end, &replacement);
        }
        result
    }

    /// Like [`redact`](Self::redact), additionally returning the
    /// original-to-redacted mapping for audit trails.
    #[must_use]
    pub fn redact_with_mapping(
        &self,
        text: &str,
        entities: &[PiiEntity],
    ) -> (String, HashMap<String, String>) {
        let mut mapping = HashMap::with_capacity(entities.len());
        for entity in entities {
            mapping.insert(
                entity.value.clone(),
                self.replacement_for(entity, &self.options.strategy),
            );
        }
        (self.redact(text, entities), mapping)
    }

    fn replacement_for(&self, entity: &PiiEntity, strategy: &RedactionStrategy) -> String {
        match strategy {
            RedactionStrategy::Mask => self.mask(&entity.value),
            RedactionStrategy::Partial => self.partial(entity),
            RedactionStrategy::Hash => hash_value(&entity.value),
            RedactionStrategy::Placeholder => match self.options.placeholder_format {
                PlaceholderFormat::Square => format!("[{}]", entity.kind.label()),
                PlaceholderFormat::Angle => format!("<{}>", entity.kind.label()),
            },
            RedactionStrategy::Custom(f) => f(entity),
            RedactionStrategy::Mixed(map) => {
                let inner = map.get(&entity.kind).unwrap_or(&RedactionStrategy::Mask);
                self.replacement_for(entity, inner)
            }
        }
    }

    fn mask(&self, value: &str) -> String {
        std::iter::repeat_n(self.options.mask_char, value.chars().count()).collect()
    }

    fn partial(&self, entity: &PiiEntity) -> String {
        let value = &entity.value;
        match entity.kind {
            PiiKind::Email => self.partial_email(value),
            PiiKind::Phone | PiiKind::Ssn | PiiKind::CreditCard => self.last_four(value),
            PiiKind::IpAddress => self.partial_ip(value),
            PiiKind::Url => partial_url(value),
        }
    }

    /// `jane@corp.example` becomes `j***@corp.example`.
    fn partial_email(&self, value: &str) -> String {
        match value.split_once('@') {
            Some((local, domain)) => {
                let first = local.chars().next().map(String::from).unwrap_or_default();
                format!("{first}{}@{domain}", self.mask_str(3))
            }
            None => self.mask(value),
        }
    }

    /// All but the last four characters masked, length preserved.
    fn last_four(&self, value: &str) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= 4 {
            return self.mask(value);
        }
        let masked = self.mask_str(chars.len() - 4);
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{masked}{tail}")
    }

    /// `192.168.1.42` becomes `***.***.1.42`; IPv6 falls back to masking.
    fn partial_ip(&self, value: &str) -> String {
        let octets: Vec<&str> = value.split('.').collect();
        if octets.len() == 4 {
            format!(
                "{m}.{m}.{}.{}",
                octets[2],
                octets[3],
                m = self.mask_str(3)
            )
        } else {
            self.mask(value)
        }
    }

    fn mask_str(&self, count: usize) -> String {
        std::iter::repeat_n(self.options.mask_char, count).collect()
    }
}

/// `https://host/secret` becomes `https://host/***`.
fn partial_url(value: &str) -> String {
    match value.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or(rest);
            format!("{scheme}://{host}/***")
        }
        None => "***".to_string(),
    }
}

/// `HASH_` plus the first 8 lowercase hex chars of SHA-256(value).
fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    format!("HASH_{}", &hex::encode(digest)[..8])
}

// ── Tests ──────────────────────────────────────────────────────────────
