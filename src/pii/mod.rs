//! PII scanning and redaction.
//!
//! [`scanner::PiiScanner`] finds six kinds of personally identifiable
//! information in text and reports them as byte-addressed
//! [`PiiEntity`] records; [`redactor::PiiRedactor`] rewrites the text with
//! a configurable replacement strategy. The data-leakage detector wraps
//! both behind the standard detector interface.

pub mod redactor;
pub mod scanner;

use std::fmt;

use serde::{Deserialize, Serialize};

// ── PiiKind ────────────────────────────────────────────────────────────

/// The kinds of PII the scanner recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    /// Email addresses.
    Email,
    /// Phone numbers (US, local, and international shapes).
    Phone,
    /// US Social Security numbers.
    Ssn,
    /// Payment card numbers (Luhn-validated).
    CreditCard,
    /// IPv4 and IPv6 addresses.
    IpAddress,
    /// HTTP(S) URLs.
    Url,
}

impl PiiKind {
    /// All kinds, in the scanner's canonical order.
    pub const ALL: [Self; 6] = [
        Self::Email,
        Self::Phone,
        Self::Ssn,
        Self::CreditCard,
        Self::IpAddress,
        Self::Url,
    ];

    /// Uppercase label used by placeholder redaction (e.g. `CREDIT_CARD`).
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Ssn => "SSN",
            Self::CreditCard => "CREDIT_CARD",
            Self::IpAddress => "IP_ADDRESS",
            Self::Url => "URL",
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Phone => write!(f, "phone"),
            Self::Ssn => write!(f, "ssn"),
            Self::CreditCard => write!(f, "credit_card"),
            Self::IpAddress => write!(f, "ip_address"),
            Self::Url => write!(f, "url"),
        }
    }
}

// ── PiiEntity ──────────────────────────────────────────────────────────

/// One occurrence of PII in the scanned text.
///
/// `start..end` is a half-open byte range over the UTF-8 input, and
/// `value` always equals `&input[start..end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiEntity {
    /// Kind of PII found.
    pub kind: PiiKind,
    /// The matched text, verbatim.
    pub value: String,
    /// Confidence in \[0.0, 1.0\].
    pub confidence: f32,
    /// Start byte offset (inclusive).
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
}

impl PiiEntity {
    /// Length of the matched span in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the span is empty (never true for scanner output).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether this entity's byte span overlaps another's.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(PiiKind::CreditCard.to_string(), "credit_card");
        assert_eq!(PiiKind::IpAddress.to_string(), "ip_address");
    }

    #[test]
    fn labels_are_uppercase() {
        for kind in PiiKind::ALL {
            assert_eq!(kind.label(), kind.label().to_uppercase());
        }
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = PiiEntity {
            kind: PiiKind::Email,
            value: "x".to_string(),
            confidence: 0.9,
            start: 5,
            end: 10,
        };
        let b = PiiEntity {
            kind: PiiKind::Url,
            value: "y".to_string(),
            confidence: 0.9,
            start: 9,
            end: 20,
        };
        let c = PiiEntity {
            kind: PiiKind::Phone,
            value: "z".to_string(),
            confidence: 0.9,
            start: 10,
            end: 12,
        };
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c) && !c.overlaps(&a));
    }
}
