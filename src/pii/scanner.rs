//! Regex-driven PII scanner with per-kind validation.
//!
//! Each kind pairs a candidate regex with a cheap validator (digit
//! counting, Luhn, octet ranges, context windows) so that the regexes can
//! stay linear-time and simple while obviously-invalid candidates are
//! still rejected. Overlapping candidates are resolved by keeping the
//! longer span.

use regex::Regex;

use crate::detectors::patterns::{PatternError, PatternFlags, compile_pattern};

use super::{PiiEntity, PiiKind};

/// Entities below this confidence never leave the scanner.
const MIN_CONFIDENCE: f32 = 0.7;

/// Bytes of context inspected on each side of an unformatted SSN
/// candidate. The window is byte-addressed, so very long inputs with the
/// keyword outside the window will miss.
const SSN_CONTEXT_WINDOW: usize = 20;

// ── PiiScanner ─────────────────────────────────────────────────────────

/// Scanner for the six supported PII kinds.
///
/// Compile once, scan many times; the scanner is immutable and safe to
/// share across threads.
#[derive(Debug, Clone)]
pub struct PiiScanner {
    email: Regex,
    phone_us: Regex,
    phone_local: Regex,
    phone_intl: Regex,
    ssn_formatted: Regex,
    ssn_unformatted: Regex,
    credit_card: Regex,
    ipv4: Regex,
    ipv6: Regex,
    url: Regex,
}

impl PiiScanner {
    /// Compile all candidate regexes.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if a regex fails to compile.
    pub fn new() -> Result<Self, PatternError> {
        let plain = PatternFlags {
            case_insensitive: false,
            ..PatternFlags::default()
        };
        Ok(Self {
            // Deliberately no word-boundary anchors: \b misbehaves next to
            // non-ASCII letters and the local part may start after one.
            email: compile_pattern(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", plain)?,
            phone_us: compile_pattern(
                r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}",
                plain,
            )?,
            phone_local: compile_pattern(r"\d{3}[-.\s]?\d{4}", plain)?,
            phone_intl: compile_pattern(r"\+\d{1,3}[-.\s]?\d{1,4}(?:[-.\s]?\d{2,4}){1,3}", plain)?,
            ssn_formatted: compile_pattern(r"\d{3}-\d{2}-\d{4}", plain)?,
            ssn_unformatted: compile_pattern(r"\d{9}", plain)?,
            // 13-19 digits with optional single separators covers the
            // 4-4-4-4 and Amex 4-6-5 groupings as well as unbroken runs.
            credit_card: compile_pattern(r"\d(?:[-\s]?\d){12,18}", plain)?,
            ipv4: compile_pattern(r"(?:\d{1,3}\.){3}\d{1,3}", plain)?,
            ipv6: compile_pattern(r"(?:[0-9A-Fa-f]{0,4}:){2,7}[0-9A-Fa-f]{0,4}", plain)?,
            url: compile_pattern(r"(?i)https?://\S+", plain)?,
        })
    }

    /// Scan `text` for every supported kind.
    ///
    /// Returned entities are non-overlapping and sorted by `start`; each
    /// satisfies `value == &text[start..end]`.
    #[must_use]
    pub fn scan(&self, text: &str) -> Vec<PiiEntity> {
        let mut candidates = Vec::new();
        for kind in PiiKind::ALL {
            self.collect(text, kind, &mut candidates);
        }
        resolve_overlaps(candidates)
    }

    /// Scan `text` for a single kind only.
    #[must_use]
    pub fn scan_by_type(&self, text: &str, kind: PiiKind) -> Vec<PiiEntity> {
        let mut candidates = Vec::new();
        self.collect(text, kind, &mut candidates);
        resolve_overlaps(candidates)
    }

    /// Whether `text` contains any PII at all.
    #[must_use]
    pub fn contains_pii(&self, text: &str) -> bool {
        !self.scan(text).is_empty()
    }

    fn collect(&self, text: &str, kind: PiiKind, out: &mut Vec<PiiEntity>) {
        match kind {
            PiiKind::Email => self.collect_emails(text, out),
            PiiKind::Phone => self.collect_phones(text, out),
            PiiKind::Ssn => self.collect_ssns(text, out),
            PiiKind::CreditCard => self.collect_credit_cards(text, out),
            PiiKind::IpAddress => self.collect_ips(text, out),
            PiiKind::Url => self.collect_urls(text, out),
        }
    }

    fn collect_emails(&self, text: &str, out: &mut Vec<PiiEntity>) {
        for m in self.email.find_iter(text) {
            out.push(entity(PiiKind::Email, m.as_str(), m.start(), m.end(), 0.95));
        }
    }

    fn collect_phones(&self, text: &str, out: &mut Vec<PiiEntity>) {
        for re in [&self.phone_us, &self.phone_intl, &self.phone_local] {
            for m in re.find_iter(text) {
                if !digit_bounded(text, m.start(), m.end()) {
                    continue;
                }
                let digits = count_digits(m.as_str());
                let confidence = match digits {
                    7..=8 => 0.80,
                    10..=11 => 0.90,
                    9 | 12..=15 => 0.85,
                    _ => continue,
                };
                out.push(entity(
                    PiiKind::Phone,
                    m.as_str(),
                    m.start(),
                    m.end(),
                    confidence,
                ));
            }
        }
    }

    fn collect_ssns(&self, text: &str, out: &mut Vec<PiiEntity>) {
        for m in self.ssn_formatted.find_iter(text) {
            if !digit_bounded(text, m.start(), m.end()) {
                continue;
            }
            let v = m.as_str();
            if ssn_parts_valid(&v[0..3], &v[4..6], &v[7..11]) {
                out.push(entity(PiiKind::Ssn, v, m.start(), m.end(), 0.95));
            }
        }

        for m in self.ssn_unformatted.find_iter(text) {
            if !digit_bounded(text, m.start(), m.end()) {
                continue;
            }
            if !ssn_context_nearby(text, m.start(), m.end()) {
                continue;
            }
            let v = m.as_str();
            if ssn_parts_valid(&v[0..3], &v[3..5], &v[5..9]) {
                out.push(entity(PiiKind::Ssn, v, m.start(), m.end(), 0.85));
            }
        }
    }

    fn collect_credit_cards(&self, text: &str, out: &mut Vec<PiiEntity>) {
        for m in self.credit_card.find_iter(text) {
            if !digit_bounded(text, m.start(), m.end()) {
                continue;
            }
            let digits: Vec<u8> = m
                .as_str()
                .bytes()
                .filter(u8::is_ascii_digit)
                .map(|b| b - b'0')
                .collect();
            if !(13..=19).contains(&digits.len()) {
                continue;
            }
            let confidence = if luhn_valid(&digits) { 0.98 } else { 0.50 };
            out.push(entity(
                PiiKind::CreditCard,
                m.as_str(),
                m.start(),
                m.end(),
                confidence,
            ));
        }
    }

    fn collect_ips(&self, text: &str, out: &mut Vec<PiiEntity>) {
        let bytes = text.as_bytes();
        for m in self.ipv4.find_iter(text) {
            if !digit_bounded(text, m.start(), m.end()) {
                continue;
            }
            // Reject candidates embedded in a longer dotted run such as a
            // version string ("1.2.3.4.5").
            let continues_left = m.start() >= 2
                && bytes[m.start() - 1] == b'.'
                && bytes[m.start() - 2].is_ascii_digit();
            let continues_right = bytes.get(m.end()) == Some(&b'.')
                && bytes.get(m.end() + 1).is_some_and(u8::is_ascii_digit);
            if continues_left || continues_right {
                continue;
            }
            if m.as_str().split('.').all(|o| o.parse::<u16>().is_ok_and(|v| v <= 255)) {
                out.push(entity(
                    PiiKind::IpAddress,
                    m.as_str(),
                    m.start(),
                    m.end(),
                    0.90,
                ));
            }
        }

        for m in self.ipv6.find_iter(text) {
            if m.as_str().parse::<std::net::Ipv6Addr>().is_ok() {
                out.push(entity(
                    PiiKind::IpAddress,
                    m.as_str(),
                    m.start(),
                    m.end(),
                    0.85,
                ));
            }
        }
    }

    fn collect_urls(&self, text: &str, out: &mut Vec<PiiEntity>) {
        for m in self.url.find_iter(text) {
            out.push(entity(PiiKind::Url, m.as_str(), m.start(), m.end(), 0.90));
        }
    }
}

fn entity(kind: PiiKind, value: &str, start: usize, end: usize, confidence: f32) -> PiiEntity {
    PiiEntity {
        kind,
        value: value.to_string(),
        confidence,
        start,
        end,
    }
}

// ── Validators ─────────────────────────────────────────────────────────

/// The candidate must not sit inside a longer digit run.
fn digit_bounded(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    let prev_ok = start == 0 || !bytes[start - 1].is_ascii_digit();
    let next_ok = end >= bytes.len() || !bytes[end].is_ascii_digit();
    prev_ok && next_ok
}

fn count_digits(s: &str) -> usize {
    s.bytes().filter(u8::is_ascii_digit).count()
}

/// Reject only obviously-invalid SSNs: area 000/666, group 00, serial 0000.
fn ssn_parts_valid(area: &str, group: &str, serial: &str) -> bool {
    area != "000" && area != "666" && group != "00" && serial != "0000"
}

/// Whether "ssn" or "social security" appears within the context window
/// around `start..end`.
fn ssn_context_nearby(text: &str, start: usize, end: usize) -> bool {
    let mut lo = start.saturating_sub(SSN_CONTEXT_WINDOW);
    while !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + SSN_CONTEXT_WINDOW).min(text.len());
    while !text.is_char_boundary(hi) {
        hi += 1;
    }
    let window = text[lo..hi].to_lowercase();
    window.contains("ssn") || window.contains("social security")
}

/// Mod-10 checksum over the card digits.
fn luhn_valid(digits: &[u8]) -> bool {
    let mut sum = 0u32;
    let mut double = false;
    for &d in digits.iter().rev() {
        let mut v = u32::from(d);
        if double {
            v *= 2;
            if v > 9 {
                v -= 9;
            }
        }
        sum += v;
        double = !double;
    }
    sum % 10 == 0
}

// ── Overlap resolution ─────────────────────────────────────────────────

/// Keep the longer entity wherever byte spans overlap (ties break to the
/// earlier start), drop sub-threshold entities, and sort by start.
fn resolve_overlaps(mut candidates: Vec<PiiEntity>) -> Vec<PiiEntity> {
    candidates.retain(|e| e.confidence >= MIN_CONFIDENCE);
    candidates.sort_by(|a, b| b.len().cmp(&a.len()).then(a.start.cmp(&b.start)));

    let mut kept: Vec<PiiEntity> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !kept.iter().any(|k| k.overlaps(&candidate)) {
            kept.push(candidate);
        }
    }

    kept.sort_by_key(|e| e.start);
    kept
}

// ── Tests ──────────────────────────────────────────────────────────────
