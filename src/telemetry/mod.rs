//! Structured telemetry events and the metrics aggregator.
//!
//! The pipeline emits three event shapes ([`GuardEvent`]) to every
//! registered [`TelemetrySink`]. Two sinks ship with the crate:
//! [`TracingSink`] renders events as `tracing` records, and
//! [`MetricsAggregator`] folds them into counters plus a bounded latency
//! ring buffer, exported on demand in Prometheus text format.
//! Percentiles are never computed on the hot path.

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Capacity of the latency ring buffer.
const RING_CAPACITY: usize = 1_000;

// ── Events ─────────────────────────────────────────────────────────────

/// Which cache tier a [`GuardEvent::CacheAccess`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// The compiled-pattern map.
    Pattern,
    /// The detector-result map.
    Result,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern => write!(f, "pattern"),
            Self::Result => write!(f, "result"),
        }
    }
}

/// A structured telemetry event emitted by the pipeline.
#[derive(Debug, Clone)]
pub enum GuardEvent {
    /// A full pipeline run finished.
    PipelineComplete {
        /// Native wall time of the run.
        duration: Duration,
        /// Wall time in integer milliseconds.
        duration_ms: u64,
        /// Whether the run ended with no promoted detection and no error.
        safe: bool,
        /// How many detectors executed (cache hits included).
        detector_count: usize,
        /// How many detections were promoted past the threshold.
        detection_count: usize,
        /// Failure label when the run errored (`"detector_error"`,
        /// `"timeout"`), else `None`.
        error: Option<String>,
    },
    /// One detector invocation finished (re-emitted on cache hits so
    /// downstream counters stay comparable).
    DetectorComplete {
        /// Detector ID.
        detector: String,
        /// Native wall time of the invocation.
        duration: Duration,
        /// Whether the detector found a threat.
        detected: bool,
        /// Category of the detection, when present.
        category: Option<String>,
        /// Confidence of the detection, when present.
        confidence: Option<f32>,
    },
    /// One cache read happened.
    CacheAccess {
        /// Which tier was read.
        cache: CacheKind,
        /// Whether the read hit.
        hit: bool,
    },
}

// ── TelemetrySink ──────────────────────────────────────────────────────

/// Consumer of [`GuardEvent`]s.
///
/// Sinks must be cheap: they run inline on the request path.
pub trait TelemetrySink: Send + Sync {
    /// Consume one event.
    fn emit(&self, event: &GuardEvent);
}

/// Sink that renders events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &GuardEvent) {
        match event {
            GuardEvent::PipelineComplete {
                duration_ms,
                safe,
                detector_count,
                detection_count,
                error,
                ..
            } => {
                tracing::info!(
                    duration_ms,
                    safe,
                    detector_count,
                    detection_count,
                    error = error.as_deref(),
                    "pipeline.complete",
                );
            }
            GuardEvent::DetectorComplete {
                detector,
                duration,
                detected,
                category,
                confidence,
            } => {
                tracing::debug!(
                    detector,
                    duration_us = duration.as_micros() as u64,
                    detected,
                    category = category.as_deref(),
                    confidence,
                    "detector.complete",
                );
            }
            GuardEvent::CacheAccess { cache, hit } => {
                tracing::trace!(cache_type = %cache, hit, "cache.access");
            }
        }
    }
}

// ── MetricsAggregator ──────────────────────────────────────────────────

/// Folds telemetry events into counters and bounded latency samples.
///
/// Implements [`TelemetrySink`], so it can be registered next to any
/// other sink. All counters are atomics; the ring buffer takes a short
/// mutex only on pipeline completion.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    requests_total: AtomicU64,
    requests_safe: AtomicU64,
    requests_detected: AtomicU64,
    requests_error: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    detections: DashMap<(String, String), u64>,
    errors: DashMap<String, u64>,
    latencies_ms: Mutex<VecDeque<u64>>,
}

impl MetricsAggregator {
    /// A fresh aggregator with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Nearest-rank percentile over the buffered latency samples, in
    /// milliseconds. Returns 0.0 with no samples.
    #[must_use]
    pub fn latency_percentile(&self, percentile: f64) -> f64 {
        let samples = self.latencies_ms.lock().expect("latency buffer poisoned");
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        drop(samples);
        sorted.sort_unstable();

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        #[allow(clippy::cast_precision_loss)]
        let value = sorted[rank.clamp(1, sorted.len()) - 1] as f64;
        value
    }

    /// Total requests observed.
    #[must_use]
    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Detection count for a `(detector, category)` pair.
    #[must_use]
    pub fn detections_for(&self, detector: &str, category: &str) -> u64 {
        self.detections
            .get(&(detector.to_string(), category.to_string()))
            .map_or(0, |c| *c)
    }

    /// Render all metrics in Prometheus text exposition format.
    #[must_use]
    #[allow(clippy::missing_panics_doc)] // writing to a String is infallible
    pub fn prometheus_metrics(&self) -> String {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let safe = self.requests_safe.load(Ordering::Relaxed);
        let detected = self.requests_detected.load(Ordering::Relaxed);
        let error = self.requests_error.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        let cache_hit_rate = if cache_hits + cache_misses == 0 {
            0.0
        } else {
            cache_hits as f64 / (cache_hits + cache_misses) as f64
        };

        let mut out = String::with_capacity(1024);

        out.push_str("# HELP llm_guard_requests_total Total validation requests.\n");
        out.push_str("# TYPE llm_guard_requests_total counter\n");
        let _ = writeln!(out, "llm_guard_requests_total {requests_total}");

        for (name, value) in [
            ("llm_guard_requests_safe", safe),
            ("llm_guard_requests_detected", detected),
            ("llm_guard_requests_error", error),
        ] {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        for (name, percentile) in [
            ("llm_guard_latency_p50_milliseconds", 50.0),
            ("llm_guard_latency_p95_milliseconds", 95.0),
            ("llm_guard_latency_p99_milliseconds", 99.0),
        ] {
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {}", self.latency_percentile(percentile));
        }

        out.push_str("# TYPE llm_guard_cache_hits_total counter\n");
        let _ = writeln!(out, "llm_guard_cache_hits_total {cache_hits}");
        out.push_str("# TYPE llm_guard_cache_misses_total counter\n");
        let _ = writeln!(out, "llm_guard_cache_misses_total {cache_misses}");
        out.push_str("# TYPE llm_guard_cache_hit_rate gauge\n");
        let _ = writeln!(out, "llm_guard_cache_hit_rate {cache_hit_rate}");

        out.push_str("# TYPE llm_guard_detections_total counter\n");
        for entry in &self.detections {
            let (detector, category) = entry.key();
            let _ = writeln!(
                out,
                "llm_guard_detections_total{{detector=\"{detector}\",category=\"{category}\"}} {}",
                entry.value(),
            );
        }

        out.push_str("# TYPE llm_guard_errors_total counter\n");
        for entry in &self.errors {
            let _ = writeln!(
                out,
                "llm_guard_errors_total{{error_type=\"{}\"}} {}",
                entry.key(),
                entry.value(),
            );
        }

        out
    }
}

impl TelemetrySink for MetricsAggregator {
    fn emit(&self, event: &GuardEvent) {
        match event {
            GuardEvent::PipelineComplete {
                duration_ms,
                safe,
                detection_count,
                error,
                ..
            } => {
                self.requests_total.fetch_add(1, Ordering::Relaxed);
                if let Some(kind) = error {
                    self.requests_error.fetch_add(1, Ordering::Relaxed);
                    *self.errors.entry(kind.clone()).or_insert(0) += 1;
                } else if *safe {
                    self.requests_safe.fetch_add(1, Ordering::Relaxed);
                }
                if *detection_count > 0 {
                    self.requests_detected.fetch_add(1, Ordering::Relaxed);
                }

                let mut samples = self.latencies_ms.lock().expect("latency buffer poisoned");
                if samples.len() == RING_CAPACITY {
                    samples.pop_front();
                }
                samples.push_back(*duration_ms);
            }
            GuardEvent::DetectorComplete {
                detector,
                detected,
                category,
                ..
            } => {
                if *detected {
                    let category = category.clone().unwrap_or_else(|| "unknown".to_string());
                    *self
                        .detections
                        .entry((detector.clone(), category))
                        .or_insert(0) += 1;
                }
            }
            GuardEvent::CacheAccess { hit, .. } => {
                if *hit {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_event(duration_ms: u64, safe: bool, detections: usize) -> GuardEvent {
        GuardEvent::PipelineComplete {
            duration: Duration::from_millis(duration_ms),
            duration_ms,
            safe,
            detector_count: 2,
            detection_count: detections,
            error: None,
        }
    }

    #[test]
    fn request_counters_split_by_outcome() {
        let metrics = MetricsAggregator::new();
        metrics.emit(&pipeline_event(5, true, 0));
        metrics.emit(&pipeline_event(7, false, 1));
        metrics.emit(&GuardEvent::PipelineComplete {
            duration: Duration::from_millis(3),
            duration_ms: 3,
            safe: false,
            detector_count: 1,
            detection_count: 0,
            error: Some("detector_error".to_string()),
        });

        assert_eq!(metrics.requests_total(), 3);
        let text = metrics.prometheus_metrics();
        assert!(text.contains("llm_guard_requests_safe 1"));
        assert!(text.contains("llm_guard_requests_detected 1"));
        assert!(text.contains("llm_guard_requests_error 1"));
        assert!(text.contains("llm_guard_errors_total{error_type=\"detector_error\"} 1"));
    }

    #[test]
    fn percentiles_nearest_rank() {
        let metrics = MetricsAggregator::new();
        for ms in 1..=100 {
            metrics.emit(&pipeline_event(ms, true, 0));
        }
        assert!((metrics.latency_percentile(50.0) - 50.0).abs() < f64::EPSILON);
        assert!((metrics.latency_percentile(95.0) - 95.0).abs() < f64::EPSILON);
        assert!((metrics.latency_percentile(99.0) - 99.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let metrics = MetricsAggregator::new();
        for ms in 0..2_000 {
            metrics.emit(&pipeline_event(ms, true, 0));
        }
        // Only the newest 1000 samples remain: 1000..1999.
        assert!((metrics.latency_percentile(0.1) - 1_000.0).abs() < f64::EPSILON);
        assert!((metrics.latency_percentile(100.0) - 1_999.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_percentile_is_zero() {
        let metrics = MetricsAggregator::new();
        assert_eq!(metrics.latency_percentile(99.0), 0.0);
    }

    #[test]
    fn detection_counters_keyed_by_detector_and_category() {
        let metrics = MetricsAggregator::new();
        metrics.emit(&GuardEvent::DetectorComplete {
            detector: "prompt_injection".to_string(),
            duration: Duration::from_micros(80),
            detected: true,
            category: Some("instruction_override".to_string()),
            confidence: Some(0.95),
        });
        metrics.emit(&GuardEvent::DetectorComplete {
            detector: "prompt_injection".to_string(),
            duration: Duration::from_micros(90),
            detected: false,
            category: None,
            confidence: None,
        });

        assert_eq!(
            metrics.detections_for("prompt_injection", "instruction_override"),
            1,
        );
        let text = metrics.prometheus_metrics();
        assert!(text.contains(
            "llm_guard_detections_total{detector=\"prompt_injection\",category=\"instruction_override\"} 1"
        ));
    }

    #[test]
    fn cache_hit_rate_reflects_accesses() {
        let metrics = MetricsAggregator::new();
        metrics.emit(&GuardEvent::CacheAccess {
            cache: CacheKind::Result,
            hit: true,
        });
        metrics.emit(&GuardEvent::CacheAccess {
            cache: CacheKind::Result,
            hit: false,
        });

        let text = metrics.prometheus_metrics();
        assert!(text.contains("llm_guard_cache_hits_total 1"));
        assert!(text.contains("llm_guard_cache_misses_total 1"));
        assert!(text.contains("llm_guard_cache_hit_rate 0.5"));
    }
}
