//! Detector orchestration: ordered execution, early termination, error
//! isolation, result caching, and telemetry.
//!
//! # Execution model
//!
//! 1. Detectors run sequentially in declared order.
//! 2. Each invocation is wrapped in a panic guard; a panicking detector
//!    becomes a [`DetectorOutcome::Error`] record, never an unwind.
//! 3. A detection at or above the confidence threshold is promoted into
//!    the result's `detections` and, with `early_termination`, stops the
//!    loop. Sub-threshold detections are recorded but do not trigger.
//! 4. With result caching active, each detector is looked up under
//!    `(sha256(input), detector_id)` first; hits are replayed verbatim,
//!    including their `detector.complete` telemetry.
//! 5. The timeout is advisory: it is checked between detectors, and an
//!    expired budget stops the loop while keeping partial results.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::{GuardCache, hash_input};
use crate::config::CachingConfig;
use crate::detectors::{DetectionDetails, Detector, DetectorOutcome, DetectorResult};
use crate::telemetry::{CacheKind, GuardEvent, TelemetrySink};

// ── PipelineOptions ────────────────────────────────────────────────────

/// Runtime options for one pipeline instance.
///
/// Uses a builder pattern; all setters are `#[must_use]`.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Stop at the first detection at or above threshold (default `true`).
    pub early_termination: bool,
    /// Keep running after a detector failure (default `false`).
    pub continue_on_error: bool,
    /// Threshold promoting a detection into the final result (default 0.7).
    pub confidence_threshold: f32,
    /// Advisory wall-time budget for the whole run (default 5 s).
    pub timeout: Duration,
    /// Trim surrounding whitespace during sanitisation (default `false`).
    pub trim_whitespace: bool,
    /// Caching section; `None` disables cache consultation.
    pub caching: Option<CachingConfig>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            early_termination: true,
            continue_on_error: false,
            confidence_threshold: 0.7,
            timeout: Duration::from_millis(5_000),
            trim_whitespace: false,
            caching: None,
        }
    }
}

impl PipelineOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable early termination.
    #[must_use]
    pub fn early_termination(mut self, enabled: bool) -> Self {
        self.early_termination = enabled;
        self
    }

    /// Keep running after a detector failure.
    #[must_use]
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Set the promotion threshold.
    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Set the advisory timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Trim surrounding whitespace during sanitisation.
    #[must_use]
    pub fn trim_whitespace(mut self, enabled: bool) -> Self {
        self.trim_whitespace = enabled;
        self
    }

    /// Set the caching section.
    #[must_use]
    pub fn caching(mut self, caching: Option<CachingConfig>) -> Self {
        self.caching = caching;
        self
    }
}

// ── Result types ───────────────────────────────────────────────────────

/// Post-threshold projection of one detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Detector that produced the detection.
    pub detector_id: String,
    /// Category of the strongest signal.
    pub category: String,
    /// Aggregated confidence.
    pub confidence: f32,
    /// Names of the matched patterns.
    pub patterns_matched: Vec<String>,
    /// Detector-specific metadata (scrubbed of raw values).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Detection {
    fn from_details(detector_id: &str, details: &DetectionDetails) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            category: details.category.clone(),
            confidence: details.confidence,
            patterns_matched: details.patterns_matched.clone(),
            metadata: details.metadata.clone(),
        }
    }
}

/// Why a pipeline run ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A detector failed and `continue_on_error` was off.
    DetectorError,
    /// The advisory time budget ran out.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DetectorError => write!(f, "detector_error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Failure record attached to a [`PipelineResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// The detector involved, when applicable.
    pub detector_id: Option<String>,
    /// Human-readable message.
    pub message: String,
}

/// Outcome of one full pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// The (sanitised) input that was inspected.
    pub input: String,
    /// True iff no promoted detection and no unsuppressed error occurred.
    pub safe: bool,
    /// Detections at or above the threshold, in detector order.
    pub detections: Vec<Detection>,
    /// One record per detector invocation, in declared detector order.
    pub detector_results: Vec<DetectorResult>,
    /// Native wall time of the whole run.
    pub total_duration: Duration,
    /// Wall time in integer milliseconds.
    pub total_duration_ms: u64,
    /// Failure record when the run did not complete cleanly.
    pub error: Option<PipelineFailure>,
}

impl PipelineResult {
    /// The highest-confidence promoted detection, if any.
    #[must_use]
    pub fn top_detection(&self) -> Option<&Detection> {
        self.detections
            .iter()
            .reduce(|best, d| if d.confidence > best.confidence { d } else { best })
    }
}

// ── Sanitisation ───────────────────────────────────────────────────────

/// A size-check failure from [`sanitize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthViolation {
    /// The configured maximum (Unicode scalars).
    pub max: usize,
    /// The offending length (Unicode scalars).
    pub actual: usize,
}

/// Length-check (and optionally trim) a payload before the pipeline.
///
/// Lengths count Unicode scalars, not bytes. Trimming is applied before
/// the check, so a padded payload that fits once trimmed passes.
///
/// # Errors
///
/// Returns [`LengthViolation`] when the text is longer than
/// `max_length`.
pub fn sanitize(
    text: &str,
    max_length: usize,
    trim_whitespace: bool,
) -> Result<Cow<'_, str>, LengthViolation> {
    let candidate = if trim_whitespace { text.trim() } else { text };
    let actual = candidate.chars().count();
    if actual > max_length {
        return Err(LengthViolation {
            max: max_length,
            actual,
        });
    }
    Ok(Cow::Borrowed(candidate))
}

// ── Pipeline ───────────────────────────────────────────────────────────

/// Ordered composition of detectors with shared cache and telemetry.
///
/// Built via [`Pipeline::builder`]; cheap to clone (all parts are
/// `Arc`-shared).
#[derive(Clone)]
pub struct Pipeline {
    detectors: Vec<Arc<dyn Detector>>,
    options: PipelineOptions,
    cache: Option<Arc<GuardCache>>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.id()).collect::<Vec<_>>(),
            )
            .field("options", &self.options)
            .field("cached", &self.cache.is_some())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Pipeline {
    /// Start building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The configured options.
    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run every detector against `input` and assemble the result.
    #[must_use]
    pub fn run(&self, input: &str) -> PipelineResult {
        let started = Instant::now();
        let threshold = self.options.confidence_threshold;

        let caching_active = self.cache.is_some()
            && self
                .options
                .caching
                .as_ref()
                .is_some_and(|c| c.enabled && c.result_cache);
        let input_hash = caching_active.then(|| hash_input(input));

        let mut detector_results: Vec<DetectorResult> = Vec::with_capacity(self.detectors.len());
        let mut detections: Vec<Detection> = Vec::new();
        let mut error: Option<PipelineFailure> = None;

        for detector in &self.detectors {
            if started.elapsed() >= self.options.timeout {
                error = Some(PipelineFailure {
                    kind: FailureKind::Timeout,
                    detector_id: None,
                    message: format!(
                        "pipeline exceeded its {} ms budget",
                        self.options.timeout.as_millis(),
                    ),
                });
                break;
            }

            let id = detector.id();
            let mut from_cache = false;

            let result = match (&self.cache, &input_hash) {
                (Some(cache), Some(hash)) => match cache.get_result(hash, id) {
                    Some(cached) => {
                        self.emit(&GuardEvent::CacheAccess {
                            cache: CacheKind::Result,
                            hit: true,
                        });
                        from_cache = true;
                        cached
                    }
                    None => {
                        self.emit(&GuardEvent::CacheAccess {
                            cache: CacheKind::Result,
                            hit: false,
                        });
                        invoke_guarded(detector.as_ref(), input)
                    }
                },
                _ => invoke_guarded(detector.as_ref(), input),
            };

            if !from_cache
                && let (Some(cache), Some(hash)) = (&self.cache, &input_hash)
            {
                cache.put_result(hash, id, result.clone(), None);
            }

            // Re-emitted for cache hits as well, so downstream counters
            // see every logical invocation.
            let details = result.outcome.details();
            self.emit(&GuardEvent::DetectorComplete {
                detector: id.to_string(),
                duration: result.duration,
                detected: result.outcome.is_detected(),
                category: details.map(|d| d.category.clone()),
                confidence: details.map(|d| d.confidence),
            });

            let outcome = result.outcome.clone();
            detector_results.push(result);

            match outcome {
                DetectorOutcome::Safe { .. } => {}
                DetectorOutcome::Detected { details } => {
                    if details.confidence >= threshold {
                        detections.push(Detection::from_details(id, &details));
                        if self.options.early_termination {
                            break;
                        }
                    }
                }
                DetectorOutcome::Error { message } => {
                    tracing::warn!(detector = id, error = %message, "detector failed");
                    if !self.options.continue_on_error {
                        error = Some(PipelineFailure {
                            kind: FailureKind::DetectorError,
                            detector_id: Some(id.to_string()),
                            message,
                        });
                        break;
                    }
                }
            }
        }

        let total_duration = started.elapsed();
        #[allow(clippy::cast_possible_truncation)]
        let total_duration_ms = total_duration.as_millis() as u64;
        let safe = detections.is_empty() && error.is_none();

        self.emit(&GuardEvent::PipelineComplete {
            duration: total_duration,
            duration_ms: total_duration_ms,
            safe,
            detector_count: detector_results.len(),
            detection_count: detections.len(),
            error: error.as_ref().map(|e| e.kind.to_string()),
        });

        PipelineResult {
            input: input.to_string(),
            safe,
            detections,
            detector_results,
            total_duration,
            total_duration_ms,
            error,
        }
    }

    fn emit(&self, event: &GuardEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Invoke a detector under a panic guard, measuring wall time on the
/// monotonic clock.
fn invoke_guarded(detector: &dyn Detector, input: &str) -> DetectorResult {
    let started = Instant::now();
    let caught =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| detector.detect(input)));
    let duration = started.elapsed();

    let outcome = match caught {
        Ok(verdict) => verdict.into(),
        Err(payload) => DetectorOutcome::Error {
            message: panic_message(payload.as_ref()),
        },
    };

    #[allow(clippy::cast_possible_truncation)]
    DetectorResult {
        detector_id: detector.id().to_string(),
        outcome,
        duration,
        duration_ms: duration.as_millis() as u64,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "detector panicked".to_string()
    }
}

// ── PipelineBuilder ────────────────────────────────────────────────────

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    detectors: Vec<Arc<dyn Detector>>,
    options: PipelineOptions,
    cache: Option<Arc<GuardCache>>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl PipelineBuilder {
    /// Append a detector; execution order is insertion order.
    #[must_use]
    pub fn add_detector(mut self, detector: impl Detector + 'static) -> Self {
        self.detectors.push(Arc::new(detector));
        self
    }

    /// Append a pre-wrapped detector.
    #[must_use]
    pub fn add_shared_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Set the runtime options.
    #[must_use]
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach the shared cache.
    #[must_use]
    pub fn cache(mut self, cache: Arc<GuardCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register a telemetry sink.
    #[must_use]
    pub fn add_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            detectors: self.detectors,
            options: self.options,
            cache: self.cache,
            sinks: self.sinks,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::Verdict;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticDetector {
        id: &'static str,
        confidence: Option<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl StaticDetector {
        fn safe(id: &'static str) -> Self {
            Self {
                id,
                confidence: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn detecting(id: &'static str, confidence: f32) -> Self {
            Self {
                id,
                confidence: Some(confidence),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn call_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    impl Detector for StaticDetector {
        fn id(&self) -> &'static str {
            self.id
        }
        fn description(&self) -> &'static str {
            "test detector"
        }
        fn detect(&self, _input: &str) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.confidence {
                None => Verdict::safe(),
                Some(confidence) => Verdict::Detected(DetectionDetails {
                    confidence,
                    category: "test_category".to_string(),
                    patterns_matched: vec!["test_pattern".to_string()],
                    metadata: serde_json::Map::new(),
                }),
            }
        }
    }

    struct PanickingDetector;

    impl Detector for PanickingDetector {
        fn id(&self) -> &'static str {
            "panicky"
        }
        fn description(&self) -> &'static str {
            "always panics"
        }
        fn detect(&self, _input: &str) -> Verdict {
            panic!("kaboom");
        }
    }

    #[test]
    fn results_follow_declared_order() {
        let pipeline = Pipeline::builder()
            .add_detector(StaticDetector::safe("first"))
            .add_detector(StaticDetector::safe("second"))
            .add_detector(StaticDetector::safe("third"))
            .build();

        let result = pipeline.run("hello");
        let ids: Vec<_> = result
            .detector_results
            .iter()
            .map(|r| r.detector_id.as_str())
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert!(result.safe);
        assert!(result.error.is_none());
    }

    #[test]
    fn early_termination_skips_later_detectors() {
        let tail = StaticDetector::safe("tail");
        let tail_calls = tail.call_counter();
        let pipeline = Pipeline::builder()
            .add_detector(StaticDetector::detecting("hot", 0.9))
            .add_detector(tail)
            .build();

        let result = pipeline.run("x");
        assert!(!result.safe);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detector_results.len(), 1);
        assert_eq!(tail_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn early_termination_off_runs_everything() {
        let pipeline = Pipeline::builder()
            .add_detector(StaticDetector::detecting("hot", 0.9))
            .add_detector(StaticDetector::safe("tail"))
            .options(PipelineOptions::new().early_termination(false))
            .build();

        let result = pipeline.run("x");
        assert_eq!(result.detector_results.len(), 2);
        assert_eq!(result.detections.len(), 1);
    }

    #[test]
    fn below_threshold_detection_recorded_but_not_promoted() {
        let pipeline = Pipeline::builder()
            .add_detector(StaticDetector::detecting("weak", 0.4))
            .add_detector(StaticDetector::safe("tail"))
            .build();

        let result = pipeline.run("x");
        assert!(result.safe, "sub-threshold detection must not flip safety");
        assert!(result.detections.is_empty());
        assert_eq!(result.detector_results.len(), 2);
        assert!(result.detector_results[0].outcome.is_detected());
    }

    #[test]
    fn panic_is_contained_and_halts_by_default() {
        let pipeline = Pipeline::builder()
            .add_detector(PanickingDetector)
            .add_detector(StaticDetector::safe("after"))
            .build();

        let result = pipeline.run("x");
        assert!(!result.safe);
        assert_eq!(result.detector_results.len(), 1);
        assert!(result.detector_results[0].outcome.is_error());

        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::DetectorError);
        assert_eq!(failure.detector_id.as_deref(), Some("panicky"));
        assert!(failure.message.contains("kaboom"));
    }

    #[test]
    fn continue_on_error_keeps_going() {
        let pipeline = Pipeline::builder()
            .add_detector(PanickingDetector)
            .add_detector(StaticDetector::safe("after"))
            .options(PipelineOptions::new().continue_on_error(true))
            .build();

        let result = pipeline.run("x");
        assert!(result.safe, "suppressed error leaves the run safe");
        assert!(result.error.is_none());
        assert_eq!(result.detector_results.len(), 2);
        assert!(result.detector_results[0].outcome.is_error());
    }

    #[test]
    fn zero_timeout_reports_timeout_with_partial_results() {
        let pipeline = Pipeline::builder()
            .add_detector(StaticDetector::safe("never_runs"))
            .options(PipelineOptions::new().timeout(Duration::ZERO))
            .build();

        let result = pipeline.run("x");
        assert!(!result.safe);
        assert!(result.detector_results.is_empty());
        assert_eq!(result.error.unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn cache_hit_skips_re_execution() {
        let caching = CachingConfig::default();
        let cache = Arc::new(GuardCache::new(&caching));

        let hot = StaticDetector::detecting("hot", 0.9);
        let calls = hot.call_counter();
        let pipeline = Pipeline::builder()
            .add_detector(hot)
            .options(PipelineOptions::new().caching(Some(caching)))
            .cache(Arc::clone(&cache))
            .build();

        let first = pipeline.run("same input");
        let second = pipeline.run("same input");

        assert_eq!(calls.load(Ordering::SeqCst), 1, "second run must be a hit");
        assert_eq!(first.detections.len(), second.detections.len());
        assert_eq!(
            first.detections[0].confidence,
            second.detections[0].confidence,
        );

        let stats = cache.stats();
        assert_eq!(stats.result_hits, 1);
        assert_eq!(stats.result_misses, 1);
    }

    #[test]
    fn distinct_inputs_do_not_share_cache_entries() {
        let caching = CachingConfig::default();
        let cache = Arc::new(GuardCache::new(&caching));
        let d = StaticDetector::safe("probe");
        let calls = d.call_counter();
        let pipeline = Pipeline::builder()
            .add_detector(d)
            .options(PipelineOptions::new().caching(Some(caching)))
            .cache(cache)
            .build();

        pipeline.run("input a");
        pipeline.run("input b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sanitize_counts_scalars_not_bytes() {
        // Six scalars, eight bytes.
        let text = "héllö!";
        assert!(sanitize(text, 6, false).is_ok());

        let err = sanitize("1234567", 6, false).unwrap_err();
        assert_eq!(err, LengthViolation { max: 6, actual: 7 });
    }

    #[test]
    fn sanitize_trims_before_checking() {
        let padded = "  hello  ";
        assert!(sanitize(padded, 5, false).is_err());
        assert_eq!(sanitize(padded, 5, true).unwrap(), "hello");
    }

    #[test]
    fn top_detection_picks_highest_confidence() {
        let pipeline = Pipeline::builder()
            .add_detector(StaticDetector::detecting("a", 0.75))
            .add_detector(StaticDetector::detecting("b", 0.95))
            .options(PipelineOptions::new().early_termination(false))
            .build();

        let result = pipeline.run("x");
        assert_eq!(result.top_detection().unwrap().detector_id, "b");
    }
}
