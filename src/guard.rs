//! The [`LlmGuard`] entry point: configured pipelines for the input and
//! output sides, a shared cache, and process metrics.
//!
//! `LlmGuard::new` is the explicit initialisation point: it compiles all
//! detectors, builds both pipelines, creates the cache (when enabled),
//! and, when called inside a Tokio runtime, spawns the periodic cache
//! sweep. [`LlmGuard::shutdown`] stops the sweep again; tests use it for
//! deterministic teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cache::{CacheStats, GuardCache};
use crate::config::GuardConfig;
use crate::detectors::data_leakage::{DataLeakageConfig, DataLeakageDetector};
use crate::detectors::jailbreak::{JailbreakConfig, JailbreakDetector};
use crate::detectors::patterns::PatternError;
use crate::detectors::prompt_injection::{PromptInjectionConfig, PromptInjectionDetector};
use crate::detectors::Detector;
use crate::error::GuardError;
use crate::pii::redactor::{PiiRedactor, RedactionOptions, RedactionStrategy};
use crate::pii::scanner::PiiScanner;
use crate::pii::PiiEntity;
use crate::pipeline::{
    FailureKind, Pipeline, PipelineFailure, PipelineOptions, PipelineResult, sanitize,
};
use crate::telemetry::{MetricsAggregator, TelemetrySink, TracingSink};

// ── LlmGuard ───────────────────────────────────────────────────────────

/// Application-embedded AI firewall.
///
/// Cheap to clone: pipelines, cache, and metrics are `Arc`-shared, so a
/// clone validates through the same process-wide state.
///
/// ```rust,ignore
/// let guard = LlmGuard::new(GuardConfig::default())?;
/// let text = guard.validate_input("What's the weather tomorrow?")?;
/// ```
#[derive(Debug, Clone)]
pub struct LlmGuard {
    config: GuardConfig,
    input_pipeline: Pipeline,
    output_pipeline: Pipeline,
    cache: Option<Arc<GuardCache>>,
    metrics: Arc<MetricsAggregator>,
    pii_scanner: Arc<PiiScanner>,
    cleanup: Option<Arc<tokio::task::JoinHandle<()>>>,
}

impl LlmGuard {
    /// Build a guard from a validated configuration.
    ///
    /// When called inside a Tokio runtime with caching enabled, the
    /// periodic cache sweep starts immediately; otherwise the host can
    /// rely on the synchronous [`GuardCache::trigger_cleanup`] path.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::PatternCompilation`] if any detector
    /// catalogue fails to compile.
    pub fn new(config: GuardConfig) -> Result<Self, GuardError> {
        let metrics = Arc::new(MetricsAggregator::new());
        let sinks: Vec<Arc<dyn TelemetrySink>> = vec![
            Arc::new(TracingSink),
            Arc::clone(&metrics) as Arc<dyn TelemetrySink>,
        ];

        let cache = config
            .caching
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| Arc::new(GuardCache::new(c)));

        let cleanup = match (&cache, &config.caching) {
            (Some(cache), Some(caching)) if tokio::runtime::Handle::try_current().is_ok() => {
                Some(Arc::new(cache.spawn_cleanup(Duration::from_secs(
                    caching.cleanup_interval_seconds,
                ))))
            }
            _ => None,
        };

        let options = PipelineOptions::new()
            .confidence_threshold(config.confidence_threshold)
            .caching(config.caching.clone());

        let input_pipeline = Self::build_pipeline(
            &config,
            &config.input_detector_ids(),
            options.clone(),
            cache.as_ref(),
            &sinks,
        )?;
        let output_pipeline = Self::build_pipeline(
            &config,
            &config.output_detector_ids(),
            options,
            cache.as_ref(),
            &sinks,
        )?;

        Ok(Self {
            config,
            input_pipeline,
            output_pipeline,
            cache,
            metrics,
            pii_scanner: Arc::new(PiiScanner::new()?),
            cleanup,
        })
    }

    fn build_pipeline(
        config: &GuardConfig,
        detector_ids: &[&str],
        options: PipelineOptions,
        cache: Option<&Arc<GuardCache>>,
        sinks: &[Arc<dyn TelemetrySink>],
    ) -> Result<Pipeline, PatternError> {
        let mut builder = Pipeline::builder().options(options);
        for id in detector_ids {
            builder = builder.add_shared_detector(Self::build_detector(config, id)?);
        }
        if let Some(cache) = cache {
            builder = builder.cache(Arc::clone(cache));
        }
        for sink in sinks {
            builder = builder.add_sink(Arc::clone(sink));
        }
        Ok(builder.build())
    }

    fn build_detector(
        config: &GuardConfig,
        id: &str,
    ) -> Result<Arc<dyn Detector>, PatternError> {
        let threshold = config.confidence_threshold;
        Ok(match id {
            "prompt_injection" => Arc::new(PromptInjectionDetector::new(
                PromptInjectionConfig::new().confidence_threshold(threshold),
            )?),
            "jailbreak" => Arc::new(JailbreakDetector::new(
                JailbreakConfig::new().confidence_threshold(threshold),
            )?),
            // Config validation already resolved the ID set, so anything
            // else here is data_leakage.
            _ => Arc::new(DataLeakageDetector::new(
                DataLeakageConfig::new().confidence_threshold(threshold),
            )?),
        })
    }

    /// The validated configuration this guard runs with.
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Process metrics collected from pipeline telemetry.
    #[must_use]
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Cache statistics, when caching is enabled.
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    // ── Validation entry points ────────────────────────────────────

    /// Length-check and screen a user input before it reaches the model.
    ///
    /// # Errors
    ///
    /// - [`GuardError::InputTooLong`] when the size check fails.
    /// - [`GuardError::Detected`] when a detector flags the text.
    /// - [`GuardError::PipelineError`] / [`GuardError::PipelineTimeout`]
    ///   when the pipeline could not complete.
    pub fn validate_input(&self, text: &str) -> Result<String, GuardError> {
        let sanitized = sanitize(
            text,
            self.config.max_input_length,
            self.input_pipeline.options().trim_whitespace,
        )
        .map_err(|v| GuardError::InputTooLong {
            max: v.max,
            actual: v.actual,
        })?
        .into_owned();

        let result = self.input_pipeline.run(&sanitized);
        classify(sanitized, result)
    }

    /// Length-check and screen a model output before it reaches the user.
    ///
    /// # Errors
    ///
    /// Same shapes as [`validate_input`](Self::validate_input), with
    /// [`GuardError::OutputTooLong`] for the size check.
    pub fn validate_output(&self, text: &str) -> Result<String, GuardError> {
        let sanitized = sanitize(
            text,
            self.config.max_output_length,
            self.output_pipeline.options().trim_whitespace,
        )
        .map_err(|v| GuardError::OutputTooLong {
            max: v.max,
            actual: v.actual,
        })?
        .into_owned();

        let result = self.output_pipeline.run(&sanitized);
        classify(sanitized, result)
    }

    /// Validate many inputs concurrently, preserving input order.
    ///
    /// Concurrency is bounded at twice the available parallelism; each
    /// element is an independent [`validate_input`](Self::validate_input).
    pub async fn validate_batch(&self, texts: Vec<String>) -> Vec<Result<String, GuardError>> {
        let limit = 2 * std::thread::available_parallelism().map_or(1, |n| n.get());
        let semaphore = Arc::new(Semaphore::new(limit));

        let mut handles = Vec::with_capacity(texts.len());
        for text in texts {
            let guard = self.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // Acquisition only fails if the semaphore is closed,
                // which never happens here.
                let _permit = semaphore.acquire_owned().await.ok();
                guard.validate_input(&text)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(aborted_task_error(&join_error.to_string())),
            });
        }
        results
    }

    // ── PII convenience passthroughs ───────────────────────────────

    /// Scan arbitrary text for PII without running the pipeline.
    #[must_use]
    pub fn scan_pii(&self, text: &str) -> Vec<PiiEntity> {
        self.pii_scanner.scan(text)
    }

    /// Scan and redact in one step with the given strategy.
    #[must_use]
    pub fn redact_pii(&self, text: &str, strategy: RedactionStrategy) -> String {
        let entities = self.pii_scanner.scan(text);
        PiiRedactor::new(RedactionOptions::with_strategy(strategy)).redact(text, &entities)
    }

    /// Current metrics rendered in Prometheus text format.
    #[must_use]
    pub fn prometheus_metrics(&self) -> String {
        self.metrics.prometheus_metrics()
    }

    /// Stop the background cache sweep, if one is running.
    pub fn shutdown(&self) {
        if let Some(cleanup) = &self.cleanup {
            cleanup.abort();
        }
    }
}

/// Map a finished pipeline run onto the public result shape.
///
/// Detection outranks timeout outranks detector error: a threat found
/// before the budget expired is still a threat.
fn classify(text: String, result: PipelineResult) -> Result<String, GuardError> {
    if let Some(top) = result.top_detection() {
        let reason = top.category.clone();
        let confidence = top.confidence;
        return Err(GuardError::Detected {
            reason,
            confidence,
            result: Box::new(result),
        });
    }

    match &result.error {
        Some(PipelineFailure {
            kind: FailureKind::Timeout,
            ..
        }) => Err(GuardError::PipelineTimeout {
            elapsed_ms: result.total_duration_ms,
            result: Box::new(result),
        }),
        Some(failure) => {
            let reason = match &failure.detector_id {
                Some(id) => format!("detector '{id}' failed: {}", failure.message),
                None => failure.message.clone(),
            };
            Err(GuardError::PipelineError {
                reason,
                result: Box::new(result),
            })
        }
        None => Ok(text),
    }
}

/// Synthesise a failure result for a batch task the runtime lost.
fn aborted_task_error(message: &str) -> GuardError {
    GuardError::PipelineError {
        reason: format!("batch task failed: {message}"),
        result: Box::new(PipelineResult {
            input: String::new(),
            safe: false,
            detections: Vec::new(),
            detector_results: Vec::new(),
            total_duration: Duration::ZERO,
            total_duration_ms: 0,
            error: Some(PipelineFailure {
                kind: FailureKind::DetectorError,
                detector_id: None,
                message: message.to_string(),
            }),
        }),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
