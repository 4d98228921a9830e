//! Telemetry pipeline
//!
//! Two layers: the persisted span log (`telemetry_spans.jsonl`, one compact
//! JSON record per coordination event, appended under a file lock and never
//! rewritten in place) and the ambient tracing/OTEL subscriber stack shared
//! by both binaries. Span-log writer failures are non-fatal; coordination
//! operations never abort because telemetry could not be recorded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    trace::{Config as SdkTraceConfig, TracerProvider as SdkTracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::CoordinationConfig;
use crate::id::IdMinter;
use crate::store::{ArchiveOutcome, Store};
use crate::{OperationContext, SwarmError, SwarmResult};

/// Span lifecycle status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Started,
    Completed,
    Error,
}

/// One telemetry record, one line of the span log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    #[serde(rename = "service.name")]
    pub service_name: String,
    #[serde(rename = "service.version")]
    pub service_version: String,
    pub start_time_ns: u64,
    pub duration_ms: u64,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, String>,
}

/// Span sampling policy; the default records everything.
#[derive(Debug, Clone, Copy)]
pub enum SamplingPolicy {
    RecordAll,
    /// Deterministic per-trace ratio in (0, 1]; keyed on the trace ID so a
    /// trace is sampled in full or not at all.
    Ratio(f64),
}

impl SamplingPolicy {
    fn admits(&self, trace_id: &str) -> bool {
        match self {
            SamplingPolicy::RecordAll => true,
            SamplingPolicy::Ratio(ratio) => {
                let bucket = u32::from_str_radix(trace_id.get(..8).unwrap_or("0"), 16)
                    .unwrap_or(0) as f64
                    / u32::MAX as f64;
                bucket < *ratio
            }
        }
    }
}

/// In-flight span; finished exactly once with [`SpanHandle::complete`] or
/// [`SpanHandle::fail`].
pub struct SpanHandle<'a> {
    emitter: &'a TelemetryEmitter,
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    operation_name: String,
    start_time_ns: u64,
    started: Instant,
    attributes: BTreeMap<String, String>,
}

impl SpanHandle<'_> {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn complete(self) {
        self.finish(SpanStatus::Completed);
    }

    pub fn fail(mut self, err: &SwarmError) {
        self.attributes
            .insert("error.kind".to_string(), err.kind().to_string());
        self.attributes
            .insert("error.message".to_string(), err.to_string());
        self.finish(SpanStatus::Error);
    }

    fn finish(self, status: SpanStatus) {
        let record = SpanRecord {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            operation_name: self.operation_name,
            service_name: self.emitter.service_name.clone(),
            service_version: self.emitter.service_version.clone(),
            start_time_ns: self.start_time_ns,
            duration_ms: self.started.elapsed().as_millis() as u64,
            status,
            attributes: self.attributes,
        };
        self.emitter.emit(&record);
    }
}

/// Builds and persists spans for every coordination event.
pub struct TelemetryEmitter {
    store: Arc<Store>,
    minter: Arc<IdMinter>,
    sampling: SamplingPolicy,
    service_name: String,
    service_version: String,
    span_retain: usize,
    max_fast_path: usize,
    emission_failures: AtomicU64,
}

impl TelemetryEmitter {
    pub fn new(store: Arc<Store>, minter: Arc<IdMinter>, config: Arc<CoordinationConfig>) -> Self {
        let sampling = if config.telemetry.sample_ratio >= 1.0 {
            SamplingPolicy::RecordAll
        } else {
            SamplingPolicy::Ratio(config.telemetry.sample_ratio)
        };
        Self {
            store,
            minter,
            sampling,
            service_name: config.telemetry.service_name.clone(),
            service_version: config.telemetry.service_version.clone(),
            span_retain: config.span_retain,
            max_fast_path: config.max_fast_path,
            emission_failures: AtomicU64::new(0),
        }
    }

    /// Open a span for `operation` under the context's trace. The caller's
    /// span id (if any) becomes this span's parent.
    pub fn start_span(&self, ctx: &OperationContext, operation: &str) -> SpanHandle<'_> {
        SpanHandle {
            emitter: self,
            trace_id: ctx.trace_id.clone(),
            span_id: self.minter.span_id(),
            parent_span_id: ctx.parent_span_id.clone(),
            operation_name: operation.to_string(),
            start_time_ns: IdMinter::wall_nanos(),
            started: Instant::now(),
            attributes: BTreeMap::new(),
        }
    }

    /// Append one record to the span log. Failures are logged and counted,
    /// never propagated.
    #[instrument(skip(self, record), fields(operation = %record.operation_name))]
    pub fn emit(&self, record: &SpanRecord) {
        if !self.sampling.admits(&record.trace_id) {
            return;
        }
        let path = self.store.spans_path();
        // Span appends use a fresh token: a cancelled operation still gets
        // its error span recorded.
        if let Err(e) = self
            .store
            .append_jsonl(&path, record, &crate::CancelToken::new())
        {
            self.emission_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("swarmsh_telemetry_emission_failures_total", 1);
            warn!(error = %e, operation = %record.operation_name, "span emission failed");
        } else {
            debug!(
                trace_id = %record.trace_id,
                span_id = %record.span_id,
                status = ?record.status,
                "span recorded"
            );
        }
    }

    /// Total spans currently in the primary log.
    pub fn span_count(&self) -> SwarmResult<usize> {
        self.store.jsonl_len(&self.store.spans_path())
    }

    pub fn emission_failures(&self) -> u64 {
        self.emission_failures.load(Ordering::Relaxed)
    }

    /// Read every span in the primary log; used by the dashboard and tests.
    pub fn read_spans(&self) -> SwarmResult<Vec<SpanRecord>> {
        self.store.read_jsonl(&self.store.spans_path())
    }

    /// Archive the span log down to the configured retention, and trim the
    /// fast-path claim log alongside it.
    #[instrument(skip(self, cancel))]
    pub fn archive(&self, cancel: &crate::CancelToken) -> SwarmResult<ArchiveOutcome> {
        let outcome = self.store.archive_jsonl(
            &self.store.spans_path(),
            "telemetry_archive",
            self.span_retain,
            cancel,
        )?;
        let fast = self.store.archive_jsonl(
            &self.store.fast_claims_path(),
            "fast_claims_archive",
            self.max_fast_path,
            cancel,
        )?;
        info!(
            spans_archived = outcome.archived,
            spans_retained = outcome.retained,
            fast_claims_archived = fast.archived,
            "telemetry archival complete"
        );
        Ok(outcome)
    }
}

/// Telemetry subscriber modes for the process-wide tracing stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryMode {
    /// Minimal stack for short-lived CLI invocations - compact stdout only.
    Lightweight,
    /// Development mode with pretty local output and optional file log.
    Development { log_file: Option<String> },
    /// Production mode - JSON logs, OTEL tracer, optional OTLP forwarding.
    Production { otlp_endpoint: Option<String> },
    Disabled,
}

impl Default for TelemetryMode {
    fn default() -> Self {
        Self::Lightweight
    }
}

/// Identity and subscriber configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub sample_ratio: f64,
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        let mode = match std::env::var("SWARMSH_TELEMETRY_MODE").as_deref() {
            Ok("development") => TelemetryMode::Development {
                log_file: std::env::var("SWARMSH_LOG_FILE").ok(),
            },
            Ok("production") => TelemetryMode::Production {
                otlp_endpoint: otlp_endpoint.clone(),
            },
            Ok("disabled") => TelemetryMode::Disabled,
            _ => TelemetryMode::Lightweight,
        };

        Self {
            mode,
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "swarmsh-core".to_string()),
            service_version: std::env::var("OTEL_SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            sample_ratio: std::env::var("OTEL_SAMPLE_RATIO")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
            otlp_endpoint,
        }
    }
}

/// Process-wide tracing/OTEL stack.
pub struct TelemetryManager {
    config: TelemetryConfig,
    tracer_provider: Option<SdkTracerProvider>,
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl TelemetryManager {
    pub async fn new() -> Result<Self> {
        Self::with_config(TelemetryConfig::default()).await
    }

    pub async fn with_config(config: TelemetryConfig) -> Result<Self> {
        let mut manager = Self {
            config,
            tracer_provider: None,
            _guard: None,
        };
        manager.initialize()?;
        Ok(manager)
    }

    /// Minimal manager for short-lived CLI invocations.
    pub async fn lightweight(service_name: &str) -> Result<Self> {
        let config = TelemetryConfig {
            mode: TelemetryMode::Lightweight,
            service_name: service_name.to_string(),
            ..TelemetryConfig::default()
        };
        Self::with_config(config).await
    }

    fn resource(&self) -> Resource {
        Resource::new(vec![
            KeyValue::new(SERVICE_NAME, self.config.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, self.config.service_version.clone()),
        ])
    }

    fn initialize(&mut self) -> Result<()> {
        match self.config.mode.clone() {
            TelemetryMode::Disabled => {
                debug!("telemetry disabled");
                Ok(())
            }
            TelemetryMode::Lightweight => self.init_lightweight(),
            TelemetryMode::Development { log_file } => self.init_development(log_file.as_deref()),
            TelemetryMode::Production { otlp_endpoint } => {
                self.init_production(otlp_endpoint.as_deref())
            }
        }
    }

    fn build_provider(&self) -> SdkTracerProvider {
        let builder = SdkTracerProvider::builder()
            .with_config(SdkTraceConfig::default().with_resource(self.resource()));
        #[cfg(feature = "stdout")]
        let builder = builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default());
        builder.build()
    }

    fn init_lightweight(&mut self) -> Result<()> {
        let provider = self.build_provider();
        // try_init: a second manager in the same process (tests, embedded
        // use) keeps the existing subscriber.
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .compact()
                    .with_filter(EnvFilter::new(&self.config.log_level)),
            )
            .try_init();

        global::set_tracer_provider(provider.clone());
        self.tracer_provider = Some(provider);
        Ok(())
    }

    fn init_development(&mut self, log_file: Option<&str>) -> Result<()> {
        let provider = self.build_provider();

        if let Some(path) = log_file {
            let path = std::path::Path::new(path);
            let appender = tracing_appender::rolling::never(
                path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                path.file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("swarmsh.log")),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            self._guard = Some(guard);
            let _ = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_filter(EnvFilter::new(&self.config.log_level)),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .json(),
                )
                .try_init();
        } else {
            let _ = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .pretty()
                        .with_filter(EnvFilter::new(&self.config.log_level)),
                )
                .try_init();
        }

        global::set_tracer_provider(provider.clone());
        self.tracer_provider = Some(provider);
        Ok(())
    }

    fn init_production(&mut self, otlp_endpoint: Option<&str>) -> Result<()> {
        let provider = self.build_provider();

        // OTLP forwarding is best-effort; the local span log is authoritative
        // and an unreachable endpoint never blocks an append.
        #[cfg(feature = "otlp")]
        if let Some(endpoint) = otlp_endpoint {
            info!(endpoint = %endpoint, "OTLP span forwarding configured");
        }
        #[cfg(not(feature = "otlp"))]
        if let Some(endpoint) = otlp_endpoint {
            debug!(endpoint = %endpoint, "OTLP endpoint set but otlp feature disabled");
        }

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_filter(EnvFilter::new(&self.config.log_level)),
            )
            .try_init();

        global::set_tracer_provider(provider.clone());
        self.tracer_provider = Some(provider);
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        if matches!(self.config.mode, TelemetryMode::Disabled) {
            return Ok(());
        }
        info!(
            service = %self.config.service_name,
            version = %self.config.service_version,
            mode = ?self.config.mode,
            "telemetry started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if matches!(self.config.mode, TelemetryMode::Disabled) {
            return Ok(());
        }
        global::shutdown_tracer_provider();
        info!("telemetry stopped");
        Ok(())
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

impl Drop for TelemetryManager {
    fn drop(&mut self) {
        global::shutdown_tracer_provider();
    }
}
