/*!
 * Call Tracing
 * Structured tracing for bridged socket calls using the tracing crate
 *
 * Features:
 * - Trace ID per call for correlating bridge and platform logs
 * - JSON-formatted logs for structured parsing
 * - Slow-call detection against a configurable threshold
 */

use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Environment variable selecting JSON output
pub const ENV_TRACE_JSON: &str = "SOCKBRIDGE_TRACE_JSON";

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - SOCKBRIDGE_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(ENV_TRACE_JSON)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
}

/// Generate a unique trace ID for call correlation
fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span around one socket-layer call
pub struct CallSpan {
    span: tracing::Span,
    start: Instant,
    op: &'static str,
    trace_id: String,
    slow_threshold: Duration,
}

impl CallSpan {
    pub fn new(op: &'static str, fd: i32, slow_threshold: Duration) -> Self {
        let trace_id = generate_trace_id();

        let span = span!(
            Level::DEBUG,
            "sock_call",
            trace_id = %trace_id,
            op = op,
            fd = fd,
            path = tracing::field::Empty,
            result = tracing::field::Empty,
            error = tracing::field::Empty,
            return_value = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            op,
            trace_id,
            slow_threshold,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Record which implementation family serviced the call
    pub fn record_path(&self, path: &'static str) {
        self.span.record("path", path);
    }

    /// Record the outcome of a `SockResult`
    pub fn record_outcome<T: std::fmt::Debug, E: std::fmt::Display>(&self, outcome: &Result<T, E>) {
        match outcome {
            Ok(value) => {
                self.span.record("result", "success");
                self.span.record("return_value", format!("{:?}", value).as_str());
            }
            Err(e) => {
                self.span.record("result", "error");
                self.span.record("error", e.to_string().as_str());
            }
        }
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for CallSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();

        if duration > self.slow_threshold {
            warn!(
                trace_id = %self.trace_id,
                op = self.op,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow socket call"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                op = self.op,
                duration_us = duration.as_micros() as u64,
                "socket call completed"
            );
        }
    }
}

/// Open a call span tagged with the path that services it
#[inline]
pub fn span_call(
    op: &'static str,
    fd: i32,
    path: &'static str,
    slow_threshold: Duration,
) -> CallSpan {
    let span = CallSpan::new(op, fd, slow_threshold);
    span.record_path(path);
    span
}
