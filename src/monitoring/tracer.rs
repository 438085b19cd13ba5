/*!
 * Tracing
 * Subscriber setup and per-RPC spans using the tracing crate
 */

use crate::core::limits::SLOW_RPC_THRESHOLD;
use crate::core::types::{Pid, ReqNo};
use std::time::Instant;
use tracing::{debug, field, info, span, warn, Level, Span};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// Environment variables:
/// - RUST_LOG: log filter (default: info)
/// - ANYKERNEL_TRACE_JSON: JSON output when `1` or `true`
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("ANYKERNEL_TRACE_JSON")
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
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()
    };

    if installed.is_ok() {
        info!(json = use_json, "tracing initialized");
    }
}

/// Span covering one proxied syscall
///
/// Records errno, return value, and duration when dropped; calls slower than
/// the slow-RPC threshold log at warn.
pub struct RpcSpan {
    span: Span,
    start: Instant,
    reqno: ReqNo,
    pid: Pid,
    number: i32,
    outcome: Option<(i32, i64)>,
}

impl RpcSpan {
    pub fn new(reqno: ReqNo, pid: Pid, number: i32) -> Self {
        let span = span!(
            Level::DEBUG,
            "rpc_syscall",
            reqno,
            pid,
            syscall = number,
            error = field::Empty,
            retval = field::Empty,
            duration_us = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            reqno,
            pid,
            number,
            outcome: None,
        }
    }

    /// Enter the span for the duration of the returned guard
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// Record the syscall's wire result
    pub fn record_result(&mut self, error: i32, retval: i64) {
        self.span.record("error", error);
        self.span.record("retval", retval);
        self.outcome = Some((error, retval));
    }
}

impl Drop for RpcSpan {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.span.record("duration_us", elapsed.as_micros() as u64);
        let (error, retval) = self.outcome.unwrap_or((-1, -1));

        if elapsed > SLOW_RPC_THRESHOLD {
            warn!(
                reqno = self.reqno,
                pid = self.pid,
                syscall = self.number,
                error,
                duration_ms = elapsed.as_millis() as u64,
                slow = true,
                "slow proxied syscall"
            );
        } else {
            debug!(
                reqno = self.reqno,
                pid = self.pid,
                syscall = self.number,
                error,
                retval,
                duration_us = elapsed.as_micros() as u64,
                "proxied syscall completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn test_rpc_span_records() {
        let mut span = RpcSpan::new(7, 3, 5);
        {
            let _entered = span.enter();
        }
        span.record_result(0, 42);
        assert_eq!(span.outcome, Some((0, 42)));
    }
}
