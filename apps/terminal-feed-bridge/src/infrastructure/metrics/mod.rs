//! Prometheus Metrics Module
//!
//! Exposes bridge metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Queries**: Paged query outcomes and completion latency
//! - **Requests**: Live request id count
//! - **Pushes**: Transactions forwarded, malformed and duplicate-suspect
//! - **Session**: Current lifecycle state
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::SessionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed the first time.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "terminal_bridge_queries_submitted_total",
        "Paged queries accepted by the terminal"
    );
    describe_counter!(
        "terminal_bridge_queries_total",
        "Paged queries by outcome"
    );
    describe_histogram!(
        "terminal_bridge_query_wait_seconds",
        "Time from submission to completion signal"
    );

    describe_gauge!(
        "terminal_bridge_live_requests",
        "Request ids currently allocated"
    );

    describe_counter!(
        "terminal_bridge_pushes_received_total",
        "Pushes received for the active channel"
    );
    describe_counter!(
        "terminal_bridge_transactions_total",
        "Transactions forwarded downstream"
    );
    describe_counter!(
        "terminal_bridge_malformed_pushes_total",
        "Push payloads forwarded unparsed"
    );
    describe_counter!(
        "terminal_bridge_duplicate_suspects_total",
        "Transactions flagged as possible duplicates"
    );

    describe_gauge!(
        "terminal_bridge_session_state",
        "Current session state code (0 = disconnected, 4 = subscribed)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Completion signal received.
    Completed,
    /// Bounded wait elapsed.
    TimedOut,
    /// Submission refused or wait cancelled.
    Failed,
}

impl QueryOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }
}

/// Record a paged query accepted by the terminal.
pub fn record_query_submitted() {
    counter!("terminal_bridge_queries_submitted_total").increment(1);
}

/// Record a paged query outcome.
pub fn record_query(outcome: QueryOutcome) {
    counter!(
        "terminal_bridge_queries_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record how long a query waited for its completion signal.
pub fn record_query_wait(waited: Duration) {
    histogram!("terminal_bridge_query_wait_seconds").record(waited.as_secs_f64());
}

/// Update the live request id gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_live_requests(count: usize) {
    gauge!("terminal_bridge_live_requests").set(count as f64);
}

/// Record a push for the active channel.
pub fn record_push_received() {
    counter!("terminal_bridge_pushes_received_total").increment(1);
}

/// Record a transaction forwarded downstream.
pub fn record_transaction(duplicate_suspect: bool) {
    counter!("terminal_bridge_transactions_total").increment(1);
    if duplicate_suspect {
        counter!("terminal_bridge_duplicate_suspects_total").increment(1);
    }
}

/// Record a payload forwarded unparsed.
pub fn record_malformed_push() {
    counter!("terminal_bridge_malformed_pushes_total").increment(1);
}

/// Update the session state gauge.
pub fn set_session_state(state: SessionState) {
    gauge!("terminal_bridge_session_state").set(f64::from(state.code()));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_outcome_as_str() {
        assert_eq!(QueryOutcome::Completed.as_str(), "completed");
        assert_eq!(QueryOutcome::TimedOut.as_str(), "timed_out");
        assert_eq!(QueryOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_query(QueryOutcome::Completed);
        record_transaction(true);
        set_session_state(SessionState::Subscribed);
    }
}
