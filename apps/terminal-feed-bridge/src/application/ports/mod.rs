//! Port Interfaces
//!
//! Defines the typed boundary to the terminal following the Hexagonal
//! Architecture pattern. Infrastructure adapters implement
//! [`TerminalTransport`]; the core never sees untyped vendor calls.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TerminalTransport`: one method per logical terminal operation
//!
//! ## Completion Signals (Inbound)
//!
//! The terminal reports query completions, snapshot completions and pushes
//! out-of-band. Each concern gets its own channel so that no component
//! waits on a signal it does not own:
//!
//! - query completions → `RequestSessionManager`
//! - snapshot completions and pushes → `EventDispatcher`

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::domain::{
    FieldCode, FieldList, PagingCursor, PagingMode, PushChannel, RawPush, RequestCount, RequestId,
    ScreenSlot,
};

// =============================================================================
// Transport Port
// =============================================================================

/// Parameters of one paged field query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedSubmission {
    /// Request the query runs under.
    pub request_id: RequestId,
    /// Output fields, sent comma-joined.
    pub fields: FieldList,
    /// Continuous-query classification.
    pub paging_mode: PagingMode,
    /// Continuation token, empty for a first page.
    pub cursor: PagingCursor,
    /// Screen identifier.
    pub screen_slot: ScreenSlot,
    /// Rows requested.
    pub requested_count: RequestCount,
}

/// Typed operations exposed by the terminal.
///
/// Calls return immediately. Query and snapshot results are announced
/// later through [`TerminalCallbacks`].
#[cfg_attr(test, mockall::automock)]
pub trait TerminalTransport: Send + Sync {
    /// Initialize the communication module.
    fn init_transport(&self) -> bool;

    /// Whether the communication module is connected.
    fn transport_connected(&self) -> bool;

    /// Shut the communication module down.
    fn terminate_transport(&self);

    /// Last error message the terminal recorded, if any.
    fn last_error_message(&self) -> Option<String>;

    /// Select the login mode for the next `authenticate`.
    fn set_auth_mode(&self, option: i32, mode: i32) -> bool;

    /// Log in with the adapter's credentials.
    fn authenticate(&self) -> bool;

    /// Log out of the current session.
    fn logout(&self) -> bool;

    /// Whether a login session is active.
    fn is_authenticated(&self) -> bool;

    /// Obtain a fresh request id; `None` when the pool is exhausted.
    fn allocate_request_id(&self) -> Option<RequestId>;

    /// Return a request id to the terminal.
    fn release_request_id(&self, request_id: RequestId);

    /// Register one field input on a request.
    fn set_field_input(&self, request_id: RequestId, code: &FieldCode, value: &str) -> bool;

    /// Issue a paged query; zero means accepted. Completion is signaled later.
    fn submit_paged_request(&self, submission: &PagedSubmission) -> i32;

    /// Rows in the completed response.
    fn row_count(&self, request_id: RequestId) -> usize;

    /// One response cell; `None` if the code was not returned.
    fn field_value(&self, request_id: RequestId, code: &FieldCode, row: usize) -> Option<String>;

    /// Start a push subscription.
    fn subscribe_push(&self, channel: &PushChannel) -> bool;

    /// Stop a push subscription.
    fn unsubscribe_push(&self, channel: &PushChannel) -> bool;

    /// Stop every push subscription.
    fn unsubscribe_all_push(&self) -> bool;

    /// Request the current push output; completion is signaled later.
    fn request_push_snapshot(&self, channel: &PushChannel) -> Option<String>;
}

/// Shared handle to the terminal transport.
pub type SharedTransport = Arc<dyn TerminalTransport>;

// =============================================================================
// Completion Signals
// =============================================================================

/// A paged query finished on the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCompletion {
    /// Request that completed.
    pub request_id: RequestId,
    /// Length of the response block.
    pub block_length: usize,
}

/// A push snapshot finished on the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCompletion {
    /// Channel whose snapshot completed.
    pub channel: PushChannel,
}

/// Sending half of the terminal's out-of-band signals, held by the adapter.
///
/// Sends never block, so vendor callback threads can call these directly.
#[derive(Debug, Clone)]
pub struct TerminalCallbacks {
    queries: mpsc::UnboundedSender<QueryCompletion>,
    snapshots: mpsc::UnboundedSender<SnapshotCompletion>,
    pushes: mpsc::UnboundedSender<RawPush>,
}

impl TerminalCallbacks {
    /// Announce a query completion.
    pub fn query_completed(&self, completion: QueryCompletion) {
        if self.queries.send(completion).is_err() {
            tracing::debug!(request_id = %completion.request_id, "Query completion dropped, no listener");
        }
    }

    /// Announce a snapshot completion.
    pub fn snapshot_completed(&self, completion: SnapshotCompletion) {
        if self.snapshots.send(completion).is_err() {
            tracing::debug!("Snapshot completion dropped, no listener");
        }
    }

    /// Deliver a push.
    pub fn push(&self, push: RawPush) {
        if self.pushes.send(push).is_err() {
            tracing::debug!("Push dropped, no listener");
        }
    }
}

/// Receiving halves of the terminal's out-of-band signals.
#[derive(Debug)]
pub struct TerminalReceivers {
    /// Query completions, owned by the request session manager.
    pub queries: mpsc::UnboundedReceiver<QueryCompletion>,
    /// Snapshot completions, owned by the event dispatcher.
    pub snapshots: mpsc::UnboundedReceiver<SnapshotCompletion>,
    /// Pushes, owned by the event dispatcher's pump.
    pub pushes: mpsc::UnboundedReceiver<RawPush>,
}

/// Create one independent channel per signal concern.
#[must_use]
pub fn terminal_channels() -> (TerminalCallbacks, TerminalReceivers) {
    let (queries_tx, queries) = mpsc::unbounded_channel();
    let (snapshots_tx, snapshots) = mpsc::unbounded_channel();
    let (pushes_tx, pushes) = mpsc::unbounded_channel();

    (
        TerminalCallbacks {
            queries: queries_tx,
            snapshots: snapshots_tx,
            pushes: pushes_tx,
        },
        TerminalReceivers {
            queries,
            snapshots,
            pushes,
        },
    )
}
