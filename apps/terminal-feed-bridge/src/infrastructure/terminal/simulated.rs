//! Simulated Terminal
//!
//! In-memory [`TerminalTransport`] with a finite request-id pool, scripted
//! response rows, failure toggles and call counters. Completions are sent
//! through the same [`TerminalCallbacks`] a real adapter uses, either
//! immediately on submission or when [`SimulatedTerminal::complete`] is
//! called.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::application::ports::{
    PagedSubmission, QueryCompletion, SnapshotCompletion, TerminalCallbacks, TerminalTransport,
};
use crate::domain::{FieldCode, FieldMap, PushChannel, RawPush, RequestId};

/// When query and snapshot completions are signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// During the submitting call.
    #[default]
    Immediate,
    /// Only when the test calls [`SimulatedTerminal::complete`].
    Manual,
}

/// Number of calls per terminal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    /// `init_transport` calls.
    pub init: usize,
    /// `terminate_transport` calls.
    pub terminate: usize,
    /// `authenticate` calls.
    pub authenticate: usize,
    /// `logout` calls.
    pub logout: usize,
    /// `submit_paged_request` calls.
    pub submit: usize,
    /// `release_request_id` calls.
    pub release: usize,
    /// `subscribe_push` calls.
    pub subscribe: usize,
    /// `unsubscribe_push` calls.
    pub unsubscribe: usize,
    /// `unsubscribe_all_push` calls.
    pub unsubscribe_all: usize,
}

#[derive(Debug, Default)]
struct Toggles {
    fail_init: bool,
    fail_login: bool,
    fail_subscribe: bool,
    submit_code: i32,
    rejected_code: Option<FieldCode>,
}

#[derive(Debug)]
struct Inner {
    pool_size: usize,
    next_id: i64,
    allocated: HashSet<RequestId>,
    inputs: HashMap<RequestId, FieldMap>,
    responses: HashMap<RequestId, Vec<FieldMap>>,
    rows: Vec<FieldMap>,
    snapshot: String,
    completion_mode: CompletionMode,
    connected: bool,
    authenticated: bool,
    auth_mode: Option<(i32, i32)>,
    subscriptions: HashSet<PushChannel>,
    last_error: Option<String>,
    toggles: Toggles,
    calls: CallCounts,
}

/// In-memory terminal.
#[derive(Debug)]
pub struct SimulatedTerminal {
    callbacks: TerminalCallbacks,
    inner: Mutex<Inner>,
}

impl SimulatedTerminal {
    /// Terminal with a pool of 16 request ids and no rows.
    #[must_use]
    pub fn new(callbacks: TerminalCallbacks) -> Self {
        Self {
            callbacks,
            inner: Mutex::new(Inner {
                pool_size: 16,
                next_id: 1,
                allocated: HashSet::new(),
                inputs: HashMap::new(),
                responses: HashMap::new(),
                rows: Vec::new(),
                snapshot: String::new(),
                completion_mode: CompletionMode::default(),
                connected: false,
                authenticated: false,
                auth_mode: None,
                subscriptions: HashSet::new(),
                last_error: None,
                toggles: Toggles::default(),
                calls: CallCounts::default(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Limit the number of simultaneously allocated request ids.
    #[must_use]
    pub fn with_pool_size(self, pool_size: usize) -> Self {
        self.inner.lock().pool_size = pool_size;
        self
    }

    /// Rows returned by every completed query.
    #[must_use]
    pub fn with_rows(self, rows: Vec<FieldMap>) -> Self {
        self.inner.lock().rows = rows;
        self
    }

    /// Output returned by snapshot requests.
    #[must_use]
    pub fn with_snapshot(self, snapshot: impl Into<String>) -> Self {
        self.inner.lock().snapshot = snapshot.into();
        self
    }

    /// Select when completions are signaled.
    #[must_use]
    pub fn with_completion_mode(self, mode: CompletionMode) -> Self {
        self.inner.lock().completion_mode = mode;
        self
    }

    /// Make `init_transport` fail.
    pub fn fail_init(&self, fail: bool) {
        self.inner.lock().toggles.fail_init = fail;
    }

    /// Make `authenticate` fail.
    pub fn fail_login(&self, fail: bool) {
        self.inner.lock().toggles.fail_login = fail;
    }

    /// Make `subscribe_push` fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.lock().toggles.fail_subscribe = fail;
    }

    /// Result code returned by `submit_paged_request`.
    pub fn set_submit_code(&self, code: i32) {
        self.inner.lock().toggles.submit_code = code;
    }

    /// Reject inputs for `code`.
    pub fn reject_field(&self, code: Option<FieldCode>) {
        self.inner.lock().toggles.rejected_code = code;
    }

    /// Simulate the connection dropping.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.authenticated = false;
        inner.last_error = Some("connection lost".to_string());
    }

    // -------------------------------------------------------------------------
    // Driving
    // -------------------------------------------------------------------------

    /// Signal completion of a submitted query. Returns `false` if the request
    /// has no pending response.
    pub fn complete(&self, request_id: RequestId) -> bool {
        let block_length = {
            let inner = self.inner.lock();
            match inner.responses.get(&request_id) {
                Some(rows) => rows.len(),
                None => return false,
            }
        };
        self.callbacks.query_completed(QueryCompletion {
            request_id,
            block_length,
        });
        true
    }

    /// Deliver a push if its channel is subscribed. Returns whether it was
    /// delivered.
    pub fn push(&self, push: RawPush) -> bool {
        let channel = PushChannel::new(push.real_name.clone(), push.subscription_key.clone());
        if !self.inner.lock().subscriptions.contains(&channel) {
            tracing::debug!(%channel, "Simulated push for unsubscribed channel dropped");
            return false;
        }
        self.callbacks.push(push);
        true
    }

    /// Call counters so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }

    /// Request ids currently allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated.len()
    }

    /// Inputs registered on a request, in code order.
    #[must_use]
    pub fn inputs(&self, request_id: RequestId) -> Option<FieldMap> {
        self.inner.lock().inputs.get(&request_id).cloned()
    }

    /// Last login mode selected.
    #[must_use]
    pub fn auth_mode(&self) -> Option<(i32, i32)> {
        self.inner.lock().auth_mode
    }
}

impl TerminalTransport for SimulatedTerminal {
    fn init_transport(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.init += 1;
        if inner.toggles.fail_init {
            inner.last_error = Some("communication module unavailable".to_string());
            return false;
        }
        inner.connected = true;
        true
    }

    fn transport_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn terminate_transport(&self) {
        let mut inner = self.inner.lock();
        inner.calls.terminate += 1;
        inner.connected = false;
        inner.authenticated = false;
        inner.subscriptions.clear();
    }

    fn last_error_message(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    fn set_auth_mode(&self, option: i32, mode: i32) -> bool {
        self.inner.lock().auth_mode = Some((option, mode));
        true
    }

    fn authenticate(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.authenticate += 1;
        if !inner.connected || inner.toggles.fail_login {
            inner.last_error = Some("login rejected".to_string());
            return false;
        }
        inner.authenticated = true;
        true
    }

    fn logout(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.logout += 1;
        let was_authenticated = inner.authenticated;
        inner.authenticated = false;
        was_authenticated
    }

    fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    fn allocate_request_id(&self) -> Option<RequestId> {
        let mut inner = self.inner.lock();
        if inner.allocated.len() >= inner.pool_size {
            return None;
        }
        let request_id = RequestId::new(inner.next_id);
        inner.next_id += 1;
        inner.allocated.insert(request_id);
        Some(request_id)
    }

    fn release_request_id(&self, request_id: RequestId) {
        let mut inner = self.inner.lock();
        inner.calls.release += 1;
        inner.allocated.remove(&request_id);
        inner.inputs.remove(&request_id);
        inner.responses.remove(&request_id);
    }

    fn set_field_input(&self, request_id: RequestId, code: &FieldCode, value: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.allocated.contains(&request_id) || inner.toggles.rejected_code.as_ref() == Some(code)
        {
            return false;
        }
        inner
            .inputs
            .entry(request_id)
            .or_default()
            .insert(code.clone(), value);
        true
    }

    fn submit_paged_request(&self, submission: &PagedSubmission) -> i32 {
        let (mode, block_length) = {
            let mut inner = self.inner.lock();
            inner.calls.submit += 1;
            if inner.toggles.submit_code != 0 {
                return inner.toggles.submit_code;
            }
            if !inner.allocated.contains(&submission.request_id) {
                return -1;
            }
            let rows = inner.rows.clone();
            let block_length = rows.len();
            inner.responses.insert(submission.request_id, rows);
            (inner.completion_mode, block_length)
        };

        if mode == CompletionMode::Immediate {
            self.callbacks.query_completed(QueryCompletion {
                request_id: submission.request_id,
                block_length,
            });
        }
        0
    }

    fn row_count(&self, request_id: RequestId) -> usize {
        self.inner
            .lock()
            .responses
            .get(&request_id)
            .map_or(0, Vec::len)
    }

    fn field_value(&self, request_id: RequestId, code: &FieldCode, row: usize) -> Option<String> {
        let inner = self.inner.lock();
        let row = inner.responses.get(&request_id)?.get(row)?;
        row.get(code)
            .or_else(|| inner.inputs.get(&request_id)?.get(code))
            .map(str::to_string)
    }

    fn subscribe_push(&self, channel: &PushChannel) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.subscribe += 1;
        if inner.toggles.fail_subscribe || !inner.authenticated {
            return false;
        }
        inner.subscriptions.insert(channel.clone());
        true
    }

    fn unsubscribe_push(&self, channel: &PushChannel) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.unsubscribe += 1;
        inner.subscriptions.remove(channel)
    }

    fn unsubscribe_all_push(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.unsubscribe_all += 1;
        inner.subscriptions.clear();
        inner.connected
    }

    fn request_push_snapshot(&self, channel: &PushChannel) -> Option<String> {
        let (mode, snapshot) = {
            let inner = self.inner.lock();
            if !inner.subscriptions.contains(channel) {
                return None;
            }
            (inner.completion_mode, inner.snapshot.clone())
        };

        if mode == CompletionMode::Immediate {
            self.callbacks.snapshot_completed(SnapshotCompletion {
                channel: channel.clone(),
            });
        }
        Some(snapshot)
    }
}
