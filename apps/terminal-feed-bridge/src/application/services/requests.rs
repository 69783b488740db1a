//! Request Session Manager
//!
//! Owns every live request id from allocation to release and turns the
//! terminal's "submit now, completion later" query protocol into a single
//! awaitable call.
//!
//! # Completion Routing
//!
//! Query completions arrive on a dedicated channel that only this manager
//! reads. The receiver sits behind an async mutex, so at most one paged
//! query waits on it at any time; a second caller queues on the lock.
//! [`RequestSessionManager::cancel_pending`] reaches queued callers too, so
//! nothing is submitted after teardown.
//! Completions for other request ids are logged and skipped, never handed
//! to the wrong waiter.
//!
//! # Release Discipline
//!
//! A request id goes back to the terminal exactly once:
//!
//! - by [`RequestSessionManager::release`] (idempotent)
//! - when its query times out, is refused or is cancelled
//! - when a [`RequestLease`] is dropped

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{PagedSubmission, QueryCompletion, SharedTransport};
use crate::application::services::codec::FieldCodec;
use crate::domain::{
    DecodedRow, FieldCode, FieldInput, FieldList, FieldResponse, PagingCursor, PagingMode,
    RequestCount, RequestId, ScreenSlot, SessionError,
};
use crate::infrastructure::metrics::{self, QueryOutcome};

/// Input field carrying the start of a date range.
pub const DATE_RANGE_START_FIELD: &str = "9034";

/// Input field carrying the end of a date range.
pub const DATE_RANGE_END_FIELD: &str = "9035";

// =============================================================================
// Settings
// =============================================================================

/// Query defaults applied by [`RequestSessionManager::query_fields`].
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Bounded wait for a completion signal.
    pub timeout: Duration,
    /// Instrument inputs registered before the date range.
    pub instrument_fields: Vec<FieldInput>,
    /// Paging classification for fresh queries.
    pub paging_mode: PagingMode,
    /// Screen identifier reused across requests.
    pub screen_slot: ScreenSlot,
    /// Rows requested per page.
    pub requested_count: RequestCount,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            instrument_fields: Vec::new(),
            paging_mode: PagingMode::default(),
            screen_slot: ScreenSlot::default(),
            requested_count: RequestCount::default(),
        }
    }
}

/// One page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedQuery {
    /// Output fields.
    pub fields: FieldList,
    /// Paging classification.
    pub paging_mode: PagingMode,
    /// Continuation token, empty for a first page.
    pub cursor: PagingCursor,
    /// Screen identifier.
    pub screen_slot: ScreenSlot,
    /// Rows requested.
    pub requested_count: RequestCount,
}

impl PagedQuery {
    /// First page of `fields` using the configured paging defaults.
    #[must_use]
    pub fn first_page(fields: FieldList, settings: &QuerySettings) -> Self {
        Self {
            fields,
            paging_mode: settings.paging_mode,
            cursor: PagingCursor::default(),
            screen_slot: settings.screen_slot.clone(),
            requested_count: settings.requested_count,
        }
    }

    /// Continue from a cursor returned by a previous page.
    #[must_use]
    pub fn continue_from(mut self, cursor: PagingCursor) -> Self {
        self.paging_mode = PagingMode::Next;
        self.cursor = cursor;
        self
    }
}

// =============================================================================
// Live Requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Configuring,
    Submitted,
    Completed { row_count: usize },
}

#[derive(Debug)]
struct FieldRequest {
    inputs: Vec<FieldInput>,
    phase: RequestPhase,
}

enum Wait {
    Completed(QueryCompletion),
    TimedOut,
    Cancelled,
    Closed,
}

/// Releases its request id when dropped.
#[derive(Debug)]
pub struct RequestLease<'a> {
    manager: &'a RequestSessionManager,
    request_id: RequestId,
}

impl RequestLease<'_> {
    /// The leased request id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.request_id
    }
}

impl Drop for RequestLease<'_> {
    fn drop(&mut self) {
        self.manager.release(self.request_id);
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Allocates, configures, submits and releases field queries.
pub struct RequestSessionManager {
    transport: SharedTransport,
    codec: FieldCodec,
    settings: QuerySettings,
    live: Mutex<HashMap<RequestId, FieldRequest>>,
    completions: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueryCompletion>>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for RequestSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSessionManager")
            .field("settings", &self.settings)
            .field("live", &self.live.lock().len())
            .finish_non_exhaustive()
    }
}

impl RequestSessionManager {
    /// Create a manager that consumes query completions from `completions`.
    #[must_use]
    pub fn new(
        transport: SharedTransport,
        completions: mpsc::UnboundedReceiver<QueryCompletion>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            codec: FieldCodec::new(transport.clone()),
            transport,
            settings,
            live: Mutex::new(HashMap::new()),
            completions: tokio::sync::Mutex::new(completions),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Query defaults.
    #[must_use]
    pub const fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Number of request ids currently held.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Request id whose query is waiting for completion, if any.
    #[must_use]
    pub fn in_flight(&self) -> Option<RequestId> {
        self.live
            .lock()
            .iter()
            .find(|(_, request)| request.phase == RequestPhase::Submitted)
            .map(|(id, _)| *id)
    }

    /// Obtain a fresh request id from the terminal.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` if the terminal has none available.
    pub fn allocate(&self) -> Result<RequestId, SessionError> {
        let mut live = self.live.lock();
        let Some(request_id) = self.transport.allocate_request_id() else {
            tracing::warn!(live = live.len(), "Request id pool exhausted");
            return Err(SessionError::AllocationExhausted);
        };

        let previous = live.insert(
            request_id,
            FieldRequest {
                inputs: Vec::new(),
                phase: RequestPhase::Configuring,
            },
        );
        if previous.is_some() {
            tracing::warn!(%request_id, "Terminal reissued a live request id");
        }
        metrics::set_live_requests(live.len());
        drop(live);

        tracing::debug!(%request_id, "Request id allocated");
        Ok(request_id)
    }

    /// Allocate a request id that is released when the lease drops.
    ///
    /// # Errors
    ///
    /// Same as [`Self::allocate`].
    pub fn lease(&self) -> Result<RequestLease<'_>, SessionError> {
        Ok(RequestLease {
            manager: self,
            request_id: self.allocate()?,
        })
    }

    /// Return a request id to the terminal. Releasing twice is a no-op.
    pub fn release(&self, request_id: RequestId) {
        let mut live = self.live.lock();
        if live.remove(&request_id).is_some() {
            self.transport.release_request_id(request_id);
            metrics::set_live_requests(live.len());
            tracing::debug!(%request_id, "Request id released");
        } else {
            tracing::trace!(%request_id, "Request id already released");
        }
    }

    /// Register inputs on a request, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first rejected input and returns `EncodeRejected` naming
    /// it. Inputs before it stay registered.
    pub fn configure_fields(
        &self,
        request_id: RequestId,
        inputs: &[FieldInput],
    ) -> Result<(), SessionError> {
        self.ensure_live(request_id)?;

        for input in inputs {
            self.codec.encode_field(request_id, &input.code, &input.value)?;
            if let Some(request) = self.live.lock().get_mut(&request_id) {
                request.inputs.push(input.clone());
            }
        }

        Ok(())
    }

    /// Register the two date-bound inputs.
    ///
    /// # Errors
    ///
    /// Same as [`Self::configure_fields`].
    pub fn configure_date_range(
        &self,
        request_id: RequestId,
        start: &str,
        end: &str,
    ) -> Result<(), SessionError> {
        let range = [
            FieldInput::new(FieldCode::new(DATE_RANGE_START_FIELD).map_err(invalid_code)?, start),
            FieldInput::new(FieldCode::new(DATE_RANGE_END_FIELD).map_err(invalid_code)?, end),
        ];
        self.configure_fields(request_id, &range)
    }

    /// Submit a paged query and wait for this request's completion.
    ///
    /// Returns the response row count. On timeout, refusal or cancellation
    /// the request id is released before the error is returned.
    ///
    /// # Errors
    ///
    /// - `TransportError` if the terminal refuses the submission, the wait
    ///   (or the queue for it) is cancelled or the completion channel closes
    /// - `Timeout` if no matching completion arrives in time
    /// - `InvalidState` if `request_id` is not live
    pub async fn submit_paged_query(
        &self,
        request_id: RequestId,
        query: &PagedQuery,
    ) -> Result<usize, SessionError> {
        // Queued callers hold the same token as the active waiter.
        let cancel = self.cancel.lock().clone();
        let mut completions = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(%request_id, "Queued paged query cancelled before submission");
                self.abandon(request_id, QueryOutcome::Failed);
                return Err(SessionError::transport(format!(
                    "paged query {request_id} cancelled"
                )));
            }
            completions = self.completions.lock() => completions,
        };

        while let Ok(stale) = completions.try_recv() {
            tracing::warn!(request_id = %stale.request_id, "Discarding stale query completion");
        }

        self.set_phase(request_id, RequestPhase::Submitted)?;

        let submission = PagedSubmission {
            request_id,
            fields: query.fields.clone(),
            paging_mode: query.paging_mode,
            cursor: query.cursor.clone(),
            screen_slot: query.screen_slot.clone(),
            requested_count: query.requested_count,
        };
        let code = self.transport.submit_paged_request(&submission);
        if code != 0 {
            tracing::warn!(%request_id, code, "Paged query refused");
            self.abandon(request_id, QueryOutcome::Failed);
            return Err(SessionError::transport(format!(
                "paged query {request_id} refused with code {code}"
            )));
        }

        metrics::record_query_submitted();
        tracing::debug!(
            %request_id,
            inputs = self.input_count(request_id),
            fields = %query.fields,
            paging_mode = query.paging_mode.as_str(),
            count = query.requested_count.get(),
            "Paged query submitted"
        );

        let started = Instant::now();
        let wait = tokio::select! {
            () = cancel.cancelled() => Wait::Cancelled,
            result = tokio::time::timeout(
                self.settings.timeout,
                Self::next_completion_for(&mut completions, request_id),
            ) => match result {
                Ok(Some(completion)) => Wait::Completed(completion),
                Ok(None) => Wait::Closed,
                Err(_) => Wait::TimedOut,
            },
        };
        drop(completions);
        let waited = started.elapsed();

        match wait {
            Wait::Completed(completion) => {
                let row_count = self.transport.row_count(request_id);
                self.set_phase(request_id, RequestPhase::Completed { row_count })?;
                metrics::record_query(QueryOutcome::Completed);
                metrics::record_query_wait(waited);
                tracing::debug!(
                    %request_id,
                    row_count,
                    block_length = completion.block_length,
                    waited_ms = waited.as_millis(),
                    "Paged query completed"
                );
                Ok(row_count)
            }
            Wait::TimedOut => {
                tracing::warn!(%request_id, waited_ms = waited.as_millis(), "Paged query timed out");
                self.abandon(request_id, QueryOutcome::TimedOut);
                Err(SessionError::Timeout { request_id, waited })
            }
            Wait::Cancelled => {
                tracing::info!(%request_id, "Paged query wait cancelled");
                self.abandon(request_id, QueryOutcome::Failed);
                Err(SessionError::transport(format!(
                    "paged query {request_id} cancelled"
                )))
            }
            Wait::Closed => {
                tracing::error!(%request_id, "Query completion channel closed");
                self.abandon(request_id, QueryOutcome::Failed);
                Err(SessionError::transport("query completion channel closed"))
            }
        }
    }

    /// Read one cell of a completed query.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the request is not live or has not completed
    /// - `DecodeOutOfRange` from the codec
    pub fn read_row(
        &self,
        request_id: RequestId,
        code: &FieldCode,
        row: usize,
    ) -> Result<String, SessionError> {
        let response = self.completed_response(request_id)?;
        self.codec.decode_field(&response, code, row)
    }

    /// Run one complete date-range query and decode every row.
    ///
    /// The request id is released on every path.
    ///
    /// # Errors
    ///
    /// Any allocation, encode, submission or decode failure.
    pub async fn query_fields(
        &self,
        start: &str,
        end: &str,
        fields: &FieldList,
    ) -> Result<Vec<DecodedRow>, SessionError> {
        let lease = self.lease()?;
        let request_id = lease.id();

        self.configure_fields(request_id, &self.settings.instrument_fields)?;
        self.configure_date_range(request_id, start, end)?;

        let query = PagedQuery::first_page(fields.clone(), &self.settings);
        let row_count = self.submit_paged_query(request_id, &query).await?;

        let response = FieldResponse {
            request_id,
            row_count,
        };
        (0..row_count)
            .map(|row| self.codec.decode_row(&response, fields, row))
            .collect()
    }

    /// Wake any waiting query with a cancellation error.
    pub fn cancel_pending(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    async fn next_completion_for(
        completions: &mut mpsc::UnboundedReceiver<QueryCompletion>,
        request_id: RequestId,
    ) -> Option<QueryCompletion> {
        loop {
            let completion = completions.recv().await?;
            if completion.request_id == request_id {
                return Some(completion);
            }
            tracing::warn!(
                expected = %request_id,
                received = %completion.request_id,
                "Ignoring completion for another request"
            );
        }
    }

    fn input_count(&self, request_id: RequestId) -> usize {
        self.live
            .lock()
            .get(&request_id)
            .map_or(0, |request| request.inputs.len())
    }

    fn ensure_live(&self, request_id: RequestId) -> Result<(), SessionError> {
        if self.live.lock().contains_key(&request_id) {
            Ok(())
        } else {
            Err(SessionError::unknown_request(request_id))
        }
    }

    fn set_phase(&self, request_id: RequestId, phase: RequestPhase) -> Result<(), SessionError> {
        self.live
            .lock()
            .get_mut(&request_id)
            .map(|request| request.phase = phase)
            .ok_or_else(|| SessionError::unknown_request(request_id))
    }

    fn completed_response(&self, request_id: RequestId) -> Result<FieldResponse, SessionError> {
        let phase = self.live.lock().get(&request_id).map(|request| request.phase);
        match phase {
            Some(RequestPhase::Completed { row_count }) => Ok(FieldResponse {
                request_id,
                row_count,
            }),
            Some(_) => Err(SessionError::InvalidState {
                message: format!("request {request_id} has no completed response"),
            }),
            None => Err(SessionError::unknown_request(request_id)),
        }
    }

    fn abandon(&self, request_id: RequestId, outcome: QueryOutcome) {
        metrics::record_query(outcome);
        self.release(request_id);
    }
}

fn invalid_code(err: crate::domain::FieldParseError) -> SessionError {
    SessionError::transport(format!("invalid date range field: {err}"))
}
