//! Typed Dispatch Adapter
//!
//! The vendor control is a single untyped entry point: a string signature
//! plus positional arguments. [`DispatchTerminal`] wraps it in the typed
//! [`TerminalTransport`] port and owns the result conventions of each call,
//! so that no service ever compares a raw integer.
//!
//! The control's event entry points (`on_fid_data`, `on_real_data`,
//! `on_agent_event`) are translated into [`TerminalCallbacks`] signals.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::application::ports::{
    PagedSubmission, QueryCompletion, SnapshotCompletion, TerminalCallbacks, TerminalTransport,
};
use crate::domain::{FieldCode, PushChannel, RawPush, RequestId};
use crate::infrastructure::config::Credentials;

// =============================================================================
// Untyped Seam
// =============================================================================

/// Positional argument to a control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchArg {
    /// Integer argument.
    Int(i64),
    /// String argument.
    Text(String),
}

impl From<i64> for DispatchArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for DispatchArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Value returned by a control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchValue {
    /// No return value.
    Empty,
    /// Integer result.
    Int(i64),
    /// String result.
    Text(String),
}

impl DispatchValue {
    /// Integer view; text results are parsed.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Empty => None,
        }
    }

    /// Non-zero integer or non-empty text.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Int(value) => *value != 0,
            Self::Text(text) => !text.is_empty(),
            Self::Empty => false,
        }
    }

    /// Text view; integers are formatted.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Int(value) => Some(value.to_string()),
            Self::Empty => None,
        }
    }
}

/// The vendor control's dispatch entry point.
pub trait ControlDispatch: Send + Sync {
    /// Invoke `signature` with positional arguments.
    fn call(&self, signature: &str, args: &[DispatchArg]) -> DispatchValue;
}

impl<T: ControlDispatch + ?Sized> ControlDispatch for std::sync::Arc<T> {
    fn call(&self, signature: &str, args: &[DispatchArg]) -> DispatchValue {
        (**self).call(signature, args)
    }
}

/// Control call signatures.
pub mod signature {
    /// Initialize the communication module.
    pub const COMM_INIT: &str = "CommInit()";
    /// Connection state.
    pub const COMM_GET_CONNECT_STATE: &str = "CommGetConnectState()";
    /// Shut down the communication module.
    pub const COMM_TERMINATE: &str = "CommTerminate(bSocketClose)";
    /// Last recorded error.
    pub const GET_LAST_ERR_MSG: &str = "GetLastErrMsg()";
    /// Select the login mode.
    pub const SET_LOGIN_MODE: &str = "SetLoginMode(nOption, nMode)";
    /// Suppress or restore agent message boxes.
    pub const SET_OFF_AGENT_MESSAGE_BOX: &str = "SetOffAgentMessageBox(nOption)";
    /// Log in.
    pub const COMM_LOGIN: &str = "CommLogin(sUserId, sPwd, sCertPass)";
    /// Log out.
    pub const COMM_LOGOUT: &str = "CommLogout(sUserId)";
    /// Login state.
    pub const GET_LOGIN_STATE: &str = "GetLoginState()";
    /// Start a push subscription.
    pub const REGISTER_REAL: &str = "RegisterReal(strRealName, strRealKey)";
    /// Stop a push subscription.
    pub const UNREGISTER_REAL: &str = "UnRegisterReal(strRealName, strRealKey)";
    /// Stop every push subscription.
    pub const ALL_UNREGISTER_REAL: &str = "AllUnRegisterReal()";
    /// Current push output.
    pub const GET_REAL_OUTPUT_DATA: &str = "GetRealOutputData(strRealName, realItem)";
    /// Allocate a request id.
    pub const CREATE_REQUEST_ID: &str = "CreateRequestID()";
    /// Release a request id.
    pub const RELEASE_RQ_ID: &str = "ReleaseRqId(nRqId)";
    /// Register a field input.
    pub const SET_FID_INPUT_DATA: &str = "SetFidInputData(nRqId, strFID, strValue)";
    /// Submit a paged query.
    pub const REQUEST_FID_ARRAY: &str = "RequestFidArray(nRqId, strOutputFidList, strPreNext, strPreNextContext, strScreenNo, nRequestCount)";
    /// Response row count.
    pub const GET_FID_OUTPUT_ROW_CNT: &str = "GetFidOutputRowCnt(nRequestId)";
    /// One response cell.
    pub const GET_FID_OUTPUT_DATA: &str = "GetFidOutputData(nRequestId, strFid, nRow)";
}

// =============================================================================
// Typed Adapter
// =============================================================================

/// Typed transport over a [`ControlDispatch`].
pub struct DispatchTerminal<D> {
    control: D,
    credentials: Option<Credentials>,
    callbacks: TerminalCallbacks,
    pending_snapshots: Mutex<HashSet<PushChannel>>,
}

impl<D> std::fmt::Debug for DispatchTerminal<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTerminal")
            .field("credentials", &self.credentials)
            .field("pending_snapshots", &self.pending_snapshots.lock().len())
            .finish_non_exhaustive()
    }
}

impl<D: ControlDispatch> DispatchTerminal<D> {
    /// Wrap a control. Without credentials every login is refused.
    #[must_use]
    pub fn new(control: D, credentials: Option<Credentials>, callbacks: TerminalCallbacks) -> Self {
        Self {
            control,
            credentials,
            callbacks,
            pending_snapshots: Mutex::new(HashSet::new()),
        }
    }

    fn invoke(&self, signature: &str, args: &[DispatchArg]) -> DispatchValue {
        tracing::debug!(signature, ?args, "Control call");
        let result = self.control.call(signature, args);
        tracing::trace!(signature, ?result, "Control result");
        result
    }

    fn invoke_redacted(&self, signature: &str, args: &[DispatchArg]) -> DispatchValue {
        tracing::debug!(signature, args = args.len(), "Control call");
        self.control.call(signature, args)
    }

    fn int(&self, signature: &str, args: &[DispatchArg]) -> Option<i64> {
        self.invoke(signature, args).as_int()
    }

    // -------------------------------------------------------------------------
    // Event Entry Points
    // -------------------------------------------------------------------------

    /// A field query finished.
    pub fn on_fid_data(&self, request_id: i64, block: &str, block_length: usize) {
        tracing::debug!(request_id, bytes = block.len(), "Field data event");
        self.callbacks.query_completed(QueryCompletion {
            request_id: RequestId::new(request_id),
            block_length,
        });
    }

    /// A push arrived. Also completes an outstanding snapshot of the channel.
    pub fn on_real_data(&self, real_name: &str, key: &str, block: &str, block_length: usize) {
        let channel = PushChannel::new(real_name, key);
        tracing::trace!(%channel, block_length, "Real data event");

        if self.pending_snapshots.lock().remove(&channel) {
            self.callbacks.snapshot_completed(SnapshotCompletion {
                channel: channel.clone(),
            });
        }

        let mut push = RawPush::text(&channel, block);
        push.block_length = block_length;
        self.callbacks.push(push);
    }

    /// Agent notification; informational only.
    pub fn on_agent_event(&self, event_type: i64, param: &str, value: &str) {
        tracing::info!(event_type, param, value, "Agent event");
    }
}

impl<D: ControlDispatch> TerminalTransport for DispatchTerminal<D> {
    fn init_transport(&self) -> bool {
        self.int(signature::COMM_INIT, &[]) == Some(0)
    }

    fn transport_connected(&self) -> bool {
        self.int(signature::COMM_GET_CONNECT_STATE, &[]) == Some(1)
    }

    fn terminate_transport(&self) {
        self.invoke(signature::COMM_TERMINATE, &[DispatchArg::Int(1)]);
        self.pending_snapshots.lock().clear();
    }

    fn last_error_message(&self) -> Option<String> {
        self.invoke(signature::GET_LAST_ERR_MSG, &[])
            .into_text()
            .filter(|message| !message.is_empty())
    }

    fn set_auth_mode(&self, option: i32, mode: i32) -> bool {
        self.invoke(
            signature::SET_LOGIN_MODE,
            &[i64::from(option).into(), i64::from(mode).into()],
        )
        .is_truthy()
    }

    fn authenticate(&self) -> bool {
        let Some(credentials) = &self.credentials else {
            tracing::warn!("Login attempted without credentials");
            return false;
        };

        self.invoke(signature::SET_OFF_AGENT_MESSAGE_BOX, &[DispatchArg::Int(1)]);
        let result = self.invoke_redacted(
            signature::COMM_LOGIN,
            &[
                credentials.user_id().into(),
                credentials.password().into(),
                credentials.cert_password().into(),
            ],
        );
        self.invoke(signature::SET_OFF_AGENT_MESSAGE_BOX, &[DispatchArg::Int(0)]);
        result.is_truthy()
    }

    fn logout(&self) -> bool {
        let user_id = self.credentials.as_ref().map_or("", Credentials::user_id);
        self.invoke_redacted(signature::COMM_LOGOUT, &[user_id.into()])
            .as_int()
            == Some(0)
    }

    fn is_authenticated(&self) -> bool {
        self.invoke(signature::GET_LOGIN_STATE, &[]).is_truthy()
    }

    fn allocate_request_id(&self) -> Option<RequestId> {
        self.int(signature::CREATE_REQUEST_ID, &[])
            .filter(|raw| *raw > 0)
            .map(RequestId::new)
    }

    fn release_request_id(&self, request_id: RequestId) {
        self.invoke(signature::RELEASE_RQ_ID, &[request_id.get().into()]);
    }

    fn set_field_input(&self, request_id: RequestId, code: &FieldCode, value: &str) -> bool {
        self.int(
            signature::SET_FID_INPUT_DATA,
            &[request_id.get().into(), code.as_str().into(), value.into()],
        ) == Some(1)
    }

    fn submit_paged_request(&self, submission: &PagedSubmission) -> i32 {
        let fields = submission.fields.to_string();
        let code = self.int(
            signature::REQUEST_FID_ARRAY,
            &[
                submission.request_id.get().into(),
                fields.as_str().into(),
                submission.paging_mode.as_str().into(),
                submission.cursor.as_str().into(),
                submission.screen_slot.as_str().into(),
                i64::from(submission.requested_count.get()).into(),
            ],
        );
        code.and_then(|code| i32::try_from(code).ok()).unwrap_or(-1)
    }

    fn row_count(&self, request_id: RequestId) -> usize {
        self.int(signature::GET_FID_OUTPUT_ROW_CNT, &[request_id.get().into()])
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(0)
    }

    fn field_value(&self, request_id: RequestId, code: &FieldCode, row: usize) -> Option<String> {
        let row = i64::try_from(row).ok()?;
        self.invoke(
            signature::GET_FID_OUTPUT_DATA,
            &[request_id.get().into(), code.as_str().into(), row.into()],
        )
        .into_text()
    }

    fn subscribe_push(&self, channel: &PushChannel) -> bool {
        self.int(
            signature::REGISTER_REAL,
            &[channel.name.as_str().into(), channel.key.as_str().into()],
        ) == Some(0)
    }

    fn unsubscribe_push(&self, channel: &PushChannel) -> bool {
        self.pending_snapshots.lock().remove(channel);
        self.int(
            signature::UNREGISTER_REAL,
            &[channel.name.as_str().into(), channel.key.as_str().into()],
        ) == Some(1)
    }

    fn unsubscribe_all_push(&self) -> bool {
        self.pending_snapshots.lock().clear();
        self.int(signature::ALL_UNREGISTER_REAL, &[]) == Some(1)
    }

    fn request_push_snapshot(&self, channel: &PushChannel) -> Option<String> {
        self.pending_snapshots.lock().insert(channel.clone());
        let output = self
            .invoke(
                signature::GET_REAL_OUTPUT_DATA,
                &[channel.name.as_str().into(), channel.key.as_str().into()],
            )
            .into_text();
        if output.is_none() {
            self.pending_snapshots.lock().remove(channel);
        }
        output
    }
}

// =============================================================================
// Tests
// =============================================================================
