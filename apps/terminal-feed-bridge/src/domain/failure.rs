//! Failure Taxonomy
//!
//! Every fallible session operation returns a [`SessionError`] carrying the
//! context of the failure. [`SessionError::kind`] collapses it to the plain
//! [`FailureKind`] callers branch on.

use std::time::Duration;

use thiserror::Error;

use super::fields::{FieldCode, RequestId};
use super::session::SessionState;

/// Coarse classification of a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The transport refused to initialize.
    TransportInitFailed,
    /// The real login pass failed.
    AuthenticationFailed,
    /// The terminal has no request ids left.
    AllocationExhausted,
    /// The terminal rejected a field input.
    EncodeRejected,
    /// A decode referenced a row or code absent from the response.
    DecodeOutOfRange,
    /// A push payload did not have the expected token layout.
    MalformedPayload,
    /// A completion signal did not arrive in time.
    Timeout,
    /// Catch-all for unexpected transport results.
    TransportError,
    /// Operation issued in the wrong lifecycle state or on a dead request id.
    InvalidState,
}

impl FailureKind {
    /// Stable name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TransportInitFailed => "transport_init_failed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::AllocationExhausted => "allocation_exhausted",
            Self::EncodeRejected => "encode_rejected",
            Self::DecodeOutOfRange => "decode_out_of_range",
            Self::MalformedPayload => "malformed_payload",
            Self::Timeout => "timeout",
            Self::TransportError => "transport_error",
            Self::InvalidState => "invalid_state",
        }
    }
}

/// Errors surfaced by the session protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Transport initialization reported failure.
    #[error("transport initialization failed: {detail}")]
    TransportInitFailed {
        /// Last error message reported by the terminal, if any.
        detail: String,
    },

    /// Real login pass failed.
    #[error("authentication failed: {detail}")]
    AuthenticationFailed {
        /// Last error message reported by the terminal, if any.
        detail: String,
    },

    /// No request id available.
    #[error("request id pool exhausted")]
    AllocationExhausted,

    /// A field input was rejected by the terminal.
    #[error("field {code}={value:?} rejected for request {request_id}")]
    EncodeRejected {
        /// Request the field was applied to.
        request_id: RequestId,
        /// Rejected field code.
        code: FieldCode,
        /// Rejected value.
        value: String,
    },

    /// Decode referenced a row beyond the row count or a code never returned.
    #[error("field {code} row {row} out of range for request {request_id} ({row_count} rows)")]
    DecodeOutOfRange {
        /// Request being read.
        request_id: RequestId,
        /// Requested field code.
        code: FieldCode,
        /// Requested row index.
        row: usize,
        /// Rows in the response.
        row_count: usize,
    },

    /// Push payload with too few tokens.
    #[error("malformed push payload: {token_count} tokens, need at least {required}")]
    MalformedPayload {
        /// Tokens found.
        token_count: usize,
        /// Tokens required.
        required: usize,
    },

    /// Completion did not arrive within the bounded wait.
    #[error("no completion for request {request_id} within {waited:?}")]
    Timeout {
        /// Request that timed out.
        request_id: RequestId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Unexpected transport result.
    #[error("transport error: {message}")]
    TransportError {
        /// Description of the failure.
        message: String,
    },

    /// Operation not valid in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the violated precondition.
        message: String,
    },
}

impl SessionError {
    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::TransportInitFailed { .. } => FailureKind::TransportInitFailed,
            Self::AuthenticationFailed { .. } => FailureKind::AuthenticationFailed,
            Self::AllocationExhausted => FailureKind::AllocationExhausted,
            Self::EncodeRejected { .. } => FailureKind::EncodeRejected,
            Self::DecodeOutOfRange { .. } => FailureKind::DecodeOutOfRange,
            Self::MalformedPayload { .. } => FailureKind::MalformedPayload,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::TransportError { .. } => FailureKind::TransportError,
            Self::InvalidState { .. } => FailureKind::InvalidState,
        }
    }

    /// Shorthand for a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
        }
    }

    /// Error for an operation issued from the wrong lifecycle state.
    #[must_use]
    pub fn unexpected_state(operation: &str, actual: SessionState) -> Self {
        Self::InvalidState {
            message: format!("{operation} not allowed while {}", actual.as_str()),
        }
    }

    /// Error for a request id that is not live.
    #[must_use]
    pub fn unknown_request(request_id: RequestId) -> Self {
        Self::InvalidState {
            message: format!("request {request_id} is not live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let id = RequestId::new(7);
        let cases = [
            (
                SessionError::TransportInitFailed {
                    detail: String::new(),
                },
                FailureKind::TransportInitFailed,
            ),
            (SessionError::AllocationExhausted, FailureKind::AllocationExhausted),
            (
                SessionError::Timeout {
                    request_id: id,
                    waited: Duration::from_secs(1),
                },
                FailureKind::Timeout,
            ),
            (SessionError::transport("boom"), FailureKind::TransportError),
            (SessionError::unknown_request(id), FailureKind::InvalidState),
        ];

        for (error, expected) in cases {
            assert_eq!(error.kind(), expected);
        }
    }

    #[test]
    fn encode_rejected_names_the_field() {
        let error = SessionError::EncodeRejected {
            request_id: RequestId::new(3),
            code: FieldCode::new("9002").unwrap(),
            value: "X".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("9002"));
        assert!(message.contains("\"X\""));
    }

    #[test]
    fn unexpected_state_message() {
        let error = SessionError::unexpected_state("subscribe", SessionState::Disconnected);
        assert_eq!(
            error.to_string(),
            "invalid state: subscribe not allowed while disconnected"
        );
    }
}
