//! Domain Layer - Session protocol types.
//!
//! Pure value types for field-coded queries, push transactions, the
//! session lifecycle and the failure taxonomy. Nothing here talks to the
//! terminal.

/// Failure taxonomy shared by every session operation.
pub mod failure;

/// Request handles, field codes, paging parameters and field maps.
pub mod fields;

/// Session lifecycle states.
pub mod session;

/// Raw pushes, normalized transactions and date-time sequences.
pub mod transaction;

pub use failure::{FailureKind, SessionError};
pub use fields::{
    DecodedRow, FieldCode, FieldInput, FieldList, FieldMap, FieldParseError, FieldResponse,
    MAX_REQUEST_COUNT, PagingCursor, PagingMode, RequestCount, RequestId, ScreenSlot,
};
pub use session::SessionState;
pub use transaction::{DateTimeSeq, PushChannel, RawPush, SequenceUnit, Transaction};
