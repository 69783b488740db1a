//! Application Services
//!
//! Services that drive the terminal through the transport port.
//!
//! - `FieldCodec`: Per-field encode and decode
//! - `TransactionNormalizer`: Push text to sequenced transactions
//! - `RequestSessionManager`: Request ids and awaitable paged queries
//! - `EventDispatcher`: The active push subscription
//! - `SessionController`: Lifecycle state machine

/// Field encode/decode over the transport.
pub mod codec;

/// Push subscription routing.
pub mod dispatcher;

/// Session lifecycle state machine.
pub mod lifecycle;

/// Push payload normalization.
pub mod normalizer;

/// Request ids and paged queries.
pub mod requests;

pub use codec::FieldCodec;
pub use dispatcher::{EventDispatcher, PushHandler, TransactionStream};
pub use lifecycle::{AuthSettings, ConnectFailure, ConnectStage, SessionController, TeardownReport};
pub use normalizer::{MalformedPush, NormalizerConfig, TransactionNormalizer};
pub use requests::{
    DATE_RANGE_END_FIELD, DATE_RANGE_START_FIELD, PagedQuery, QuerySettings, RequestLease,
    RequestSessionManager,
};
