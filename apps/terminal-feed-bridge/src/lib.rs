#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Terminal Feed Bridge - Session Protocol Adapter
//!
//! Drives a vendor trading terminal's field-coded query protocol and its
//! asynchronous push channel, turning them into decoded query rows and an
//! ordered stream of transaction records.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Value types with no terminal access
//!   - `fields`: Request ids, field codes, paging parameters
//!   - `transaction`: Pushes, transactions, date-time sequences
//!   - `session`: Lifecycle states
//!   - `failure`: Failure taxonomy
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Typed transport port and completion channels
//!   - `services`: Codec, normalizer, request manager, dispatcher, lifecycle
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `terminal`: Dispatch adapter and simulated terminal
//!   - `bridge`: Session assembly
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!                  query completions
//! Terminal ──┬──────────────────────► RequestSessionManager ──► DecodedRow
//!            │     snapshot completions
//!            ├──────────────────────► EventDispatcher ──► snapshot text
//!            │     pushes
//!            └──────────────────────► EventDispatcher ──► TransactionNormalizer ──► TransactionStream
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Session protocol types with no terminal access.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::{
    DateTimeSeq, DecodedRow, FailureKind, FieldCode, FieldInput, FieldList, FieldMap, PushChannel,
    RawPush, RequestId, SessionError, SessionState, Transaction,
};

// Ports
pub use application::ports::{
    SharedTransport, TerminalCallbacks, TerminalReceivers, TerminalTransport, terminal_channels,
};

// Services
pub use application::services::{
    AuthSettings, ConnectFailure, EventDispatcher, FieldCodec, RequestSessionManager,
    SessionController, TeardownReport, TransactionNormalizer, TransactionStream,
};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError, Credentials, ServerSettings};

// Session assembly
pub use infrastructure::bridge::BridgeSession;

// Terminal adapters
pub use infrastructure::terminal::{CompletionMode, DispatchTerminal, SimulatedTerminal};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
