//! Terminal Adapters
//!
//! Implementations of the `TerminalTransport` port.
//!
//! - `DispatchTerminal`: Typed calls over the vendor control's untyped dispatch
//! - `SimulatedTerminal`: In-memory terminal for tests and replay

/// Typed adapter over the vendor dispatch entry point.
pub mod dispatch;

/// In-memory terminal.
pub mod simulated;

pub use dispatch::{ControlDispatch, DispatchArg, DispatchTerminal, DispatchValue};
pub use simulated::{CallCounts, CompletionMode, SimulatedTerminal};
