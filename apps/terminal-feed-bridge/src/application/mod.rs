//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the session services and the port through which
//! they reach the terminal.

/// Transport port and completion signal channels.
pub mod ports;

/// Codec, normalizer, request, dispatch and lifecycle services.
pub mod services;
