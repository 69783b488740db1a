//! Session Lifecycle State
//!
//! `Disconnected → Initializing → Authenticating → Authenticated →
//! Subscribed → Disconnecting → Disconnected`

use serde::Serialize;

/// Current lifecycle state of the terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No transport, no login.
    #[default]
    Disconnected,
    /// Transport initialized, no login attempted.
    Initializing,
    /// Probing login issued.
    Authenticating,
    /// Real login succeeded.
    Authenticated,
    /// Push subscription requested; the session is running.
    Subscribed,
    /// Teardown in progress.
    Disconnecting,
}

impl SessionState {
    /// State name for logs and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Initializing => "initializing",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Subscribed => "subscribed",
            Self::Disconnecting => "disconnecting",
        }
    }

    /// Numeric code for the session state gauge.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Initializing => 1,
            Self::Authenticating => 2,
            Self::Authenticated => 3,
            Self::Subscribed => 4,
            Self::Disconnecting => 5,
        }
    }

    /// Whether the session is running and receiving pushes.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Subscribed)
    }

    /// Whether a login has succeeded and not yet been torn down.
    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Subscribed)
    }
}
