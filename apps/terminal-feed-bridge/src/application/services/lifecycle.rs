//! Connection Lifecycle Controller
//!
//! Drives the session state machine:
//!
//! ```text
//! Disconnected ─initialize─▶ Initializing ─first pass─▶ Authenticating
//!      ▲                                                     │
//!      │◀───────────── second pass failed ───────────────────┤
//!      │                                                second pass
//!      │                                                     ▼
//!      └──── Disconnecting ◀─disconnect── Subscribed ◀─subscribe── Authenticated
//! ```
//!
//! `connect` fails as a whole with the root cause. `disconnect` never
//! fails: every teardown step runs and its outcome is logged.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::application::ports::SharedTransport;
use crate::application::services::dispatcher::{EventDispatcher, TransactionStream};
use crate::application::services::requests::RequestSessionManager;
use crate::domain::{DecodedRow, FailureKind, FieldList, PushChannel, SessionError, SessionState};
use crate::infrastructure::metrics;

// =============================================================================
// Settings
// =============================================================================

/// Login mode selection for the two authentication passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSettings {
    /// Login option passed with every mode change.
    pub option: i32,
    /// Mode of the probing first pass.
    pub probe_mode: i32,
    /// Mode of the real second pass.
    pub login_mode: i32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            option: 0,
            probe_mode: 1,
            login_mode: 0,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Step of `connect` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// Transport initialization.
    Initialize,
    /// Probing login.
    FirstPass,
    /// Real login.
    SecondPass,
    /// Push subscription.
    Subscribe,
}

impl ConnectStage {
    /// Stable stage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::FirstPass => "authenticate_first_pass",
            Self::SecondPass => "authenticate_second_pass",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Aggregated `connect` failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connect failed during {}: {source}", .stage.as_str())]
pub struct ConnectFailure {
    /// Step that failed.
    pub stage: ConnectStage,
    /// Root cause.
    #[source]
    pub source: SessionError,
}

impl ConnectFailure {
    /// Failure kind of the root cause.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.source.kind()
    }
}

/// What `disconnect` did. Teardown itself always succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    /// Nothing to tear down; the session was already disconnected or another
    /// caller is tearing it down.
    pub skipped: bool,
    /// Both health checks passed before teardown.
    pub was_healthy: bool,
    /// Logout was attempted and confirmed.
    pub logged_out: bool,
    /// Unsubscribe-all was confirmed.
    pub unsubscribed: bool,
}

impl TeardownReport {
    /// Human-readable summary.
    #[must_use]
    pub fn reason(&self) -> String {
        if self.skipped {
            return "already disconnected".to_string();
        }
        let logout = match (self.was_healthy, self.logged_out) {
            (false, _) => "logout skipped (connection unhealthy)",
            (true, true) => "logged out",
            (true, false) => "logout not confirmed",
        };
        let unsubscribe = if self.unsubscribed {
            "subscriptions removed"
        } else {
            "unsubscribe not confirmed"
        };
        format!("{logout}; {unsubscribe}; transport terminated")
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Owns the session state and sequences the other components through it.
pub struct SessionController {
    transport: SharedTransport,
    requests: Arc<RequestSessionManager>,
    dispatcher: Arc<EventDispatcher>,
    state: RwLock<SessionState>,
    auth: AuthSettings,
    channel: PushChannel,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("auth", &self.auth)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a disconnected controller.
    #[must_use]
    pub fn new(
        transport: SharedTransport,
        requests: Arc<RequestSessionManager>,
        dispatcher: Arc<EventDispatcher>,
        auth: AuthSettings,
        channel: PushChannel,
    ) -> Self {
        Self {
            transport,
            requests,
            dispatcher,
            state: RwLock::new(SessionState::Disconnected),
            auth,
            channel,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Push channel subscribed on connect.
    #[must_use]
    pub const fn channel(&self) -> &PushChannel {
        &self.channel
    }

    /// Event dispatcher, for installing push handlers.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// `Disconnected -> Initializing`.
    ///
    /// # Errors
    ///
    /// `TransportInitFailed` if the terminal refuses; the state stays
    /// `Disconnected`. No retry is attempted.
    pub fn initialize(&self) -> Result<(), SessionError> {
        self.expect_state("initialize", SessionState::Disconnected)?;
        self.set_state(SessionState::Initializing);

        if self.transport.init_transport() {
            tracing::info!("Transport initialized");
            Ok(())
        } else {
            let detail = self.last_error();
            tracing::error!(%detail, "Transport initialization failed");
            self.set_state(SessionState::Disconnected);
            Err(SessionError::TransportInitFailed { detail })
        }
    }

    /// `Initializing -> Authenticating`. The probing login's result is only
    /// logged.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Initializing`.
    pub fn authenticate_first_pass(&self) -> Result<(), SessionError> {
        self.expect_state("authenticate_first_pass", SessionState::Initializing)?;
        self.set_state(SessionState::Authenticating);

        let mode_set = self
            .transport
            .set_auth_mode(self.auth.option, self.auth.probe_mode);
        let accepted = self.transport.authenticate();
        tracing::info!(
            option = self.auth.option,
            mode = self.auth.probe_mode,
            mode_set,
            accepted,
            "Probing login pass finished"
        );
        Ok(())
    }

    /// `Authenticating -> Authenticated`, or back to `Disconnected`.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` if the real login fails. The transport is
    /// terminated before returning.
    pub fn authenticate_second_pass(&self) -> Result<(), SessionError> {
        self.expect_state("authenticate_second_pass", SessionState::Authenticating)?;

        let mode_set = self
            .transport
            .set_auth_mode(self.auth.option, self.auth.login_mode);
        if !mode_set {
            tracing::warn!(mode = self.auth.login_mode, "Login mode not accepted");
        }

        if self.transport.authenticate() {
            tracing::info!("Logged in");
            self.set_state(SessionState::Authenticated);
            return Ok(());
        }

        let detail = self.last_error();
        tracing::error!(%detail, "Login failed");
        self.transport.terminate_transport();
        self.set_state(SessionState::Disconnected);
        Err(SessionError::AuthenticationFailed { detail })
    }

    /// `Authenticated -> Subscribed`.
    ///
    /// A rejected subscription is logged and the state still advances.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Authenticated`.
    pub fn subscribe(&self) -> Result<(), SessionError> {
        self.expect_state("subscribe", SessionState::Authenticated)?;

        if let Err(err) = self.dispatcher.subscribe(self.channel.clone()) {
            tracing::warn!(channel = %self.channel, error = %err, "Subscribe failed, continuing");
        }
        self.set_state(SessionState::Subscribed);
        Ok(())
    }

    /// Run every transition from `Disconnected` to `Subscribed`.
    ///
    /// # Errors
    ///
    /// The first failing step and its root cause.
    pub fn connect(&self) -> Result<(), ConnectFailure> {
        let stage =
            |stage: ConnectStage| move |source: SessionError| ConnectFailure { stage, source };

        self.initialize().map_err(stage(ConnectStage::Initialize))?;
        self.authenticate_first_pass()
            .map_err(stage(ConnectStage::FirstPass))?;
        self.authenticate_second_pass()
            .map_err(stage(ConnectStage::SecondPass))?;
        self.subscribe().map_err(stage(ConnectStage::Subscribe))?;

        tracing::info!(channel = %self.channel, "Session connected");
        Ok(())
    }

    /// Tear the session down. Never fails and never blocks on the terminal.
    ///
    /// Only one caller runs teardown; concurrent callers get a skipped report.
    pub fn disconnect(&self) -> TeardownReport {
        let mut state = self.state.write();
        let previous = *state;
        if matches!(
            previous,
            SessionState::Disconnected | SessionState::Disconnecting
        ) {
            drop(state);
            tracing::debug!(
                state = previous.as_str(),
                "Disconnect requested while already disconnected"
            );
            return TeardownReport {
                skipped: true,
                ..TeardownReport::default()
            };
        }
        *state = SessionState::Disconnecting;
        drop(state);
        tracing::debug!(
            from = previous.as_str(),
            to = SessionState::Disconnecting.as_str(),
            "Session state changed"
        );
        metrics::set_session_state(SessionState::Disconnecting);

        self.requests.cancel_pending();

        let was_healthy = self.is_healthy();
        let logged_out = if was_healthy {
            let confirmed = self.transport.logout();
            if !confirmed {
                tracing::warn!(detail = %self.last_error(), "Logout not confirmed");
            }
            confirmed
        } else {
            tracing::warn!("Skipping logout on unhealthy connection");
            false
        };

        let unsubscribed = self.dispatcher.unsubscribe_all();
        self.transport.terminate_transport();
        self.set_state(SessionState::Disconnected);

        let report = TeardownReport {
            skipped: false,
            was_healthy,
            logged_out,
            unsubscribed,
        };
        tracing::info!(reason = %report, "Session disconnected");
        report
    }

    /// Transport connected and session authenticated. Each failing check is
    /// logged separately.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let connected = self.transport.transport_connected();
        if !connected {
            tracing::error!("Transport not connected");
        }
        let authenticated = self.transport.is_authenticated();
        if !authenticated {
            tracing::error!("Session not authenticated");
        }
        connected && authenticated
    }

    // -------------------------------------------------------------------------
    // Upward Surface
    // -------------------------------------------------------------------------

    /// Run a date-range field query.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless logged in, otherwise any query failure.
    pub async fn query_fields(
        &self,
        start: &str,
        end: &str,
        fields: &FieldList,
    ) -> Result<Vec<DecodedRow>, SessionError> {
        let state = self.state();
        if !state.is_logged_in() {
            return Err(SessionError::unexpected_state("query_fields", state));
        }
        self.requests.query_fields(start, end, fields).await
    }

    /// Current terminal output for the subscribed channel.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless subscribed, otherwise any snapshot failure.
    pub async fn fetch_snapshot(&self) -> Result<String, SessionError> {
        self.expect_state("fetch_snapshot", SessionState::Subscribed)?;
        self.dispatcher.fetch_snapshot().await
    }

    /// Claim the current subscription's transaction stream.
    #[must_use]
    pub fn transaction_stream(&self) -> Option<TransactionStream> {
        self.dispatcher.transaction_stream()
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn expect_state(&self, operation: &str, expected: SessionState) -> Result<(), SessionError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(SessionError::unexpected_state(operation, actual))
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            tracing::debug!(from = previous.as_str(), to = next.as_str(), "Session state changed");
        }
        metrics::set_session_state(next);
    }

    fn last_error(&self) -> String {
        self.transport
            .last_error_message()
            .unwrap_or_else(|| "no detail reported".to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::{MockTerminalTransport, terminal_channels};
    use crate::application::services::normalizer::{NormalizerConfig, TransactionNormalizer};
    use crate::application::services::requests::QuerySettings;
    use crate::domain::FieldCode;

    fn controller(transport: MockTerminalTransport) -> SessionController {
        let transport: SharedTransport = Arc::new(transport);
        let (_callbacks, receivers) = terminal_channels();
        let requests = Arc::new(RequestSessionManager::new(
            Arc::clone(&transport),
            receivers.queries,
            QuerySettings::default(),
        ));
        let normalizer = Arc::new(TransactionNormalizer::new(NormalizerConfig {
            remote_id_field: FieldCode::new("ID").unwrap(),
            dedup_window: 16,
        }));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&transport),
            normalizer,
            receivers.snapshots,
            Duration::from_secs(1),
        ));
        SessionController::new(
            transport,
            requests,
            dispatcher,
            AuthSettings::default(),
            PushChannel::new("FX_TICK", "GBP/AUD"),
        )
    }

    /// Transport that accepts every connect step.
    fn connectable() -> MockTerminalTransport {
        let mut transport = MockTerminalTransport::new();
        transport.expect_init_transport().return_const(true);
        transport.expect_set_auth_mode().return_const(true);
        transport.expect_authenticate().return_const(true);
        transport.expect_subscribe_push().return_const(true);
        transport
    }

    #[test]
    fn connect_walks_every_state() {
        let controller = controller(connectable());
        assert_eq!(controller.state(), SessionState::Disconnected);

        controller.connect().unwrap();
        assert_eq!(controller.state(), SessionState::Subscribed);
        assert!(controller.transaction_stream().is_some());
    }

    #[test]
    fn init_failure_is_fatal_and_stays_disconnected() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_init_transport().times(1).return_const(false);
        transport
            .expect_last_error_message()
            .return_const(Some("agent not running".to_string()));
        transport.expect_authenticate().never();
        let controller = controller(transport);

        let err = controller.connect().unwrap_err();
        assert_eq!(err.stage, ConnectStage::Initialize);
        assert_eq!(err.kind(), FailureKind::TransportInitFailed);
        assert!(err.to_string().contains("agent not running"));
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[test]
    fn probe_login_failure_is_ignored() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_init_transport().return_const(true);
        transport.expect_set_auth_mode().return_const(true);
        let mut seq = mockall::Sequence::new();
        transport
            .expect_authenticate()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(false);
        transport
            .expect_authenticate()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);
        transport.expect_subscribe_push().return_const(true);
        let controller = controller(transport);

        controller.connect().unwrap();
        assert_eq!(controller.state(), SessionState::Subscribed);
    }

    #[test]
    fn auth_modes_follow_settings() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_init_transport().return_const(true);
        let mut seq = mockall::Sequence::new();
        transport
            .expect_set_auth_mode()
            .with(eq(0), eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);
        transport
            .expect_set_auth_mode()
            .with(eq(0), eq(0))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);
        transport.expect_authenticate().return_const(true);
        transport.expect_subscribe_push().return_const(true);
        let controller = controller(transport);

        controller.connect().unwrap();
    }

    #[test]
    fn second_pass_failure_returns_to_disconnected() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_init_transport().return_const(true);
        transport.expect_set_auth_mode().return_const(true);
        transport.expect_authenticate().return_const(false);
        transport.expect_last_error_message().return_const(None);
        transport.expect_terminate_transport().times(1).return_const(());
        transport.expect_subscribe_push().never();
        let controller = controller(transport);

        let err = controller.connect().unwrap_err();
        assert_eq!(err.stage, ConnectStage::SecondPass);
        assert_eq!(err.kind(), FailureKind::AuthenticationFailed);
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    /// Subscribe failure is tolerated: the session still reaches `Subscribed`.
    #[test]
    fn rejected_subscription_still_enters_subscribed() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_init_transport().return_const(true);
        transport.expect_set_auth_mode().return_const(true);
        transport.expect_authenticate().return_const(true);
        transport.expect_subscribe_push().times(1).return_const(false);
        let controller = controller(transport);

        controller.connect().unwrap();
        assert_eq!(controller.state(), SessionState::Subscribed);
    }

    #[test]
    fn healthy_disconnect_logs_out_and_tears_down() {
        let mut transport = connectable();
        transport.expect_transport_connected().return_const(true);
        transport.expect_is_authenticated().return_const(true);
        transport.expect_logout().times(1).return_const(true);
        transport
            .expect_unsubscribe_all_push()
            .times(1)
            .return_const(true);
        transport.expect_terminate_transport().times(1).return_const(());
        let controller = controller(transport);
        controller.connect().unwrap();

        let report = controller.disconnect();
        assert!(report.was_healthy && report.logged_out && report.unsubscribed);
        assert_eq!(report.reason(), "logged out; subscriptions removed; transport terminated");
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[test]
    fn unhealthy_disconnect_still_unsubscribes_and_terminates() {
        let mut transport = connectable();
        transport.expect_transport_connected().return_const(true);
        transport.expect_is_authenticated().return_const(false);
        transport.expect_logout().never();
        transport
            .expect_unsubscribe_all_push()
            .times(1)
            .return_const(false);
        transport.expect_terminate_transport().times(1).return_const(());
        let controller = controller(transport);
        controller.connect().unwrap();

        let report = controller.disconnect();
        assert!(!report.skipped);
        assert!(!report.was_healthy);
        assert!(!report.logged_out);
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[test]
    fn disconnect_when_disconnected_is_a_no_op() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_terminate_transport().never();
        transport.expect_unsubscribe_all_push().never();
        let controller = controller(transport);

        assert!(controller.disconnect().skipped);
        assert_eq!(controller.disconnect().reason(), "already disconnected");
    }

    #[test]
    fn disconnect_during_teardown_is_a_no_op() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_logout().never();
        transport.expect_terminate_transport().never();
        transport.expect_unsubscribe_all_push().never();
        let controller = controller(transport);
        *controller.state.write() = SessionState::Disconnecting;

        assert!(controller.disconnect().skipped);
        assert_eq!(controller.state(), SessionState::Disconnecting);
    }

    #[test]
    fn concurrent_disconnects_tear_down_once() {
        let mut transport = connectable();
        transport.expect_transport_connected().return_const(true);
        transport.expect_is_authenticated().return_const(true);
        transport.expect_logout().times(1).return_const(true);
        transport
            .expect_unsubscribe_all_push()
            .times(1)
            .return_const(true);
        transport.expect_terminate_transport().times(1).return_const(());
        let controller = controller(transport);
        controller.connect().unwrap();

        let reports: Vec<TeardownReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| controller.disconnect()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(reports.iter().filter(|r| !r.skipped).count(), 1);
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[test]
    fn health_requires_both_checks() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_transport_connected().return_const(false);
        transport.expect_is_authenticated().times(1).return_const(true);
        let controller = controller(transport);

        assert!(!controller.is_healthy());
    }

    #[test]
    fn transitions_out_of_order_are_rejected() {
        let controller = controller(MockTerminalTransport::new());

        let err = controller.subscribe().unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidState);
        assert_eq!(
            err.to_string(),
            "invalid state: subscribe not allowed while disconnected"
        );
    }

    #[tokio::test]
    async fn query_requires_login() {
        let controller = controller(MockTerminalTransport::new());

        let err = controller
            .query_fields("20200301", "20200302", &"8".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidState);
    }
}
