//! Session Lifecycle Integration Tests
//!
//! Tests connect and teardown sequencing against the simulated terminal.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use terminal_feed_bridge::application::services::ConnectStage;
use terminal_feed_bridge::infrastructure::terminal::CallCounts;
use terminal_feed_bridge::{
    BridgeConfig, BridgeSession, FailureKind, SessionState, SharedTransport, SimulatedTerminal,
    terminal_channels,
};

fn session_with(extra: &[(&str, &str)]) -> (Arc<SimulatedTerminal>, BridgeSession) {
    let mut pairs = vec![
        ("TERMINAL_REAL_NAME", "FX_TICK"),
        ("TERMINAL_SYMBOL", "GBP/AUD"),
    ];
    pairs.extend_from_slice(extra);
    let config = BridgeConfig::from_lookup(|key| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
    })
    .unwrap();

    let (callbacks, receivers) = terminal_channels();
    let terminal = Arc::new(SimulatedTerminal::new(callbacks));
    let transport: SharedTransport = terminal.clone();
    let session = BridgeSession::assemble(transport, receivers, &config);
    (terminal, session)
}

fn session() -> (Arc<SimulatedTerminal>, BridgeSession) {
    session_with(&[])
}

// =============================================================================
// Connect Tests
// =============================================================================

#[test]
fn test_connect_reaches_subscribed() {
    let (terminal, session) = session();

    session.controller().connect().unwrap();

    assert_eq!(session.controller().state(), SessionState::Subscribed);
    assert!(session.controller().is_healthy());
    let calls = terminal.calls();
    assert_eq!(calls.init, 1);
    assert_eq!(calls.authenticate, 2);
    assert_eq!(calls.subscribe, 1);
    assert_eq!(terminal.auth_mode(), Some((0, 0)));
}

#[test]
fn test_login_modes_are_configurable() {
    let (terminal, session) = session_with(&[
        ("TERMINAL_AUTH_OPTION", "1"),
        ("TERMINAL_LOGIN_MODE", "2"),
    ]);

    session.controller().connect().unwrap();
    assert_eq!(terminal.auth_mode(), Some((1, 2)));
}

#[test]
fn test_init_failure_stays_disconnected_without_retry() {
    let (terminal, session) = session();
    terminal.fail_init(true);

    let failure = session.controller().connect().unwrap_err();

    assert_eq!(failure.stage, ConnectStage::Initialize);
    assert_eq!(failure.kind(), FailureKind::TransportInitFailed);
    assert!(failure.to_string().contains("communication module unavailable"));
    assert_eq!(session.controller().state(), SessionState::Disconnected);
    assert_eq!(terminal.calls().init, 1);
    assert_eq!(terminal.calls().authenticate, 0);
}

#[test]
fn test_login_failure_terminates_transport() {
    let (terminal, session) = session();
    terminal.fail_login(true);

    let failure = session.controller().connect().unwrap_err();

    assert_eq!(failure.stage, ConnectStage::SecondPass);
    assert_eq!(failure.kind(), FailureKind::AuthenticationFailed);
    assert_eq!(session.controller().state(), SessionState::Disconnected);
    let calls = terminal.calls();
    assert_eq!(calls.authenticate, 2);
    assert_eq!(calls.terminate, 1);
    assert_eq!(calls.subscribe, 0);
}

#[test]
fn test_rejected_subscription_still_advances() {
    let (terminal, session) = session();
    terminal.fail_subscribe(true);

    session.controller().connect().unwrap();

    assert_eq!(session.controller().state(), SessionState::Subscribed);
    assert_eq!(terminal.calls().subscribe, 1);
}

#[test]
fn test_connect_twice_is_invalid_state() {
    let (_, session) = session();
    session.controller().connect().unwrap();

    let failure = session.controller().connect().unwrap_err();
    assert_eq!(failure.stage, ConnectStage::Initialize);
    assert_eq!(failure.kind(), FailureKind::InvalidState);
    assert_eq!(session.controller().state(), SessionState::Subscribed);
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[test]
fn test_healthy_disconnect_logs_out_once() {
    let (terminal, session) = session();
    session.controller().connect().unwrap();
    let before = terminal.calls();

    let report = session.controller().disconnect();

    assert!(report.was_healthy);
    assert!(report.logged_out);
    assert!(report.unsubscribed);
    assert_eq!(
        report.reason(),
        "logged out; subscriptions removed; transport terminated"
    );
    assert_eq!(
        terminal.calls(),
        CallCounts {
            logout: before.logout + 1,
            unsubscribe_all: before.unsubscribe_all + 1,
            terminate: before.terminate + 1,
            ..before
        }
    );
    assert_eq!(session.controller().state(), SessionState::Disconnected);
}

#[test]
fn test_unhealthy_disconnect_skips_logout() {
    let (terminal, session) = session();
    session.controller().connect().unwrap();
    terminal.drop_connection();

    let report = session.controller().disconnect();

    assert!(!report.was_healthy);
    assert!(!report.logged_out);
    let calls = terminal.calls();
    assert_eq!(calls.logout, 0);
    assert_eq!(calls.unsubscribe_all, 1);
    assert_eq!(calls.terminate, 1);
    assert!(report.reason().starts_with("logout skipped"));
    assert_eq!(session.controller().state(), SessionState::Disconnected);
}

#[test]
fn test_second_disconnect_is_a_no_op() {
    let (terminal, session) = session();
    session.controller().connect().unwrap();
    session.controller().disconnect();
    let after_first = terminal.calls();

    let report = session.controller().disconnect();

    assert!(report.skipped);
    assert_eq!(report.reason(), "already disconnected");
    assert_eq!(terminal.calls(), after_first);
}

#[test]
fn test_reconnect_after_disconnect_opens_new_stream() {
    let (terminal, session) = session();
    session.controller().connect().unwrap();
    assert!(session.controller().transaction_stream().is_some());
    session.controller().disconnect();
    assert!(session.controller().transaction_stream().is_none());

    session.controller().connect().unwrap();

    assert_eq!(session.controller().state(), SessionState::Subscribed);
    assert!(session.controller().transaction_stream().is_some());
    assert_eq!(terminal.calls().init, 2);
}
