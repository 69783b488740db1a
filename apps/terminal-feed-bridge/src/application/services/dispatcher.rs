//! Event Dispatcher
//!
//! Owns the single active push subscription. Pushes for that channel are
//! normalized and forwarded, in arrival order, to the subscription's
//! [`TransactionStream`]; pushes for any other channel are discarded.
//!
//! Snapshot requests wait on their own completion channel, so tearing the
//! subscription down never touches a pending query wait.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{SharedTransport, SnapshotCompletion};
use crate::application::services::normalizer::TransactionNormalizer;
use crate::domain::{PushChannel, RawPush, SessionError, Transaction};
use crate::infrastructure::metrics;

/// Callback invoked with every push for the active channel.
pub type PushHandler = Arc<dyn Fn(&RawPush) + Send + Sync>;

// =============================================================================
// Transaction Stream
// =============================================================================

/// Lazy, unbounded sequence of transactions for one subscription.
///
/// Ends when the subscription is replaced or torn down.
#[derive(Debug)]
pub struct TransactionStream {
    channel: PushChannel,
    inner: UnboundedReceiverStream<Transaction>,
}

impl TransactionStream {
    /// Channel this stream was opened for.
    #[must_use]
    pub const fn channel(&self) -> &PushChannel {
        &self.channel
    }
}

impl Stream for TransactionStream {
    type Item = Transaction;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct ActiveSubscription {
    channel: PushChannel,
    sender: mpsc::UnboundedSender<Transaction>,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes terminal pushes to the active subscription.
pub struct EventDispatcher {
    transport: SharedTransport,
    normalizer: Arc<TransactionNormalizer>,
    active: Mutex<Option<ActiveSubscription>>,
    unclaimed_stream: Mutex<Option<TransactionStream>>,
    handler: Mutex<Option<PushHandler>>,
    snapshots: tokio::sync::Mutex<mpsc::UnboundedReceiver<SnapshotCompletion>>,
    snapshot_cancel: Mutex<CancellationToken>,
    snapshot_timeout: Duration,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("active_channel", &self.active_channel())
            .field("snapshot_timeout", &self.snapshot_timeout)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create a dispatcher that waits at most `snapshot_timeout` for snapshots.
    #[must_use]
    pub fn new(
        transport: SharedTransport,
        normalizer: Arc<TransactionNormalizer>,
        snapshots: mpsc::UnboundedReceiver<SnapshotCompletion>,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            normalizer,
            active: Mutex::new(None),
            unclaimed_stream: Mutex::new(None),
            handler: Mutex::new(None),
            snapshots: tokio::sync::Mutex::new(snapshots),
            snapshot_cancel: Mutex::new(CancellationToken::new()),
            snapshot_timeout,
        }
    }

    /// Channel of the active subscription, if any.
    #[must_use]
    pub fn active_channel(&self) -> Option<PushChannel> {
        self.active.lock().as_ref().map(|active| active.channel.clone())
    }

    /// Install the raw push callback, replacing any previous one.
    pub fn on_push(&self, handler: PushHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Subscribe to `channel`, replacing the current subscription.
    ///
    /// The subscription slot is installed even if the terminal refuses, so
    /// pushes it delivers anyway are still forwarded.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the terminal rejects the subscription.
    pub fn subscribe(&self, channel: PushChannel) -> Result<(), SessionError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stream = TransactionStream {
            channel: channel.clone(),
            inner: UnboundedReceiverStream::new(receiver),
        };

        let previous = self.active.lock().replace(ActiveSubscription {
            channel: channel.clone(),
            sender,
        });
        *self.unclaimed_stream.lock() = Some(stream);

        if let Some(previous) = previous
            && previous.channel != channel
            && !self.transport.unsubscribe_push(&previous.channel)
        {
            tracing::warn!(channel = %previous.channel, "Replaced subscription did not unsubscribe cleanly");
        }

        if self.transport.subscribe_push(&channel) {
            tracing::info!(%channel, "Push subscription active");
            Ok(())
        } else {
            tracing::warn!(%channel, "Terminal rejected push subscription");
            Err(SessionError::transport(format!(
                "subscription to {channel} rejected"
            )))
        }
    }

    /// Claim the stream of the current subscription. Each subscription's
    /// stream can be taken once.
    #[must_use]
    pub fn transaction_stream(&self) -> Option<TransactionStream> {
        self.unclaimed_stream.lock().take()
    }

    /// Drop the active subscription. Safe to call when none is active.
    pub fn unsubscribe(&self) {
        self.release_snapshot_wait();
        let Some(active) = self.take_active() else {
            tracing::debug!("Unsubscribe with no active subscription");
            return;
        };

        if self.transport.unsubscribe_push(&active.channel) {
            tracing::info!(channel = %active.channel, "Push subscription removed");
        } else {
            tracing::warn!(channel = %active.channel, "Terminal did not confirm unsubscribe");
        }
    }

    /// Drop every subscription on the terminal. Idempotent and safe during
    /// teardown; returns whether the terminal confirmed.
    pub fn unsubscribe_all(&self) -> bool {
        self.release_snapshot_wait();
        let active = self.take_active();

        let confirmed = self.transport.unsubscribe_all_push();
        if confirmed {
            tracing::info!(
                channel = ?active.as_ref().map(|a| &a.channel),
                "All push subscriptions removed"
            );
        } else {
            tracing::warn!("Terminal did not confirm unsubscribe-all");
        }
        confirmed
    }

    /// Route one push. Never fails; problems are logged.
    pub fn dispatch(&self, push: &RawPush) {
        let sender = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(active) if push.is_for(&active.channel) => active.sender.clone(),
                Some(active) => {
                    tracing::debug!(
                        real_name = %push.real_name,
                        key = %push.subscription_key,
                        active = %active.channel,
                        "Discarding push for inactive channel"
                    );
                    return;
                }
                None => {
                    tracing::debug!(real_name = %push.real_name, "Discarding push, no subscription");
                    return;
                }
            }
        };

        metrics::record_push_received();
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(push);
        }

        let transaction = match self.normalizer.ingest(push) {
            Ok(transaction) => transaction,
            Err(malformed) => {
                tracing::warn!(
                    local_sequence = malformed.transaction.local_sequence,
                    block = %push.block,
                    error = %malformed.error,
                    "Forwarding malformed push unparsed"
                );
                metrics::record_malformed_push();
                malformed.transaction
            }
        };

        tracing::debug!(
            local_sequence = transaction.local_sequence,
            remote_id = ?transaction.remote_id,
            duplicate_suspect = transaction.is_duplicate_suspect(),
            "Transaction normalized"
        );
        metrics::record_transaction(transaction.is_duplicate_suspect());

        if sender.send(transaction).is_err() {
            tracing::debug!("Transaction stream closed, record dropped");
        }
    }

    /// Pump pushes from the terminal until cancelled or the channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut pushes: mpsc::UnboundedReceiver<RawPush>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Push pump cancelled");
                    break;
                }
                push = pushes.recv() => match push {
                    Some(push) => self.dispatch(&push),
                    None => {
                        tracing::debug!("Push channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Request the terminal's current output for the active channel.
    ///
    /// # Errors
    ///
    /// - `InvalidState` with no active subscription
    /// - `TransportError` if the terminal refuses, the wait is cancelled or
    ///   no completion arrives within the snapshot timeout
    pub async fn fetch_snapshot(&self) -> Result<String, SessionError> {
        let channel = self.active_channel().ok_or_else(|| SessionError::InvalidState {
            message: "snapshot requires an active subscription".to_string(),
        })?;

        let mut snapshots = self.snapshots.lock().await;
        let cancel = self.snapshot_cancel.lock().clone();
        while let Ok(stale) = snapshots.try_recv() {
            tracing::debug!(channel = %stale.channel, "Discarding stale snapshot completion");
        }

        let Some(raw) = self.transport.request_push_snapshot(&channel) else {
            return Err(SessionError::transport(format!(
                "snapshot of {channel} refused"
            )));
        };

        let completed = tokio::select! {
            () = cancel.cancelled() => {
                return Err(SessionError::transport(format!("snapshot of {channel} cancelled")));
            }
            result = tokio::time::timeout(
                self.snapshot_timeout,
                Self::next_completion_for(&mut snapshots, &channel),
            ) => result,
        };

        match completed {
            Ok(true) => {
                tracing::debug!(%channel, bytes = raw.len(), "Snapshot received");
                Ok(raw)
            }
            Ok(false) => Err(SessionError::transport("snapshot completion channel closed")),
            Err(_) => Err(SessionError::transport(format!(
                "snapshot of {channel} timed out after {}ms",
                self.snapshot_timeout.as_millis()
            ))),
        }
    }

    async fn next_completion_for(
        snapshots: &mut mpsc::UnboundedReceiver<SnapshotCompletion>,
        channel: &PushChannel,
    ) -> bool {
        while let Some(completion) = snapshots.recv().await {
            if &completion.channel == channel {
                return true;
            }
            tracing::debug!(received = %completion.channel, "Ignoring snapshot for another channel");
        }
        false
    }

    fn take_active(&self) -> Option<ActiveSubscription> {
        self.unclaimed_stream.lock().take();
        self.active.lock().take()
    }

    fn release_snapshot_wait(&self) {
        let mut token = self.snapshot_cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_stream::StreamExt;

    use super::*;
    use crate::application::ports::{MockTerminalTransport, terminal_channels};
    use crate::application::services::normalizer::NormalizerConfig;
    use crate::domain::{FieldCode, FieldMap};

    fn channel() -> PushChannel {
        PushChannel::new("FX_TICK", "GBP/AUD")
    }

    fn dispatcher(
        transport: MockTerminalTransport,
        snapshots: mpsc::UnboundedReceiver<SnapshotCompletion>,
    ) -> EventDispatcher {
        let normalizer = Arc::new(TransactionNormalizer::new(NormalizerConfig {
            remote_id_field: FieldCode::new("ID").unwrap(),
            dedup_window: 16,
        }));
        EventDispatcher::new(
            Arc::new(transport),
            normalizer,
            snapshots,
            Duration::from_secs(1),
        )
    }

    fn accepting() -> MockTerminalTransport {
        let mut transport = MockTerminalTransport::new();
        transport.expect_subscribe_push().return_const(true);
        transport.expect_unsubscribe_push().return_const(true);
        transport.expect_unsubscribe_all_push().return_const(true);
        transport
    }

    #[tokio::test]
    async fn pushes_become_ordered_transactions() {
        let (_callbacks, receivers) = terminal_channels();
        let dispatcher = dispatcher(accepting(), receivers.snapshots);
        dispatcher.subscribe(channel()).unwrap();
        let mut stream = dispatcher.transaction_stream().unwrap();

        dispatcher.dispatch(
            &RawPush::text(&channel(), "  A  20200302093015  X  1234.50  ")
                .with_fields(FieldMap::parse("ID=T-1").unwrap()),
        );
        dispatcher.dispatch(&RawPush::text(&channel(), "short"));
        dispatcher.dispatch(&RawPush::text(&channel(), "a b 20200302093016 d 1234.75"));

        let first = stream.next().await.unwrap();
        assert_eq!(first.local_sequence, 0);
        assert_eq!(first.price.as_deref(), Some("1234.50"));
        assert_eq!(first.remote_id.as_deref(), Some("T-1"));

        let malformed = stream.next().await.unwrap();
        assert_eq!(malformed, Transaction::unparsed(1));

        let third = stream.next().await.unwrap();
        assert_eq!(third.local_sequence, 2);
        assert!(third.is_duplicate_suspect());
    }

    #[tokio::test]
    async fn pushes_for_other_channels_are_discarded() {
        let (_callbacks, receivers) = terminal_channels();
        let dispatcher = dispatcher(accepting(), receivers.snapshots);
        dispatcher.subscribe(channel()).unwrap();
        let mut stream = dispatcher.transaction_stream().unwrap();

        dispatcher.dispatch(&RawPush::text(&PushChannel::new("FX_TICK", "EUR/USD"), "a b c d e"));
        dispatcher.dispatch(&RawPush::text(&channel(), "a b c d e"));

        // The discarded push consumed no sequence.
        assert_eq!(stream.next().await.unwrap().local_sequence, 0);
    }

    #[tokio::test]
    async fn resubscribe_replaces_stream() {
        let (_callbacks, receivers) = terminal_channels();
        let dispatcher = dispatcher(accepting(), receivers.snapshots);
        dispatcher.subscribe(channel()).unwrap();
        let mut old = dispatcher.transaction_stream().unwrap();

        let other = PushChannel::new("FX_TICK", "EUR/USD");
        dispatcher.subscribe(other.clone()).unwrap();
        let mut new = dispatcher.transaction_stream().unwrap();
        assert!(dispatcher.transaction_stream().is_none());

        dispatcher.dispatch(&RawPush::text(&other, "a b c d e"));
        assert!(old.next().await.is_none());
        assert_eq!(new.next().await.unwrap().local_sequence, 0);
        assert_eq!(new.channel(), &other);
    }

    #[test]
    fn rejected_subscription_is_a_transport_error() {
        let (_callbacks, receivers) = terminal_channels();
        let mut transport = MockTerminalTransport::new();
        transport.expect_subscribe_push().return_const(false);
        let dispatcher = dispatcher(transport, receivers.snapshots);

        let err = dispatcher.subscribe(channel()).unwrap_err();
        assert_eq!(err.kind(), crate::domain::FailureKind::TransportError);
        assert_eq!(dispatcher.active_channel(), Some(channel()));
    }

    #[test]
    fn unsubscribe_all_is_idempotent() {
        let (_callbacks, receivers) = terminal_channels();
        let mut transport = MockTerminalTransport::new();
        transport
            .expect_unsubscribe_all_push()
            .times(2)
            .return_const(true);
        transport.expect_unsubscribe_push().never();
        let dispatcher = dispatcher(transport, receivers.snapshots);

        assert!(dispatcher.unsubscribe_all());
        assert!(dispatcher.unsubscribe_all());
        dispatcher.unsubscribe();
        assert_eq!(dispatcher.active_channel(), None);
    }

    #[tokio::test]
    async fn handler_sees_raw_pushes_for_active_channel() {
        let (_callbacks, receivers) = terminal_channels();
        let dispatcher = dispatcher(accepting(), receivers.snapshots);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.on_push(Arc::new(move |_push: &RawPush| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.dispatch(&RawPush::text(&channel(), "a b c d e"));
        dispatcher.subscribe(channel()).unwrap();
        dispatcher.dispatch(&RawPush::text(&channel(), "a b c d e"));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_pumps_until_cancelled() {
        let (callbacks, receivers) = terminal_channels();
        let dispatcher = Arc::new(dispatcher(accepting(), receivers.snapshots));
        dispatcher.subscribe(channel()).unwrap();
        let mut stream = dispatcher.transaction_stream().unwrap();
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(Arc::clone(&dispatcher).run(receivers.pushes, cancel.clone()));

        callbacks.push(RawPush::text(&channel(), "a b c d e"));
        assert_eq!(stream.next().await.unwrap().local_sequence, 0);

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_waits_for_its_own_completion() {
        let (callbacks, receivers) = terminal_channels();
        let mut transport = accepting();
        transport
            .expect_request_push_snapshot()
            .returning(move |channel| {
                callbacks.snapshot_completed(SnapshotCompletion {
                    channel: PushChannel::new("OTHER", "X"),
                });
                callbacks.snapshot_completed(SnapshotCompletion {
                    channel: channel.clone(),
                });
                Some("a b 20200302093015 d 1.5".to_string())
            });
        let dispatcher = dispatcher(transport, receivers.snapshots);
        dispatcher.subscribe(channel()).unwrap();

        let raw = dispatcher.fetch_snapshot().await.unwrap();
        assert_eq!(raw, "a b 20200302093015 d 1.5");
    }

    #[tokio::test]
    async fn snapshot_without_subscription_is_invalid() {
        let (_callbacks, receivers) = terminal_channels();
        let dispatcher = dispatcher(MockTerminalTransport::new(), receivers.snapshots);

        let err = dispatcher.fetch_snapshot().await.unwrap_err();
        assert_eq!(err.kind(), crate::domain::FailureKind::InvalidState);
    }

    #[tokio::test]
    async fn unsubscribe_cancels_pending_snapshot() {
        let (_callbacks, receivers) = terminal_channels();
        let mut transport = accepting();
        transport
            .expect_request_push_snapshot()
            .returning(|_| Some(String::new()));
        let dispatcher = dispatcher(transport, receivers.snapshots);
        dispatcher.subscribe(channel()).unwrap();

        let mut snapshot = tokio_test::task::spawn(dispatcher.fetch_snapshot());
        tokio_test::assert_pending!(snapshot.poll());

        dispatcher.unsubscribe();
        assert!(snapshot.is_woken());
        let err = tokio_test::assert_ready_err!(snapshot.poll());
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_times_out() {
        let (_callbacks, receivers) = terminal_channels();
        let mut transport = accepting();
        transport
            .expect_request_push_snapshot()
            .returning(|_| Some(String::new()));
        let dispatcher = dispatcher(transport, receivers.snapshots);
        dispatcher.subscribe(channel()).unwrap();

        let err = dispatcher.fetch_snapshot().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
