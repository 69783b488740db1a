//! Session Assembly
//!
//! Wires the request manager, normalizer, dispatcher and controller around
//! one transport and its completion channels. Also reads the replay line
//! format used to feed pushes into a simulated terminal.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{SharedTransport, TerminalReceivers};
use crate::application::services::{
    EventDispatcher, RequestSessionManager, SessionController, TransactionNormalizer,
};
use crate::domain::{FieldMap, FieldParseError, PushChannel, RawPush};
use crate::infrastructure::config::BridgeConfig;

/// Every service of one bridge session.
#[derive(Debug)]
pub struct BridgeSession {
    controller: Arc<SessionController>,
    requests: Arc<RequestSessionManager>,
    normalizer: Arc<TransactionNormalizer>,
    pushes: Mutex<Option<mpsc::UnboundedReceiver<RawPush>>>,
}

impl BridgeSession {
    /// Build the services. The push pump is not started.
    #[must_use]
    pub fn assemble(
        transport: SharedTransport,
        receivers: TerminalReceivers,
        config: &BridgeConfig,
    ) -> Self {
        let TerminalReceivers {
            queries,
            snapshots,
            pushes,
        } = receivers;

        let requests = Arc::new(RequestSessionManager::new(
            Arc::clone(&transport),
            queries,
            config.query.clone(),
        ));
        let normalizer = Arc::new(TransactionNormalizer::new(config.normalizer.clone()));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&normalizer),
            snapshots,
            config.query.timeout,
        ));
        let controller = Arc::new(SessionController::new(
            transport,
            Arc::clone(&requests),
            dispatcher,
            config.auth,
            config.channel.clone(),
        ));

        Self {
            controller,
            requests,
            normalizer,
            pushes: Mutex::new(Some(pushes)),
        }
    }

    /// Lifecycle controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Request session manager.
    #[must_use]
    pub const fn requests(&self) -> &Arc<RequestSessionManager> {
        &self.requests
    }

    /// Transaction normalizer.
    #[must_use]
    pub const fn normalizer(&self) -> &Arc<TransactionNormalizer> {
        &self.normalizer
    }

    /// Start routing pushes into the dispatcher. Only the first call spawns.
    pub fn spawn_pump(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let pushes = self.pushes.lock().take()?;
        let dispatcher = Arc::clone(self.controller.dispatcher());
        Some(tokio::spawn(dispatcher.run(pushes, cancel)))
    }
}

/// Parse one replay line: a push block, optionally followed by `|` and
/// whitespace-separated `code=value` fields.
///
/// Leading whitespace of the block is kept since it shifts token positions.
///
/// # Errors
///
/// Returns an error if a field token lacks `=` or has an invalid code.
pub fn replay_push(channel: &PushChannel, line: &str) -> Result<RawPush, FieldParseError> {
    let (block, fields) = match line.split_once('|') {
        Some((block, fields)) => (block, FieldMap::parse(fields)?),
        None => (line, FieldMap::new()),
    };
    Ok(RawPush::text(channel, block.trim_end()).with_fields(fields))
}
