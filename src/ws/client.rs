use std::fmt;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::config::Config;
use super::connection::{ConnectionManager, ConnectionState, Shared};
use super::envelope::Envelope;
use super::environment::{EnvironmentNotifier, EnvironmentSignal};
use super::error::WsError;
use super::quality::ConnectionQuality;
use super::session::{SendStatus, Session};
use super::traits::{EnvironmentWatcher, SocketHandler};
use crate::Result;
use crate::error::Error;

/// Self-healing WebSocket client.
///
/// A `Client` is a cheap handle: clones share one connection, one outbound
/// queue and one set of handlers. The connection is driven by a background
/// task that stops when the last handle is dropped.
///
/// Every method returns immediately. Socket I/O happens on the background
/// task, and results are reported through [`Client::state_receiver`],
/// [`Client::subscribe`], [`Client::messages`] and registered
/// [`SocketHandler`]s.
///
/// # Examples
///
/// ```rust, no_run
/// use futures::StreamExt as _;
/// use resilient_ws::ws::{Client, Config, Envelope};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("wss://feed.example.com/live", Config::default());
///     client.connect();
///     client.send(Envelope::new("subscribe", json!({ "channel": "prices" })), 10);
///
///     let mut messages = Box::pin(client.messages());
///     while let Some(message) = messages.next().await {
///         let message = message?;
///         println!("{}: {}", message.kind, message.data);
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    /// Stops the connection task once the last handle is gone
    _guard: DropGuard,
}

impl Client {
    /// Create a client for `endpoint` and start its connection task.
    ///
    /// No connection is made until [`Client::connect`]. An endpoint that is
    /// not a `ws`, `wss`, `http` or `https` URL is reported when connecting.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new<S: Into<String>>(endpoint: S, config: Config) -> Self {
        let capacity = config.broadcast_capacity;
        let write_timeout = config.write_timeout;
        let session = Session::new(endpoint, config, super::connection::now());
        let shared = Arc::new(Shared::new(session, capacity));
        let shutdown = CancellationToken::new();

        ConnectionManager::spawn(Arc::clone(&shared), shutdown.clone(), write_timeout);

        Self {
            inner: Arc::new(ClientInner {
                shared,
                _guard: shutdown.clone().drop_guard(),
                shutdown,
            }),
        }
    }

    /// Connect, and keep reconnecting until [`Client::disconnect`].
    ///
    /// Does nothing while already connecting or connected.
    pub fn connect(&self) {
        self.inner.shared.apply(|session, _| session.connect());
    }

    /// Close the connection without reconnecting.
    ///
    /// Pending timers are cancelled, queued messages are discarded and the
    /// reconnect attempt counter starts over.
    pub fn disconnect(&self) {
        self.inner.shared.apply(|session, _| session.disconnect());
    }

    /// Close the connection and connect again after the configured restart
    /// delay, with a fresh attempt counter. Queued messages are kept.
    pub fn reconnect(&self) {
        self.inner.shared.apply(Session::reconnect);
    }

    /// Send `envelope`, or queue it when the connection is down, throttled or
    /// already has messages waiting. Higher `priority` is delivered first.
    pub fn send(&self, envelope: Envelope, priority: i32) -> SendStatus {
        self.inner
            .shared
            .apply(|session, now| session.send(envelope, priority, now))
    }

    /// Serialize `data` into an envelope of type `kind` and send it.
    pub fn send_data<K, T>(&self, kind: K, data: &T, priority: i32) -> Result<SendStatus>
    where
        K: Into<String>,
        T: Serialize,
    {
        Ok(self.send(Envelope::with_data(kind, data)?, priority))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.inspect(Session::state)
    }

    /// The most recent non-heartbeat message received.
    #[must_use]
    pub fn last_message(&self) -> Option<Envelope> {
        self.inner
            .shared
            .inspect(|session| session.last_message().cloned())
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.inner.shared.inspect(Session::quality)
    }

    /// Messages waiting in the outbound queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner.shared.inspect(Session::queued_count)
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for re-sending subscriptions after a reconnect.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state_receiver()
    }

    /// Subscribe to incoming messages.
    ///
    /// Each call returns a new independent receiver. A receiver that falls
    /// more than the configured broadcast capacity behind loses the oldest
    /// messages.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.shared.subscribe()
    }

    /// Stream of incoming messages.
    ///
    /// Yields [`WsError::Lagged`] each time the consumer falls behind, then
    /// continues with the oldest message still buffered. Ends when the client
    /// is dropped.
    pub fn messages(&self) -> impl Stream<Item = Result<Envelope>> + use<> {
        let mut rx = self.subscribe();

        stream! {
            loop {
                match rx.recv().await {
                    Ok(envelope) => yield Ok(envelope),
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Message stream lagged, missed {count} messages");
                        yield Err(Error::from(WsError::Lagged { count }));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Register a handler for lifecycle events and messages.
    pub fn add_handler<H: SocketHandler>(&self, handler: H) {
        self.inner.shared.add_handler(Arc::new(handler));
    }

    /// Handle for delivering host environment signals to this client.
    #[must_use]
    pub fn environment_notifier(&self) -> EnvironmentNotifier {
        EnvironmentNotifier::new(&self.inner.shared, self.inner.shutdown.clone())
    }

    /// Start `watcher` with a notifier for this client.
    pub fn watch_environment<W: EnvironmentWatcher>(&self, watcher: W) {
        watcher.watch(self.environment_notifier());
    }

    /// Shorthand for [`EnvironmentNotifier::notify`].
    pub fn notify_environment(&self, signal: EnvironmentSignal) {
        self.inner.shared.apply(|session, _| session.environment(signal));
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("queued", &self.queued_count())
            .finish_non_exhaustive()
    }
}
