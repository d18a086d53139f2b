#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::close::CloseCode;
use super::envelope::Envelope;
#[cfg(feature = "tracing")]
use super::error::WsError;
use super::session::{Action, Event, Frame, LinkId, Session};
use super::traits::SocketHandler;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Opening = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;

/// How long to wait for a close frame to be written before dropping the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to retry after a failure
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Connected, or a connection attempt is in flight.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected { .. })
    }
}

/// Current time on the tokio clock, so paused-time tests drive the session too.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// State shared between client handles and the connection driver.
pub(crate) struct Shared {
    session: Mutex<Session>,
    /// Signalled whenever a handle changes the session
    wake: Notify,
    state_tx: watch::Sender<ConnectionState>,
    broadcast_tx: broadcast::Sender<Envelope>,
    handlers: RwLock<Vec<Arc<dyn SocketHandler>>>,
}

impl Shared {
    pub(crate) fn new(session: Session, broadcast_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(session.state());
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity.max(1));

        Self {
            session: Mutex::new(session),
            wake: Notify::new(),
            state_tx,
            broadcast_tx,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Run `op` on the session and wake the driver to carry out its actions.
    pub(crate) fn apply<R, F>(&self, op: F) -> R
    where
        F: FnOnce(&mut Session, Instant) -> R,
    {
        let result = self.update(op);
        self.wake.notify_one();
        result
    }

    /// Read from the session without changing it.
    pub(crate) fn inspect<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Session) -> R,
    {
        f(&self.lock())
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.broadcast_tx.subscribe()
    }

    pub(crate) fn add_handler(&self, handler: Arc<dyn SocketHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` and publish the resulting state while the lock is still held,
    /// so observers see transitions in order.
    fn update<R, F>(&self, op: F) -> R
    where
        F: FnOnce(&mut Session, Instant) -> R,
    {
        let mut session = self.lock();
        let result = op(&mut session, now());
        let state = session.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        result
    }

    fn take_actions(&self) -> Vec<Action> {
        self.lock().take_actions()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().next_deadline()
    }

    /// Deliver an event to subscribers and handlers. Called without the session lock.
    fn dispatch(&self, event: &Event) {
        if let Event::Message(envelope) = event {
            // No receivers is fine
            _ = self.broadcast_tx.send(envelope.clone());
        }

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            match event {
                Event::Connected => handler.on_connect(),
                Event::Disconnected { code, reconnecting } => {
                    handler.on_disconnect(*code, *reconnecting);
                }
                Event::Message(envelope) => handler.on_message(envelope),
            }
        }
    }
}

/// An open WebSocket connection.
struct Link {
    id: LinkId,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

/// Background task that carries out [`Session`] actions over `tokio-tungstenite`.
///
/// The driver owns the socket. It feeds socket events and timer expiries into
/// the session and executes the actions that come back, in the order the
/// session produced them. It stops when every client handle has been dropped.
pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    link: Option<Link>,
    opening: Option<(LinkId, Opening)>,
    write_timeout: Duration,
}

impl ConnectionManager {
    /// Start the driver on the current tokio runtime.
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        shutdown: CancellationToken,
        write_timeout: Duration,
    ) {
        let manager = Self {
            shared,
            shutdown,
            link: None,
            opening: None,
            write_timeout,
        };
        tokio::spawn(manager.run());
    }

    async fn run(mut self) {
        loop {
            self.execute_pending().await;
            let deadline = self.shared.next_deadline();

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.shared.wake.notified() => {}
                (id, result) = Self::opened(&mut self.opening) => {
                    self.opening = None;
                    self.on_open(id, result);
                }
                (id, message) = Self::next_message(&mut self.link) => self.on_message(id, message),
                () = Self::sleep(deadline) => self.shared.update(Session::fire_due),
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("All client handles dropped, stopping connection driver");

        if let Some(link) = self.link.take() {
            Self::send_close(link, CloseCode::NORMAL).await;
        }
    }

    async fn opened(
        opening: &mut Option<(LinkId, Opening)>,
    ) -> (LinkId, Result<WsStream, tungstenite::Error>) {
        match opening {
            Some((id, future)) => (*id, future.await),
            None => pending().await,
        }
    }

    async fn next_message(
        link: &mut Option<Link>,
    ) -> (LinkId, Option<Result<Message, tungstenite::Error>>) {
        match link {
            Some(link) => (link.id, link.read.next().await),
            None => pending().await,
        }
    }

    async fn sleep(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline.into()).await,
            None => pending().await,
        }
    }

    fn on_open(&mut self, id: LinkId, result: Result<WsStream, tungstenite::Error>) {
        match result {
            Ok(stream) => {
                let (write, read) = stream.split();
                self.link = Some(Link { id, write, read });
                self.shared.update(|session, now| session.opened(id, now));
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(link = %id, error = %WsError::Connection(e), "Unable to connect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.shared
                    .update(|session, now| session.connect_failed(id, now));
            }
        }
    }

    fn on_message(&mut self, id: LinkId, message: Option<Result<Message, tungstenite::Error>>) {
        let code = match message {
            Some(Ok(Message::Text(text))) => {
                self.shared
                    .update(|session, now| session.received_text(id, text.as_str(), now));
                return;
            }
            Some(Ok(Message::Close(frame))) => frame.map_or(CloseCode::NO_STATUS, |frame| {
                CloseCode::from(u16::from(frame.code))
            }),
            Some(Ok(_)) => {
                // Binary frames and protocol-level ping/pong are not part of the envelope protocol.
                return;
            }
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(link = %id, error = %WsError::Connection(e), "Connection error");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                CloseCode::ABNORMAL
            }
            None => CloseCode::ABNORMAL,
        };

        self.link = None;
        self.shared
            .update(|session, now| session.link_closed(id, code, now));
    }

    /// Execute actions until the session stops producing them.
    async fn execute_pending(&mut self) {
        loop {
            let actions = self.shared.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.execute(action).await;
            }
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Open { link, url } => {
                // A session holds at most one connection.
                self.link = None;
                let target = url.to_string();
                self.opening = Some((
                    link,
                    Box::pin(async move { connect_async(target).await.map(|(stream, _)| stream) }),
                ));
            }
            Action::Transmit { link, frame } => self.transmit(link, frame).await,
            Action::Close { link, code } => {
                if self.opening.as_ref().is_some_and(|(id, _)| *id == link) {
                    self.opening = None;
                }
                if let Some(link) = self.link.take_if(|held| held.id == link) {
                    Self::send_close(link, code).await;
                }
            }
            Action::Emit(event) => self.shared.dispatch(&event),
        }
    }

    async fn transmit(&mut self, id: LinkId, frame: Frame) {
        let text = match frame.envelope().to_text() {
            Ok(text) => text,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Dropping message that cannot be serialized");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        let failed_on = match self.link.as_mut().filter(|link| link.id == id) {
            Some(link) => {
                let write = link.write.send(Message::Text(text.into()));
                match timeout(self.write_timeout, write).await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(link = %id, error = %WsError::Connection(e), "Write failed");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                        Some(id)
                    }
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(link = %id, timeout = ?self.write_timeout, "Write timed out");
                        Some(id)
                    }
                }
            }
            None => None,
        };

        self.shared
            .update(|session, now| session.transmit_failed(failed_on, frame, now));
    }

    async fn send_close(mut link: Link, code: CloseCode) {
        let frame = CloseFrame {
            code: u16::from(code).into(),
            reason: Utf8Bytes::from_static(""),
        };
        let result = timeout(CLOSE_TIMEOUT, link.write.send(Message::Close(Some(frame)))).await;

        #[cfg(feature = "tracing")]
        match result {
            Ok(Ok(())) => tracing::debug!(link = %link.id, %code, "Connection closed"),
            Ok(Err(e)) => tracing::debug!(link = %link.id, error = %e, "Close frame not delivered"),
            Err(_) => tracing::debug!(link = %link.id, "Timed out sending close frame"),
        }
        #[cfg(not(feature = "tracing"))]
        let _ = &result;
    }
}
