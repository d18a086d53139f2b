//! Transport-independent connection state machine.
//!
//! [`Session`] holds everything the client decides: connection state, the
//! reconnect attempt counter, the outbound queue, heartbeat bookkeeping and
//! the three named timers. It performs no I/O. Each input is a method call
//! taking the current [`Instant`], and the resulting side effects are queued as
//! [`Action`]s for the driver to carry out in order (see
//! [`ConnectionManager`](super::connection::ConnectionManager)).

use std::fmt;
use std::time::Instant;

use backoff::backoff::Backoff as _;
use chrono::Utc;
use url::Url;

use super::backoff::ReconnectBackoff;
use super::close::CloseCode;
use super::config::Config;
use super::connection::ConnectionState;
use super::endpoint::normalize_endpoint;
use super::envelope::{Envelope, Inbound, parse_frame};
use super::environment::EnvironmentSignal;
#[cfg(feature = "tracing")]
use super::error::WsError;
use super::quality::{ConnectionQuality, HeartbeatMonitor, Pulse};
use super::queue::{OutboundMessage, OutboundQueue};
use super::timers::{TimerKind, Timers};

/// Identifies one physical connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of [`Session::send`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed to the socket right away
    Sent,
    /// Waiting in the outbound queue
    Queued,
}

/// A frame to write to the socket.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Frame {
    /// Application message, re-queued if the write fails
    Message(OutboundMessage),
    /// PING or PONG, dropped if the write fails
    Heartbeat(Envelope),
}

impl Frame {
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        match self {
            Self::Message(message) => &message.envelope,
            Self::Heartbeat(envelope) => envelope,
        }
    }
}

/// Notification for consumers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected {
        code: CloseCode,
        /// Whether a reconnect was scheduled
        reconnecting: bool,
    },
    Message(Envelope),
}

/// Side effect requested by the session.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Action {
    /// Start a new physical connection, dropping any previous one
    Open { link: LinkId, url: Url },
    /// Write a frame on `link`
    Transmit { link: LinkId, frame: Frame },
    /// Close `link` with `code`
    Close { link: LinkId, code: CloseCode },
    /// Notify handlers and subscribers
    Emit(Event),
}

/// Maps [`Instant`]s to Unix milliseconds for heartbeat timestamps.
#[derive(Debug, Clone, Copy)]
struct WallClock {
    origin: Instant,
    origin_ms: i64,
}

impl WallClock {
    fn new(origin: Instant) -> Self {
        Self {
            origin,
            origin_ms: Utc::now().timestamp_millis(),
        }
    }

    fn millis(self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.origin).as_millis();
        self.origin_ms
            .saturating_add(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}

/// Connection state machine for one endpoint.
#[derive(Debug)]
pub struct Session {
    config: Config,
    endpoint: String,
    state: ConnectionState,
    backoff: ReconnectBackoff,
    queue: OutboundQueue,
    heartbeat: HeartbeatMonitor,
    timers: Timers,
    link: Option<LinkId>,
    next_link: u64,
    last_send: Option<Instant>,
    /// Set by `connect`, cleared by `disconnect`
    wants_connection: bool,
    has_connected: bool,
    last_message: Option<Envelope>,
    clock: WallClock,
    actions: Vec<Action>,
}

impl Session {
    #[must_use]
    pub fn new<S: Into<String>>(endpoint: S, config: Config, now: Instant) -> Self {
        Self {
            backoff: config.reconnect.clone().into(),
            heartbeat: HeartbeatMonitor::new(config.max_missed_pongs),
            config,
            endpoint: endpoint.into(),
            state: ConnectionState::Disconnected,
            queue: OutboundQueue::new(),
            timers: Timers::default(),
            link: None,
            next_link: 0,
            last_send: None,
            wants_connection: false,
            has_connected: false,
            last_message: None,
            clock: WallClock::new(now),
            actions: Vec::new(),
        }
    }

    /// Drain the actions produced so far, oldest first.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Start connecting. Ignored while connecting or connected, and when the
    /// endpoint is not a usable URL.
    pub fn connect(&mut self) {
        if self.state.is_active() {
            #[cfg(feature = "tracing")]
            tracing::debug!(state = %self.state, "Connect ignored, connection already active");
            return;
        }

        let url = match normalize_endpoint(&self.endpoint) {
            Ok(url) => url,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(endpoint = %self.endpoint, error = %e, "Unable to connect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        self.wants_connection = true;
        self.timers.cancel(TimerKind::Reconnect);

        let link = LinkId(self.next_link);
        self.next_link += 1;
        self.link = Some(link);
        self.state = ConnectionState::Connecting;

        #[cfg(feature = "tracing")]
        tracing::debug!(%link, %url, attempt = self.backoff.attempt(), "Connecting");

        self.actions.push(Action::Open { link, url });
    }

    /// Close the connection on purpose. Nothing reconnects afterwards, and the
    /// outbound queue and connection quality are discarded.
    pub fn disconnect(&mut self) {
        self.wants_connection = false;
        self.teardown(false);
        self.queue.clear();
        self.backoff.reset();
        self.heartbeat.reset();
    }

    /// Reset the attempt counter, close, and connect again after the restart delay.
    ///
    /// Unlike [`Session::disconnect`] the outbound queue is kept.
    pub fn reconnect(&mut self, now: Instant) {
        self.backoff.reset();
        self.teardown(true);
        self.wants_connection = true;
        self.timers.arm(
            TimerKind::Reconnect,
            now + self.config.reconnect.restart_delay,
        );
    }

    /// Send `envelope` now if possible, otherwise queue it.
    ///
    /// A message goes straight out only while connected, outside the
    /// throttle window and with nothing already queued ahead of it.
    pub fn send(&mut self, envelope: Envelope, priority: i32, now: Instant) -> SendStatus {
        if self.state.is_connected()
            && let Some(link) = self.link
            && self.queue.is_empty()
            && !self.is_throttled(now)
        {
            self.last_send = Some(now);
            self.actions.push(Action::Transmit {
                link,
                frame: Frame::Message(OutboundMessage::new(envelope, priority, now)),
            });
            return SendStatus::Sent;
        }

        self.queue.push(envelope, priority, now);
        if self.state.is_connected() && !self.timers.is_armed(TimerKind::Batch) {
            self.timers
                .arm(TimerKind::Batch, now + self.config.batch.flush_interval);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(priority, queued = self.queue.len(), "Message queued");

        SendStatus::Queued
    }

    /// The physical connection for `link` is open.
    pub fn opened(&mut self, link: LinkId, now: Instant) {
        if self.link != Some(link) || self.state != ConnectionState::Connecting {
            #[cfg(feature = "tracing")]
            tracing::debug!(%link, "Closing connection that opened after it was abandoned");
            self.actions.push(Action::Close {
                link,
                code: CloseCode::NORMAL,
            });
            return;
        }

        self.state = ConnectionState::Connected { since: now };
        self.has_connected = true;
        self.backoff.reset();
        self.heartbeat.restart();
        self.last_send = None;

        #[cfg(feature = "tracing")]
        tracing::debug!(%link, queued = self.queue.len(), "Connected");

        self.actions.push(Action::Emit(Event::Connected));

        self.send_ping(link, now);
        self.timers
            .arm(TimerKind::Heartbeat, now + self.config.heartbeat_interval);
        if !self.queue.is_empty() {
            self.timers.arm(TimerKind::Batch, now);
        }
    }

    /// Establishing `link` failed before it opened.
    pub fn connect_failed(&mut self, link: LinkId, now: Instant) {
        if self.link != Some(link) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(%link, "Unable to establish connection");

        self.closed(CloseCode::ABNORMAL, now);
    }

    /// `link` was closed by the peer or dropped.
    pub fn link_closed(&mut self, link: LinkId, code: CloseCode, now: Instant) {
        if self.link != Some(link) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%link, %code, "Ignoring closure of stale connection");
            return;
        }

        self.closed(code, now);
    }

    /// A text frame arrived on `link`.
    pub fn received_text(&mut self, link: LinkId, text: &str, now: Instant) {
        if self.link != Some(link) || !self.state.is_connected() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Received WebSocket text message");

        match parse_frame(text) {
            Ok(None) => {}
            Ok(Some(Inbound::Ping { timestamp })) => {
                self.actions.push(Action::Transmit {
                    link,
                    frame: Frame::Heartbeat(Envelope::pong(timestamp)),
                });
            }
            Ok(Some(Inbound::Pong { timestamp })) => {
                self.heartbeat
                    .pong_received(timestamp, self.clock.millis(now));
            }
            Ok(Some(Inbound::Message(envelope))) => {
                self.last_message = Some(envelope.clone());
                self.actions.push(Action::Emit(Event::Message(envelope)));
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    /// Writing `frame` failed. `link` is the connection the driver held, if any.
    ///
    /// Messages go back into the queue one priority level lower. A failure on
    /// the live connection closes it and starts the reconnect path.
    pub fn transmit_failed(&mut self, link: Option<LinkId>, frame: Frame, now: Instant) {
        if let Frame::Message(mut message) = frame {
            message.priority = message.priority.saturating_sub(1);
            self.queue.requeue(message);
        }

        if link.is_some() && link == self.link && self.state.is_connected() {
            self.force_close(CloseCode::SEND_FAILURE, now);
        } else if self.state.is_connected() && !self.timers.is_armed(TimerKind::Batch) {
            self.timers
                .arm(TimerKind::Batch, now + self.config.batch.flush_interval);
        }
    }

    /// Run every timer whose deadline has passed.
    pub fn fire_due(&mut self, now: Instant) {
        for kind in TimerKind::ALL {
            if self.timers.deadline(kind).is_some_and(|deadline| deadline <= now) {
                self.timers.cancel(kind);
                match kind {
                    TimerKind::Reconnect => self.connect(),
                    TimerKind::Heartbeat => self.heartbeat_tick(now),
                    TimerKind::Batch => self.flush_batch(now),
                }
            }
        }
    }

    /// The host became visible or the network came back.
    pub fn environment(&mut self, signal: EnvironmentSignal) {
        #[cfg(not(feature = "tracing"))]
        let _ = signal;

        if !self.wants_connection || self.state.is_active() {
            #[cfg(feature = "tracing")]
            tracing::trace!(%signal, state = %self.state, "Environment signal ignored");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%signal, "Environment changed, reconnecting");

        self.connect();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.heartbeat.quality()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Envelope> {
        self.last_message.as_ref()
    }

    /// Reconnect attempts made since the last successful or clean connection.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    #[must_use]
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.timers.deadline(kind)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn is_throttled(&self, now: Instant) -> bool {
        self.last_send.is_some_and(|last| {
            now.saturating_duration_since(last) < self.config.batch.min_send_interval
        })
    }

    fn send_ping(&mut self, link: LinkId, now: Instant) {
        self.heartbeat.ping_sent();
        self.actions.push(Action::Transmit {
            link,
            frame: Frame::Heartbeat(Envelope::ping(self.clock.millis(now))),
        });
    }

    fn heartbeat_tick(&mut self, now: Instant) {
        let Some(link) = self.link.filter(|_| self.state.is_connected()) else {
            return;
        };

        match self.heartbeat.tick() {
            Pulse::Alive => {
                self.send_ping(link, now);
                self.timers
                    .arm(TimerKind::Heartbeat, now + self.config.heartbeat_interval);
            }
            Pulse::Expired { missed } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %WsError::HeartbeatTimeout { missed }, "Closing dead connection");
                #[cfg(not(feature = "tracing"))]
                let _ = missed;
                self.force_close(CloseCode::HEARTBEAT_TIMEOUT, now);
            }
        }
    }

    fn flush_batch(&mut self, now: Instant) {
        let Some(link) = self.link.filter(|_| self.state.is_connected()) else {
            return;
        };

        let batch = self.queue.drain_batch(self.config.batch.max_batch_size.max(1));
        if !batch.is_empty() {
            self.last_send = Some(now);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(count = batch.len(), remaining = self.queue.len(), "Flushing batch");

        self.actions
            .extend(batch.into_iter().map(|message| Action::Transmit {
                link,
                frame: Frame::Message(message),
            }));

        if !self.queue.is_empty() {
            self.timers
                .arm(TimerKind::Batch, now + self.config.batch.flush_interval);
        }
    }

    /// Close the live link ourselves and treat it as an abnormal closure.
    fn force_close(&mut self, code: CloseCode, now: Instant) {
        if let Some(link) = self.link {
            self.actions.push(Action::Close { link, code });
        }
        self.closed(code, now);
    }

    /// Common closure path for dropped, refused and force-closed links.
    fn closed(&mut self, code: CloseCode, now: Instant) {
        self.link = None;
        self.timers.cancel(TimerKind::Heartbeat);
        self.timers.cancel(TimerKind::Batch);
        self.heartbeat.restart();

        if code.is_normal() {
            self.backoff.reset();
        }

        let was_open = self.state.is_connected();
        let reconnecting = self.wants_connection
            && code.should_reconnect(self.has_connected)
            && self.schedule_reconnect(now);
        if !reconnecting {
            self.state = ConnectionState::Disconnected;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%code, reconnecting, state = %self.state, "Connection closed");

        if was_open {
            self.actions
                .push(Action::Emit(Event::Disconnected { code, reconnecting }));
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) -> bool {
        if self.timers.is_armed(TimerKind::Reconnect) {
            return true;
        }

        match self.backoff.next_backoff() {
            Some(delay) => {
                let attempt = self.backoff.attempt();
                self.state = ConnectionState::Reconnecting { attempt };
                self.timers.arm(TimerKind::Reconnect, now + delay);

                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, ?delay, "Reconnect scheduled");

                true
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    error = %WsError::ReconnectExhausted { attempts: self.backoff.attempt() },
                    "Giving up on connection"
                );
                false
            }
        }
    }

    /// Tear down the current link on purpose.
    fn teardown(&mut self, reconnecting: bool) {
        self.timers.cancel_all();
        self.heartbeat.restart();

        let was_open = self.state.is_connected();
        if let Some(link) = self.link.take() {
            self.actions.push(Action::Close {
                link,
                code: CloseCode::NORMAL,
            });
        }
        self.state = ConnectionState::Disconnected;

        if was_open {
            self.actions.push(Action::Emit(Event::Disconnected {
                code: CloseCode::NORMAL,
                reconnecting,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::ws::config::{BatchConfig, ReconnectConfig};

    const ENDPOINT: &str = "ws://127.0.0.1:9001/live";

    fn config() -> Config {
        Config::builder()
            .heartbeat_interval(Duration::from_secs(30))
            .reconnect(
                ReconnectConfig::builder()
                    .base_interval(Duration::from_millis(1000))
                    .max_delay(Duration::from_millis(30_000))
                    .max_attempts(3)
                    .build(),
            )
            .batch(
                BatchConfig::builder()
                    .min_send_interval(Duration::from_millis(100))
                    .flush_interval(Duration::from_millis(50))
                    .max_batch_size(10)
                    .build(),
            )
            .build()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn open_link(actions: &[Action]) -> LinkId {
        actions
            .iter()
            .find_map(|action| match action {
                Action::Open { link, .. } => Some(*link),
                _ => None,
            })
            .expect("expected an Open action")
    }

    fn sent_kinds(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Transmit {
                    frame: Frame::Message(message),
                    ..
                } => Some(message.envelope.kind.clone()),
                _ => None,
            })
            .collect()
    }

    fn closes(actions: &[Action]) -> Vec<CloseCode> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Close { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn pings(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|action| {
                matches!(action, Action::Transmit { frame: Frame::Heartbeat(envelope), .. } if envelope.kind == "ping")
            })
            .count()
    }

    fn message(kind: &str) -> Envelope {
        Envelope::new(kind, Value::Null)
    }

    /// Session that has connected once at `t0`.
    fn connected(t0: Instant) -> (Session, LinkId) {
        let mut session = Session::new(ENDPOINT, config(), t0);
        session.connect();
        let link = open_link(&session.take_actions());
        session.opened(link, t0);
        session.take_actions();
        (session, link)
    }

    #[test]
    fn connect_is_idempotent() {
        let t0 = Instant::now();
        let mut session = Session::new(ENDPOINT, config(), t0);

        session.connect();
        session.connect();

        let opens = session
            .take_actions()
            .iter()
            .filter(|action| matches!(action, Action::Open { .. }))
            .count();
        assert_eq!(opens, 1);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_with_invalid_endpoint_stays_disconnected() {
        let t0 = Instant::now();
        for endpoint in ["", "not a url", "ftp://example.com"] {
            let mut session = Session::new(endpoint, config(), t0);
            session.connect();
            assert!(session.take_actions().is_empty(), "{endpoint:?} should not open");
            assert_eq!(session.state(), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn http_endpoint_opens_as_ws() {
        let mut session = Session::new("http://localhost:8080/feed", config(), Instant::now());
        session.connect();

        let actions = session.take_actions();
        let Some(Action::Open { url, .. }) = actions.first() else {
            panic!("expected Open, got {actions:?}");
        };
        assert_eq!(url.as_str(), "ws://localhost:8080/feed");
    }

    #[test]
    fn open_emits_connected_and_first_ping() {
        let t0 = Instant::now();
        let mut session = Session::new(ENDPOINT, config(), t0);
        session.connect();
        let link = open_link(&session.take_actions());

        session.opened(link, t0);

        let actions = session.take_actions();
        assert!(matches!(actions[0], Action::Emit(Event::Connected)));
        assert_eq!(pings(&actions), 1);
        assert!(session.state().is_connected());
        assert_eq!(session.deadline(TimerKind::Heartbeat), Some(t0 + ms(30_000)));
    }

    #[test]
    fn queued_while_disconnected_flush_by_priority_after_connect() {
        let t0 = Instant::now();
        let mut session = Session::new(ENDPOINT, config(), t0);

        assert_eq!(session.send(message("x"), 5, t0), SendStatus::Queued);
        assert_eq!(session.send(message("y"), 10, t0 + ms(1)), SendStatus::Queued);
        assert_eq!(session.queued_count(), 2);

        session.connect();
        let link = open_link(&session.take_actions());
        session.opened(link, t0 + ms(10));
        session.take_actions();

        session.fire_due(t0 + ms(10));

        assert_eq!(sent_kinds(&session.take_actions()), vec!["y", "x"]);
        assert_eq!(session.queued_count(), 0);
    }

    #[test]
    fn flush_order_is_priority_then_age() {
        let t0 = Instant::now();
        let mut session = Session::new(ENDPOINT, config(), t0);
        let input = [("a", 1), ("b", 0), ("c", 2), ("d", 1), ("e", 2), ("f", 0)];
        for (offset, (kind, priority)) in (0_u64..).zip(input) {
            session.send(message(kind), priority, t0 + ms(offset));
        }

        session.connect();
        let link = open_link(&session.take_actions());
        session.opened(link, t0 + ms(100));
        session.fire_due(t0 + ms(100));

        assert_eq!(
            sent_kinds(&session.take_actions()),
            vec!["c", "e", "a", "d", "b", "f"]
        );
    }

    #[test]
    fn send_while_connected_goes_out_immediately() {
        let t0 = Instant::now();
        let (mut session, _) = connected(t0);

        let status = session.send(message("hello"), 0, t0 + ms(500));

        assert_eq!(status, SendStatus::Sent);
        assert_eq!(sent_kinds(&session.take_actions()), vec!["hello"]);
    }

    #[test]
    fn rapid_sends_are_throttled_and_batched() {
        let t0 = Instant::now();
        let (mut session, _) = connected(t0);

        assert_eq!(session.send(message("a"), 0, t0 + ms(1000)), SendStatus::Sent);
        assert_eq!(session.send(message("b"), 0, t0 + ms(1010)), SendStatus::Queued);
        assert_eq!(session.send(message("c"), 0, t0 + ms(1020)), SendStatus::Queued);
        assert_eq!(session.deadline(TimerKind::Batch), Some(t0 + ms(1060)));
        session.take_actions();

        session.fire_due(t0 + ms(1060));

        assert_eq!(sent_kinds(&session.take_actions()), vec!["b", "c"]);
        assert_eq!(session.deadline(TimerKind::Batch), None);
    }

    #[test]
    fn batch_is_bounded_by_max_batch_size() {
        let t0 = Instant::now();
        let mut session = Session::new(
            ENDPOINT,
            Config::builder()
                .batch(BatchConfig::builder().max_batch_size(2).build())
                .build(),
            t0,
        );
        for i in 0..5 {
            session.send(message(&format!("m{i}")), 0, t0);
        }
        session.connect();
        let link = open_link(&session.take_actions());
        session.opened(link, t0);
        session.take_actions();

        session.fire_due(t0);
        assert_eq!(sent_kinds(&session.take_actions()), vec!["m0", "m1"]);

        let next = session.deadline(TimerKind::Batch).expect("batch timer re-armed");
        session.fire_due(next);
        assert_eq!(sent_kinds(&session.take_actions()), vec!["m2", "m3"]);
        assert_eq!(session.queued_count(), 1);
    }

    #[test]
    fn message_behind_a_queue_waits_its_turn() {
        let t0 = Instant::now();
        let (mut session, _) = connected(t0);
        session.send(message("first"), 0, t0 + ms(1000));
        session.send(message("second"), 0, t0 + ms(1001));
        session.take_actions();

        let status = session.send(message("third"), 0, t0 + ms(2000));

        assert_eq!(status, SendStatus::Queued);
        assert_eq!(session.queued_count(), 2);
    }

    #[test]
    fn three_abnormal_closures_back_off_then_give_up() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        let mut delays = Vec::new();

        // The live connection drops.
        let mut now = t0 + ms(5000);
        session.link_closed(link, CloseCode::ABNORMAL, now);

        loop {
            let Some(deadline) = session.deadline(TimerKind::Reconnect) else {
                break;
            };
            delays.push(deadline - now);
            now = deadline;
            session.fire_due(now);
            let link = open_link(&session.take_actions());
            // Every retry is refused.
            session.connect_failed(link, now);
        }

        assert_eq!(delays, vec![ms(1000), ms(2000), ms(4000)]);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.attempt(), 3);
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn fixed_backoff_repeats_base_interval() {
        let t0 = Instant::now();
        let mut session = Session::new(
            ENDPOINT,
            Config::builder()
                .reconnect(
                    ReconnectConfig::builder()
                        .base_interval(ms(750))
                        .exponential(false)
                        .max_attempts(4)
                        .build(),
                )
                .build(),
            t0,
        );
        session.connect();
        let link = open_link(&session.take_actions());
        session.opened(link, t0);
        session.link_closed(link, CloseCode(1011), t0);

        let mut now = t0;
        let mut delays = Vec::new();
        while let Some(deadline) = session.deadline(TimerKind::Reconnect) {
            delays.push(deadline - now);
            now = deadline;
            session.fire_due(now);
            let link = open_link(&session.take_actions());
            session.connect_failed(link, now);
        }

        assert_eq!(delays, vec![ms(750); 4]);
    }

    #[test]
    fn state_reports_reconnect_attempt() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        session.link_closed(link, CloseCode::ABNORMAL, t0);

        assert_eq!(
            session.state(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        let actions = session.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Emit(Event::Disconnected {
                code: CloseCode::ABNORMAL,
                reconnecting: true
            })
        )));
    }

    #[test]
    fn successful_reconnect_resets_attempts() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.link_closed(link, CloseCode::ABNORMAL, t0);
        let deadline = session.deadline(TimerKind::Reconnect).unwrap();
        session.fire_due(deadline);
        let link = open_link(&session.take_actions());

        session.opened(link, deadline);

        assert_eq!(session.attempt(), 0);
        assert!(session.state().is_connected());
    }

    #[test]
    fn refused_endpoint_that_never_connected_does_not_retry() {
        let t0 = Instant::now();
        let mut session = Session::new(ENDPOINT, config(), t0);
        session.connect();
        let link = open_link(&session.take_actions());

        session.connect_failed(link, t0);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.deadline(TimerKind::Reconnect), None);
    }

    #[test]
    fn clean_closure_does_not_reconnect() {
        let t0 = Instant::now();
        for code in [CloseCode::NORMAL, CloseCode::GOING_AWAY, CloseCode::NO_STATUS] {
            let (mut session, link) = connected(t0);
            session.link_closed(link, code, t0);
            assert_eq!(session.state(), ConnectionState::Disconnected, "{code}");
            assert_eq!(session.deadline(TimerKind::Reconnect), None, "{code}");
        }
    }

    #[test]
    fn disconnect_prevents_reconnect_and_resets_counter() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.link_closed(link, CloseCode::ABNORMAL, t0);
        assert_eq!(session.attempt(), 1);
        session.send(message("pending"), 0, t0);

        session.disconnect();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.next_deadline(), None);
        assert_eq!(session.queued_count(), 0);
        assert_eq!(session.attempt(), 0);

        // Nothing fires later, even far in the future.
        session.take_actions();
        session.fire_due(t0 + Duration::from_secs(3600));
        assert!(session.take_actions().is_empty());

        session.connect();
        assert_eq!(session.attempt(), 0);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn disconnect_closes_live_link_normally() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        session.disconnect();

        let actions = session.take_actions();
        assert!(matches!(
            actions[0],
            Action::Close { link: closed, code: CloseCode::NORMAL } if closed == link
        ));
        assert!(matches!(
            actions[1],
            Action::Emit(Event::Disconnected {
                reconnecting: false,
                ..
            })
        ));

        // The peer's close echo is ignored.
        session.link_closed(link, CloseCode::NORMAL, t0);
        assert!(session.take_actions().is_empty());
    }

    #[test]
    fn pong_updates_latency_and_resets_missed() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.fire_due(t0 + ms(30_000));
        assert_eq!(session.quality().consecutive_missed_pongs, 1);

        let sent_at = session.clock.millis(t0 + ms(30_000));
        let pong = json!({ "type": "pong", "timestamp": sent_at }).to_string();
        session.received_text(link, &pong, t0 + ms(30_040));

        let quality = session.quality();
        assert_eq!(quality.latency_ms, 40);
        assert_eq!(quality.consecutive_missed_pongs, 0);
        assert!(session.last_message().is_none(), "pong must not reach consumers");
    }

    #[test]
    fn three_missed_pongs_force_close_and_schedule_reconnect() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        session.fire_due(t0 + ms(30_000));
        session.fire_due(t0 + ms(60_000));
        assert!(session.state().is_connected());
        assert_eq!(pings(&session.take_actions()), 2);

        session.fire_due(t0 + ms(90_000));

        let actions = session.take_actions();
        assert_eq!(closes(&actions), vec![CloseCode::HEARTBEAT_TIMEOUT]);
        assert!(matches!(
            actions.first(),
            Some(Action::Close { link: closed, .. }) if *closed == link
        ));
        assert_eq!(
            session.state(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert_eq!(
            session.deadline(TimerKind::Reconnect),
            Some(t0 + ms(91_000))
        );
    }

    #[test]
    fn pongs_keep_connection_alive() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        for tick in 1..=10_u64 {
            let now = t0 + ms(30_000 * tick);
            session.fire_due(now);
            session.received_text(link, "pong", now + ms(5));
        }

        assert!(session.state().is_connected());
        assert!(closes(&session.take_actions()).is_empty());
    }

    #[test]
    fn server_ping_is_answered_with_pong() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        session.received_text(link, r#"{"type":"ping","timestamp":77}"#, t0);

        let actions = session.take_actions();
        let [Action::Transmit { frame: Frame::Heartbeat(pong), .. }] = actions.as_slice() else {
            panic!("expected a single pong, got {actions:?}");
        };
        assert_eq!(pong.kind, "pong");
        assert_eq!(pong.timestamp, Some(77));
    }

    #[test]
    fn inbound_message_is_emitted_and_remembered() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        session.received_text(link, r#"{"type":"price","data":{"v":1}}"#, t0);

        let actions = session.take_actions();
        let [Action::Emit(Event::Message(envelope))] = actions.as_slice() else {
            panic!("expected a message event, got {actions:?}");
        };
        assert_eq!(envelope.kind, "price");
        assert_eq!(session.last_message().map(|e| e.data.clone()), Some(json!({ "v": 1 })));
    }

    #[test]
    fn malformed_frame_is_dropped_and_connection_kept() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);

        session.received_text(link, "{broken", t0);

        assert!(session.take_actions().is_empty());
        assert!(session.state().is_connected());
    }

    #[test]
    fn frames_from_stale_links_are_ignored() {
        let t0 = Instant::now();
        let (mut session, old) = connected(t0);
        session.disconnect();
        session.connect();
        session.take_actions();

        session.received_text(old, r#"{"type":"late"}"#, t0);
        session.link_closed(old, CloseCode::ABNORMAL, t0);

        assert!(session.take_actions().is_empty());
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn late_open_of_abandoned_link_is_closed() {
        let t0 = Instant::now();
        let mut session = Session::new(ENDPOINT, config(), t0);
        session.connect();
        let link = open_link(&session.take_actions());
        session.disconnect();
        session.take_actions();

        session.opened(link, t0);

        assert_eq!(closes(&session.take_actions()), vec![CloseCode::NORMAL]);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transmit_failure_requeues_at_lower_priority_and_reconnects() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.send(message("order"), 4, t0 + ms(1000));
        let frame = session
            .take_actions()
            .into_iter()
            .find_map(|action| match action {
                Action::Transmit { frame, .. } => Some(frame),
                _ => None,
            })
            .unwrap();

        session.transmit_failed(Some(link), frame, t0 + ms(1001));

        assert_eq!(session.queued_count(), 1);
        assert_eq!(closes(&session.take_actions()), vec![CloseCode::SEND_FAILURE]);
        assert_eq!(
            session.state(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert_eq!(session.queue.pop().map(|m| m.priority), Some(3));
    }

    #[test]
    fn failed_heartbeat_write_is_not_requeued() {
        let t0 = Instant::now();
        let (mut session, _) = connected(t0);

        session.transmit_failed(None, Frame::Heartbeat(Envelope::ping(1)), t0);

        assert_eq!(session.queued_count(), 0);
        assert!(session.state().is_connected());
    }

    #[test]
    fn manual_reconnect_restarts_after_fixed_delay() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.link_closed(link, CloseCode::ABNORMAL, t0);
        let deadline = session.deadline(TimerKind::Reconnect).unwrap();
        session.fire_due(deadline);
        let link = open_link(&session.take_actions());
        session.connect_failed(link, deadline);
        assert_eq!(session.attempt(), 2);
        session.send(message("kept"), 0, deadline);

        session.reconnect(deadline);

        assert_eq!(session.attempt(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.queued_count(), 1);
        assert_eq!(
            session.deadline(TimerKind::Reconnect),
            Some(deadline + ms(100))
        );
        session.take_actions();

        session.fire_due(deadline + ms(100));
        open_link(&session.take_actions());
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn environment_signals_revive_dropped_connection() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.link_closed(link, CloseCode::ABNORMAL, t0);
        session.take_actions();

        session.environment(EnvironmentSignal::NetworkOnline);

        open_link(&session.take_actions());
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.deadline(TimerKind::Reconnect), None);

        // A second signal while connecting does nothing.
        session.environment(EnvironmentSignal::Visible);
        assert!(session.take_actions().is_empty());
    }

    #[test]
    fn environment_signals_respect_manual_disconnect() {
        let t0 = Instant::now();
        let mut idle = Session::new(ENDPOINT, config(), t0);
        idle.environment(EnvironmentSignal::Visible);
        assert!(idle.take_actions().is_empty(), "never asked to connect");

        let (mut session, _) = connected(t0);
        session.disconnect();
        session.take_actions();
        session.environment(EnvironmentSignal::NetworkOnline);
        assert!(session.take_actions().is_empty());
    }

    #[test]
    fn clean_server_closure_resets_attempts() {
        let t0 = Instant::now();
        let (mut session, link) = connected(t0);
        session.link_closed(link, CloseCode::ABNORMAL, t0);
        let deadline = session.deadline(TimerKind::Reconnect).unwrap();
        session.fire_due(deadline);
        let link = open_link(&session.take_actions());
        session.opened(link, deadline);
        session.link_closed(link, CloseCode::NORMAL, deadline);

        assert_eq!(session.attempt(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
