//! Host environment signals that can revive a dropped connection.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bon::Builder;
use tokio::net::TcpStream;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;

use super::connection::Shared;
use super::endpoint::normalize_endpoint;
use super::error::WsError;
use super::traits::EnvironmentWatcher;
use crate::Result;

/// A change in the host environment.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EnvironmentSignal {
    /// The host application became visible or moved to the foreground
    Visible,
    /// Network connectivity was restored
    NetworkOnline,
}

/// Handle for delivering [`EnvironmentSignal`]s to a client.
///
/// A signal reconnects immediately when the client was asked to stay connected
/// but is currently down. It is ignored after a manual disconnect and while a
/// connection is open or being established.
#[derive(Debug, Clone)]
pub struct EnvironmentNotifier {
    shared: Weak<Shared>,
    shutdown: CancellationToken,
}

impl EnvironmentNotifier {
    pub(crate) fn new(shared: &Arc<Shared>, shutdown: CancellationToken) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            shutdown,
        }
    }

    /// Deliver `signal`. Returns `false` once the client has been dropped.
    pub fn notify(&self, signal: EnvironmentSignal) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        shared.apply(|session, _| session.environment(signal));
        true
    }

    pub fn visible(&self) -> bool {
        self.notify(EnvironmentSignal::Visible)
    }

    pub fn network_online(&self) -> bool {
        self.notify(EnvironmentSignal::NetworkOnline)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once every handle to the client has been dropped.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

/// Watches network reachability by periodically opening a TCP connection to
/// the endpoint, and signals [`EnvironmentSignal::NetworkOnline`] when a probe
/// succeeds after one or more failures.
///
/// # Example
///
/// ```no_run
/// use resilient_ws::ws::{Client, Config, ReachabilityWatcher};
///
/// # async fn run() -> resilient_ws::Result<()> {
/// let client = Client::new("wss://feed.example.com/live", Config::default());
/// client.watch_environment(ReachabilityWatcher::for_endpoint("wss://feed.example.com/live")?);
/// client.connect();
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReachabilityWatcher {
    /// `host:port` to probe
    #[builder(into)]
    pub target: String,
    /// Time between probes
    #[builder(default = Duration::from_secs(5))]
    pub interval: Duration,
    /// How long a single probe may take before it counts as a failure
    #[builder(default = Duration::from_secs(3))]
    pub probe_timeout: Duration,
}

impl ReachabilityWatcher {
    /// Probe the host and port that `endpoint` connects to.
    pub fn for_endpoint(endpoint: &str) -> Result<Self> {
        let url = normalize_endpoint(endpoint)?;
        let host = url
            .host_str()
            .ok_or_else(|| WsError::InvalidEndpoint(endpoint.to_owned()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| WsError::InvalidEndpoint(endpoint.to_owned()))?;

        Ok(Self::builder().target(format!("{host}:{port}")).build())
    }

    async fn probe(&self) -> bool {
        matches!(
            timeout(self.probe_timeout, TcpStream::connect(self.target.as_str())).await,
            Ok(Ok(_))
        )
    }

    async fn run(self, notifier: EnvironmentNotifier) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reachable = true;

        loop {
            tokio::select! {
                () = notifier.closed() => break,
                _ = ticker.tick() => {}
            }

            let now_reachable = self.probe().await;
            if now_reachable && !reachable {
                #[cfg(feature = "tracing")]
                tracing::debug!(probe = %self.target, "Endpoint reachable again");

                if !notifier.network_online() {
                    break;
                }
            }
            #[cfg(feature = "tracing")]
            if !now_reachable && reachable {
                tracing::debug!(probe = %self.target, "Endpoint unreachable");
            }
            reachable = now_reachable;
        }
    }
}

impl EnvironmentWatcher for ReachabilityWatcher {
    fn watch(self, notifier: EnvironmentNotifier) {
        tokio::spawn(self.run(notifier));
    }
}
