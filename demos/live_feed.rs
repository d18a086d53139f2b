//! Connects to a WebSocket endpoint, sends a few prioritised messages and
//! prints whatever comes back, along with connection state and heartbeat
//! latency.
//!
//! The default endpoint is a public echo server, so the messages sent are
//! received again.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=resilient_ws=debug,live_feed=info cargo run --example live_feed --features tracing -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use resilient_ws::ws::{
    Client, CloseCode, Config, Envelope, ReachabilityWatcher, ReconnectConfig, SocketHandler,
};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ENDPOINT: &str = "wss://echo.websocket.org";

struct LifecycleLogger;

impl SocketHandler for LifecycleLogger {
    fn on_connect(&self) {
        info!(event = "connected");
    }

    fn on_disconnect(&self, code: CloseCode, reconnecting: bool) {
        warn!(event = "disconnected", %code, reconnecting);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());

    let config = Config::builder()
        .heartbeat_interval(Duration::from_secs(5))
        .reconnect(ReconnectConfig::builder().max_attempts(5).build())
        .build();
    let client = Client::new(endpoint.as_str(), config);
    client.add_handler(LifecycleLogger);
    client.watch_environment(ReachabilityWatcher::for_endpoint(&endpoint)?);

    // Queued until the connection opens, then flushed highest priority first.
    client.send(Envelope::new("hello", json!({ "from": "live_feed" })), 0);
    client.send(Envelope::new("subscribe", json!({ "channel": "ticker" })), 10);
    info!(queued = client.queued_count(), "Messages queued before connecting");

    let mut states = client.state_receiver();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            debug!(state = %state, "State changed");
        }
    });

    client.connect();

    let mut messages = Box::pin(client.messages());
    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(15), messages.next()).await {
        match result {
            Ok(envelope) => {
                count += 1;
                info!(kind = %envelope.kind, data = %envelope.data, timestamp = ?envelope.timestamp);
                if count == 2 {
                    let sent = client.send_data("ack", &json!({ "received": count }), 5)?;
                    debug!(?sent, "Acknowledged");
                }
            }
            Err(e) => warn!(error = %e, "Stream error"),
        }

        let quality = client.quality();
        info!(
            latency_ms = quality.latency_ms,
            missed_pongs = quality.consecutive_missed_pongs,
            state = %client.state()
        );

        if count >= 5 {
            break;
        }
    }

    info!(received = count, "Done");
    client.disconnect();

    Ok(())
}
