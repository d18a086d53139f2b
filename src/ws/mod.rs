//! Self-healing WebSocket client.
//!
//! # Architecture
//!
//! - [`Session`]: Transport-free state machine that owns every decision: when
//!   to connect, when to retry, what to send and when the connection is dead
//! - `ConnectionManager` in [`connection`]: Background task that performs the
//!   socket I/O the session asks for and feeds socket events back into it
//! - [`Client`]: Cloneable handle exposing the public operations and
//!   observers
//! - [`SocketHandler`] and [`EnvironmentWatcher`]: Extension points for
//!   consumers and host integrations
//!
//! # Example
//!
//! ```rust, no_run
//! use resilient_ws::ws::{Client, CloseCode, Config, Envelope, SocketHandler};
//! use serde_json::json;
//!
//! struct Logger;
//!
//! impl SocketHandler for Logger {
//!     fn on_message(&self, envelope: &Envelope) {
//!         println!("{envelope:?}");
//!     }
//!
//!     fn on_disconnect(&self, code: CloseCode, reconnecting: bool) {
//!         println!("closed ({code}), reconnecting: {reconnecting}");
//!     }
//! }
//!
//! # async fn run() {
//! let client = Client::new("wss://feed.example.com/live", Config::default());
//! client.add_handler(Logger);
//! client.connect();
//! client.send(Envelope::new("subscribe", json!({ "channel": "trades" })), 0);
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod close;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod quality;
pub mod queue;
pub mod session;
pub mod timers;
pub mod traits;

pub use client::Client;
pub use close::CloseCode;
pub use config::{BatchConfig, Config, ReconnectConfig};
pub use connection::ConnectionState;
pub use envelope::Envelope;
pub use environment::{EnvironmentNotifier, EnvironmentSignal, ReachabilityWatcher};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use quality::ConnectionQuality;
pub use queue::OutboundMessage;
pub use session::{Action, Event, Frame, LinkId, SendStatus, Session};
pub use traits::*;
