//! Extension points for consumers of the client.

use super::close::CloseCode;
use super::envelope::Envelope;
use super::environment::EnvironmentNotifier;

/// Callbacks for connection lifecycle events and inbound messages.
///
/// Handlers run on the connection task, in registration order, after the
/// session has settled into its new state. They may call back into the
/// [`Client`](super::Client) freely, but long-running work should be moved
/// to a separate task so inbound processing is not held up.
///
/// # Example
///
/// ```
/// use resilient_ws::ws::{CloseCode, Envelope, SocketHandler};
///
/// struct Printer;
///
/// impl SocketHandler for Printer {
///     fn on_message(&self, envelope: &Envelope) {
///         println!("{}: {}", envelope.kind, envelope.data);
///     }
///
///     fn on_disconnect(&self, code: CloseCode, reconnecting: bool) {
///         println!("closed with {code}, reconnecting: {reconnecting}");
///     }
/// }
/// ```
pub trait SocketHandler: Send + Sync + 'static {
    /// The connection opened.
    fn on_connect(&self) {}

    /// An open connection closed. `reconnecting` tells whether a retry was scheduled.
    fn on_disconnect(&self, code: CloseCode, reconnecting: bool) {
        let _ = (code, reconnecting);
    }

    /// A non-heartbeat message arrived.
    fn on_message(&self, envelope: &Envelope) {
        let _ = envelope;
    }
}

/// Source of host environment signals such as visibility or network changes.
///
/// Implementations typically spawn a task that calls
/// [`EnvironmentNotifier::visible`] or [`EnvironmentNotifier::network_online`]
/// when the host reports a change, and stop once
/// [`EnvironmentNotifier::closed`] resolves.
pub trait EnvironmentWatcher: Send + 'static {
    fn watch(self, notifier: EnvironmentNotifier);
}
