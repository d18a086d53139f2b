use std::fmt;

/// WebSocket close status code (RFC 6455 §7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// Reported when a close frame carried no status. Never sent on the wire.
    pub const NO_STATUS: Self = Self(1005);
    /// Reported when the link dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: Self = Self(1006);
    /// Sent by the client when the heartbeat gave up on the server.
    pub const HEARTBEAT_TIMEOUT: Self = Self(4000);
    /// Sent by the client when a physical write failed.
    pub const SEND_FAILURE: Self = Self(4001);

    /// Whether a closure with this code should trigger automatic reconnection.
    ///
    /// Clean and protocol-level closures never reconnect. An abnormal closure
    /// only reconnects once the client has been connected at least once, so an
    /// endpoint that refuses every attempt does not cause a reconnect storm.
    #[must_use]
    pub const fn should_reconnect(self, has_connected: bool) -> bool {
        match self.0 {
            1000 | 1001 | 1002 | 1003 | 1005 => false,
            1006 => has_connected,
            _ => true,
        }
    }

    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 == Self::NORMAL.0
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
