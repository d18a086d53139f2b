//! Heartbeat bookkeeping and the connection quality it produces.

/// Snapshot of connection health derived from heartbeat round-trips.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionQuality {
    /// Round-trip time of the most recent PING/PONG exchange, in milliseconds
    pub latency_ms: u64,
    /// Heartbeat intervals in a row that passed without a PONG
    pub consecutive_missed_pongs: u32,
}

/// Outcome of a heartbeat tick.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// Send the next PING
    Alive,
    /// Too many PONGs missed, the connection is dead
    Expired { missed: u32 },
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    awaiting_pong: bool,
    quality: ConnectionQuality,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            awaiting_pong: false,
            quality: ConnectionQuality::default(),
        }
    }

    /// Forget any outstanding PING. Latency from the previous link is kept.
    pub fn restart(&mut self) {
        self.awaiting_pong = false;
        self.quality.consecutive_missed_pongs = 0;
    }

    pub fn reset(&mut self) {
        self.restart();
        self.quality = ConnectionQuality::default();
    }

    /// Account for one elapsed heartbeat interval.
    pub fn tick(&mut self) -> Pulse {
        if self.awaiting_pong {
            self.quality.consecutive_missed_pongs += 1;
        }
        if self.quality.consecutive_missed_pongs >= self.max_missed {
            Pulse::Expired {
                missed: self.quality.consecutive_missed_pongs,
            }
        } else {
            Pulse::Alive
        }
    }

    pub fn ping_sent(&mut self) {
        self.awaiting_pong = true;
    }

    /// Record a PONG. `sent_at_ms` is the timestamp echoed back from our PING.
    pub fn pong_received(&mut self, sent_at_ms: Option<i64>, now_ms: i64) {
        self.awaiting_pong = false;
        self.quality.consecutive_missed_pongs = 0;
        if let Some(sent_at) = sent_at_ms {
            self.quality.latency_ms = u64::try_from(now_ms.saturating_sub(sent_at)).unwrap_or(0);
        }
    }

    #[must_use]
    pub const fn quality(&self) -> ConnectionQuality {
        self.quality
    }
}
