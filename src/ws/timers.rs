use std::time::Instant;

/// The independently cancellable timers a client owns.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimerKind {
    Reconnect,
    Heartbeat,
    Batch,
}

impl TimerKind {
    /// Order in which due timers fire when several expire at once.
    pub const ALL: [Self; 3] = [Self::Reconnect, Self::Heartbeat, Self::Batch];

    const fn slot(self) -> usize {
        match self {
            Self::Reconnect => 0,
            Self::Heartbeat => 1,
            Self::Batch => 2,
        }
    }
}

/// Deadlines for each [`TimerKind`]. At most one deadline per kind.
#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 3],
}

impl Timers {
    /// Arm `kind`, replacing any deadline it already had.
    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.slot()] = Some(deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.slot()] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 3];
    }

    #[must_use]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.slot()].is_some()
    }

    #[must_use]
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.slot()]
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }
}
