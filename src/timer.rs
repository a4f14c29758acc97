//! Timer descriptors handed from the engine to the shell.
//!
//! The engine never sleeps. When it wants a timer, it returns a [Timer] in
//! an action; the shell schedules it on a real clock and reports back
//! through `timer_scheduled` with an opaque cancellation token, then fires
//! `timer_triggered` when the timer elapses. Per-connection timer ids let
//! the engine tell a live timer apart from one it has already replaced.

use crate::ConnectionId;
use std::time::Duration;

/// Distinguishes successive timers on the same connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerId(pub(crate) u64);

/// What a timer is for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerUseCase {
    /// Delay before retrying a failed connection attempt.
    Backoff,
    /// Periodic health probe on an idle connection.
    KeepAlive,
    /// Idle demand-tier connections are closed when this fires.
    IdleTimeout,
}

/// A timer the shell must schedule on behalf of the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timer {
    pub(crate) connection_id: ConnectionId,
    pub(crate) timer_id: TimerId,
    pub(crate) use_case: TimerUseCase,
    pub(crate) duration: Duration,
}

impl Timer {
    /// The connection this timer belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// What the timer is for.
    pub fn use_case(&self) -> TimerUseCase {
        self.use_case
    }

    /// How long the shell should wait before firing the timer.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}
