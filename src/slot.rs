//! State machine for a single pooled connection.
//!
//! A [Slot] tracks one connection through its whole lifecycle:
//!
//! ```text
//! starting ──▶ backing_off ──▶ starting (retry)
//!    │              └────────▶ closed
//!    └───▶ idle ◀──▶ leased
//!            │          │
//!            ▼          ▼
//!         closing ──▶ closed
//! ```
//!
//! Slots also own the bookkeeping for the timers attached to a connection
//! (backoff, keep-alive, idle timeout). Timer ids increase monotonically
//! per connection so that a stale timer callback, or a cancellation token
//! registered after its timer already advanced, can be recognized and
//! discarded.
//!
//! Every operation here is a pure state transition; contract violations
//! (leasing more streams than declared, releasing an unleased connection)
//! are defects in the caller and panic.

use crate::timer::{Timer, TimerId, TimerUseCase};
use crate::ConnectionId;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use smallvec::SmallVec;
use std::time::Duration;

/// Counts of pool connections and streams by state.
///
/// Maintained incrementally as connections change state; always equal to
/// what a from-scratch recount of the connection sequence would produce.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Connections with an establish attempt in flight.
    pub connecting: u16,
    /// Connections waiting out a backoff period after a failed attempt.
    pub backing_off: u16,
    /// Connections parked with no leased streams.
    pub idle: u16,
    /// Connections with at least one leased stream.
    pub leased: u16,
    /// Connections with a keep-alive probe in flight (idle or leased).
    pub running_keep_alive: u16,
    /// Connections that have been asked to close but have not confirmed.
    pub closing: u16,
    /// Streams that could be leased right now.
    pub available_streams: u16,
    /// Streams currently leased out.
    pub leased_streams: u16,
}

impl Stats {
    /// Connections that count against the capacity limits.
    pub fn active_connections(&self) -> usize {
        usize::from(self.connecting)
            + usize::from(self.backing_off)
            + usize::from(self.idle)
            + usize::from(self.leased)
    }

    /// Connections not leasable yet but expected to become so: currently
    /// connecting, backing off, or running a keep-alive.
    pub fn soon_available_connections(&self) -> usize {
        usize::from(self.connecting)
            + usize::from(self.backing_off)
            + usize::from(self.running_keep_alive)
    }

    pub(crate) fn add(&mut self, other: &Stats) {
        self.connecting += other.connecting;
        self.backing_off += other.backing_off;
        self.idle += other.idle;
        self.leased += other.leased;
        self.running_keep_alive += other.running_keep_alive;
        self.closing += other.closing;
        self.available_streams += other.available_streams;
        self.leased_streams += other.leased_streams;
    }

    pub(crate) fn subtract(&mut self, other: &Stats) {
        self.connecting -= other.connecting;
        self.backing_off -= other.backing_off;
        self.idle -= other.idle;
        self.leased -= other.leased;
        self.running_keep_alive -= other.running_keep_alive;
        self.closing -= other.closing;
        self.available_streams -= other.available_streams;
        self.leased_streams -= other.leased_streams;
    }
}

// A timer the engine is waiting on. The cancellation token arrives
// separately, once the shell has actually scheduled the timer.
#[derive_where(Debug)]
pub(crate) struct TimerState<Token> {
    id: TimerId,
    #[derive_where(skip)]
    token: Option<Token>,
}

impl<Token> TimerState<Token> {
    fn new(id: TimerId) -> Self {
        Self { id, token: None }
    }
}

// Keep-alive sub-state carried by idle and leased connections.
//
// A probe may run concurrently with in-flight leased streams on
// connections that multiplex.
#[derive_where(Debug)]
enum KeepAlive<Token> {
    NotScheduled,
    Scheduled(TimerState<Token>),
    Running { consuming_stream: bool },
}

impl<Token> KeepAlive<Token> {
    fn consumed_streams(&self) -> u16 {
        match self {
            KeepAlive::Running {
                consuming_stream: true,
            } => 1,
            _ => 0,
        }
    }

    fn is_running(&self) -> bool {
        matches!(self, KeepAlive::Running { .. })
    }
}

#[derive_where(Debug)]
enum State<Conn, Token> {
    // An establish attempt is in flight.
    Starting,

    // The last attempt failed; a backoff timer is pending.
    BackingOff(TimerState<Token>),

    // Connected with no leased streams.
    Idle {
        conn: DebugIgnore<Conn>,
        max_streams: u16,
        keep_alive: KeepAlive<Token>,
        idle_timer: Option<TimerState<Token>>,
    },

    // Connected with at least one leased stream.
    Leased {
        conn: DebugIgnore<Conn>,
        used_streams: u16,
        max_streams: u16,
        keep_alive: KeepAlive<Token>,
    },

    // Close requested, waiting for confirmation.
    Closing(DebugIgnore<Conn>),

    // Final state.
    Closed,
}

/// A connection leased out of a slot, with the timers that must be
/// cancelled because leasing ended the idle period.
pub(crate) struct Lease<Conn, Token> {
    pub(crate) conn: Conn,
    pub(crate) timers_to_cancel: SmallVec<[Token; 2]>,
}

pub(crate) enum Release {
    StillLeased,
    Idle,
}

/// A keep-alive probe to start, with the fired timer's token (if one was
/// registered) so the shell can release it.
pub(crate) struct KeepAliveStart<Conn, Token> {
    pub(crate) conn: Conn,
    pub(crate) timer_token: Option<Token>,
}

/// A connection to physically close, with every pending timer to cancel.
pub(crate) struct Close<Conn, Token> {
    pub(crate) conn: Conn,
    pub(crate) timers_to_cancel: SmallVec<[Token; 2]>,
}

/// State machine for one pooled connection.
#[derive_where(Debug)]
pub(crate) struct Slot<Conn, Token> {
    id: ConnectionId,
    state: State<Conn, Token>,
    next_timer_id: u64,
}

impl<Conn: Clone, Token> Slot<Conn, Token> {
    pub(crate) fn new_starting(id: ConnectionId) -> Self {
        Self {
            id,
            state: State::Starting,
            next_timer_id: 0,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_starting(&self) -> bool {
        matches!(self.state, State::Starting)
    }

    pub(crate) fn is_backing_off(&self) -> bool {
        matches!(self.state, State::BackingOff(_))
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state, State::Idle { .. } | State::Leased { .. })
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle { .. })
    }

    pub(crate) fn is_leased(&self) -> bool {
        matches!(self.state, State::Leased { .. })
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Streams that could be leased from this slot right now.
    pub(crate) fn available_streams(&self) -> u16 {
        match &self.state {
            State::Idle {
                max_streams,
                keep_alive,
                ..
            } => max_streams.saturating_sub(keep_alive.consumed_streams()),
            State::Leased {
                used_streams,
                max_streams,
                keep_alive,
                ..
            } => max_streams
                .saturating_sub(*used_streams)
                .saturating_sub(keep_alive.consumed_streams()),
            _ => 0,
        }
    }

    /// This slot's contribution to the group [Stats].
    pub(crate) fn stats_contribution(&self) -> Stats {
        let mut stats = Stats::default();
        match &self.state {
            State::Starting => stats.connecting = 1,
            State::BackingOff(_) => stats.backing_off = 1,
            State::Idle { keep_alive, .. } => {
                stats.idle = 1;
                stats.running_keep_alive = u16::from(keep_alive.is_running());
                stats.available_streams = self.available_streams();
            }
            State::Leased {
                used_streams,
                keep_alive,
                ..
            } => {
                stats.leased = 1;
                stats.running_keep_alive = u16::from(keep_alive.is_running());
                stats.leased_streams = *used_streams;
                stats.available_streams = self.available_streams();
            }
            State::Closing(_) => stats.closing = 1,
            State::Closed => {}
        }
        stats
    }

    /// The establish attempt succeeded; the connection is idle and ready.
    pub(crate) fn connected(&mut self, conn: Conn, max_streams: u16) {
        match self.state {
            State::Starting => {
                self.state = State::Idle {
                    conn: DebugIgnore(conn),
                    max_streams,
                    keep_alive: KeepAlive::NotScheduled,
                    idle_timer: None,
                };
            }
            ref other => unreachable!("connected on connection in state {other:?}"),
        }
    }

    /// The establish attempt failed; returns the backoff timer to schedule.
    pub(crate) fn failed_to_connect(&mut self, backoff: Duration) -> Timer {
        match self.state {
            State::Starting => {
                let timer = self.next_timer(TimerUseCase::Backoff, backoff);
                self.state = State::BackingOff(TimerState::new(timer.timer_id));
                timer
            }
            ref other => unreachable!("failed_to_connect on connection in state {other:?}"),
        }
    }

    /// True if `timer` is this slot's currently pending backoff timer.
    pub(crate) fn backoff_timer_matches(&self, timer: &Timer) -> bool {
        matches!(&self.state, State::BackingOff(pending) if pending.id == timer.timer_id)
    }

    /// The backoff period elapsed; start a new establish attempt. Returns
    /// the now-obsolete backoff timer's token, if one was registered.
    pub(crate) fn retry_connect(&mut self) -> Option<Token> {
        match std::mem::replace(&mut self.state, State::Starting) {
            State::BackingOff(pending) => pending.token,
            other => unreachable!("retry_connect on connection in state {other:?}"),
        }
    }

    /// Give up on a backing-off connection. Returns the obsolete backoff
    /// timer's token, if one was registered.
    pub(crate) fn destroy_backing_off(&mut self) -> Option<Token> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::BackingOff(pending) => pending.token,
            other => unreachable!("destroy_backing_off on connection in state {other:?}"),
        }
    }

    /// Leases `streams` streams. Leasing an idle connection ends its idle
    /// period, so any pending idle-timeout or keep-alive timers are
    /// returned for cancellation.
    pub(crate) fn lease(&mut self, streams: u16) -> Lease<Conn, Token> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Idle {
                conn,
                max_streams,
                keep_alive,
                idle_timer,
            } => {
                let mut timers_to_cancel = SmallVec::new();
                if let Some(token) = idle_timer.and_then(|pending| pending.token) {
                    timers_to_cancel.push(token);
                }
                let keep_alive = match keep_alive {
                    KeepAlive::Scheduled(pending) => {
                        if let Some(token) = pending.token {
                            timers_to_cancel.push(token);
                        }
                        KeepAlive::NotScheduled
                    }
                    other => other,
                };
                assert!(
                    streams + keep_alive.consumed_streams() <= max_streams,
                    "connection {} leased beyond its declared capacity",
                    self.id
                );
                let lease = Lease {
                    conn: conn.0.clone(),
                    timers_to_cancel,
                };
                self.state = State::Leased {
                    conn,
                    used_streams: streams,
                    max_streams,
                    keep_alive,
                };
                lease
            }
            State::Leased {
                conn,
                used_streams,
                max_streams,
                keep_alive,
            } => {
                assert!(
                    used_streams + streams + keep_alive.consumed_streams() <= max_streams,
                    "connection {} leased beyond its declared capacity",
                    self.id
                );
                let lease = Lease {
                    conn: conn.0.clone(),
                    timers_to_cancel: SmallVec::new(),
                };
                self.state = State::Leased {
                    conn,
                    used_streams: used_streams + streams,
                    max_streams,
                    keep_alive,
                };
                lease
            }
            other => unreachable!("lease on connection in state {other:?}"),
        }
    }

    /// Returns `streams` streams to the slot; the connection becomes idle
    /// once every stream is back.
    pub(crate) fn release(&mut self, streams: u16) -> Release {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Leased {
                conn,
                used_streams,
                max_streams,
                keep_alive,
            } => {
                assert!(
                    streams <= used_streams,
                    "connection {} released more streams than it had leased",
                    self.id
                );
                let used_streams = used_streams - streams;
                if used_streams == 0 {
                    self.state = State::Idle {
                        conn,
                        max_streams,
                        keep_alive,
                        idle_timer: None,
                    };
                    Release::Idle
                } else {
                    self.state = State::Leased {
                        conn,
                        used_streams,
                        max_streams,
                        keep_alive,
                    };
                    Release::StillLeased
                }
            }
            other => unreachable!("release on connection in state {other:?}"),
        }
    }

    /// Parks an idle connection by scheduling the timers it is missing.
    /// Already-pending timers (for example an idle timer that survived a
    /// keep-alive cycle) are left untouched.
    pub(crate) fn park(
        &mut self,
        schedule_keep_alive: Option<Duration>,
        schedule_idle_timeout: Option<Duration>,
    ) -> SmallVec<[Timer; 2]> {
        assert!(
            self.is_idle(),
            "parking connection {} which is not idle",
            self.id
        );
        let mut timers = SmallVec::new();

        if let Some(duration) = schedule_keep_alive {
            if matches!(
                &self.state,
                State::Idle {
                    keep_alive: KeepAlive::NotScheduled,
                    ..
                }
            ) {
                let timer = self.next_timer(TimerUseCase::KeepAlive, duration);
                let State::Idle { keep_alive, .. } = &mut self.state else {
                    unreachable!()
                };
                *keep_alive = KeepAlive::Scheduled(TimerState::new(timer.timer_id));
                timers.push(timer);
            }
        }

        if let Some(duration) = schedule_idle_timeout {
            if matches!(&self.state, State::Idle { idle_timer: None, .. }) {
                let timer = self.next_timer(TimerUseCase::IdleTimeout, duration);
                let State::Idle { idle_timer, .. } = &mut self.state else {
                    unreachable!()
                };
                *idle_timer = Some(TimerState::new(timer.timer_id));
                timers.push(timer);
            }
        }

        timers
    }

    /// Starts the keep-alive probe whose timer just fired. Returns `None`
    /// if the timer is stale: the connection was leased or closed in the
    /// meantime, or the timer was replaced.
    pub(crate) fn run_keep_alive(
        &mut self,
        timer: &Timer,
        consuming_stream: bool,
    ) -> Option<KeepAliveStart<Conn, Token>> {
        let State::Idle {
            conn, keep_alive, ..
        } = &mut self.state
        else {
            return None;
        };
        match keep_alive {
            KeepAlive::Scheduled(pending) if pending.id == timer.timer_id => {
                let timer_token = pending.token.take();
                *keep_alive = KeepAlive::Running { consuming_stream };
                Some(KeepAliveStart {
                    conn: conn.0.clone(),
                    timer_token,
                })
            }
            _ => None,
        }
    }

    /// The keep-alive probe completed. A no-op if the connection has since
    /// moved to closing or closed; the probe must not resurrect removed
    /// bookkeeping.
    pub(crate) fn keep_alive_succeeded(&mut self) -> Option<()> {
        match &mut self.state {
            State::Idle { keep_alive, .. } | State::Leased { keep_alive, .. } => {
                match keep_alive {
                    KeepAlive::Running { .. } => {
                        *keep_alive = KeepAlive::NotScheduled;
                        Some(())
                    }
                    other => unreachable!(
                        "keep-alive succeeded on connection {} without a running probe: {other:?}",
                        self.id
                    ),
                }
            }
            State::Closing(_) | State::Closed => None,
            other => unreachable!(
                "keep-alive succeeded on connection {} in state {other:?}",
                self.id
            ),
        }
    }

    /// True if `timer` is this slot's currently pending idle-timeout timer.
    pub(crate) fn idle_timer_matches(&self, timer: &Timer) -> bool {
        matches!(
            &self.state,
            State::Idle {
                idle_timer: Some(pending),
                ..
            } if pending.id == timer.timer_id
        )
    }

    /// Begins closing, but only if the connection is idle.
    pub(crate) fn close_if_idle(&mut self) -> Option<Close<Conn, Token>> {
        if !self.is_idle() {
            return None;
        }
        self.close()
    }

    /// Begins closing unconditionally. Returns `None` for connections that
    /// have nothing to physically close yet (still starting) or are
    /// already closing or closed.
    pub(crate) fn close(&mut self) -> Option<Close<Conn, Token>> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Idle {
                conn,
                keep_alive,
                idle_timer,
                ..
            } => {
                let mut timers_to_cancel = SmallVec::new();
                if let Some(token) = idle_timer.and_then(|pending| pending.token) {
                    timers_to_cancel.push(token);
                }
                if let KeepAlive::Scheduled(pending) = keep_alive {
                    if let Some(token) = pending.token {
                        timers_to_cancel.push(token);
                    }
                }
                let close = Close {
                    conn: conn.0.clone(),
                    timers_to_cancel,
                };
                self.state = State::Closing(conn);
                Some(close)
            }
            State::Leased { conn, .. } => {
                let close = Close {
                    conn: conn.0.clone(),
                    timers_to_cancel: SmallVec::new(),
                };
                self.state = State::Closing(conn);
                Some(close)
            }
            other @ (State::Starting | State::BackingOff(_) | State::Closing(_) | State::Closed) => {
                self.state = other;
                None
            }
        }
    }

    /// Finalizes the slot after the connection has actually shut down,
    /// whether the pool asked for it or the peer hung up. Returns any
    /// timer tokens that are now obsolete.
    pub(crate) fn closed(&mut self) -> SmallVec<[Token; 2]> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Idle {
                keep_alive,
                idle_timer,
                ..
            } => {
                let mut timers_to_cancel = SmallVec::new();
                if let Some(token) = idle_timer.and_then(|pending| pending.token) {
                    timers_to_cancel.push(token);
                }
                if let KeepAlive::Scheduled(pending) = keep_alive {
                    if let Some(token) = pending.token {
                        timers_to_cancel.push(token);
                    }
                }
                timers_to_cancel
            }
            State::Leased { .. } | State::Closing(_) => SmallVec::new(),
            other => unreachable!("closed on connection in state {other:?}"),
        }
    }

    /// Drops any pending idle-timeout timer, returning its token. Used when
    /// a connection is promoted into the persisted tier, which never sheds
    /// connections for being idle.
    pub(crate) fn cancel_idle_timer(&mut self) -> Option<Token> {
        if let State::Idle { idle_timer, .. } = &mut self.state {
            return idle_timer.take().and_then(|pending| pending.token);
        }
        None
    }

    /// Abandons a connection whose establish attempt will never complete
    /// usefully (the pool is shutting down and the attempt failed).
    pub(crate) fn abandon_starting(&mut self) {
        match self.state {
            State::Starting => self.state = State::Closed,
            ref other => unreachable!("abandon_starting on connection in state {other:?}"),
        }
    }

    /// The backend renegotiated the connection's stream capacity.
    pub(crate) fn update_max_streams(&mut self, new_max: u16) -> bool {
        match &mut self.state {
            State::Idle { max_streams, .. } | State::Leased { max_streams, .. } => {
                *max_streams = new_max;
                true
            }
            _ => false,
        }
    }

    /// Registers the shell's cancellation token with the pending timer it
    /// belongs to. If that timer has already advanced (it fired, or was
    /// replaced before the shell finished scheduling it) the token is
    /// handed straight back so the shell cancels it at once.
    pub(crate) fn timer_scheduled(&mut self, timer: &Timer, token: Token) -> Option<Token> {
        match timer.use_case {
            TimerUseCase::Backoff => {
                if let State::BackingOff(pending) = &mut self.state {
                    if pending.id == timer.timer_id {
                        pending.token = Some(token);
                        return None;
                    }
                }
            }
            TimerUseCase::KeepAlive => {
                if let State::Idle {
                    keep_alive: KeepAlive::Scheduled(pending),
                    ..
                } = &mut self.state
                {
                    if pending.id == timer.timer_id {
                        pending.token = Some(token);
                        return None;
                    }
                }
            }
            TimerUseCase::IdleTimeout => {
                if let State::Idle {
                    idle_timer: Some(pending),
                    ..
                } = &mut self.state
                {
                    if pending.id == timer.timer_id {
                        pending.token = Some(token);
                        return None;
                    }
                }
            }
        }
        Some(token)
    }

    fn next_timer(&mut self, use_case: TimerUseCase, duration: Duration) -> Timer {
        let timer_id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        Timer {
            connection_id: self.id,
            timer_id,
            use_case,
            duration,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The engine only ever clones connections; a unit does fine here.
    type TestSlot = Slot<(), &'static str>;

    const KEEP_ALIVE: Duration = Duration::from_secs(30);
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    fn idle_slot(max_streams: u16) -> TestSlot {
        let mut slot = TestSlot::new_starting(ConnectionId(1));
        slot.connected((), max_streams);
        slot
    }

    #[test]
    fn lifecycle_starting_to_idle() {
        let mut slot = TestSlot::new_starting(ConnectionId(7));
        assert!(slot.is_starting());
        assert_eq!(slot.available_streams(), 0);

        slot.connected((), 4);
        assert!(slot.is_idle());
        assert_eq!(slot.available_streams(), 4);
        assert_eq!(slot.stats_contribution().idle, 1);
        assert_eq!(slot.stats_contribution().available_streams, 4);
    }

    #[test]
    fn backoff_retry_returns_obsolete_timer_token() {
        let mut slot = TestSlot::new_starting(ConnectionId(1));
        let timer = slot.failed_to_connect(Duration::from_millis(100));
        assert_eq!(timer.use_case(), TimerUseCase::Backoff);
        assert!(slot.is_backing_off());
        assert!(slot.backoff_timer_matches(&timer));

        assert!(slot.timer_scheduled(&timer, "backoff-token").is_none());
        assert_eq!(slot.retry_connect(), Some("backoff-token"));
        assert!(slot.is_starting());
    }

    #[test]
    fn stale_timer_registration_hands_token_back() {
        let mut slot = TestSlot::new_starting(ConnectionId(1));
        let timer = slot.failed_to_connect(Duration::from_millis(100));

        // The timer "fires" (retry) before the shell finishes scheduling.
        assert_eq!(slot.retry_connect(), None);
        assert_eq!(slot.timer_scheduled(&timer, "late-token"), Some("late-token"));
    }

    #[test]
    fn lease_and_release_stream_accounting() {
        let mut slot = idle_slot(4);

        let lease = slot.lease(1);
        assert!(lease.timers_to_cancel.is_empty());
        assert!(slot.is_leased());
        assert_eq!(slot.available_streams(), 3);

        slot.lease(2);
        assert_eq!(slot.available_streams(), 1);
        assert_eq!(slot.stats_contribution().leased_streams, 3);

        assert!(matches!(slot.release(2), Release::StillLeased));
        assert!(matches!(slot.release(1), Release::Idle));
        assert!(slot.is_idle());
        assert_eq!(slot.available_streams(), 4);
    }

    #[test]
    #[should_panic(expected = "leased beyond its declared capacity")]
    fn overleasing_is_a_defect() {
        let mut slot = idle_slot(2);
        slot.lease(3);
    }

    #[test]
    fn leasing_cancels_park_timers() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), Some(IDLE_TIMEOUT));
        assert_eq!(timers.len(), 2);
        assert_eq!(timers[0].use_case(), TimerUseCase::KeepAlive);
        assert_eq!(timers[1].use_case(), TimerUseCase::IdleTimeout);

        assert!(slot.timer_scheduled(&timers[0], "keep-alive").is_none());
        assert!(slot.timer_scheduled(&timers[1], "idle").is_none());

        let lease = slot.lease(1);
        assert_eq!(lease.timers_to_cancel.len(), 2);
    }

    #[test]
    fn park_only_schedules_missing_timers() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), None);
        assert_eq!(timers.len(), 1);

        // Keep-alive already scheduled; only the idle timer is created.
        let timers = slot.park(Some(KEEP_ALIVE), Some(IDLE_TIMEOUT));
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].use_case(), TimerUseCase::IdleTimeout);

        // Everything pending; nothing to schedule.
        assert!(slot.park(Some(KEEP_ALIVE), Some(IDLE_TIMEOUT)).is_empty());
    }

    #[test]
    fn keep_alive_consumes_a_stream_while_running() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), None);
        let start = slot.run_keep_alive(&timers[0], true).unwrap();
        assert!(start.timer_token.is_none());
        assert_eq!(slot.available_streams(), 0);
        assert_eq!(slot.stats_contribution().running_keep_alive, 1);

        slot.keep_alive_succeeded().unwrap();
        assert_eq!(slot.available_streams(), 1);
        assert_eq!(slot.stats_contribution().running_keep_alive, 0);
    }

    #[test]
    fn keep_alive_runs_concurrently_with_leases() {
        let mut slot = idle_slot(4);
        let timers = slot.park(Some(KEEP_ALIVE), None);
        slot.run_keep_alive(&timers[0], true).unwrap();

        slot.lease(3);
        assert_eq!(slot.available_streams(), 0);

        // The probe finishing while leased restores its stream.
        slot.keep_alive_succeeded().unwrap();
        assert_eq!(slot.available_streams(), 1);
    }

    #[test]
    fn stale_keep_alive_trigger_is_ignored() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), None);

        // Lease cancels the scheduled keep-alive; the old timer must not
        // start a probe when it fires late.
        slot.lease(1);
        slot.release(1);
        assert!(slot.run_keep_alive(&timers[0], true).is_none());
    }

    #[test]
    fn keep_alive_completion_after_close_is_a_noop() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), None);
        slot.run_keep_alive(&timers[0], true).unwrap();

        slot.close().unwrap();
        assert!(slot.keep_alive_succeeded().is_none());
    }

    #[test]
    fn close_returns_pending_timer_tokens() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), Some(IDLE_TIMEOUT));
        slot.timer_scheduled(&timers[0], "keep-alive");
        slot.timer_scheduled(&timers[1], "idle");

        let close = slot.close().unwrap();
        assert_eq!(close.timers_to_cancel.len(), 2);

        // Closing again is a no-op; finalization is terminal.
        assert!(slot.close().is_none());
        assert!(slot.closed().is_empty());
        assert!(slot.is_closed());
    }

    #[test]
    fn close_if_idle_refuses_leased_connections() {
        let mut slot = idle_slot(2);
        slot.lease(1);
        assert!(slot.close_if_idle().is_none());
        assert!(slot.is_leased());
    }

    #[test]
    fn unexpected_closure_returns_parked_timer_tokens() {
        let mut slot = idle_slot(1);
        let timers = slot.park(Some(KEEP_ALIVE), Some(IDLE_TIMEOUT));
        slot.timer_scheduled(&timers[0], "keep-alive");
        slot.timer_scheduled(&timers[1], "idle");

        // Peer hangs up without the pool asking.
        let tokens = slot.closed();
        assert_eq!(tokens.len(), 2);
        assert!(slot.is_closed());
    }

    #[test]
    fn idle_timer_identity_survives_lease_cycles() {
        let mut slot = idle_slot(1);
        let old = slot.park(None, Some(IDLE_TIMEOUT));
        slot.lease(1);
        slot.release(1);
        let new = slot.park(None, Some(IDLE_TIMEOUT));

        assert!(!slot.idle_timer_matches(&old[0]));
        assert!(slot.idle_timer_matches(&new[0]));
    }

    #[test]
    fn max_stream_updates_apply_to_connected_slots() {
        let mut slot = idle_slot(1);
        assert!(slot.update_max_streams(8));
        assert_eq!(slot.available_streams(), 8);

        slot.lease(3);
        assert!(slot.update_max_streams(2));
        // Available saturates rather than underflowing when the backend
        // lowers the limit below current usage.
        assert_eq!(slot.available_streams(), 0);

        slot.close().unwrap();
        assert!(!slot.update_max_streams(4));
    }
}
