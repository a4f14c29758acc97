//! The tiered collection of connection slots.
//!
//! Connections live in a single `Vec` whose index encodes the capacity
//! tier: indexes below the minimum count are *persisted*, indexes from
//! there up to the soft limit are *demand*, and indexes beyond the soft
//! limit are *overflow*. Removal swaps the last well-behaving connection
//! into the hole so the tier encoding survives in O(1); a connection
//! promoted into the persisted tier by such a swap has its idle-timeout
//! timer cancelled, since persisted connections are never shed for
//! idling.
//!
//! The group also maintains [Stats] incrementally: every slot mutation
//! goes through [ConnectionGroup::with_slot], which subtracts the slot's
//! contribution, applies the mutation, and adds the new contribution
//! back. The stats are therefore always identical to a from-scratch
//! recount, at O(1) cost per transition.

use crate::backoff::connection_backoff;
use crate::policy::Policy;
use crate::slot::{Close, KeepAliveStart, Slot, Stats};
use crate::timer::Timer;
use crate::ConnectionId;

use smallvec::SmallVec;
use std::time::Duration;

/// Instruction to the shell to establish one new connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub connection_id: ConnectionId,
}

/// The capacity tier a connection belongs to, derived from its position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Tier {
    /// Kept open permanently; reconnected with backoff when lost.
    Persisted,
    /// Created under load, shed after the idle timeout.
    Demand,
    /// Created only once the soft limit is saturated; closed the moment
    /// it becomes idle.
    Overflow,
}

/// A connection handed out for leasing, along with the now-obsolete park
/// timers the shell must cancel.
pub(crate) struct LeasedConnection<Conn, Token> {
    pub(crate) conn: Conn,
    pub(crate) timers_to_cancel: SmallVec<[Token; 2]>,
}

/// Outcome of a backoff timer firing.
pub(crate) enum BackoffDone<Token> {
    /// Start a new establish attempt for the same connection id.
    Retry(ConnectionRequest, Option<Token>),
    /// The connection was given up on and removed from the group.
    Removed(SmallVec<[Token; 2]>),
    /// The timer was stale; nothing to do.
    Ignored,
}

/// Everything to tear down when the whole group shuts down.
pub struct ShutdownBatch<Conn, Token> {
    /// Connections to physically close.
    pub connections: Vec<Conn>,
    /// Pending timers to cancel.
    pub timers_to_cancel: Vec<Token>,
}

pub(crate) struct ConnectionGroup<Conn, Token> {
    connections: Vec<Slot<Conn, Token>>,
    minimum: usize,
    soft_limit: usize,
    hard_limit: usize,
    keep_alive_duration: Option<Duration>,
    keep_alive_reduces_available_streams: bool,
    idle_timeout_duration: Duration,
    stats: Stats,
    failed_consecutive_connection_attempts: usize,
}

impl<Conn: Clone, Token> ConnectionGroup<Conn, Token> {
    pub(crate) fn new(policy: &Policy) -> Self {
        assert!(
            policy.minimum_connection_count <= policy.maximum_connection_soft_limit,
            "minimum connection count exceeds the soft limit"
        );
        assert!(
            policy.maximum_connection_soft_limit <= policy.maximum_connection_hard_limit,
            "soft connection limit exceeds the hard limit"
        );
        Self {
            connections: Vec::with_capacity(policy.maximum_connection_hard_limit),
            minimum: policy.minimum_connection_count,
            soft_limit: policy.maximum_connection_soft_limit,
            hard_limit: policy.maximum_connection_hard_limit,
            keep_alive_duration: policy.keep_alive_duration,
            keep_alive_reduces_available_streams: policy.keep_alive_reduces_available_streams,
            idle_timeout_duration: policy.idle_timeout_duration,
            stats: Stats::default(),
            failed_consecutive_connection_attempts: 0,
        }
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub(crate) fn tier(&self, index: usize) -> Tier {
        if index < self.minimum {
            Tier::Persisted
        } else if index < self.soft_limit {
            Tier::Demand
        } else {
            Tier::Overflow
        }
    }

    pub(crate) fn connection_id_at(&self, index: usize) -> ConnectionId {
        self.connections[index].id()
    }

    /// Starts connections until the persisted tier is full.
    pub(crate) fn refill_connections(&mut self) -> SmallVec<[ConnectionRequest; 4]> {
        let mut requests = SmallVec::new();
        while self.stats.active_connections() < self.minimum {
            requests.push(self.start_connection());
        }
        requests
    }

    /// Starts one demand-tier connection, if the soft limit allows.
    pub(crate) fn create_connection_if_below_soft_limit(&mut self) -> Option<ConnectionRequest> {
        (self.stats.active_connections() < self.soft_limit).then(|| self.start_connection())
    }

    /// Starts one overflow connection, if the hard limit allows.
    pub(crate) fn create_connection_if_below_hard_limit(&mut self) -> Option<ConnectionRequest> {
        (self.stats.active_connections() < self.hard_limit).then(|| self.start_connection())
    }

    /// An establish attempt succeeded. Returns the slot index, so the
    /// caller can lease from or park the fresh connection.
    pub(crate) fn connection_established(
        &mut self,
        id: ConnectionId,
        conn: Conn,
        max_streams: u16,
    ) -> usize {
        let index = self.index_of(id);
        self.failed_consecutive_connection_attempts = 0;
        self.with_slot(index, |slot| slot.connected(conn, max_streams));
        index
    }

    /// An establish attempt failed. Returns the backoff timer to
    /// schedule before the next attempt.
    pub(crate) fn connection_establish_failed(&mut self, id: ConnectionId) -> Timer {
        let index = self.index_of(id);
        self.failed_consecutive_connection_attempts += 1;
        let backoff = connection_backoff(self.failed_consecutive_connection_attempts);
        self.with_slot(index, |slot| slot.failed_to_connect(backoff))
    }

    /// A backoff timer fired. Persisted connections always retry;
    /// others retry only while `demand_exists`, and are removed
    /// otherwise.
    pub(crate) fn backoff_done(&mut self, timer: &Timer, demand_exists: bool) -> BackoffDone<Token> {
        let Some(index) = self.find(timer.connection_id()) else {
            return BackoffDone::Ignored;
        };
        if !self.connections[index].backoff_timer_matches(timer) {
            return BackoffDone::Ignored;
        }
        if index < self.minimum || demand_exists {
            let token = self.with_slot(index, |slot| slot.retry_connect());
            BackoffDone::Retry(
                ConnectionRequest {
                    connection_id: timer.connection_id(),
                },
                token,
            )
        } else {
            let mut tokens = SmallVec::new();
            if let Some(token) = self.with_slot(index, |slot| slot.destroy_backing_off()) {
                tokens.push(token);
            }
            if let Some(token) = self.remove_closed_slot(index) {
                tokens.push(token);
            }
            BackoffDone::Removed(tokens)
        }
    }

    /// Routes a cancellation token to the pending timer it belongs to.
    /// Returns the token if the timer is already obsolete.
    pub(crate) fn timer_scheduled(&mut self, timer: &Timer, token: Token) -> Option<Token> {
        match self.find(timer.connection_id()) {
            Some(index) => self.connections[index].timer_scheduled(timer, token),
            None => Some(token),
        }
    }

    /// Finds the first connection that can lease `streams` more streams.
    /// Lower indexes are preferred, which keeps load on the persisted
    /// tier and lets overflow connections idle out.
    pub(crate) fn find_available_connection(&self, streams: u16) -> Option<usize> {
        self.connections
            .iter()
            .position(|slot| slot.available_streams() >= streams)
    }

    pub(crate) fn available_streams_at(&self, index: usize) -> u16 {
        self.connections[index].available_streams()
    }

    pub(crate) fn is_idle_at(&self, index: usize) -> bool {
        self.connections[index].is_idle()
    }

    pub(crate) fn lease(&mut self, index: usize, streams: u16) -> LeasedConnection<Conn, Token> {
        let lease = self.with_slot(index, |slot| slot.lease(streams));
        LeasedConnection {
            conn: lease.conn,
            timers_to_cancel: lease.timers_to_cancel,
        }
    }

    /// Returns `streams` streams to their connection. Yields the slot
    /// index and whether the connection is now idle; `None` when the
    /// release raced with a closure and the connection is already on its
    /// way out.
    pub(crate) fn release_connection(
        &mut self,
        id: ConnectionId,
        streams: u16,
    ) -> Option<(usize, bool)> {
        let index = self.find(id)?;
        if !self.connections[index].is_leased() {
            return None;
        }
        let release = self.with_slot(index, |slot| slot.release(streams));
        Some((index, matches!(release, crate::slot::Release::Idle)))
    }

    /// Parks an idle connection, scheduling whichever of its keep-alive
    /// and idle-timeout timers are enabled, missing, and appropriate for
    /// its tier. Overflow connections are never parked.
    pub(crate) fn park_connection(&mut self, index: usize) -> SmallVec<[Timer; 2]> {
        let keep_alive = self.keep_alive_duration;
        let idle_timeout = match self.tier(index) {
            Tier::Persisted => None,
            Tier::Demand => Some(self.idle_timeout_duration),
            Tier::Overflow => unreachable!("overflow connections are closed, not parked"),
        };
        self.with_slot(index, |slot| slot.park(keep_alive, idle_timeout))
    }

    /// A keep-alive timer fired. Returns the probe to run, or `None` if
    /// the timer was stale.
    pub(crate) fn keep_alive_timer_fired(
        &mut self,
        timer: &Timer,
    ) -> Option<KeepAliveStart<Conn, Token>> {
        let index = self.find(timer.connection_id())?;
        let consuming_stream = self.keep_alive_reduces_available_streams;
        self.with_slot(index, |slot| slot.run_keep_alive(timer, consuming_stream))
    }

    /// A keep-alive probe succeeded. Returns the slot index if the
    /// connection is still connected; `None` when the probe finished
    /// after the connection moved on to closing.
    pub(crate) fn keep_alive_succeeded(&mut self, id: ConnectionId) -> Option<usize> {
        let index = self.find(id)?;
        self.with_slot(index, |slot| slot.keep_alive_succeeded())?;
        Some(index)
    }

    /// An idle-timeout timer fired. Closes the connection if it is still
    /// idle and the timer is current.
    pub(crate) fn close_connection_if_idle(&mut self, timer: &Timer) -> Option<Close<Conn, Token>> {
        let index = self.find(timer.connection_id())?;
        if !self.connections[index].idle_timer_matches(timer) {
            return None;
        }
        self.with_slot(index, |slot| slot.close_if_idle())
    }

    /// Begins closing a connection unconditionally (keep-alive failure,
    /// overflow idling, shutdown).
    pub(crate) fn close_connection(&mut self, index: usize) -> Option<Close<Conn, Token>> {
        self.with_slot(index, |slot| slot.close())
    }

    pub(crate) fn close_connection_by_id(&mut self, id: ConnectionId) -> Option<Close<Conn, Token>> {
        let index = self.find(id)?;
        self.close_connection(index)
    }

    /// The backend renegotiated a connection's stream capacity. Returns
    /// the slot index if the connection is still connected.
    pub(crate) fn update_max_streams(&mut self, id: ConnectionId, max_streams: u16) -> Option<usize> {
        let index = self.find(id)?;
        self.with_slot(index, |slot| slot.update_max_streams(max_streams))
            .then_some(index)
    }

    /// A connection has fully shut down; removes its slot. Returns the
    /// tokens of any timers made obsolete by the removal, including the
    /// idle timer of a connection promoted into the persisted tier.
    pub(crate) fn connection_closed(&mut self, id: ConnectionId) -> SmallVec<[Token; 2]> {
        let index = self.index_of(id);
        let mut tokens = self.with_slot(index, |slot| slot.closed());
        if let Some(token) = self.remove_closed_slot(index) {
            tokens.push(token);
        }
        tokens
    }

    /// Removes a connection whose establish attempt failed while the
    /// pool was shutting down.
    pub(crate) fn remove_starting(&mut self, id: ConnectionId) {
        let index = self.index_of(id);
        self.with_slot(index, |slot| slot.abandon_starting());
        self.remove_closed_slot(index);
    }

    /// Tears down the whole group: backing-off connections are dropped,
    /// idle connections are closed, and leased connections are closed
    /// too unless the shutdown is graceful. Starting connections stay
    /// until their establish attempt resolves.
    pub(crate) fn shutdown(&mut self, graceful: bool) -> ShutdownBatch<Conn, Token> {
        let mut batch = ShutdownBatch {
            connections: Vec::new(),
            timers_to_cancel: Vec::new(),
        };
        for index in 0..self.connections.len() {
            let slot = &self.connections[index];
            if slot.is_backing_off() {
                if let Some(token) = self.with_slot(index, |slot| slot.destroy_backing_off()) {
                    batch.timers_to_cancel.push(token);
                }
            } else if slot.is_idle() || (slot.is_leased() && !graceful) {
                if let Some(close) = self.with_slot(index, |slot| slot.close()) {
                    batch.connections.push(close.conn);
                    batch.timers_to_cancel.extend(close.timers_to_cancel);
                }
            }
        }
        // Tier positions stop mattering once the pool is shutting down.
        self.connections.retain(|slot| !slot.is_closed());
        batch
    }

    fn start_connection(&mut self) -> ConnectionRequest {
        let connection_id = ConnectionId::next();
        let slot = Slot::new_starting(connection_id);
        self.stats.add(&slot.stats_contribution());
        self.connections.push(slot);
        ConnectionRequest { connection_id }
    }

    fn find(&self, id: ConnectionId) -> Option<usize> {
        self.connections.iter().position(|slot| slot.id() == id)
    }

    fn index_of(&self, id: ConnectionId) -> usize {
        self.find(id)
            .unwrap_or_else(|| unreachable!("unknown connection {id}"))
    }

    fn with_slot<T>(
        &mut self,
        index: usize,
        body: impl FnOnce(&mut Slot<Conn, Token>) -> T,
    ) -> T {
        let slot = &mut self.connections[index];
        let before = slot.stats_contribution();
        let result = body(slot);
        let after = slot.stats_contribution();
        self.stats.subtract(&before);
        self.stats.add(&after);
        result
    }

    /// Removes the closed slot at `index`, swapping the last connected
    /// slot into the hole so tier positions stay meaningful. A connected
    /// slot promoted into the persisted tier has its idle timer
    /// cancelled; the token is returned.
    fn remove_closed_slot(&mut self, index: usize) -> Option<Token> {
        debug_assert!(self.connections[index].is_closed());
        let mut promotion_token = None;
        match self.connections.iter().rposition(|slot| slot.is_connected()) {
            Some(last) if last > index => {
                self.connections.swap(index, last);
                if index < self.minimum {
                    promotion_token = self.connections[index].cancel_idle_timer();
                } else if last >= self.soft_limit {
                    // Overflow connections are never parked, so one promoted
                    // into the demand tier carries no idle timer.
                    assert!(
                        self.connections[index].is_leased(),
                        "promoted overflow connection {} is not leased",
                        self.connections[index].id()
                    );
                }
                // Everything past `last` is not connected, so the slot
                // swapped into its place cannot break the tier encoding.
                self.connections.swap_remove(last);
            }
            _ => {
                self.connections.swap_remove(index);
            }
        }
        promotion_token
    }
}
