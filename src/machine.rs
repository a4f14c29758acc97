//! The pool state machine.
//!
//! [PoolStateMachine] is the purely synchronous core of the pool. It
//! performs no I/O, spawns nothing, and never blocks: callers feed it
//! events one at a time (a lease request, a connection established, a
//! timer fired) and every event returns an [Action] describing exactly
//! what the caller must do in response. The [crate::pool] module wraps
//! it in a tokio shell, but nothing here depends on a runtime; the
//! concurrency story reduces to "serialize the events".
//!
//! Events must be delivered in the order they were observed. The machine
//! is tolerant of the races inherent to that model (a timer firing
//! concurrently with its cancellation, a stream release racing a
//! connection closure, a keep-alive completing after its connection was
//! torn down) and resolves all of them internally.

use crate::group::{BackoffDone, ConnectionGroup, Tier};
use crate::policy::Policy;
use crate::request_queue::{Request, RequestQueue};
use crate::slot::Stats;
use crate::timer::{Timer, TimerUseCase};
use crate::{ConnectionId, RequestId};

use smallvec::{smallvec, SmallVec};
use thiserror::Error;

pub use crate::group::{ConnectionRequest, ShutdownBatch};

/// Why a lease request could not be served.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The caller cancelled the request before a stream was available.
    #[error("the lease request was cancelled")]
    RequestCancelled,

    /// The pool was shut down before a stream was available.
    #[error("the pool is shut down")]
    PoolShutdown,

    /// Connection establishment has failed repeatedly and the pool has
    /// stopped trying. Not currently produced.
    #[error("connection creation circuit breaker tripped")]
    ConnectionCreationCircuitBreakerTripped,
}

/// What the caller must do after feeding the machine one event.
///
/// Request and connection follow-ups are orthogonal, so an action
/// carries at most one of each.
pub struct Action<Conn, R, Token> {
    pub request: RequestAction<Conn, R>,
    pub connection: ConnectionAction<Conn, Token>,
}

pub enum RequestAction<Conn, R> {
    None,
    /// Complete these requests with a lease on this connection, one
    /// stream each.
    LeaseConnection(SmallVec<[R; 1]>, Conn),
    /// Complete this request with an error.
    FailRequest(R, PoolError),
    /// Complete all of these requests with the same error.
    FailRequests(Vec<R>, PoolError),
}

pub enum ConnectionAction<Conn, Token> {
    None,
    /// Schedule these timers and report each back through
    /// [PoolStateMachine::timer_scheduled].
    ScheduleTimers(SmallVec<[Timer; 2]>),
    /// Establish these new connections, after cancelling the listed
    /// timers.
    MakeConnections(SmallVec<[ConnectionRequest; 4]>, SmallVec<[Token; 2]>),
    /// Run a keep-alive probe on this connection. The token, if present,
    /// belongs to the timer that fired and should be released.
    RunKeepAlive(Conn, Option<Token>),
    /// Cancel these timers.
    CancelTimers(SmallVec<[Token; 2]>),
    /// Physically close this connection, after cancelling the listed
    /// timers. Completion is reported through
    /// [PoolStateMachine::connection_closed].
    CloseConnection(Conn, SmallVec<[Token; 2]>),
    /// Tear down every listed connection and timer at once.
    Shutdown(ShutdownBatch<Conn, Token>),
}

impl<Conn, R, Token> Action<Conn, R, Token> {
    fn none() -> Self {
        Self {
            request: RequestAction::None,
            connection: ConnectionAction::None,
        }
    }

    fn connection(connection: ConnectionAction<Conn, Token>) -> Self {
        Self {
            request: RequestAction::None,
            connection,
        }
    }

    fn request(request: RequestAction<Conn, R>) -> Self {
        Self {
            request,
            connection: ConnectionAction::None,
        }
    }

    fn cancel_timers(tokens: SmallVec<[Token; 2]>) -> Self {
        if tokens.is_empty() {
            Self::none()
        } else {
            Self::connection(ConnectionAction::CancelTimers(tokens))
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PoolState {
    Running,
    ShuttingDown { graceful: bool },
    ShutDown,
}

/// The connection pool, as a pure state machine.
pub struct PoolStateMachine<Conn: Clone, R: Request, Token> {
    connections: ConnectionGroup<Conn, Token>,
    request_queue: RequestQueue<R>,
    state: PoolState,
    // Set when a lease request found the pool saturated; saves the
    // growth scan on every subsequent request until capacity frees up.
    cache_no_more_connections_allowed: bool,
}

impl<Conn: Clone, R: Request, Token> PoolStateMachine<Conn, R, Token> {
    pub fn new(policy: &Policy) -> Self {
        Self {
            connections: ConnectionGroup::new(policy),
            request_queue: RequestQueue::new(),
            state: PoolState::Running,
            cache_no_more_connections_allowed: false,
        }
    }

    pub fn stats(&self) -> &Stats {
        self.connections.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state == PoolState::ShutDown
    }

    /// Starts the persisted-tier connections. Called once at startup;
    /// later refills happen through [Self::connection_closed].
    pub fn refill_connections(&mut self) -> SmallVec<[ConnectionRequest; 4]> {
        self.connections.refill_connections()
    }

    /// A caller wants a stream lease.
    pub fn lease_connection(&mut self, request: R) -> Action<Conn, R, Token> {
        if self.state != PoolState::Running {
            return Action::request(RequestAction::FailRequest(request, PoolError::PoolShutdown));
        }

        if let Some(index) = self.connections.find_available_connection(1) {
            let leased = self.connections.lease(index, 1);
            return Action {
                request: RequestAction::LeaseConnection(smallvec![request], leased.conn),
                connection: if leased.timers_to_cancel.is_empty() {
                    ConnectionAction::None
                } else {
                    ConnectionAction::CancelTimers(leased.timers_to_cancel)
                },
            };
        }

        self.request_queue.queue(request);
        match self.grow_if_needed() {
            Some(request) => Action::connection(ConnectionAction::MakeConnections(
                smallvec![request],
                SmallVec::new(),
            )),
            None => Action::none(),
        }
    }

    /// A caller gave up on a queued lease request.
    pub fn cancel_request(&mut self, id: RequestId) -> Action<Conn, R, Token> {
        match self.request_queue.remove(id) {
            Some(request) => Action::request(RequestAction::FailRequest(
                request,
                PoolError::RequestCancelled,
            )),
            None => Action::none(),
        }
    }

    /// A caller returned `streams` streams on a connection.
    pub fn release_connection(
        &mut self,
        id: ConnectionId,
        streams: u16,
    ) -> Action<Conn, R, Token> {
        match self.connections.release_connection(id, streams) {
            Some((index, _)) => self.handle_available_connection(index),
            // The release raced a closure; the streams died with the
            // connection.
            None => Action::none(),
        }
    }

    /// The shell finished establishing a connection.
    pub fn connection_established(
        &mut self,
        id: ConnectionId,
        conn: Conn,
        max_streams: u16,
    ) -> Action<Conn, R, Token> {
        let index = self.connections.connection_established(id, conn, max_streams);
        self.handle_available_connection(index)
    }

    /// The shell failed to establish a connection.
    pub fn connection_establish_failed(&mut self, id: ConnectionId) -> Action<Conn, R, Token> {
        match self.state {
            PoolState::Running => {
                let timer = self.connections.connection_establish_failed(id);
                Action::connection(ConnectionAction::ScheduleTimers(smallvec![timer]))
            }
            PoolState::ShuttingDown { .. } => {
                self.connections.remove_starting(id);
                self.check_shutdown_complete()
            }
            PoolState::ShutDown => {
                unreachable!("connection attempt resolved after shutdown completed")
            }
        }
    }

    /// The shell scheduled a timer and reports its cancellation token.
    /// If the token comes back, the timer already became obsolete and
    /// the shell must cancel it immediately.
    #[must_use]
    pub fn timer_scheduled(&mut self, timer: &Timer, token: Token) -> Option<Token> {
        self.connections.timer_scheduled(timer, token)
    }

    /// A scheduled timer fired.
    pub fn timer_triggered(&mut self, timer: &Timer) -> Action<Conn, R, Token> {
        match timer.use_case() {
            TimerUseCase::Backoff => self.backoff_timer_triggered(timer),
            TimerUseCase::KeepAlive => match self.connections.keep_alive_timer_fired(timer) {
                Some(start) => Action::connection(ConnectionAction::RunKeepAlive(
                    start.conn,
                    start.timer_token,
                )),
                None => Action::none(),
            },
            TimerUseCase::IdleTimeout => {
                // A connection is about to leave; growth may be possible
                // again.
                self.cache_no_more_connections_allowed = false;
                match self.connections.close_connection_if_idle(timer) {
                    Some(close) => Action::connection(ConnectionAction::CloseConnection(
                        close.conn,
                        close.timers_to_cancel,
                    )),
                    None => Action::none(),
                }
            }
        }
    }

    /// A keep-alive probe succeeded.
    pub fn connection_keep_alive_done(&mut self, id: ConnectionId) -> Action<Conn, R, Token> {
        match self.connections.keep_alive_succeeded(id) {
            Some(index) => self.handle_available_connection(index),
            // The probe outlived its connection.
            None => Action::none(),
        }
    }

    /// A keep-alive probe failed; the connection is condemned.
    pub fn connection_keep_alive_failed(&mut self, id: ConnectionId) -> Action<Conn, R, Token> {
        match self.connections.close_connection_by_id(id) {
            Some(close) => Action::connection(ConnectionAction::CloseConnection(
                close.conn,
                close.timers_to_cancel,
            )),
            None => Action::none(),
        }
    }

    /// The backend renegotiated a connection's stream capacity.
    pub fn connection_received_new_max_stream_setting(
        &mut self,
        id: ConnectionId,
        max_streams: u16,
    ) -> Action<Conn, R, Token> {
        match self.connections.update_max_streams(id, max_streams) {
            Some(index) => self.handle_available_connection(index),
            None => Action::none(),
        }
    }

    /// A connection has fully shut down, expectedly or not.
    pub fn connection_closed(&mut self, id: ConnectionId) -> Action<Conn, R, Token> {
        let tokens = self.connections.connection_closed(id);
        self.cache_no_more_connections_allowed = false;

        match self.state {
            PoolState::Running => {
                // Replace the lost connections if the persisted tier fell
                // short, or if queued demand justifies it. A single closure
                // can leave the tier more than one short when several
                // connections were condemned before their closures
                // confirmed, so every refill request must be started.
                let mut replacements = self.connections.refill_connections();
                if replacements.is_empty() {
                    replacements.extend(self.grow_if_needed());
                }
                if replacements.is_empty() {
                    Action::cancel_timers(tokens)
                } else {
                    Action::connection(ConnectionAction::MakeConnections(replacements, tokens))
                }
            }
            PoolState::ShuttingDown { .. } => {
                let mut action = self.check_shutdown_complete();
                if !tokens.is_empty() {
                    action.connection = ConnectionAction::CancelTimers(tokens);
                }
                action
            }
            PoolState::ShutDown => unreachable!("connection closed after shutdown completed"),
        }
    }

    /// Shuts the pool down immediately: all queued requests fail, and
    /// every connection is closed, leased or not.
    pub fn trigger_force_shutdown(&mut self) -> Action<Conn, R, Token> {
        if self.state == PoolState::ShutDown {
            return Action::none();
        }
        self.state = PoolState::ShuttingDown { graceful: false };
        let batch = self.connections.shutdown(false);
        let failed = self.request_queue.remove_all();
        if self.connections.is_empty() {
            self.state = PoolState::ShutDown;
        }
        Action {
            request: if failed.is_empty() {
                RequestAction::None
            } else {
                RequestAction::FailRequests(failed, PoolError::PoolShutdown)
            },
            connection: ConnectionAction::Shutdown(batch),
        }
    }

    /// Shuts the pool down gracefully: new requests are rejected, but
    /// already-queued requests are still served and leased connections
    /// stay open until their streams come back.
    pub fn trigger_graceful_shutdown(&mut self) -> Action<Conn, R, Token> {
        if self.state != PoolState::Running {
            return Action::none();
        }
        self.state = PoolState::ShuttingDown { graceful: true };
        let batch = self.connections.shutdown(true);
        if self.connections.is_empty() {
            self.state = PoolState::ShutDown;
            let failed = self.request_queue.remove_all();
            return Action {
                request: if failed.is_empty() {
                    RequestAction::None
                } else {
                    RequestAction::FailRequests(failed, PoolError::PoolShutdown)
                },
                connection: ConnectionAction::Shutdown(batch),
            };
        }
        Action::connection(ConnectionAction::Shutdown(batch))
    }

    /// A connection gained leasable streams (it was established, a lease
    /// came back, a probe finished, its capacity grew). Serve queued
    /// requests from it; if it is idle afterwards, park or shed it
    /// according to its tier and the pool state.
    fn handle_available_connection(&mut self, index: usize) -> Action<Conn, R, Token> {
        let available = usize::from(self.connections.available_streams_at(index));
        let to_serve = self.request_queue.count().min(available);
        if to_serve > 0 {
            let requests = self.request_queue.pop(to_serve);
            let leased = self.connections.lease(index, requests.len() as u16);
            return Action {
                request: RequestAction::LeaseConnection(requests, leased.conn),
                connection: if leased.timers_to_cancel.is_empty() {
                    ConnectionAction::None
                } else {
                    ConnectionAction::CancelTimers(leased.timers_to_cancel)
                },
            };
        }

        if !self.connections.is_idle_at(index) {
            return Action::none();
        }
        let shed = match self.state {
            PoolState::Running => self.connections.tier(index) == Tier::Overflow,
            PoolState::ShuttingDown { .. } => true,
            PoolState::ShutDown => unreachable!("connection available after shutdown completed"),
        };
        if shed {
            match self.connections.close_connection(index) {
                Some(close) => Action::connection(ConnectionAction::CloseConnection(
                    close.conn,
                    close.timers_to_cancel,
                )),
                None => Action::none(),
            }
        } else {
            let timers = self.connections.park_connection(index);
            if timers.is_empty() {
                Action::none()
            } else {
                Action::connection(ConnectionAction::ScheduleTimers(timers))
            }
        }
    }

    fn backoff_timer_triggered(&mut self, timer: &Timer) -> Action<Conn, R, Token> {
        let demand_exists = !self.request_queue.is_empty();
        match self.connections.backoff_done(timer, demand_exists) {
            BackoffDone::Retry(request, token) => Action::connection(
                ConnectionAction::MakeConnections(smallvec![request], token.into_iter().collect()),
            ),
            BackoffDone::Removed(tokens) => {
                self.cache_no_more_connections_allowed = false;
                Action::cancel_timers(tokens)
            }
            BackoffDone::Ignored => Action::none(),
        }
    }

    fn grow_if_needed(&mut self) -> Option<ConnectionRequest> {
        if self.cache_no_more_connections_allowed || self.state != PoolState::Running {
            return None;
        }
        let soon = self.connections.stats().soon_available_connections();
        if soon >= self.request_queue.count() {
            return None;
        }
        let request = self
            .connections
            .create_connection_if_below_soft_limit()
            .or_else(|| self.connections.create_connection_if_below_hard_limit());
        if request.is_none() {
            self.cache_no_more_connections_allowed = true;
        }
        request
    }

    fn check_shutdown_complete(&mut self) -> Action<Conn, R, Token> {
        if matches!(self.state, PoolState::ShuttingDown { .. }) && self.connections.is_empty() {
            self.state = PoolState::ShutDown;
            let failed = self.request_queue.remove_all();
            if !failed.is_empty() {
                return Action::request(RequestAction::FailRequests(
                    failed,
                    PoolError::PoolShutdown,
                ));
            }
        }
        Action::none()
    }
}
