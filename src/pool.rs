//! A pool which uses a [crate::connection::Connector] to establish
//! connections and vend out stream leases as [claim::Handle]s.
//!
//! The pool is a thin shell around [PoolStateMachine]: a single worker
//! task owns the machine, serializes every external event (claims,
//! releases, connect results, timers, closures) through one channel, and
//! executes the actions the machine returns. All sleeping, connecting
//! and probing happens in short-lived spawned tasks that report back
//! through the same channel, so the worker itself never blocks.

use crate::claim;
use crate::connection::{self, Connection, SharedConnector};
use crate::machine::{
    Action, ConnectionAction, ConnectionRequest, PoolError, PoolStateMachine, RequestAction,
};
use crate::policy::Policy;
use crate::request_queue::Request;
use crate::slot::Stats;
use crate::timer::Timer;
use crate::{ConnectionId, RequestId};

use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Pool terminated")]
    Terminated,
}

/// The name of the pool
#[derive(Clone, Debug)]
pub(crate) struct Name(std::sync::Arc<str>);

impl Name {
    pub(crate) fn new<S: Into<std::sync::Arc<str>>>(name: S) -> Self {
        Self(name.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// Everything that can happen to the pool, funneled through one channel.
pub(crate) enum Event<Conn: Connection> {
    Claim {
        id: RequestId,
        tx: oneshot::Sender<Result<claim::Handle<Conn>, PoolError>>,
    },
    CancelClaim {
        id: RequestId,
    },
    Release {
        connection_id: ConnectionId,
        streams: u16,
    },
    Established {
        connection_id: ConnectionId,
        conn: Conn,
        max_streams: u16,
    },
    EstablishFailed {
        connection_id: ConnectionId,
        error: connection::Error,
    },
    TimerTriggered {
        timer: Timer,
    },
    KeepAliveDone {
        connection_id: ConnectionId,
    },
    KeepAliveFailed {
        connection_id: ConnectionId,
        error: connection::Error,
    },
    Closed {
        connection_id: ConnectionId,
        error: Option<connection::Error>,
    },
    Shutdown {
        graceful: bool,
        tx: oneshot::Sender<()>,
    },
}

// A claim request that could not complete immediately
struct QueuedRequest<Conn: Connection> {
    id: RequestId,
    tx: oneshot::Sender<Result<claim::Handle<Conn>, PoolError>>,
}

impl<Conn: Connection> Request for QueuedRequest<Conn> {
    fn id(&self) -> RequestId {
        self.id
    }
}

// Timers are spawned sleep tasks; aborting the task is cancelling the
// timer, which makes cancellation safe to call on spent timers too.
type Machine<Conn> = PoolStateMachine<Conn, QueuedRequest<Conn>, AbortHandle>;

struct PoolInner<Conn: Connection> {
    name: Name,
    connector: SharedConnector<Conn>,
    machine: Machine<Conn>,

    // Cloned into every spawned task so results flow back to the worker.
    tx: mpsc::UnboundedSender<Event<Conn>>,
    rx: mpsc::UnboundedReceiver<Event<Conn>>,

    stats_tx: watch::Sender<Stats>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl<Conn: Connection> PoolInner<Conn> {
    async fn run(mut self) {
        for request in self.machine.refill_connections() {
            self.spawn_connect(request);
        }
        self.publish_stats();

        while let Some(pool_event) = self.rx.recv().await {
            self.handle_event(pool_event);
            self.publish_stats();
            if self.machine.is_shut_down() {
                break;
            }
        }

        event!(Level::INFO, pool = %self.name, "Pool shut down");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn handle_event(&mut self, pool_event: Event<Conn>) {
        match pool_event {
            Event::Claim { id, tx } => {
                let action = self.machine.lease_connection(QueuedRequest { id, tx });
                if matches!(action.request, RequestAction::None) {
                    event!(
                        Level::TRACE,
                        pool = %self.name,
                        request_id = %id,
                        "Claim queued; waiting for an available stream"
                    );
                }
                self.perform(action);
            }
            Event::CancelClaim { id } => {
                let action = self.machine.cancel_request(id);
                self.perform(action);
            }
            Event::Release {
                connection_id,
                streams,
            } => {
                let action = self.machine.release_connection(connection_id, streams);
                self.perform(action);
            }
            Event::Established {
                connection_id,
                conn,
                max_streams,
            } => {
                event!(
                    Level::DEBUG,
                    pool = %self.name,
                    connection_id = %connection_id,
                    max_streams,
                    "Connection established"
                );
                self.watch_closure(&conn);
                let action = self
                    .machine
                    .connection_established(connection_id, conn, max_streams);
                self.perform(action);
            }
            Event::EstablishFailed {
                connection_id,
                error,
            } => {
                event!(
                    Level::WARN,
                    pool = %self.name,
                    connection_id = %connection_id,
                    error = %error,
                    "Failed to establish connection"
                );
                let action = self.machine.connection_establish_failed(connection_id);
                self.perform(action);
            }
            Event::TimerTriggered { timer } => {
                let action = self.machine.timer_triggered(&timer);
                self.perform(action);
            }
            Event::KeepAliveDone { connection_id } => {
                event!(
                    Level::TRACE,
                    pool = %self.name,
                    connection_id = %connection_id,
                    "Keep-alive succeeded"
                );
                let action = self.machine.connection_keep_alive_done(connection_id);
                self.perform(action);
            }
            Event::KeepAliveFailed {
                connection_id,
                error,
            } => {
                event!(
                    Level::WARN,
                    pool = %self.name,
                    connection_id = %connection_id,
                    error = %error,
                    "Keep-alive failed; closing connection"
                );
                let action = self.machine.connection_keep_alive_failed(connection_id);
                self.perform(action);
            }
            Event::Closed {
                connection_id,
                error,
            } => {
                match error {
                    Some(error) => event!(
                        Level::WARN,
                        pool = %self.name,
                        connection_id = %connection_id,
                        error = %error,
                        "Connection closed unexpectedly"
                    ),
                    None => event!(
                        Level::DEBUG,
                        pool = %self.name,
                        connection_id = %connection_id,
                        "Connection closed"
                    ),
                }
                let action = self.machine.connection_closed(connection_id);
                self.perform(action);
            }
            Event::Shutdown { graceful, tx } => {
                event!(Level::INFO, pool = %self.name, graceful, "Shutting down pool");
                self.shutdown_waiters.push(tx);
                let action = if graceful {
                    self.machine.trigger_graceful_shutdown()
                } else {
                    self.machine.trigger_force_shutdown()
                };
                self.perform(action);
            }
        }
    }

    fn perform(&mut self, action: Action<Conn, QueuedRequest<Conn>, AbortHandle>) {
        match action.request {
            RequestAction::None => {}
            RequestAction::LeaseConnection(requests, conn) => {
                for request in requests {
                    self.send_lease(request, conn.clone());
                }
            }
            RequestAction::FailRequest(request, error) => {
                let _ = request.tx.send(Err(error));
            }
            RequestAction::FailRequests(requests, error) => {
                for request in requests {
                    let _ = request.tx.send(Err(error));
                }
            }
        }
        match action.connection {
            ConnectionAction::None => {}
            ConnectionAction::ScheduleTimers(timers) => {
                for timer in timers {
                    self.schedule_timer(timer);
                }
            }
            ConnectionAction::MakeConnections(requests, timers_to_cancel) => {
                for timer in timers_to_cancel {
                    timer.abort();
                }
                for request in requests {
                    self.spawn_connect(request);
                }
            }
            ConnectionAction::RunKeepAlive(conn, timer_to_cancel) => {
                if let Some(timer) = timer_to_cancel {
                    timer.abort();
                }
                self.spawn_keep_alive(conn);
            }
            ConnectionAction::CancelTimers(timers) => {
                for timer in timers {
                    timer.abort();
                }
            }
            ConnectionAction::CloseConnection(conn, timers_to_cancel) => {
                for timer in timers_to_cancel {
                    timer.abort();
                }
                event!(
                    Level::DEBUG,
                    pool = %self.name,
                    connection_id = %conn.id(),
                    "Closing connection"
                );
                conn.close();
            }
            ConnectionAction::Shutdown(batch) => {
                for timer in batch.timers_to_cancel {
                    timer.abort();
                }
                for conn in batch.connections {
                    conn.close();
                }
            }
        }
    }

    fn send_lease(&mut self, request: QueuedRequest<Conn>, conn: Conn) {
        let handle = claim::Handle::new(conn, self.tx.clone());

        // If the caller gave up concurrently, dropping the rejected
        // handle sends the stream straight back.
        let _ = request.tx.send(Ok(handle));
    }

    fn schedule_timer(&mut self, timer: Timer) {
        let events = self.tx.clone();
        let duration = timer.duration();
        let fired = timer.clone();
        let task = tokio::task::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(Event::TimerTriggered { timer: fired });
        });

        // The timer may have become obsolete while we were spawning.
        if let Some(token) = self.machine.timer_scheduled(&timer, task.abort_handle()) {
            token.abort();
        }
    }

    fn spawn_connect(&self, request: ConnectionRequest) {
        event!(
            Level::DEBUG,
            pool = %self.name,
            connection_id = %request.connection_id,
            "Establishing connection"
        );
        let connector = self.connector.clone();
        let events = self.tx.clone();
        let connection_id = request.connection_id;
        tokio::task::spawn(async move {
            match connector.connect(connection_id).await {
                Ok(attempt) => {
                    let _ = events.send(Event::Established {
                        connection_id,
                        conn: attempt.connection,
                        max_streams: attempt.max_streams,
                    });
                }
                Err(error) => {
                    let _ = events.send(Event::EstablishFailed {
                        connection_id,
                        error,
                    });
                }
            }
        });
    }

    fn spawn_keep_alive(&self, conn: Conn) {
        event!(
            Level::DEBUG,
            pool = %self.name,
            connection_id = %conn.id(),
            "Running keep-alive probe"
        );
        let connector = self.connector.clone();
        let events = self.tx.clone();
        tokio::task::spawn(async move {
            let connection_id = conn.id();
            match connector.keep_alive(&conn).await {
                Ok(()) => {
                    let _ = events.send(Event::KeepAliveDone { connection_id });
                }
                Err(error) => {
                    let _ = events.send(Event::KeepAliveFailed {
                        connection_id,
                        error,
                    });
                }
            }
        });
    }

    fn watch_closure(&self, conn: &Conn) {
        let conn = conn.clone();
        let events = self.tx.clone();
        tokio::task::spawn(async move {
            let error = conn.closed().await;
            let _ = events.send(Event::Closed {
                connection_id: conn.id(),
                error,
            });
        });
    }

    fn publish_stats(&self) {
        let stats = self.machine.stats();
        self.stats_tx.send_if_modified(|current| {
            if current == stats {
                false
            } else {
                *current = stats.clone();
                true
            }
        });
    }
}

// Sends a cancellation for the claim if the claim future is dropped
// before the pool answered.
struct CancelGuard<'a, Conn: Connection> {
    id: RequestId,
    events: Option<&'a mpsc::UnboundedSender<Event<Conn>>>,
}

impl<Conn: Connection> CancelGuard<'_, Conn> {
    fn disarm(&mut self) {
        self.events = None;
    }
}

impl<Conn: Connection> Drop for CancelGuard<'_, Conn> {
    fn drop(&mut self) {
        if let Some(events) = self.events {
            let _ = events.send(Event::CancelClaim { id: self.id });
        }
    }
}

/// Manages a set of multiplexed connections to a service.
pub struct Pool<Conn: Connection> {
    name: Name,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tx: mpsc::UnboundedSender<Event<Conn>>,
    stats_rx: watch::Receiver<Stats>,
}

impl<Conn: Connection> Pool<Conn> {
    /// Creates a new connection pool.
    ///
    /// - name: The name of this pool, for instrumentation.
    /// - connector: Describes how connections to the backend service
    ///   should be made.
    /// - policy: Describes the capacity tiers and timer durations.
    ///
    /// The pool starts establishing its persisted connections
    /// immediately; claims made before any connection is up are queued
    /// until one is.
    pub fn new(name: String, connector: SharedConnector<Conn>, policy: Policy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(Stats::default());
        let name = Name::new(name);
        let worker = PoolInner {
            name: name.clone(),
            connector,
            machine: Machine::new(&policy),
            tx: tx.clone(),
            rx,
            stats_tx,
            shutdown_waiters: Vec::new(),
        };
        let handle = tokio::task::spawn(worker.run());

        Self {
            name,
            handle: Mutex::new(Some(handle)),
            tx,
            stats_rx,
        }
    }

    /// The name this pool was created with.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Samples the pool's stats at a single point in time.
    pub fn stats(&self) -> Stats {
        self.stats_rx.borrow().clone()
    }

    /// Returns a receiver which observes every stats change.
    pub fn stats_receiver(&self) -> watch::Receiver<Stats> {
        self.stats_rx.clone()
    }

    /// Acquires a lease on one stream of a pooled connection.
    ///
    /// Waits until a stream is available; dropping the returned future
    /// withdraws the request. Cancellation-safe: a lease granted
    /// concurrently with the drop is returned to the pool.
    #[instrument(level = "debug", skip(self), err, name = "Pool::claim")]
    pub async fn claim(&self) -> Result<claim::Handle<Conn>, Error> {
        let id = RequestId::next();
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Event::Claim { id, tx })
            .map_err(|_| Error::Terminated)?;

        let mut guard = CancelGuard {
            id,
            events: Some(&self.tx),
        };
        let result = rx.await;
        guard.disarm();

        match result {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Terminated),
        }
    }

    /// Terminates the connection pool immediately.
    ///
    /// Queued claims fail with [PoolError::PoolShutdown] and every
    /// connection is closed, leased or not. Resolves once all
    /// connections have confirmed closure.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.shutdown(false).await
    }

    /// Terminates the connection pool gracefully.
    ///
    /// New claims are rejected, already-queued claims are still served,
    /// and leased connections stay open until their streams are
    /// returned. Resolves once the last connection has closed.
    pub async fn terminate_gracefully(&self) -> Result<(), Error> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, graceful: bool) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Event::Shutdown { graceful, tx })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?;

        let Some(handle) = self.handle.lock().unwrap().take() else {
            return Ok(());
        };
        handle.await.map_err(|_| Error::Terminated)
    }
}

impl<Conn: Connection> Drop for Pool<Conn> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_utils::TestConnector;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_thread_names(true)
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    }

    fn policy(minimum: usize, soft: usize, hard: usize) -> Policy {
        Policy {
            minimum_connection_count: minimum,
            maximum_connection_soft_limit: soft,
            maximum_connection_hard_limit: hard,
            keep_alive_duration: None,
            keep_alive_reduces_available_streams: true,
            idle_timeout_duration: Duration::from_secs(60),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_stats(pool: &Pool<crate::test_utils::TestConnection>, f: impl FnMut(&Stats) -> bool) {
        let mut rx = pool.stats_receiver();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(f))
            .await
            .expect("stats not reached in time")
            .expect("pool worker gone");
    }

    #[tokio::test]
    async fn test_claims_multiplex_onto_one_connection() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(2));
        let pool = Pool::new("test-pool".to_string(), connector.clone(), policy(0, 1, 1));

        let first = pool.claim().await.expect("Failed to get claim");
        let second = pool.claim().await.expect("Failed to get claim");
        assert_eq!(first.id(), second.id());
        assert_eq!(connector.connect_attempts(), 1);

        wait_for_stats(&pool, |stats| stats.leased_streams == 2).await;
        drop(first);
        drop(second);
        wait_for_stats(&pool, |stats| stats.idle == 1 && stats.leased_streams == 0).await;
    }

    #[tokio::test]
    async fn test_claims_block_until_a_stream_frees_up() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new("test-pool".to_string(), connector, policy(0, 1, 1));

        let first = pool.claim().await.expect("Failed to get claim");

        // The only stream is taken, so another claim cannot complete.
        let result = tokio::time::timeout(Duration::from_millis(50), pool.claim()).await;
        assert!(
            result.is_err(),
            "Unexpected non-error result (expected timeout)"
        );

        drop(first);
        pool.claim()
            .await
            .expect("Failed to get claim after a stream became available");
    }

    #[tokio::test]
    async fn test_persisted_connections_connect_eagerly() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new("test-pool".to_string(), connector.clone(), policy(2, 4, 4));

        // No claims needed; the persisted tier fills on its own.
        wait_for_stats(&pool, |stats| stats.idle == 2).await;
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_failed_connects_retry_with_backoff() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        connector.set_fail_connects(true);
        let pool = Pool::new("test-pool".to_string(), connector.clone(), policy(1, 1, 1));

        // Persisted connections retry indefinitely.
        {
            let connector = connector.clone();
            wait_until(move || connector.connect_attempts() >= 2).await;
        }

        connector.set_fail_connects(false);
        wait_for_stats(&pool, |stats| stats.idle == 1).await;
    }

    #[tokio::test]
    async fn test_dead_connections_are_replaced() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new("test-pool".to_string(), connector.clone(), policy(1, 1, 1));

        wait_for_stats(&pool, |stats| stats.idle == 1).await;
        connector.connections()[0].kill();

        {
            let connector = connector.clone();
            wait_until(move || connector.connect_attempts() == 2).await;
        }
        wait_for_stats(&pool, |stats| stats.idle == 1).await;
    }

    #[tokio::test]
    async fn test_keep_alive_probes_run_periodically() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new(
            "test-pool".to_string(),
            connector.clone(),
            Policy {
                keep_alive_duration: Some(Duration::from_millis(10)),
                ..policy(1, 1, 1)
            },
        );

        wait_for_stats(&pool, |stats| stats.idle == 1).await;
        {
            let connector = connector.clone();
            wait_until(move || connector.keep_alive_probes() >= 3).await;
        }
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_keep_alive_replaces_the_connection() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        connector.set_fail_keep_alives(true);
        let pool = Pool::new(
            "test-pool".to_string(),
            connector.clone(),
            Policy {
                keep_alive_duration: Some(Duration::from_millis(10)),
                ..policy(1, 1, 1)
            },
        );

        {
            let connector = connector.clone();
            wait_until(move || connector.connect_attempts() >= 2).await;
        }
        connector.set_fail_keep_alives(false);
        wait_for_stats(&pool, |stats| stats.idle == 1).await;
    }

    #[tokio::test]
    async fn test_idle_demand_connections_are_shed() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new(
            "test-pool".to_string(),
            connector.clone(),
            Policy {
                idle_timeout_duration: Duration::from_millis(20),
                ..policy(0, 1, 1)
            },
        );

        let handle = pool.claim().await.expect("Failed to get claim");
        drop(handle);

        wait_for_stats(&pool, |stats| *stats == Stats::default()).await;
        assert_eq!(connector.connect_attempts(), 1);

        // The next claim builds a fresh connection.
        let _handle = pool.claim().await.expect("Failed to get claim");
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_claims_release_their_queue_slot() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new("test-pool".to_string(), connector, policy(0, 1, 1));

        let first = pool.claim().await.expect("Failed to get claim");

        // This claim times out; dropping the future withdraws it.
        let result = tokio::time::timeout(Duration::from_millis(50), pool.claim()).await;
        assert!(result.is_err());

        // The withdrawn claim must not swallow the freed stream.
        drop(first);
        wait_for_stats(&pool, |stats| stats.idle == 1).await;
    }

    #[tokio::test]
    async fn test_terminate_closes_leased_connections() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Pool::new("test-pool".to_string(), connector.clone(), policy(0, 2, 2));

        let handle = pool.claim().await.expect("Failed to get claim");
        pool.terminate().await.expect("Failed to terminate");

        assert!(matches!(pool.claim().await, Err(Error::Terminated)));

        // Returning the lease after the fact is harmless.
        drop(handle);
    }

    #[tokio::test]
    async fn test_graceful_terminate_waits_for_leases() {
        setup_tracing_subscriber();
        let connector = Arc::new(TestConnector::new(1));
        let pool = Arc::new(Pool::new(
            "test-pool".to_string(),
            connector,
            policy(0, 1, 1),
        ));

        let handle = pool.claim().await.expect("Failed to get claim");

        let terminator = {
            let pool = pool.clone();
            tokio::task::spawn(async move { pool.terminate_gracefully().await })
        };

        // Termination cannot complete while the lease is out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!terminator.is_finished());

        drop(handle);
        terminator
            .await
            .expect("Background task failed")
            .expect("Failed to terminate");
    }
}
