//! Configuration options which can alter the behavior of the pool.

use std::time::Duration;

/// Policy which is applicable to a connection pool.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The number of persisted connections the pool keeps open at all
    /// times. Persisted connections are created eagerly, never closed for
    /// being idle, and retried indefinitely when they fail to connect.
    pub minimum_connection_count: usize,

    /// The number of connections the pool may keep parked while idle.
    ///
    /// Connections above [Self::minimum_connection_count] and below this
    /// limit are created on demand and shed again after
    /// [Self::idle_timeout_duration].
    pub maximum_connection_soft_limit: usize,

    /// The absolute maximum number of connections.
    ///
    /// Connections above the soft limit are created only once the soft
    /// limit is saturated, and are closed the instant they become idle.
    pub maximum_connection_hard_limit: usize,

    /// How often an idle connection is probed for liveness.
    ///
    /// `None` disables keep-alive probing.
    pub keep_alive_duration: Option<Duration>,

    /// Whether a running keep-alive probe occupies one of the connection's
    /// streams while it is in flight.
    pub keep_alive_reduces_available_streams: bool,

    /// How long a demand-tier connection may sit idle before it is closed.
    pub idle_timeout_duration: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            minimum_connection_count: 0,
            maximum_connection_soft_limit: 10,
            maximum_connection_hard_limit: 10,
            keep_alive_duration: None,
            keep_alive_reduces_available_streams: true,
            idle_timeout_duration: Duration::from_secs(60),
        }
    }
}
