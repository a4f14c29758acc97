//! tidepool is a connection pooling crate for multiplexed protocols.
//!
//! tidepool manages a bounded set of long-lived, reusable connections to a
//! backend service and leases individual *streams* on those connections to
//! concurrent callers. Connections may multiplex several in-flight
//! operations at once; the pool tracks per-connection stream capacity and
//! hands out leases until that capacity is exhausted.
//!
//! It uses the following terminology:
//! * A *stream* is a logical concurrent-request slot within one physical
//!   connection.
//! * A *lease* grants use of one stream on a connection to a caller, and is
//!   returned to the pool when the [claim::Handle] is dropped.
//! * Connections live in three capacity tiers: *persisted* connections are
//!   kept open permanently, *demand* connections are created under load and
//!   shed after an idle timeout, and *overflow* connections are created only
//!   once the soft limit is saturated and closed the moment they idle.
//!
//! # Architecture
//!
//! The crate is split into a purely synchronous engine and a tokio-based
//! shell:
//!
//! * [machine::PoolStateMachine] is the engine. It owns all pool
//!   bookkeeping, performs no I/O, spawns nothing, and never blocks; every
//!   public operation is a state transition that returns an
//!   [machine::Action] describing exactly what the caller must do next
//!   (create a connection, run a keep-alive, schedule or cancel timers,
//!   lease connections to waiting requests, fail requests, shut down).
//! * [pool::Pool] is the shell. It owns the sockets, timers and tasks,
//!   serializes all external events into the engine through a single worker
//!   task, and executes the returned actions.
//!
//! This split keeps the concurrent parts trivial and makes the hard parts
//! (capacity tiers, stream accounting, timer races) exhaustively testable
//! without any runtime.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [connection::Connector], which
//!   specifies how connections to the backend service are created and kept
//!   alive, and a [policy::Policy] describing the capacity tiers.

// Public API
pub mod claim;
pub mod connection;
pub mod machine;
pub mod policy;
pub mod pool;

// Necessary for implementation
mod backoff;
mod group;
mod request_queue;
mod slot;
#[cfg(test)]
mod test_utils;
mod timer;

pub use crate::machine::PoolError;
pub use crate::request_queue::Request;
pub use crate::slot::Stats;
pub use crate::timer::{Timer, TimerUseCase};

use std::sync::atomic::{AtomicU64, Ordering};

/// Uniquely identifies a pooled connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Produces the next process-wide unique connection id.
    ///
    /// Safe to call concurrently; the counter wraps on overflow.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Uniquely identifies a lease request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Produces the next process-wide unique request id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
