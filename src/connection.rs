//! The interface for creating and observing connections to the backend
//! service.

use crate::ConnectionId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Interface for connections managed by the pool.
///
/// A connection is a cheaply clonable handle to a multiplexed transport;
/// several leases may reference the same connection at once. The pool never
/// interprets the connection beyond its identity: it asks for the id, asks
/// to be told when the connection dies, and requests closure.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    /// A stable identifier, matching the id the [Connector] was given.
    fn id(&self) -> ConnectionId;

    /// Requests closure of the connection. [Self::closed] resolves once the
    /// connection has actually shut down.
    fn close(&self);

    /// Resolves when the connection closes, whether closure was requested
    /// by the pool or happened unexpectedly. Returns the error that caused
    /// an unexpected closure, if any.
    async fn closed(&self) -> Option<Error>;
}

/// A freshly established connection, together with its declared capacity.
pub struct ConnectAttempt<Conn> {
    pub connection: Conn,
    /// How many concurrent streams the connection can multiplex.
    pub max_streams: u16,
}

/// Describes how a connection to the backend service should be constructed.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Creates a connection, which must report `id` from
    /// [Connection::id].
    async fn connect(&self, id: ConnectionId)
        -> Result<ConnectAttempt<Self::Connection>, Error>;

    /// Runs a liveness probe against an idle connection.
    ///
    /// Called periodically on idle connections when
    /// [crate::policy::Policy::keep_alive_duration] is set. A failure
    /// causes the connection to be closed.
    ///
    /// By default this method does nothing.
    async fn keep_alive(&self, _conn: &Self::Connection) -> Result<(), Error> {
        Ok(())
    }
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
