//! Stream leases which are borrowed from the connection pool.

use crate::connection::Connection;
use crate::pool::Event;
use tokio::sync::mpsc;

/// A lease on one stream of a pooled connection, returned to the pool
/// when dropped.
///
/// Note that this type implements [std::ops::Deref] for the generic
/// `Conn` type, and generally, clients should transparently use a handle
/// as a connection. Several handles may deref to the same underlying
/// connection when it multiplexes.
pub struct Handle<Conn: Connection> {
    conn: Option<Conn>,
    events: mpsc::UnboundedSender<Event<Conn>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(conn: Conn, events: mpsc::UnboundedSender<Event<Conn>>) -> Self {
        Self {
            conn: Some(conn),
            events,
        }
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        let conn = self.conn.take().unwrap();

        // If the pool is gone the stream dies with it.
        let _ = self.events.send(Event::Release {
            connection_id: conn.id(),
            streams: 1,
        });
    }
}
