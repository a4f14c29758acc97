//! Utilities to help with testing tidepool

use crate::connection::{self, ConnectAttempt, Connection, Connector};
use crate::ConnectionId;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A test-only connection which does nothing but track whether it has
/// been closed.
#[derive(Clone)]
pub(crate) struct TestConnection {
    inner: Arc<TestConnectionInner>,
}

struct TestConnectionInner {
    id: ConnectionId,
    closed_tx: watch::Sender<bool>,
}

impl TestConnection {
    fn new(id: ConnectionId) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TestConnectionInner { id, closed_tx }),
        }
    }

    /// Simulates the peer hanging up.
    pub(crate) fn kill(&self) {
        let _ = self.inner.closed_tx.send(true);
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id
    }

    fn close(&self) {
        let _ = self.inner.closed_tx.send(true);
    }

    async fn closed(&self) -> Option<connection::Error> {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        None
    }
}

/// A test-only connector with scriptable failure modes.
pub(crate) struct TestConnector {
    max_streams: u16,
    fail_connects: AtomicBool,
    fail_keep_alives: AtomicBool,
    connect_attempts: AtomicUsize,
    keep_alive_probes: AtomicUsize,
    connections: Mutex<Vec<TestConnection>>,
}

impl TestConnector {
    pub(crate) fn new(max_streams: u16) -> Self {
        Self {
            max_streams,
            fail_connects: AtomicBool::new(false),
            fail_keep_alives: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            keep_alive_probes: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_keep_alives(&self, fail: bool) {
        self.fail_keep_alives.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn keep_alive_probes(&self) -> usize {
        self.keep_alive_probes.load(Ordering::SeqCst)
    }

    /// All connections ever vended, including closed ones.
    pub(crate) fn connections(&self) -> Vec<TestConnection> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(
        &self,
        id: ConnectionId,
    ) -> Result<ConnectAttempt<TestConnection>, connection::Error> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(connection::Error::Other(anyhow::anyhow!(
                "connection refused"
            )));
        }
        let connection = TestConnection::new(id);
        self.connections.lock().unwrap().push(connection.clone());
        Ok(ConnectAttempt {
            connection,
            max_streams: self.max_streams,
        })
    }

    async fn keep_alive(&self, _conn: &TestConnection) -> Result<(), connection::Error> {
        self.keep_alive_probes.fetch_add(1, Ordering::SeqCst);
        if self.fail_keep_alives.load(Ordering::SeqCst) {
            return Err(connection::Error::Other(anyhow::anyhow!(
                "keep-alive probe timed out"
            )));
        }
        Ok(())
    }
}
