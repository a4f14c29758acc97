//! FIFO queue of pending lease requests.

use crate::RequestId;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

/// A pending lease request, as seen by the engine.
///
/// The engine never completes a request itself; it hands requests back in
/// [crate::machine::RequestAction]s and the shell signals the caller.
pub trait Request {
    fn id(&self) -> RequestId;
}

/// FIFO queue with O(1) enqueue, dequeue and cancellation.
///
/// Cancellation removes the request from the id map only; the id stays in
/// the order list as a tombstone and is skipped when it surfaces in
/// [Self::pop]. The queue owns a request's completion contract while the
/// request is enqueued; ownership transfers out on pop or removal.
pub(crate) struct RequestQueue<R: Request> {
    order: VecDeque<RequestId>,
    requests: HashMap<RequestId, R>,
}

impl<R: Request> RequestQueue<R> {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            requests: HashMap::new(),
        }
    }

    /// The number of live (non-cancelled) requests.
    pub(crate) fn count(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn queue(&mut self, request: R) {
        let id = request.id();
        let replaced = self.requests.insert(id, request);
        assert!(replaced.is_none(), "request {id} enqueued twice");
        self.order.push_back(id);
    }

    /// Pops up to `max` live requests in enqueue order, lazily discarding
    /// tombstones of cancelled requests along the way.
    pub(crate) fn pop(&mut self, max: usize) -> SmallVec<[R; 1]> {
        let mut popped = SmallVec::new();
        while popped.len() < max {
            let Some(id) = self.order.pop_front() else {
                break;
            };
            if let Some(request) = self.requests.remove(&id) {
                popped.push(request);
            }
        }
        popped
    }

    /// Cancels an enqueued request. Returns `None` if the request was
    /// already popped, cancelled, or never queued.
    pub(crate) fn remove(&mut self, id: RequestId) -> Option<R> {
        self.requests.remove(&id)
    }

    /// Drains every live request, in enqueue order. Used at shutdown.
    pub(crate) fn remove_all(&mut self) -> Vec<R> {
        let mut drained = Vec::with_capacity(self.requests.len());
        for id in self.order.drain(..) {
            if let Some(request) = self.requests.remove(&id) {
                drained.push(request);
            }
        }
        drained
    }
}
