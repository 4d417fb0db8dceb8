//! # Per-client request queues.
//!
//! [`RequestScheduler`] parks requests that cannot be dispatched yet (engine
//! busy, setup running) and hands them back one at a time when the engine
//! frees up.
//!
//! ## Rules
//! - One FIFO queue per client.
//! - A request equal to one already queued (for any client) is not queued
//!   again.
//! - [`next`](RequestScheduler::next) releases at most one request per call.
//!   Clients are visited in attach order, starting after the one served last,
//!   so a chatty client cannot starve the others.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::request::{BillingRequest, ClientId, RequestId};

/// A parked request. It keeps the id handed out when it was first posted.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRequest {
    pub client: ClientId,
    pub id: RequestId,
    pub request: BillingRequest,
}

/// Deferred requests, keyed by client.
#[derive(Debug, Default)]
pub struct RequestScheduler {
    queues: BTreeMap<ClientId, VecDeque<(RequestId, BillingRequest)>>,
    last_served: Option<ClientId>,
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `request` for `client`. Returns `false` when an equal request is
    /// already waiting.
    pub fn schedule(&mut self, client: ClientId, id: RequestId, request: BillingRequest) -> bool {
        if self.queues.values().flatten().any(|(_, queued)| *queued == request) {
            debug!(%client, request_id = %id, kind = request.kind().as_label(), "equal request already queued");
            return false;
        }
        self.queues.entry(client).or_default().push_back((id, request));
        true
    }

    /// Pops the next request to resubmit, or `None` if the engine is busy or
    /// nothing waits.
    pub fn next(&mut self, busy: bool) -> Option<QueuedRequest> {
        if busy {
            return None;
        }
        let start = self.last_served;
        let order = self
            .queues
            .keys()
            .copied()
            .filter(|id| start.is_some_and(|s| *id > s))
            .chain(self.queues.keys().copied().filter(|id| start.map_or(true, |s| *id <= s)))
            .collect::<Vec<_>>();

        for client in order {
            let popped = self.queues.get_mut(&client).and_then(VecDeque::pop_front);
            if let Some((id, request)) = popped {
                self.last_served = Some(client);
                self.prune(client);
                return Some(QueuedRequest { client, id, request });
            }
        }
        None
    }

    /// Whether `client` has anything waiting.
    pub fn has_queued(&self, client: ClientId) -> bool {
        self.queues.get(&client).is_some_and(|q| !q.is_empty())
    }

    /// Number of requests waiting across all clients.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets everything queued for `client`.
    pub fn drop_queue(&mut self, client: ClientId) -> Vec<QueuedRequest> {
        self.queues
            .remove(&client)
            .into_iter()
            .flatten()
            .map(|(id, request)| QueuedRequest { client, id, request })
            .collect()
    }

    /// Forgets every queue, returning what was dropped in client order.
    pub fn drop_all_queues(&mut self) -> Vec<QueuedRequest> {
        self.last_served = None;
        std::mem::take(&mut self.queues)
            .into_iter()
            .flat_map(|(client, queue)| {
                queue
                    .into_iter()
                    .map(move |(id, request)| QueuedRequest { client, id, request })
            })
            .collect()
    }

    fn prune(&mut self, client: ClientId) {
        if self.queues.get(&client).is_some_and(VecDeque::is_empty) {
            self.queues.remove(&client);
        }
    }
}
