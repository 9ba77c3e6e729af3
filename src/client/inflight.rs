//! Bounded FIFO queues of requests awaiting completion, one per node.

use std::collections::{HashMap, VecDeque};

use crate::cluster::BrokerId;

use super::request::ClientRequest;

#[derive(Debug)]
struct InFlightEntry {
    request: ClientRequest,
    /// True once the selector reports the request's bytes fully written.
    send_completed: bool,
}

/// The set of requests sent or being sent and not yet acknowledged.
#[derive(Debug)]
pub(crate) struct InFlightRequests {
    max_per_connection: usize,
    requests: HashMap<BrokerId, VecDeque<InFlightEntry>>,
}

impl InFlightRequests {
    pub(crate) fn new(max_per_connection: usize) -> Self {
        Self {
            max_per_connection,
            requests: HashMap::new(),
        }
    }

    /// Queue a request. The caller must have checked [`Self::can_send_more`].
    pub(crate) fn add(&mut self, request: ClientRequest) {
        self.requests
            .entry(request.node_id)
            .or_default()
            .push_back(InFlightEntry {
                request,
                send_completed: false,
            });
    }

    /// Whether another request may be queued to this node: the newest
    /// request must have left the send buffer and the pipeline must have
    /// room.
    pub(crate) fn can_send_more(&self, node: BrokerId) -> bool {
        match self.requests.get(&node) {
            None => true,
            Some(queue) => match queue.back() {
                None => true,
                Some(newest) => newest.send_completed && queue.len() < self.max_per_connection,
            },
        }
    }

    /// Record that the request's bytes are fully on the wire.
    ///
    /// Returns the request if it does not expect a response: it is complete
    /// now and leaves the queue.
    pub(crate) fn complete_send(
        &mut self,
        node: BrokerId,
        correlation_id: i32,
    ) -> Option<ClientRequest> {
        let queue = self.requests.get_mut(&node)?;
        let idx = queue
            .iter()
            .position(|e| e.request.correlation_id == correlation_id)?;
        queue[idx].send_completed = true;
        if !queue[idx].request.expects_response {
            return queue.remove(idx).map(|e| e.request);
        }
        None
    }

    /// Pop the oldest in-flight request of this node (FIFO completion).
    pub(crate) fn complete_next(&mut self, node: BrokerId) -> Option<ClientRequest> {
        self.requests
            .get_mut(&node)?
            .pop_front()
            .map(|e| e.request)
    }

    pub(crate) fn count(&self, node: BrokerId) -> usize {
        self.requests.get(&node).map_or(0, VecDeque::len)
    }

    pub(crate) fn total_count(&self) -> usize {
        self.requests.values().map(VecDeque::len).sum()
    }

    /// Drain everything queued for the node, oldest first.
    pub(crate) fn clear_all(&mut self, node: BrokerId) -> Vec<ClientRequest> {
        self.requests
            .remove(&node)
            .map(|queue| queue.into_iter().map(|e| e.request).collect())
            .unwrap_or_default()
    }

    /// Nodes whose oldest in-flight request has been outstanding longer
    /// than `timeout_ms`.
    pub(crate) fn nodes_with_timed_out_requests(
        &self,
        now: i64,
        timeout_ms: i64,
    ) -> Vec<BrokerId> {
        self.requests
            .iter()
            .filter_map(|(node, queue)| {
                let oldest = queue.front()?;
                (now - oldest.request.send_time_ms > timeout_ms).then_some(*node)
            })
            .collect()
    }
}
