//! A poll-driven client for asynchronous request/response network I/O.
//!
//! [`NetworkClient`] multiplexes pipelined requests over one connection per
//! broker. It is not thread-safe: exactly one driver thread calls
//! [`ready`](NetworkClient::ready), [`send`](NetworkClient::send),
//! [`poll`](NetworkClient::poll) and the close operations, and all state
//! mutation happens inside those calls. The only cross-thread entry point
//! is [`wakeup`](NetworkClient::wakeup), which merely unblocks a poll in
//! progress.
//!
//! The event-processing order inside `poll` is part of the contract:
//! completed sends, then completed receives, then disconnections, then new
//! connections, then request timeouts, then user callbacks.

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::cluster::{BrokerId, Node};
use crate::config::ClientConfig;
use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    messages::{ReadVersionedType, RequestHeader, ResponseHeader},
    primitives::{Int16, Int32, NullableString},
};

mod conn;
mod inflight;
pub mod request;
pub mod selector;
pub mod updater;

pub use conn::ConnectionState;
pub use request::{ClientRequest, ClientResponse, ResponseCallback};
pub use selector::{NetworkReceive, NetworkSend, Selectable, SelectorEvents, TcpSelector, Wakeup};
pub use updater::{DefaultMetadataUpdater, ManualMetadataUpdater, MetadataHolder, MetadataUpdater};

use conn::ClusterConnectionStates;
use inflight::InFlightRequests;

#[derive(Error, Debug)]
pub enum Error {
    /// Programming error: the node has no connectable identity.
    #[error("Cannot connect to empty node {0}")]
    EmptyNode(Node),

    /// Programming error: `send` without a positive `ready`.
    #[error("Attempt to send a request to node {0} which is not ready")]
    NodeNotReady(BrokerId),

    /// Protocol corruption: responses arrived out of order or for nothing
    /// we sent. The session must be torn down.
    #[error(
        "Correlation id for response ({response}) does not match request ({request}) on node {node}"
    )]
    CorrelationMismatch {
        node: BrokerId,
        request: i32,
        response: i32,
    },

    /// Protocol corruption: a response arrived with nothing in flight.
    #[error("Response from node {0} with no matching in-flight request")]
    UnexpectedResponse(BrokerId),

    /// Protocol corruption: the response header did not parse.
    #[error("Malformed response header from node {node}")]
    MalformedResponseHeader { node: BrokerId },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wall-clock milliseconds, for drivers that do not inject their own clock.
pub fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_millis() as i64
}

/// The connection-facing half of the client, handed to the
/// [`MetadataUpdater`] so it can route its refresh traffic through the
/// same connections and pipelines as user requests.
pub struct ClientCore {
    selector: Box<dyn Selectable>,
    connection_states: ClusterConnectionStates,
    in_flight: InFlightRequests,
    config: ClientConfig,
    correlation: i32,
}

impl ClientCore {
    fn new(selector: Box<dyn Selectable>, config: ClientConfig) -> Self {
        Self {
            selector,
            connection_states: ClusterConnectionStates::new(config.reconnect_backoff_ms),
            in_flight: InFlightRequests::new(config.max_in_flight_requests_per_connection),
            config,
            correlation: 0,
        }
    }

    /// Connected, channel-ready, and with pipeline room.
    pub fn can_send_request(&self, node: BrokerId) -> bool {
        self.connection_states.is_connected(node)
            && self.selector.is_channel_ready(node)
            && self.in_flight.can_send_more(node)
    }

    /// Disconnected and out of the reconnect backoff window.
    pub fn can_connect(&self, node: BrokerId, now: i64) -> bool {
        self.connection_states.can_connect(node, now)
    }

    /// Header with the next correlation id (process-wide, wrapping).
    pub fn next_request_header(
        &mut self,
        api_key: ApiKey,
        api_version: ApiVersion,
    ) -> RequestHeader {
        let correlation_id = self.correlation;
        self.correlation = self.correlation.wrapping_add(1);
        RequestHeader {
            request_api_key: api_key,
            request_api_version: api_version,
            correlation_id: Int32(correlation_id),
            client_id: NullableString(self.config.client_id.clone()),
        }
    }

    /// Start a non-blocking connection attempt; false if it failed on the
    /// spot (the node enters backoff).
    pub fn initiate_connect(&mut self, node: &Node, now: i64) -> bool {
        debug!(node = %node, "initiating connection");
        self.connection_states.connecting(node.id, now);
        match self.selector.connect(
            node,
            self.config.socket_send_buffer_bytes,
            self.config.socket_receive_buffer_bytes,
        ) {
            Ok(()) => true,
            Err(e) => {
                self.connection_states.disconnected(node.id, now);
                debug!(node = %node, error = %e, "error initiating connection");
                false
            }
        }
    }

    /// Record the send time, queue into the node's pipeline, and hand the
    /// payload to the selector for writing.
    pub fn do_send(&mut self, mut request: ClientRequest, now: i64) {
        request.send_time_ms = now;
        let payload = std::mem::take(&mut request.payload);
        trace!(
            node = request.node_id,
            correlation_id = request.correlation_id,
            "queueing request"
        );
        self.selector.send(NetworkSend {
            node_id: request.node_id,
            correlation_id: request.correlation_id,
            payload,
        });
        self.in_flight.add(request);
    }

    /// The node with the fewest outstanding requests, preferring idle
    /// established connections, never picking a blacked-out node while an
    /// alternative exists.
    pub fn least_loaded(&self, nodes: &[Node], now: i64) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let offset = rand::thread_rng().gen_range(0..nodes.len());
        let mut best: Option<(usize, &Node)> = None;
        for i in 0..nodes.len() {
            let node = &nodes[(offset + i) % nodes.len()];
            let in_flight = self.in_flight.count(node.id);
            if in_flight == 0 && self.connection_states.is_connected(node.id) {
                // an idle established connection beats everything
                return Some(node.clone());
            }
            if !self.connection_states.is_blacked_out(node.id, now)
                && best.map_or(true, |(count, _)| in_flight < count)
            {
                best = Some((in_flight, node));
            }
        }
        best.map(|(_, node)| node.clone())
    }
}

/// The poll engine. See the module docs for the threading contract.
pub struct NetworkClient {
    core: ClientCore,
    updater: Box<dyn MetadataUpdater>,
    /// Synthetic responses produced by an explicit `close_node`, delivered
    /// by the next poll.
    deferred_responses: Vec<ClientResponse>,
}

impl NetworkClient {
    /// Build a client with its own metadata refresh over `bootstrap`.
    pub fn new(selector: Box<dyn Selectable>, bootstrap: Vec<Node>, config: ClientConfig) -> Self {
        let updater = Box::new(DefaultMetadataUpdater::new(bootstrap, &config));
        Self::with_updater(selector, updater, config)
    }

    /// Build a client with a caller-supplied metadata updater.
    pub fn with_updater(
        selector: Box<dyn Selectable>,
        updater: Box<dyn MetadataUpdater>,
        config: ClientConfig,
    ) -> Self {
        Self {
            core: ClientCore::new(selector, config),
            updater,
            deferred_responses: Vec::new(),
        }
    }

    /// Begin connecting to the node if needed; true if it is ready for a
    /// request right now.
    pub fn ready(&mut self, node: &Node, now: i64) -> Result<bool> {
        if node.is_empty() {
            return Err(Error::EmptyNode(node.clone()));
        }
        if self.is_ready(node, now) {
            return Ok(true);
        }
        if self.core.can_connect(node.id, now) && !self.core.initiate_connect(node, now) {
            // a failed attempt may mean our metadata is stale
            self.updater.request_update();
        }
        Ok(false)
    }

    /// True iff the node can take a request and no metadata refresh is
    /// due. A due refresh makes every node unready so the refresh gets
    /// head-of-line.
    pub fn is_ready(&self, node: &Node, now: i64) -> bool {
        !self.updater.is_update_due(now) && self.core.can_send_request(node.id)
    }

    /// Queue a request towards its node.
    ///
    /// The node must be ready; violating that is a programming error, not
    /// a transient condition.
    pub fn send(&mut self, request: ClientRequest, now: i64) -> Result<()> {
        if !self.core.can_send_request(request.node_id) {
            return Err(Error::NodeNotReady(request.node_id));
        }
        self.core.do_send(request, now);
        Ok(())
    }

    /// One I/O step: maybe refresh metadata, move bytes, and convert the
    /// observed events into responses, in the contractual order.
    pub fn poll(&mut self, timeout_ms: i64, now: i64) -> Result<Vec<ClientResponse>> {
        let metadata_timeout = self.updater.maybe_update(now, &mut self.core);

        let timeout = timeout_ms
            .min(metadata_timeout)
            .min(self.core.config.request_timeout_ms)
            .max(0);
        let events = self.core.selector.poll(timeout);

        let mut responses = std::mem::take(&mut self.deferred_responses);

        // (a) completed sends: retire fire-and-forget requests
        for (node, correlation_id) in events.completed_sends {
            if let Some(request) = self.core.in_flight.complete_send(node, correlation_id) {
                responses.push(ClientResponse::sent(request, now));
            }
        }

        // (b) completed receives: FIFO-match against the pipeline
        for receive in events.completed_receives {
            let request = self
                .core
                .in_flight
                .complete_next(receive.node_id)
                .ok_or(Error::UnexpectedResponse(receive.node_id))?;
            let body = parse_response(&request, receive)?;
            if !self
                .updater
                .maybe_handle_completed_receive(&request, now, &body)
            {
                responses.push(ClientResponse::received(request, now, body));
            }
        }

        // (c) disconnections, before (d) so a flap inside one tick reads
        // as disconnect-then-connect
        let had_disconnects = !events.disconnected.is_empty();
        for node in events.disconnected {
            debug!(node, "node disconnected");
            self.process_disconnection(&mut responses, node, now);
        }
        if had_disconnects {
            self.updater.request_update();
        }

        // (d) connections
        for node in events.connected {
            debug!(node, "completed connection");
            self.core.connection_states.connected(node);
        }

        // (e) request timeouts: cancel locally, close the transport
        let timed_out = self
            .core
            .in_flight
            .nodes_with_timed_out_requests(now, self.core.config.request_timeout_ms);
        for node in &timed_out {
            debug!(node, "disconnecting on request timeout");
            self.core.selector.close(*node);
            self.process_disconnection(&mut responses, *node, now);
        }
        if !timed_out.is_empty() {
            self.updater.request_update();
        }

        // user callbacks, outside all queue manipulation
        for response in &mut responses {
            if let Some(callback) = response.request.callback.take() {
                callback(response);
            }
        }

        Ok(responses)
    }

    /// The node with the fewest in-flight requests, or `None` when every
    /// candidate is blacked out.
    pub fn least_loaded_node(&self, now: i64) -> Option<Node> {
        let nodes = self.updater.fetch_nodes();
        self.core.least_loaded(&nodes, now)
    }

    pub fn in_flight_request_count(&self) -> usize {
        self.core.in_flight.total_count()
    }

    pub fn in_flight_request_count_for(&self, node: BrokerId) -> usize {
        self.core.in_flight.count(node)
    }

    /// Milliseconds before a connection attempt to this node makes sense.
    pub fn connection_delay(&self, node: &Node, now: i64) -> i64 {
        self.core.connection_states.connection_delay(node.id, now)
    }

    /// Header carrying the next correlation id.
    pub fn next_request_header(
        &mut self,
        api_key: ApiKey,
        api_version: ApiVersion,
    ) -> RequestHeader {
        self.core.next_request_header(api_key, api_version)
    }

    /// Interrupt a blocking `poll` from any thread.
    pub fn wakeup(&self) {
        self.core.selector.wakeup();
    }

    /// Close the connection to one node. Every queued request surfaces as
    /// a synthetic disconnect response from the next `poll` (internal
    /// metadata requests are swallowed).
    pub fn close_node(&mut self, node: BrokerId, now: i64) {
        self.core.selector.close(node);
        let mut responses = Vec::new();
        self.process_disconnection(&mut responses, node, now);
        self.deferred_responses.append(&mut responses);
        self.core.connection_states.remove(node);
    }

    /// Tear down every connection.
    pub fn close(&mut self) {
        self.core.selector.close_all();
    }

    /// Access to the metadata updater, e.g. to force a refresh.
    pub fn metadata_updater(&mut self) -> &mut dyn MetadataUpdater {
        self.updater.as_mut()
    }

    fn process_disconnection(
        &mut self,
        responses: &mut Vec<ClientResponse>,
        node: BrokerId,
        now: i64,
    ) {
        self.core.connection_states.disconnected(node, now);
        for request in self.core.in_flight.clear_all(node) {
            trace!(
                node,
                correlation_id = request.correlation_id,
                "cancelled request on disconnect"
            );
            if !self.updater.maybe_handle_disconnection(&request) {
                responses.push(ClientResponse::disconnected(request, now));
            }
        }
    }
}

/// Validate the response header against the in-flight request and return
/// the body bytes.
fn parse_response(request: &ClientRequest, receive: NetworkReceive) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(receive.payload);
    let header = ResponseHeader::read_versioned(&mut cursor, ApiVersion(Int16(0)))
        .map_err(|_| Error::MalformedResponseHeader {
            node: receive.node_id,
        })?;

    if header.correlation_id.0 != request.correlation_id {
        error!(
            node = receive.node_id,
            request = request.correlation_id,
            response = header.correlation_id.0,
            "correlation id mismatch"
        );
        return Err(Error::CorrelationMismatch {
            node: receive.node_id,
            request: request.correlation_id,
            response: header.correlation_id.0,
        });
    }

    let position = cursor.position() as usize;
    let mut payload = cursor.into_inner();
    payload.drain(..position);
    Ok(payload)
}
