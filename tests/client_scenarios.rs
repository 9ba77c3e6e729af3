//! End-to-end scenarios of the poll engine against a scripted selector.

mod common;

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::Cursor;
use std::rc::Rc;

use assert_matches::assert_matches;

use rsbroker::client::{
    ClientRequest, ClientResponse, Error, ManualMetadataUpdater, NetworkClient, NetworkReceive,
    NetworkSend, Selectable, SelectorEvents,
};
use rsbroker::cluster::{BrokerId, Node};
use rsbroker::config::ClientConfig;
use rsbroker::protocol::api_key::ApiKey;
use rsbroker::protocol::api_version::ApiVersion;
use rsbroker::protocol::messages::{
    MetadataResponse, MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
    WriteVersionedType,
};
use rsbroker::protocol::primitives::{Array, Boolean, Int16, Int32, NullableString, String_};

use common::{response_bytes, RawBody};

#[derive(Default)]
struct MockState {
    connect_calls: Vec<BrokerId>,
    closed: Vec<BrokerId>,
    sends: Vec<(BrokerId, i32, Vec<u8>)>,
    ready_channels: HashSet<BrokerId>,
    staged: SelectorEvents,
}

impl MockState {
    fn stage_connected(&mut self, node: BrokerId) {
        self.ready_channels.insert(node);
        self.staged.connected.push(node);
    }

    fn stage_disconnected(&mut self, node: BrokerId) {
        self.ready_channels.remove(&node);
        self.staged.disconnected.push(node);
    }

    fn stage_send_completed(&mut self, node: BrokerId, correlation_id: i32) {
        self.staged.completed_sends.push((node, correlation_id));
    }

    fn stage_receive(&mut self, node: BrokerId, payload: Vec<u8>) {
        self.staged.completed_receives.push(NetworkReceive {
            node_id: node,
            payload,
        });
    }
}

/// Scripted [`Selectable`]: the test stages events, `poll` hands them out.
struct MockSelector(Rc<RefCell<MockState>>);

impl Selectable for MockSelector {
    fn connect(
        &mut self,
        node: &Node,
        _send_buffer_bytes: usize,
        _receive_buffer_bytes: usize,
    ) -> std::io::Result<()> {
        self.0.borrow_mut().connect_calls.push(node.id);
        Ok(())
    }

    fn send(&mut self, send: NetworkSend) {
        self.0
            .borrow_mut()
            .sends
            .push((send.node_id, send.correlation_id, send.payload));
    }

    fn poll(&mut self, _timeout_ms: i64) -> SelectorEvents {
        std::mem::take(&mut self.0.borrow_mut().staged)
    }

    fn is_channel_ready(&self, node: BrokerId) -> bool {
        self.0.borrow().ready_channels.contains(&node)
    }

    fn close(&mut self, node: BrokerId) {
        let mut state = self.0.borrow_mut();
        state.ready_channels.remove(&node);
        state.closed.push(node);
    }

    fn close_all(&mut self) {
        self.0.borrow_mut().ready_channels.clear();
    }

    fn wakeup(&self) {}
}

fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 100,
        reconnect_backoff_ms: 50,
        metadata_refresh_backoff_ms: 100,
        ..ClientConfig::default()
    }
}

fn node(id: BrokerId) -> Node {
    Node::new(id, format!("broker-{}", id), 9092)
}

/// Client over a scripted selector with a fixed node list.
fn manual_client(nodes: Vec<Node>) -> (NetworkClient, Rc<RefCell<MockState>>) {
    let state = Rc::new(RefCell::new(MockState::default()));
    let selector = MockSelector(Rc::clone(&state));
    let updater = Box::new(ManualMetadataUpdater::new(nodes));
    let client = NetworkClient::with_updater(Box::new(selector), updater, test_config());
    (client, state)
}

/// Drive `ready` + a connection completion so `node` accepts requests.
fn connect(client: &mut NetworkClient, state: &Rc<RefCell<MockState>>, n: &Node, now: i64) {
    assert!(!client.ready(n, now).unwrap());
    state.borrow_mut().stage_connected(n.id);
    client.poll(0, now).unwrap();
    assert!(client.ready(n, now).unwrap());
}

fn user_request(
    client: &mut NetworkClient,
    n: &Node,
    body: &[u8],
    expects_response: bool,
    now: i64,
) -> ClientRequest {
    let header = client.next_request_header(ApiKey::Produce, ApiVersion(Int16(0)));
    ClientRequest::new(
        n.id,
        header,
        &RawBody(body.to_vec()),
        expects_response,
        now,
        None,
    )
    .unwrap()
}

#[test]
fn test_bootstrap_connect_then_ready() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone(), node(2)]);

    // not connected yet: ready is false but kicks off a connect
    assert!(!client.ready(&a, 0).unwrap());
    assert_eq!(state.borrow().connect_calls, vec![1]);
    assert_eq!(client.connection_delay(&a, 0), i64::MAX);

    // connection completes on a later poll
    state.borrow_mut().stage_connected(1);
    let responses = client.poll(10, 1).unwrap();
    assert!(responses.is_empty());
    assert!(client.ready(&a, 1).unwrap());
    assert!(client.is_ready(&a, 1));
}

#[test]
fn test_empty_node_is_rejected() {
    let (mut client, _state) = manual_client(vec![]);
    let err = client.ready(&Node::new(1, "", 9092), 0).unwrap_err();
    assert_matches!(err, Error::EmptyNode(_));
}

#[test]
fn test_request_gets_matching_response() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let request = user_request(&mut client, &a, b"ping", true, 1);
    let correlation_id = request.correlation_id;
    client.send(request, 1).unwrap();
    assert_eq!(client.in_flight_request_count_for(1), 1);

    let mut mock = state.borrow_mut();
    mock.stage_send_completed(1, correlation_id);
    mock.stage_receive(1, response_bytes(correlation_id, b"pong"));
    drop(mock);

    let responses = client.poll(10, 2).unwrap();
    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.request.correlation_id, correlation_id);
    assert!(!response.disconnected);
    assert_eq!(response.body.as_deref(), Some(&b"pong"[..]));
    assert_eq!(client.in_flight_request_count(), 0);
}

#[test]
fn test_callback_runs_inside_poll() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let seen: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));
    let seen_captured = Rc::clone(&seen);
    let header = client.next_request_header(ApiKey::Produce, ApiVersion(Int16(0)));
    let request = ClientRequest::new(
        a.id,
        header,
        &RawBody(b"ping".to_vec()),
        true,
        1,
        Some(Box::new(move |response: &ClientResponse| {
            *seen_captured.borrow_mut() = Some(response.request.correlation_id);
        })),
    )
    .unwrap();
    let correlation_id = request.correlation_id;
    client.send(request, 1).unwrap();

    state
        .borrow_mut()
        .stage_receive(1, response_bytes(correlation_id, b"pong"));
    client.poll(10, 2).unwrap();
    assert_eq!(*seen.borrow(), Some(correlation_id));
}

#[test]
fn test_no_response_request_completes_on_send() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let request = user_request(&mut client, &a, b"fire", false, 1);
    let correlation_id = request.correlation_id;
    client.send(request, 1).unwrap();

    state.borrow_mut().stage_send_completed(1, correlation_id);
    let responses = client.poll(10, 2).unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].body.is_none());
    assert!(!responses[0].disconnected);
    assert_eq!(client.in_flight_request_count_for(1), 0);
}

#[test]
fn test_pipeline_is_bounded_until_send_completes() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let r1 = user_request(&mut client, &a, b"one", true, 1);
    let c1 = r1.correlation_id;
    client.send(r1, 1).unwrap();

    // the newest request's bytes are still in the send buffer
    assert!(!client.is_ready(&a, 1));
    let r2 = user_request(&mut client, &a, b"two", true, 1);
    let err = client.send(r2, 1).unwrap_err();
    assert_matches!(err, Error::NodeNotReady(1));

    state.borrow_mut().stage_send_completed(1, c1);
    client.poll(10, 2).unwrap();
    assert!(client.is_ready(&a, 2));

    let r2 = user_request(&mut client, &a, b"two", true, 2);
    client.send(r2, 2).unwrap();
    assert_eq!(client.in_flight_request_count_for(1), 2);
}

#[test]
fn test_disconnect_drains_every_in_flight_request_once() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let mut correlation_ids = Vec::new();
    for body in [&b"one"[..], &b"two"[..]] {
        let request = user_request(&mut client, &a, body, true, 1);
        correlation_ids.push(request.correlation_id);
        let correlation_id = request.correlation_id;
        client.send(request, 1).unwrap();
        state.borrow_mut().stage_send_completed(1, correlation_id);
        client.poll(0, 1).unwrap();
    }
    assert_eq!(client.in_flight_request_count_for(1), 2);

    state.borrow_mut().stage_disconnected(1);
    let responses = client.poll(10, 2).unwrap();
    assert_eq!(responses.len(), 2);
    for (response, correlation_id) in responses.iter().zip(&correlation_ids) {
        assert!(response.disconnected);
        assert_eq!(response.request.correlation_id, *correlation_id);
    }
    assert_eq!(client.in_flight_request_count(), 0);

    // within the reconnect backoff the node is blacked out
    assert!(!client.ready(&a, 2).unwrap());
    assert_eq!(state.borrow().connect_calls.len(), 1);
    // after it expires a new attempt goes out
    assert!(!client.ready(&a, 60).unwrap());
    assert_eq!(state.borrow().connect_calls.len(), 2);
}

#[test]
fn test_request_timeout_closes_connection() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let request = user_request(&mut client, &a, b"slow", true, 0);
    client.send(request, 0).unwrap();
    state.borrow_mut().stage_send_completed(1, 0);
    client.poll(0, 1).unwrap();

    // no network activity until past the 100ms request timeout
    let responses = client.poll(10, 150).unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].disconnected);
    assert_eq!(state.borrow().closed, vec![1]);
    assert!(!client.is_ready(&a, 150));
}

#[test]
fn test_correlation_mismatch_is_illegal_state() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let request = user_request(&mut client, &a, b"ping", true, 1);
    let correlation_id = request.correlation_id;
    client.send(request, 1).unwrap();

    state
        .borrow_mut()
        .stage_receive(1, response_bytes(correlation_id + 7, b"pong"));
    let err = client.poll(10, 2).unwrap_err();
    assert_matches!(
        err,
        Error::CorrelationMismatch {
            node: 1,
            response, ..
        } if response == correlation_id + 7
    );
}

#[test]
fn test_fifo_correlation_across_pipeline() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let mut correlation_ids = Vec::new();
    for body in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let request = user_request(&mut client, &a, body, true, 1);
        correlation_ids.push(request.correlation_id);
        let correlation_id = request.correlation_id;
        client.send(request, 1).unwrap();
        state.borrow_mut().stage_send_completed(1, correlation_id);
        client.poll(0, 1).unwrap();
    }

    // responses arrive in wire order and match the pipeline head by head
    {
        let mut mock = state.borrow_mut();
        for correlation_id in &correlation_ids {
            mock.stage_receive(1, response_bytes(*correlation_id, b"ok"));
        }
    }
    let responses = client.poll(10, 2).unwrap();
    assert_eq!(
        responses
            .iter()
            .map(|r| r.request.correlation_id)
            .collect::<Vec<_>>(),
        correlation_ids
    );
}

#[test]
fn test_close_node_surfaces_deferred_disconnects() {
    let a = node(1);
    let (mut client, state) = manual_client(vec![a.clone()]);
    connect(&mut client, &state, &a, 0);

    let request = user_request(&mut client, &a, b"ping", true, 1);
    client.send(request, 1).unwrap();

    client.close_node(1, 2);
    assert_eq!(state.borrow().closed, vec![1]);
    // the cancelled request surfaces from the next poll
    let responses = client.poll(0, 3).unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].disconnected);

    // close_node forgets backoff state entirely
    assert!(!client.ready(&a, 3).unwrap());
    assert_eq!(state.borrow().connect_calls.len(), 2);
}

#[test]
fn test_least_loaded_node_selection() {
    let nodes = vec![node(1), node(2), node(3)];
    let (mut client, state) = manual_client(nodes.clone());

    connect(&mut client, &state, &nodes[0], 0);
    connect(&mut client, &state, &nodes[1], 0);

    let request = user_request(&mut client, &nodes[0], b"busy", true, 1);
    client.send(request, 1).unwrap();

    // node 2 is connected and idle: it wins over busy node 1 and
    // unconnected node 3
    assert_eq!(client.least_loaded_node(1).unwrap().id, 2);

    // make node 2 busy too; node 3 (no connection, zero in-flight) wins
    let request = user_request(&mut client, &nodes[1], b"busy", true, 1);
    client.send(request, 1).unwrap();
    assert_eq!(client.least_loaded_node(1).unwrap().id, 3);

    // black out node 3: one of the busy-but-alive nodes is picked instead
    state.borrow_mut().stage_disconnected(3);
    client.ready(&nodes[2], 1).unwrap();
    client.poll(0, 1).unwrap();
    let chosen = client.least_loaded_node(2).unwrap();
    assert_ne!(chosen.id, 3);

    // black out everything: nothing to return
    state.borrow_mut().stage_disconnected(1);
    state.borrow_mut().stage_disconnected(2);
    client.poll(0, 3).unwrap();
    assert_eq!(client.least_loaded_node(4), None);
}

fn metadata_response_bytes(correlation_id: i32) -> Vec<u8> {
    let response = MetadataResponse {
        brokers: vec![
            MetadataResponseBroker {
                node_id: Int32(1),
                host: String_("broker-1".to_string()),
                port: Int32(9092),
                rack: Some(NullableString(None)),
            },
            MetadataResponseBroker {
                node_id: Int32(2),
                host: String_("broker-2".to_string()),
                port: Int32(9092),
                rack: Some(NullableString(None)),
            },
        ],
        controller_id: Some(Int32(1)),
        topics: vec![MetadataResponseTopic {
            error: None,
            name: String_("events".to_string()),
            is_internal: Some(Boolean(false)),
            partitions: vec![MetadataResponsePartition {
                error: None,
                partition_index: Int32(0),
                leader_id: Int32(1),
                replica_nodes: Array(Some(vec![Int32(1), Int32(2)])),
                isr_nodes: Array(Some(vec![Int32(1), Int32(2)])),
            }],
        }],
    };

    let mut cursor = Cursor::new(Vec::new());
    response
        .write_versioned(&mut cursor, ApiVersion(Int16(1)))
        .unwrap();
    response_bytes(correlation_id, &cursor.into_inner())
}

/// Client with the stock metadata updater over bootstrap nodes.
fn bootstrap_client(bootstrap: Vec<Node>) -> (NetworkClient, Rc<RefCell<MockState>>) {
    let state = Rc::new(RefCell::new(MockState::default()));
    let selector = MockSelector(Rc::clone(&state));
    let client = NetworkClient::new(Box::new(selector), bootstrap, test_config());
    (client, state)
}

#[test]
fn test_metadata_refresh_has_priority_then_completes() {
    let a = node(1);
    let (mut client, state) = bootstrap_client(vec![a.clone(), node(2)]);

    // refresh is due from the start, so every node reads unready even
    // before any connection exists
    assert!(!client.is_ready(&a, 0));

    // first poll initiates a connection towards some bootstrap node
    client.poll(10, 0).unwrap();
    let target = {
        let mock = state.borrow();
        assert_eq!(mock.connect_calls.len(), 1);
        mock.connect_calls[0]
    };

    // the connection completes; the refresh itself waits out the backoff
    // recorded while the node was still connecting
    state.borrow_mut().stage_connected(target);
    client.poll(10, 1).unwrap();
    assert!(state.borrow().sends.is_empty());

    client.poll(10, 150).unwrap();
    let (send_node, correlation_id) = {
        let mock = state.borrow();
        assert_eq!(mock.sends.len(), 1);
        (mock.sends[0].0, mock.sends[0].1)
    };
    assert_eq!(send_node, target);

    // the response is intercepted: nothing reaches the caller, but the
    // snapshot is replaced and nodes become ready
    state
        .borrow_mut()
        .stage_receive(target, metadata_response_bytes(correlation_id));
    let responses = client.poll(10, 151).unwrap();
    assert!(responses.is_empty());
    assert!(client.is_ready(&node(target), 151));
    let least_loaded = client.least_loaded_node(151).unwrap();
    assert!(least_loaded.host.starts_with("broker-"));
}

#[test]
fn test_request_timeout_marks_metadata_dirty() {
    let a = node(1);
    let (mut client, state) = bootstrap_client(vec![a.clone()]);

    client.poll(10, 0).unwrap();
    state.borrow_mut().stage_connected(1);
    client.poll(10, 1).unwrap();
    client.poll(10, 150).unwrap();
    let correlation_id = state.borrow().sends[0].1;
    state
        .borrow_mut()
        .stage_receive(1, metadata_response_bytes(correlation_id));
    client.poll(10, 151).unwrap();
    assert!(client.is_ready(&a, 151));

    // a user request that times out closes the node and invalidates the
    // metadata snapshot
    let request = user_request(&mut client, &a, b"slow", true, 152);
    client.send(request, 152).unwrap();
    let responses = client.poll(10, 300).unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].disconnected);
    assert!(!client.is_ready(&a, 300));
}

#[test]
fn test_refresh_with_no_nodes_backs_off() {
    let (mut client, state) = bootstrap_client(vec![]);

    // an update is due but no node exists to serve it; nothing is sent
    // and nothing connects, the engine just waits out the backoff
    client.poll(10, 0).unwrap();
    assert!(state.borrow().sends.is_empty());
    assert!(state.borrow().connect_calls.is_empty());

    client.poll(10, 1).unwrap();
    assert!(state.borrow().sends.is_empty());
}

#[test]
fn test_internal_metadata_request_swallowed_on_disconnect() {
    let a = node(1);
    let (mut client, state) = bootstrap_client(vec![a.clone()]);

    client.poll(10, 0).unwrap();
    state.borrow_mut().stage_connected(1);
    client.poll(10, 1).unwrap();
    client.poll(10, 150).unwrap();
    assert_eq!(state.borrow().sends.len(), 1);

    // the broker drops the connection with the refresh in flight: the
    // internal request must not surface as a user response
    state.borrow_mut().stage_disconnected(1);
    let responses = client.poll(10, 151).unwrap();
    assert!(responses.is_empty());

    // and the refresh is re-attempted once the reconnect backoff allows
    client.poll(10, 300).unwrap();
    assert_eq!(state.borrow().connect_calls.len(), 2);
}
