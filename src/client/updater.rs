//! Cluster-metadata refresh coordination.
//!
//! The updater and the poll engine collaborate through a small mutual
//! interface: the engine asks [`MetadataUpdater::maybe_update`] on every
//! poll and routes internal metadata traffic back through
//! [`MetadataUpdater::maybe_handle_completed_receive`] /
//! [`MetadataUpdater::maybe_handle_disconnection`]; the updater reaches
//! into the engine through the [`ClientCore`] it is handed.

use std::io::Cursor;

use tracing::{debug, warn};

use crate::cluster::{Cluster, Node};
use crate::config::ClientConfig;
use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    messages::{MetadataRequest, ReadVersionedType, RequestBody},
    primitives::Int16,
};

use super::request::ClientRequest;
use super::ClientCore;

/// Metadata body version the refresh path speaks.
const METADATA_VERSION: ApiVersion = ApiVersion(Int16(1));

/// Decides when and how cluster metadata is refreshed.
pub trait MetadataUpdater {
    /// Snapshot of the currently known nodes.
    fn fetch_nodes(&self) -> Vec<Node>;

    /// True iff no refresh is in flight and the next-update deadline has
    /// been reached. While this holds, user sends are suppressed so the
    /// refresh gets head-of-line.
    fn is_update_due(&self, now: i64) -> bool;

    /// Kick off a refresh if one is due and a node can take it; returns
    /// the number of milliseconds until the next refresh may be attempted
    /// (effectively infinite while one is outstanding).
    fn maybe_update(&mut self, now: i64, core: &mut ClientCore) -> i64;

    /// Intercept the loss of an internal metadata request. Returns true if
    /// `request` was one (the engine then swallows it).
    fn maybe_handle_disconnection(&mut self, request: &ClientRequest) -> bool;

    /// Intercept the response to an internal metadata request. Returns
    /// true if `request` was one (the engine then swallows it).
    fn maybe_handle_completed_receive(
        &mut self,
        request: &ClientRequest,
        now: i64,
        body: &[u8],
    ) -> bool;

    /// Mark the current metadata stale; the next poll schedules a refresh.
    fn request_update(&mut self);
}

/// The mutable cluster-metadata entity with its refresh bookkeeping.
pub struct MetadataHolder {
    cluster: Cluster,
    metadata_expire_ms: i64,
    refresh_backoff_ms: i64,
    last_refresh_ms: i64,
    last_successful_refresh_ms: i64,
    need_update: bool,
    version: i64,
    listeners: Vec<Box<dyn Fn(&Cluster)>>,
}

impl std::fmt::Debug for MetadataHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataHolder")
            .field("cluster", &self.cluster)
            .field("need_update", &self.need_update)
            .field("last_refresh_ms", &self.last_refresh_ms)
            .field(
                "last_successful_refresh_ms",
                &self.last_successful_refresh_ms,
            )
            .field("version", &self.version)
            .finish()
    }
}

impl MetadataHolder {
    /// Seed from bootstrap nodes. The first refresh is due immediately.
    pub fn new(bootstrap: Vec<Node>, metadata_expire_ms: i64, refresh_backoff_ms: i64) -> Self {
        Self {
            cluster: Cluster::bootstrap(bootstrap),
            metadata_expire_ms,
            refresh_backoff_ms,
            last_refresh_ms: -refresh_backoff_ms,
            last_successful_refresh_ms: -metadata_expire_ms,
            need_update: true,
            version: 0,
            listeners: Vec::new(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Bumped on every snapshot replacement.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn refresh_backoff_ms(&self) -> i64 {
        self.refresh_backoff_ms
    }

    /// Milliseconds until a refresh is both needed and allowed: stale data
    /// (or an explicit invalidation) makes it needed, the refresh backoff
    /// gates how soon it is allowed.
    pub fn time_to_next_update(&self, now: i64) -> i64 {
        let time_to_expire = if self.need_update {
            0
        } else {
            (self.last_successful_refresh_ms + self.metadata_expire_ms - now).max(0)
        };
        let time_to_allow_update = (self.last_refresh_ms + self.refresh_backoff_ms - now).max(0);
        time_to_expire.max(time_to_allow_update)
    }

    /// Replace the snapshot and notify listeners.
    pub fn update(&mut self, cluster: Cluster, now: i64) {
        self.need_update = false;
        self.last_refresh_ms = now;
        self.last_successful_refresh_ms = now;
        self.version += 1;
        for listener in &self.listeners {
            listener(&cluster);
        }
        self.cluster = cluster;
    }

    /// Record an unusable refresh; the next attempt obeys the backoff.
    pub fn failed_update(&mut self, now: i64) {
        self.last_refresh_ms = now;
    }

    pub fn request_update(&mut self) {
        self.need_update = true;
    }

    pub fn on_update(&mut self, listener: Box<dyn Fn(&Cluster)>) {
        self.listeners.push(listener);
    }
}

/// Stock updater: owns the metadata and refreshes it through the engine's
/// own connections.
pub struct DefaultMetadataUpdater {
    metadata: MetadataHolder,
    fetch_in_progress: bool,
    last_no_node_available_ms: i64,
}

impl DefaultMetadataUpdater {
    pub fn new(bootstrap: Vec<Node>, config: &ClientConfig) -> Self {
        let backoff = config.metadata_refresh_backoff_ms;
        Self {
            metadata: MetadataHolder::new(bootstrap, config.metadata_max_age_ms, backoff),
            fetch_in_progress: false,
            last_no_node_available_ms: -backoff,
        }
    }

    pub fn metadata(&self) -> &MetadataHolder {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataHolder {
        &mut self.metadata
    }

    fn is_internal_metadata(request: &ClientRequest) -> bool {
        request.internal && request.api_key == ApiKey::Metadata
    }

    /// `max(t_due, t_backoff, t_in_flight)` per the refresh contract.
    fn refresh_delay(&self, now: i64) -> i64 {
        let time_to_next = self.metadata.time_to_next_update(now);
        let time_to_backoff =
            (self.last_no_node_available_ms + self.metadata.refresh_backoff_ms - now).max(0);
        let wait_for_fetch = if self.fetch_in_progress { i64::MAX } else { 0 };
        time_to_next.max(time_to_backoff).max(wait_for_fetch)
    }

    fn maybe_send(&mut self, now: i64, core: &mut ClientCore, node: &Node) {
        if core.can_send_request(node.id) {
            debug!(node = node.id, "sending metadata refresh request");
            self.fetch_in_progress = true;
            let header = core.next_request_header(ApiKey::Metadata, METADATA_VERSION);
            let request = ClientRequest::new(
                node.id,
                header,
                &MetadataRequest { topics: None },
                true,
                now,
                None,
            )
            .expect("metadata request serializes into memory")
            .internal();
            core.do_send(request, now);
        } else if core.can_connect(node.id, now) {
            debug!(node = node.id, "initiating connection for metadata refresh");
            if !core.initiate_connect(node, now) {
                self.metadata.request_update();
            }
        } else {
            // connected but at capacity, or still connecting: wait for a
            // network event
            self.last_no_node_available_ms = now;
        }
    }

    fn handle_response(&mut self, request: &ClientRequest, now: i64, body: &[u8]) {
        type ResponseBody = <MetadataRequest as RequestBody>::ResponseBody;

        let mut cursor = Cursor::new(body);
        match ResponseBody::read_versioned(&mut cursor, request.api_version) {
            Ok(response) => {
                for topic in &response.topics {
                    if let Some(error) = topic.error {
                        warn!(
                            topic = %topic.name.0,
                            %error,
                            correlation_id = request.correlation_id,
                            "error while fetching topic metadata"
                        );
                    }
                }
                let cluster = Cluster::from_metadata(&response);
                if cluster.nodes().is_empty() {
                    // a topic still being created yields no usable nodes;
                    // keep the previous snapshot
                    debug!(
                        correlation_id = request.correlation_id,
                        "ignoring metadata response with no nodes"
                    );
                    self.metadata.failed_update(now);
                } else {
                    self.metadata.update(cluster, now);
                }
            }
            Err(e) => {
                warn!(error = %e, "discarding unparseable metadata response");
                self.metadata.failed_update(now);
            }
        }
    }
}

impl MetadataUpdater for DefaultMetadataUpdater {
    fn fetch_nodes(&self) -> Vec<Node> {
        self.metadata.cluster().nodes().to_vec()
    }

    fn is_update_due(&self, now: i64) -> bool {
        !self.fetch_in_progress && self.metadata.time_to_next_update(now) == 0
    }

    fn maybe_update(&mut self, now: i64, core: &mut ClientCore) -> i64 {
        if self.refresh_delay(now) == 0 {
            let nodes = self.fetch_nodes();
            match core.least_loaded(&nodes, now) {
                Some(node) => self.maybe_send(now, core, &node),
                None => {
                    debug!("no node available for metadata refresh, backing off");
                    self.last_no_node_available_ms = now;
                }
            }
        }

        // recomputed so the caller sees the delay produced by whatever was
        // just attempted (infinite while the refresh is in flight)
        self.refresh_delay(now)
    }

    fn maybe_handle_disconnection(&mut self, request: &ClientRequest) -> bool {
        if !Self::is_internal_metadata(request) {
            return false;
        }
        if self.metadata.cluster().is_bootstrap() {
            if let Some(node) = self.metadata.cluster().node_by_id(request.node_id) {
                warn!(%node, "bootstrap broker disconnected");
            }
        }
        self.fetch_in_progress = false;
        true
    }

    fn maybe_handle_completed_receive(
        &mut self,
        request: &ClientRequest,
        now: i64,
        body: &[u8],
    ) -> bool {
        if !Self::is_internal_metadata(request) {
            return false;
        }
        self.fetch_in_progress = false;
        self.handle_response(request, now, body);
        true
    }

    fn request_update(&mut self) {
        self.metadata.request_update();
    }
}

/// Updater for callers that maintain cluster metadata out of band: the
/// node list is fixed and the engine never refreshes anything on its own.
#[derive(Debug)]
pub struct ManualMetadataUpdater {
    nodes: Vec<Node>,
}

impl ManualMetadataUpdater {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn set_nodes(&mut self, nodes: Vec<Node>) {
        self.nodes = nodes;
    }
}

impl MetadataUpdater for ManualMetadataUpdater {
    fn fetch_nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    fn is_update_due(&self, _now: i64) -> bool {
        false
    }

    fn maybe_update(&mut self, _now: i64, _core: &mut ClientCore) -> i64 {
        i64::MAX
    }

    fn maybe_handle_disconnection(&mut self, _request: &ClientRequest) -> bool {
        false
    }

    fn maybe_handle_completed_receive(
        &mut self,
        _request: &ClientRequest,
        _now: i64,
        _body: &[u8],
    ) -> bool {
        false
    }

    fn request_update(&mut self) {}
}
