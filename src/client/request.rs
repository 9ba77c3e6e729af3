//! Requests and responses as the poll engine sees them.

use std::io::Cursor;

use crate::cluster::BrokerId;
use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    messages::{RequestHeader, WriteVersionedError, WriteVersionedType},
    primitives::Int16,
};

/// Version of the request header put on the wire (carries the client id).
pub const REQUEST_HEADER_VERSION: ApiVersion = ApiVersion(Int16(1));

/// Invoked from inside `poll` once the matching response (real or
/// synthetic) is known.
pub type ResponseCallback = Box<dyn FnOnce(&ClientResponse)>;

/// One request queued towards a broker.
///
/// The payload is the fully serialized header + body, without the length
/// prefix; the engine never interprets it again after send.
pub struct ClientRequest {
    pub node_id: BrokerId,
    pub api_key: ApiKey,
    pub api_version: ApiVersion,
    pub correlation_id: i32,

    /// False for fire-and-forget requests (e.g. produce with acks=0): the
    /// request is retired as soon as its bytes hit the wire.
    pub expects_response: bool,

    /// True when the engine itself initiated the request (metadata
    /// refresh); such requests never reach user callbacks.
    pub internal: bool,

    pub created_ms: i64,

    /// Set when the request is handed to the selector.
    pub send_time_ms: i64,

    pub payload: Vec<u8>,

    pub callback: Option<ResponseCallback>,
}

impl ClientRequest {
    /// Serialize `header` + `body` into a sendable request.
    pub fn new<B>(
        node_id: BrokerId,
        header: RequestHeader,
        body: &B,
        expects_response: bool,
        created_ms: i64,
        callback: Option<ResponseCallback>,
    ) -> Result<Self, WriteVersionedError>
    where
        B: WriteVersionedType<Cursor<Vec<u8>>>,
    {
        let mut buf = Cursor::new(Vec::new());
        header.write_versioned(&mut buf, REQUEST_HEADER_VERSION)?;
        body.write_versioned(&mut buf, header.request_api_version)?;

        Ok(Self {
            node_id,
            api_key: header.request_api_key,
            api_version: header.request_api_version,
            correlation_id: header.correlation_id.0,
            expects_response,
            internal: false,
            created_ms,
            send_time_ms: -1,
            payload: buf.into_inner(),
            callback,
        })
    }

    pub(crate) fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("node_id", &self.node_id)
            .field("api_key", &self.api_key)
            .field("correlation_id", &self.correlation_id)
            .field("expects_response", &self.expects_response)
            .field("internal", &self.internal)
            .field("send_time_ms", &self.send_time_ms)
            .field("payload_len", &self.payload.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Completion of one [`ClientRequest`].
///
/// Exactly one response exists per request: a parsed body, a synthetic
/// success for fire-and-forget sends (`body` is `None`), or a synthetic
/// disconnect (`disconnected` is true).
#[derive(Debug)]
pub struct ClientResponse {
    pub request: ClientRequest,
    pub received_ms: i64,
    pub disconnected: bool,

    /// Response body bytes (header already consumed); `None` for synthetic
    /// responses.
    pub body: Option<Vec<u8>>,
}

impl ClientResponse {
    pub(crate) fn received(request: ClientRequest, received_ms: i64, body: Vec<u8>) -> Self {
        Self {
            request,
            received_ms,
            disconnected: false,
            body: Some(body),
        }
    }

    pub(crate) fn sent(request: ClientRequest, received_ms: i64) -> Self {
        Self {
            request,
            received_ms,
            disconnected: false,
            body: None,
        }
    }

    pub(crate) fn disconnected(request: ClientRequest, received_ms: i64) -> Self {
        Self {
            request,
            received_ms,
            disconnected: true,
            body: None,
        }
    }
}
