//! Configuration surface for the network client and the placement layer.

/// How rack information on brokers is treated during replica placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RackAwareMode {
    /// Mixed rack information is fatal.
    #[default]
    Enforced,

    /// Downgrade to rack-unaware placement if any broker lacks a rack.
    Safe,

    /// Ignore rack information entirely.
    Disabled,
}

/// Knobs of the [`crate::client::NetworkClient`].
///
/// Defaults mirror what the stock producer/consumer clients ship with.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identifier sent in every request header.
    pub client_id: Option<String>,

    /// Upper bound on unacknowledged requests per connection.
    pub max_in_flight_requests_per_connection: usize,

    /// Window after a disconnect during which the node is blacked out.
    pub reconnect_backoff_ms: i64,

    /// A request older than this is cancelled and its connection closed.
    pub request_timeout_ms: i64,

    /// SO_SNDBUF for broker sockets.
    pub socket_send_buffer_bytes: usize,

    /// SO_RCVBUF for broker sockets.
    pub socket_receive_buffer_bytes: usize,

    /// Metadata is considered stale after this many milliseconds even
    /// without an explicit invalidation.
    pub metadata_max_age_ms: i64,

    /// Minimum delay between two metadata refresh attempts.
    pub metadata_refresh_backoff_ms: i64,

    /// Hard cap on a single framed message.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            max_in_flight_requests_per_connection: 5,
            reconnect_backoff_ms: 50,
            request_timeout_ms: 30_000,
            socket_send_buffer_bytes: 128 * 1024,
            socket_receive_buffer_bytes: 64 * 1024,
            metadata_max_age_ms: 5 * 60 * 1000,
            metadata_refresh_backoff_ms: 100,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout: i64) -> Self {
        self.request_timeout_ms = timeout;
        self
    }
}
