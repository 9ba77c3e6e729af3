//! Helpers shared by the integration tests.

use std::io::{Cursor, Write};

use rsbroker::protocol::api_version::ApiVersion;
use rsbroker::protocol::messages::{WriteVersionedError, WriteVersionedType};
use rsbroker::protocol::traits::WriteError;

/// Opaque request body carrying raw bytes.
pub struct RawBody(pub Vec<u8>);

impl WriteVersionedType<Cursor<Vec<u8>>> for RawBody {
    fn write_versioned(
        &self,
        writer: &mut Cursor<Vec<u8>>,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        writer.write_all(&self.0).map_err(WriteError::from)?;
        Ok(())
    }
}

/// Unframed response bytes: v0 response header (correlation id) + body.
pub fn response_bytes(correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let mut out = correlation_id.to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

/// Correlation id of a serialized request (header version 1).
pub fn request_correlation_id(payload: &[u8]) -> i32 {
    i32::from_be_bytes(payload[4..8].try_into().unwrap())
}
