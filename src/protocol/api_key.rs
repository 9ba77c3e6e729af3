//! ApiKey to tag request types.

use super::primitives::Int16;

/// The APIs this crate speaks.
///
/// Anything else on the wire round-trips through [`ApiKey::Unknown`] so that
/// opaque user payloads keep their tag.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    ApiVersions,
    Unknown(Int16),
}

impl From<Int16> for ApiKey {
    fn from(key: Int16) -> Self {
        match key.0 {
            0 => Self::Produce,
            1 => Self::Fetch,
            2 => Self::ListOffsets,
            3 => Self::Metadata,
            18 => Self::ApiVersions,
            _ => Self::Unknown(key),
        }
    }
}

impl From<ApiKey> for Int16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => Int16(0),
            ApiKey::Fetch => Int16(1),
            ApiKey::ListOffsets => Int16(2),
            ApiKey::Metadata => Int16(3),
            ApiKey::ApiVersions => Int16(18),
            ApiKey::Unknown(code) => code,
        }
    }
}
