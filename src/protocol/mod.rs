//! Wire codec for broker requests and responses.
//!
//! The engine in [`crate::client`] treats request payloads as opaque bytes;
//! the only body it constructs and parses on its own behalf is the cluster
//! metadata exchange. Everything in here is the fixed-width (pre-compact)
//! encoding: big-endian integers and length-prefixed strings and arrays.

pub mod api_key;
pub mod api_version;
pub mod error;
pub mod frame;
pub mod messages;
pub mod primitives;
pub mod traits;
