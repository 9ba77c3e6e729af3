//! Decode/encode seam shared by every wire type in [`crate::protocol`].
//!
//! Request payloads travel through the engine as opaque bytes; these two
//! traits are what turns the typed messages into those bytes and back at
//! the places that look inside a frame: header handling and the metadata
//! refresh. Version-dependent fields layer on top of this in
//! [`crate::protocol::messages`].

use std::io::{Read, Write};

use thiserror::Error;

/// Failure while decoding a wire type.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Cannot read data: {0}")]
    IO(#[from] std::io::Error),

    /// The bytes violate the encoding, e.g. a negative length prefix or
    /// an array length no real response could carry.
    #[error("Malformed data: {0}")]
    Malformed(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A type with a fixed decoding, independent of any message version.
pub trait ReadType<R>: Sized
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError>;
}

/// Failure while encoding a wire type.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Cannot write data: {0}")]
    IO(#[from] std::io::Error),

    /// A length or count does not fit its fixed-width wire field.
    #[error("Value does not fit its wire field: {0}")]
    Overflow(#[from] std::num::TryFromIntError),
}

/// A type with a fixed encoding, independent of any message version.
pub trait WriteType<W>: Sized
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError>;
}
