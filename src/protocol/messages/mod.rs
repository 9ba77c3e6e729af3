//! Individual API messages.

use std::io::{Read, Write};

use thiserror::Error;

use super::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    primitives::Int32,
    traits::{ReadError, ReadType, WriteError, WriteType},
};

mod header;
pub use header::*;
mod metadata;
pub use metadata::*;

#[derive(Error, Debug)]
pub enum ReadVersionedError {
    #[error("Read error: {0}")]
    ReadError(#[from] ReadError),
}

pub trait ReadVersionedType<R>: Sized
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError>;
}

#[derive(Error, Debug)]
pub enum WriteVersionedError {
    #[error("Write error: {0}")]
    WriteError(#[from] WriteError),

    #[error("Field {field} not available in version: {version:?}")]
    FieldNotAvailable { field: String, version: ApiVersion },
}

pub trait WriteVersionedType<W>: Sized
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError>;
}

impl<W: Write, T: WriteVersionedType<W>> WriteVersionedType<W> for &T {
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        T::write_versioned(self, writer, version)
    }
}

/// Specifies a request body.
pub trait RequestBody {
    /// The response type that will follow when issuing this request.
    type ResponseBody;

    /// API key tagging the request in its header.
    const API_KEY: ApiKey;

    /// Version range this crate can speak for the API.
    const API_VERSION_RANGE: ApiVersionRange;
}

/// Read an array of versioned objects.
fn read_versioned_array<R: Read, T: ReadVersionedType<R>>(
    reader: &mut R,
    version: ApiVersion,
) -> Result<Option<Vec<T>>, ReadVersionedError> {
    let len = Int32::read(reader)?;
    match len.0 {
        -1 => Ok(None),
        l if l < -1 => Err(ReadVersionedError::ReadError(ReadError::Malformed(
            format!("Invalid negative array length: {}", l).into(),
        ))),
        l => {
            let mut res = Vec::with_capacity(l as usize);
            for _ in 0..l {
                res.push(T::read_versioned(reader, version)?);
            }
            Ok(Some(res))
        }
    }
}

/// Write an array of versioned objects.
fn write_versioned_array<W: Write, T: WriteVersionedType<W>>(
    writer: &mut W,
    version: ApiVersion,
    data: Option<&[T]>,
) -> Result<(), WriteVersionedError> {
    match data {
        None => {
            Int32(-1).write(writer).map_err(WriteError::from)?;
            Ok(())
        }
        Some(inner) => {
            let len = i32::try_from(inner.len()).map_err(WriteError::from)?;
            Int32(len).write(writer).map_err(WriteError::from)?;

            for element in inner {
                element.write_versioned(writer, version)?;
            }
            Ok(())
        }
    }
}
