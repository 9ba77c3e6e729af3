use std::io::{Read, Write};

use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    primitives::{Int16, Int32, NullableString},
    traits::{ReadType, WriteType},
};

use super::{ReadVersionedError, ReadVersionedType, WriteVersionedError, WriteVersionedType};

#[derive(Debug, Clone)]
pub struct RequestHeader {
    /// The API key of this request.
    pub request_api_key: ApiKey,

    /// The API version of this request.
    pub request_api_version: ApiVersion,

    /// The correlation ID of this request.
    pub correlation_id: Int32,

    /// The client ID string.
    ///
    /// Added in version 1.
    pub client_id: NullableString,
}

impl<W> WriteVersionedType<W> for RequestHeader
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0 .0;
        assert!(v <= 1);

        Int16::from(self.request_api_key).write(writer)?;
        self.request_api_version.0.write(writer)?;
        self.correlation_id.write(writer)?;

        if v >= 1 {
            self.client_id.write(writer)?;
        }

        Ok(())
    }
}

impl<R> ReadVersionedType<R> for RequestHeader
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0 .0;
        assert!(v <= 1);

        Ok(Self {
            request_api_key: ApiKey::from(Int16::read(reader)?),
            request_api_version: ApiVersion(Int16::read(reader)?),
            correlation_id: Int32::read(reader)?,
            client_id: if v >= 1 {
                NullableString::read(reader)?
            } else {
                NullableString(None)
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHeader {
    /// The correlation ID of this response.
    pub correlation_id: Int32,
}

impl<R> ReadVersionedType<R> for ResponseHeader
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            correlation_id: Int32::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for ResponseHeader
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        self.correlation_id.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn test_request_header_v1_carries_client_id() {
        let header = RequestHeader {
            request_api_key: ApiKey::Metadata,
            request_api_version: ApiVersion(Int16(0)),
            correlation_id: Int32(42),
            client_id: NullableString(Some("driver".to_string())),
        };

        let mut buf = Cursor::new(vec![]);
        header
            .write_versioned(&mut buf, ApiVersion(Int16(1)))
            .unwrap();
        buf.set_position(0);

        let parsed = RequestHeader::read_versioned(&mut buf, ApiVersion(Int16(1))).unwrap();
        assert_eq!(parsed.request_api_key, ApiKey::Metadata);
        assert_eq!(parsed.correlation_id, Int32(42));
        assert_eq!(parsed.client_id.0.as_deref(), Some("driver"));
    }
}
