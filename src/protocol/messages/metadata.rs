use std::io::{Read, Write};

use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    primitives::{Array, Boolean, Int16, Int32, NullableString, String_},
    traits::{ReadType, WriteType},
};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};

#[derive(Debug, Clone)]
pub struct MetadataRequest {
    /// The topics to fetch metadata for.
    ///
    /// Requests data for all topics if `None` (version 1+) or if the list is
    /// empty (version 0).
    pub topics: Option<Vec<MetadataRequestTopic>>,
}

impl RequestBody for MetadataRequest {
    type ResponseBody = MetadataResponse;

    const API_KEY: ApiKey = ApiKey::Metadata;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(1)));
}

impl<W> WriteVersionedType<W> for MetadataRequest
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

        if v == 0 {
            // all-topics is an empty array in version 0
            let topics = self.topics.as_deref().unwrap_or(&[]);
            write_versioned_array(writer, version, Some(topics))
        } else {
            write_versioned_array(writer, version, self.topics.as_deref())
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataRequestTopic {
    /// The topic name.
    pub name: String_,
}

impl<W> WriteVersionedType<W> for MetadataRequestTopic
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 .0 <= 1);
        Ok(self.name.write(writer)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataResponse {
    /// Each broker in the response.
    pub brokers: Vec<MetadataResponseBroker>,

    /// The ID of the controller broker.
    ///
    /// Added in version 1.
    pub controller_id: Option<Int32>,

    /// Each topic in the response.
    pub topics: Vec<MetadataResponseTopic>,
}

impl<R> ReadVersionedType<R> for MetadataResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0 .0;
        assert!(v <= 1);

        let brokers = read_versioned_array(reader, version)?.unwrap_or_default();
        let controller_id = (v >= 1).then(|| Int32::read(reader)).transpose()?;
        let topics = read_versioned_array(reader, version)?.unwrap_or_default();

        Ok(Self {
            brokers,
            controller_id,
            topics,
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponse
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

        write_versioned_array(writer, version, Some(&self.brokers))?;
        if v >= 1 {
            self.controller_id.unwrap_or(Int32(-1)).write(writer)?;
        }
        write_versioned_array(writer, version, Some(&self.topics))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataResponseBroker {
    /// The broker ID.
    pub node_id: Int32,

    /// The broker hostname.
    pub host: String_,

    /// The broker port.
    pub port: Int32,

    /// The rack of the broker.
    ///
    /// Added in version 1.
    pub rack: Option<NullableString>,
}

impl<R> ReadVersionedType<R> for MetadataResponseBroker
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0 .0;
        assert!(v <= 1);

        Ok(Self {
            node_id: Int32::read(reader)?,
            host: String_::read(reader)?,
            port: Int32::read(reader)?,
            rack: (v >= 1).then(|| NullableString::read(reader)).transpose()?,
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponseBroker
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

        self.node_id.write(writer)?;
        self.host.write(writer)?;
        self.port.write(writer)?;
        if v >= 1 {
            self.rack
                .clone()
                .unwrap_or(NullableString(None))
                .write(writer)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataResponseTopic {
    /// The topic error, if any.
    pub error: Option<crate::protocol::error::Error>,

    /// The topic name.
    pub name: String_,

    /// True if the topic is internal.
    ///
    /// Added in version 1.
    pub is_internal: Option<Boolean>,

    /// Each partition in the topic.
    pub partitions: Vec<MetadataResponsePartition>,
}

impl<R> ReadVersionedType<R> for MetadataResponseTopic
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0 .0;
        assert!(v <= 1);

        Ok(Self {
            error: crate::protocol::error::Error::new(Int16::read(reader)?.0),
            name: String_::read(reader)?,
            is_internal: (v >= 1).then(|| Boolean::read(reader)).transpose()?,
            partitions: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponseTopic
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

        Int16(self.error.map_or(0, |e| e.code())).write(writer)?;
        self.name.write(writer)?;
        if v >= 1 {
            self.is_internal.unwrap_or(Boolean(false)).write(writer)?;
        }
        write_versioned_array(writer, version, Some(&self.partitions))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataResponsePartition {
    /// The partition error, if any.
    pub error: Option<crate::protocol::error::Error>,

    /// The partition index.
    pub partition_index: Int32,

    /// The ID of the leader broker.
    pub leader_id: Int32,

    /// The set of all nodes that host this partition.
    pub replica_nodes: Array<Int32>,

    /// The set of nodes that are in sync with the leader for this partition.
    pub isr_nodes: Array<Int32>,
}

impl<R> ReadVersionedType<R> for MetadataResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!(version.0 .0 <= 1);

        Ok(Self {
            error: crate::protocol::error::Error::new(Int16::read(reader)?.0),
            partition_index: Int32::read(reader)?,
            leader_id: Int32::read(reader)?,
            replica_nodes: Array::read(reader)?,
            isr_nodes: Array::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponsePartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 .0 <= 1);

        Int16(self.error.map_or(0, |e| e.code())).write(writer)?;
        self.partition_index.write(writer)?;
        self.leader_id.write(writer)?;
        self.replica_nodes.write(writer)?;
        self.isr_nodes.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn sample_response() -> MetadataResponse {
        MetadataResponse {
            brokers: vec![MetadataResponseBroker {
                node_id: Int32(1),
                host: String_("broker-1".to_string()),
                port: Int32(9092),
                rack: Some(NullableString(Some("r1".to_string()))),
            }],
            controller_id: Some(Int32(1)),
            topics: vec![MetadataResponseTopic {
                error: None,
                name: String_("events".to_string()),
                is_internal: Some(Boolean(false)),
                partitions: vec![MetadataResponsePartition {
                    error: crate::protocol::error::Error::new(5),
                    partition_index: Int32(0),
                    leader_id: Int32(-1),
                    replica_nodes: Array(Some(vec![Int32(1)])),
                    isr_nodes: Array(Some(vec![Int32(1)])),
                }],
            }],
        }
    }

    #[test]
    fn test_response_v1_roundtrip() {
        let response = sample_response();
        let mut buf = Cursor::new(vec![]);
        response
            .write_versioned(&mut buf, ApiVersion(Int16(1)))
            .unwrap();
        buf.set_position(0);

        let parsed = MetadataResponse::read_versioned(&mut buf, ApiVersion(Int16(1))).unwrap();
        assert_eq!(parsed, response);
        assert_eq!(
            parsed.topics[0].partitions[0].error,
            Some(crate::protocol::error::Error::LeaderNotAvailable)
        );
    }

    #[test]
    fn test_request_v0_all_topics_is_empty_array() {
        let request = MetadataRequest { topics: None };
        let mut buf = Cursor::new(vec![]);
        request
            .write_versioned(&mut buf, ApiVersion(Int16(0)))
            .unwrap();
        assert_eq!(buf.into_inner(), 0i32.to_be_bytes().to_vec());
    }
}
