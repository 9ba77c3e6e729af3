//! Numeric error codes carried in response bodies.

/// Server-side error codes.
///
/// Only the subset that shows up in the metadata exchange and topic admin
/// paths is enumerated; everything else surfaces as [`Error::Unknown`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Error {
    UnknownServerError,
    OffsetOutOfRange,
    CorruptMessage,
    UnknownTopicOrPartition,
    LeaderNotAvailable,
    NotLeaderForPartition,
    RequestTimedOut,
    ReplicaNotAvailable,
    NetworkException,
    InvalidTopic,
    TopicAlreadyExists,
    InvalidPartitions,
    InvalidReplicationFactor,
    Unknown(i16),
}

impl Error {
    /// Build an error from a wire code.
    ///
    /// Returns `None` for code `0` ("no error").
    pub fn new(code: i16) -> Option<Self> {
        match code {
            0 => None,
            -1 => Some(Self::UnknownServerError),
            1 => Some(Self::OffsetOutOfRange),
            2 => Some(Self::CorruptMessage),
            3 => Some(Self::UnknownTopicOrPartition),
            5 => Some(Self::LeaderNotAvailable),
            6 => Some(Self::NotLeaderForPartition),
            7 => Some(Self::RequestTimedOut),
            9 => Some(Self::ReplicaNotAvailable),
            13 => Some(Self::NetworkException),
            17 => Some(Self::InvalidTopic),
            36 => Some(Self::TopicAlreadyExists),
            37 => Some(Self::InvalidPartitions),
            38 => Some(Self::InvalidReplicationFactor),
            other => Some(Self::Unknown(other)),
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            Self::UnknownServerError => -1,
            Self::OffsetOutOfRange => 1,
            Self::CorruptMessage => 2,
            Self::UnknownTopicOrPartition => 3,
            Self::LeaderNotAvailable => 5,
            Self::NotLeaderForPartition => 6,
            Self::RequestTimedOut => 7,
            Self::ReplicaNotAvailable => 9,
            Self::NetworkException => 13,
            Self::InvalidTopic => 17,
            Self::TopicAlreadyExists => 36,
            Self::InvalidPartitions => 37,
            Self::InvalidReplicationFactor => 38,
            Self::Unknown(code) => *code,
        }
    }

    /// Whether a client may retry after the next metadata refresh.
    ///
    /// Leader/replica gaps are transient while the cluster converges.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::UnknownTopicOrPartition
                | Self::LeaderNotAvailable
                | Self::NotLeaderForPartition
                | Self::RequestTimedOut
                | Self::ReplicaNotAvailable
                | Self::NetworkException
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [-1i16, 1, 2, 3, 5, 6, 7, 9, 13, 17, 36, 37, 38, 99] {
            assert_eq!(Error::new(code).unwrap().code(), code);
        }
        assert!(Error::new(0).is_none());
    }

    #[test]
    fn test_metadata_gaps_are_retriable() {
        assert!(Error::LeaderNotAvailable.is_retriable());
        assert!(Error::ReplicaNotAvailable.is_retriable());
        assert!(!Error::InvalidTopic.is_retriable());
    }
}
