use thiserror::Error;

use crate::decode::DecodeError;
use crate::query::QueryError;
use crate::sink::SinkError;

/// Terminal outcome of a failed read.
///
/// Only the first error raised by any partition is reported; everything that
/// fails afterwards is a consequence of the cancellation it triggers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadError {
    #[error("reader has already been read")]
    AlreadyStarted,

    #[error("partition {partition_token:?}: {source}")]
    Query {
        partition_token: String,
        #[source]
        source: QueryError,
    },

    #[error("partition {partition_token:?}: failed to decode row: {source}")]
    Decode {
        partition_token: String,
        #[source]
        source: DecodeError,
    },

    #[error("partition {partition_token:?}: sink rejected result: {source}")]
    Sink {
        partition_token: String,
        #[source]
        source: SinkError,
    },

    #[error("read was cancelled")]
    Cancelled,

    #[error("partition task panicked: {0}")]
    Panicked(String),
}

impl ReadError {
    /// Partition the error originated from, if it is tied to one.
    #[must_use]
    pub fn partition_token(&self) -> Option<&str> {
        match self {
            Self::Query {
                partition_token, ..
            }
            | Self::Decode {
                partition_token, ..
            }
            | Self::Sink {
                partition_token, ..
            } => Some(partition_token),
            Self::AlreadyStarted | Self::Cancelled | Self::Panicked(_) => None,
        }
    }
}
