//! Query executor seam
//!
//! The traversal engine never talks to the database itself. It asks a
//! [`QueryExecutor`] to open a row stream for one partition and consumes the
//! rows it yields.

use core::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::record::Timestamp;

/// Parameters of one partition read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionQuery {
    pub stream_id: String,
    /// `None` for the root partition, which carries no partition filter
    pub partition_token: Option<String>,
    pub start_timestamp: Timestamp,
    /// `None` reads until cancelled
    pub end_timestamp: Option<Timestamp>,
    pub heartbeat_interval: Duration,
}

impl PartitionQuery {
    /// Token as stored in the partition registry; empty for the root.
    #[must_use]
    pub fn token(&self) -> &str {
        self.partition_token.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.partition_token.is_none()
    }

    #[must_use]
    pub fn heartbeat_millis(&self) -> u64 {
        u64::try_from(self.heartbeat_interval.as_millis()).unwrap_or(u64::MAX)
    }
}

/// One raw row of the change stream, column values in select order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<Value>,
}

impl Row {
    #[must_use]
    pub const fn new(columns: Vec<Value>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn column(&self, index: usize) -> Option<&Value> {
        self.columns.get(index)
    }

    #[must_use]
    pub fn into_columns(self) -> Vec<Value> {
        self.columns
    }
}

/// Rows of one partition. Dropping the stream closes the underlying query.
pub type RowStream = BoxStream<'static, Result<Row, QueryError>>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    #[error("failed to open change stream query: {0}")]
    Open(String),

    #[error("change stream query failed: {0}")]
    Stream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs change stream queries for single partitions.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn open(&self, query: &PartitionQuery) -> Result<RowStream, QueryError>;
}
