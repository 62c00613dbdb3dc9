//! Change stream partition reader
//!
//! Reads a database change stream that is split into partitions arranged as a
//! DAG. Every partition is read exactly once, children start only after all of
//! their parents have finished, and unrelated partitions are read
//! concurrently.
//!
//! ## Core Concepts
//!
//! - **Reader**: single-use entry point driving one traversal
//! - **PartitionRegistry**: claim-once state shared by every partition task
//! - **QueryExecutor**: opens the row stream of one partition (dependency injection)
//! - **Dialect**: decodes raw rows into [`ReadResult`]s
//! - **ResultSink**: receives every decoded row; an error aborts the read
//!
//! ```rust,ignore
//! let reader = Reader::new(&ReaderConfig::load(dir)?, executor)?;
//!
//! reader
//!     .read(&CancellationToken::new(), |result: ReadResult| -> Result<(), SinkError> {
//!         println!("{}", result.partition_token);
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod decode;
pub mod error;
mod group;
pub mod query;
pub mod reader;
pub mod record;
pub mod registry;
pub mod replay;
pub mod sink;

pub use config::{ConfigError, ReaderConfig};
pub use decode::{DecodeError, Dialect};
pub use error::ReadError;
pub use query::{PartitionQuery, QueryError, QueryExecutor, Row, RowStream};
pub use reader::{Reader, ROOT_PARTITION_TOKEN};
pub use record::{
    ChangeRecord, ChildPartition, ChildPartitionsRecord, ColumnType, DataChangeRecord,
    HeartbeatRecord, Mod, ReadResult, Timestamp,
};
pub use registry::{PartitionRegistry, PartitionState, RegistryStats};
pub use replay::ReplayExecutor;
pub use sink::{ResultSink, SinkError};
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;
