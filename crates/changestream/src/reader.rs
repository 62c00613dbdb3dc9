//! Change stream reader
//!
//! Starts at the root partition and follows child partition announcements
//! through the partition DAG, reading every partition exactly once. A child is
//! started only once all of its parents have finished; whichever parent
//! finishes last is the one whose readiness check starts it.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConfigError, ReaderConfig};
use crate::decode::Dialect;
use crate::error::ReadError;
use crate::group::TaskGroup;
use crate::query::{PartitionQuery, QueryError, QueryExecutor, Row, RowStream};
use crate::record::{ChildPartitionsRecord, Timestamp};
use crate::registry::{PartitionRegistry, PartitionState, RegistryStats};
use crate::sink::ResultSink;

/// Token of the synthetic root partition.
pub const ROOT_PARTITION_TOKEN: &str = "";

/// Reads a change stream across all of its partitions.
///
/// A reader is single-use: [`Reader::read`] may be called once.
pub struct Reader {
    inner: Arc<ReaderInner>,
    started: AtomicBool,
}

struct ReaderInner {
    executor: Arc<dyn QueryExecutor>,
    dialect: Dialect,
    stream_id: String,
    start_timestamp: Option<Timestamp>,
    end_timestamp: Option<Timestamp>,
    heartbeat_interval: Duration,
    registry: PartitionRegistry,
}

impl core::fmt::Debug for Reader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reader")
            .field("stream_id", &self.inner.stream_id)
            .field("dialect", &self.inner.dialect)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Reader {
    /// Creates a reader; fails if the configured dialect is not supported.
    pub fn new<Q>(config: &ReaderConfig, executor: Q) -> Result<Self, ConfigError>
    where
        Q: QueryExecutor + 'static,
    {
        let dialect = config.dialect()?;

        Ok(Self {
            inner: Arc::new(ReaderInner {
                executor: Arc::new(executor),
                dialect,
                stream_id: config.stream_id.clone(),
                start_timestamp: config.start_timestamp,
                end_timestamp: config.end_timestamp,
                heartbeat_interval: config.heartbeat_interval(),
                registry: PartitionRegistry::new(),
            }),
            started: AtomicBool::new(false),
        })
    }

    /// Reads the change stream, handing every decoded row to `sink`.
    ///
    /// Resolves once every partition discovered from the root has finished,
    /// or with the first error raised by any partition or the sink. Cancelling
    /// `cancellation` stops all partitions. Not reentrant: any call after the
    /// first returns [`ReadError::AlreadyStarted`].
    pub async fn read<S>(&self, cancellation: &CancellationToken, sink: S) -> Result<(), ReadError>
    where
        S: ResultSink + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ReadError::AlreadyStarted);
        }

        let group = TaskGroup::new(cancellation);
        let start_timestamp = self.inner.start_timestamp.unwrap_or_else(Utc::now);

        info!(
            stream_id = %self.inner.stream_id,
            dialect = %self.inner.dialect,
            %start_timestamp,
            end_timestamp = ?self.inner.end_timestamp,
            "Starting change stream read"
        );

        group.spawn(
            PartitionTask {
                reader: Arc::clone(&self.inner),
                group: group.clone(),
                sink: Arc::new(sink),
                partition_token: ROOT_PARTITION_TOKEN.to_owned(),
                start_timestamp,
            }
            .run(),
        );

        let result = group.wait().await;
        let stats = self.inner.registry.stats();

        info!(
            stream_id = %self.inner.stream_id,
            finished = stats.finished,
            unfinished = stats.reading,
            success = result.is_ok(),
            "Change stream read ended"
        );

        result
    }

    #[must_use]
    pub fn partition_state(&self, partition_token: &str) -> PartitionState {
        self.inner.registry.state(partition_token)
    }

    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }
}

/// Reads one partition and starts whichever of its children become ready.
struct PartitionTask {
    reader: Arc<ReaderInner>,
    group: TaskGroup,
    sink: Arc<dyn ResultSink>,
    partition_token: String,
    start_timestamp: Timestamp,
}

impl PartitionTask {
    /// Boxed so a task can spawn its children without a recursive future type.
    fn run(self) -> BoxFuture<'static, Result<(), ReadError>> {
        self.read().boxed()
    }

    async fn read(self) -> Result<(), ReadError> {
        let registry = &self.reader.registry;

        if !registry.try_claim(&self.partition_token) {
            debug!(partition_token = %self.partition_token, "Partition already claimed, skipping");
            return Ok(());
        }

        debug!(
            partition_token = %self.partition_token,
            start_timestamp = %self.start_timestamp,
            "Reading partition"
        );

        // A failure here leaves the partition `Reading`, so none of its
        // children can ever become ready.
        let children = self.consume().await?;

        registry.mark_finished(&self.partition_token);

        debug!(
            partition_token = %self.partition_token,
            child_records = children.len(),
            "Finished partition"
        );

        // Children must be spawned before this task returns.
        for record in &children {
            for child in &record.child_partitions {
                if !registry.all_parents_finished(&child.parent_partition_tokens) {
                    continue;
                }

                self.group.spawn(
                    Self {
                        reader: Arc::clone(&self.reader),
                        group: self.group.clone(),
                        sink: Arc::clone(&self.sink),
                        partition_token: child.token.clone(),
                        start_timestamp: record.start_timestamp,
                    }
                    .run(),
                );
            }
        }

        Ok(())
    }

    /// Delivers every row to the sink and returns the child announcements seen.
    async fn consume(&self) -> Result<Vec<ChildPartitionsRecord>, ReadError> {
        let cancellation = self.group.cancellation();
        let query = self.query();

        let mut rows = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(ReadError::Cancelled),
            opened = self.reader.executor.open(&query) => opened.map_err(|source| self.query_error(source))?,
        };

        let mut children = Vec::new();

        while let Some(row) = next_row(cancellation, &mut rows).await? {
            let row = row.map_err(|source| self.query_error(source))?;

            let result = self
                .reader
                .dialect
                .decode(&self.partition_token, row)
                .map_err(|source| ReadError::Decode {
                    partition_token: self.partition_token.clone(),
                    source,
                })?;

            children.extend(result.child_partitions_records().cloned());

            self.sink
                .on_result(result)
                .await
                .map_err(|source| ReadError::Sink {
                    partition_token: self.partition_token.clone(),
                    source,
                })?;
        }

        Ok(children)
    }

    fn query(&self) -> PartitionQuery {
        PartitionQuery {
            stream_id: self.reader.stream_id.clone(),
            partition_token: (self.partition_token != ROOT_PARTITION_TOKEN)
                .then(|| self.partition_token.clone()),
            start_timestamp: self.start_timestamp,
            end_timestamp: self.reader.end_timestamp,
            heartbeat_interval: self.reader.heartbeat_interval,
        }
    }

    fn query_error(&self, source: QueryError) -> ReadError {
        ReadError::Query {
            partition_token: self.partition_token.clone(),
            source,
        }
    }
}

/// Next row of the stream, unless the read is cancelled first.
async fn next_row(
    cancellation: &CancellationToken,
    rows: &mut RowStream,
) -> Result<Option<Result<Row, QueryError>>, ReadError> {
    tokio::select! {
        biased;
        () = cancellation.cancelled() => Err(ReadError::Cancelled),
        row = rows.next() => Ok(row),
    }
}
