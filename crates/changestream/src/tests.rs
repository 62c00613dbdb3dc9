//! End-to-end tests of the partition traversal
//!
//! Tests cover:
//! - Fan-out to independent children
//! - Children gated on several parents
//! - Duplicate announcements of the same child
//! - Stream, decode and sink failures
//! - Cancellation and reentry

use core::time::Duration;
use std::collections::HashMap;
use std::fs::{create_dir_all, write};
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::replay::{PARTITIONS_DIR, ROOT_FILE};

use super::*;

const CHILD_START: &str = "2024-03-01T10:00:01Z";

#[derive(Clone, Default)]
struct Script {
    rows: Vec<Result<Row, String>>,
    gate: Option<Arc<Notify>>,
}

/// In-memory executor serving scripted rows per partition token.
#[derive(Clone, Default)]
struct ScriptedExecutor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    opened: Arc<Mutex<HashMap<String, usize>>>,
    queries: Arc<Mutex<Vec<PartitionQuery>>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn partition(self, token: &str, rows: Vec<Result<Row, String>>) -> Self {
        self.scripts
            .lock()
            .entry(token.to_owned())
            .or_default()
            .rows = rows;
        self
    }

    /// Holds the partition's stream closed until the returned gate is notified.
    fn gate(&self, token: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.scripts
            .lock()
            .entry(token.to_owned())
            .or_default()
            .gate = Some(Arc::clone(&gate));
        gate
    }

    fn opened(&self, token: &str) -> usize {
        self.opened.lock().get(token).copied().unwrap_or_default()
    }

    fn query(&self, token: &str) -> Option<PartitionQuery> {
        self.queries
            .lock()
            .iter()
            .find(|query| query.token() == token)
            .cloned()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn open(&self, query: &PartitionQuery) -> Result<RowStream, QueryError> {
        let token = query.token().to_owned();

        *self.opened.lock().entry(token.clone()).or_default() += 1;
        self.queries.lock().push(query.clone());

        let script = self
            .scripts
            .lock()
            .get(&token)
            .cloned()
            .ok_or_else(|| QueryError::Open(format!("no script for partition {token:?}")))?;

        if let Some(gate) = script.gate {
            gate.notified().await;
        }

        let rows = script
            .rows
            .into_iter()
            .map(|row| row.map_err(QueryError::Stream));

        Ok(stream::iter(rows).boxed())
    }
}

#[derive(Clone, Default)]
struct CollectingSink {
    results: Arc<Mutex<Vec<ReadResult>>>,
    fail_on: Option<usize>,
}

impl CollectingSink {
    fn failing_on(delivery: usize) -> Self {
        Self {
            fail_on: Some(delivery),
            ..Self::default()
        }
    }

    fn len(&self) -> usize {
        self.results.lock().len()
    }

    fn tables(&self, token: &str) -> Vec<String> {
        self.results
            .lock()
            .iter()
            .filter(|result| result.partition_token == token)
            .flat_map(|result| result.change_records.iter())
            .flat_map(|record| record.data_change_records.iter())
            .map(|change| change.table_name.clone())
            .collect()
    }
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn on_result(&self, result: ReadResult) -> Result<(), SinkError> {
        let delivered = {
            let mut results = self.results.lock();
            results.push(result);
            results.len()
        };

        if self.fail_on == Some(delivered) {
            return Err(format!("rejected result #{delivered}").into());
        }

        Ok(())
    }
}

fn config(dialect: Dialect) -> ReaderConfig {
    ReaderConfig::new("Orders")
        .with_dialect(dialect)
        .with_start_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
}

fn reader(executor: &ScriptedExecutor) -> Reader {
    Reader::new(&config(Dialect::GoogleSql), executor.clone()).unwrap()
}

fn data_row(table: &str) -> Result<Row, String> {
    Ok(Row::new(vec![json!([{
        "data_change_record": [{
            "commit_timestamp": "2024-03-01T10:00:00.5Z",
            "record_sequence": "00000000",
            "server_transaction_id": "tx",
            "table_name": table,
            "mod_type": "INSERT",
            "mods": [{"keys": {"Id": "1"}, "new_values": {}, "old_values": {}}]
        }]
    }])]))
}

fn heartbeat_row() -> Result<Row, String> {
    Ok(Row::new(vec![json!([{
        "heartbeat_record": [{"timestamp": "2024-03-01T10:00:00.9Z"}]
    }])]))
}

fn children_row(children: &[(&str, &[&str])]) -> Result<Row, String> {
    let children: Vec<Value> = children
        .iter()
        .map(|(token, parents)| json!({"token": token, "parent_partition_tokens": parents}))
        .collect();

    Ok(Row::new(vec![json!([{
        "child_partitions_record": [{
            "start_timestamp": CHILD_START,
            "record_sequence": "00000001",
            "child_partitions": children
        }]
    }])]))
}

fn stream_error(message: &str) -> Result<Row, String> {
    Err(message.to_owned())
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

// ============================================================
// Traversal Tests
// ============================================================

#[tokio::test]
async fn test_root_with_independent_children() {
    let executor = ScriptedExecutor::new()
        .partition("", vec![heartbeat_row(), children_row(&[("child1", &[]), ("child2", &[])])])
        .partition("child1", vec![data_row("a1"), data_row("a2")])
        .partition("child2", vec![data_row("b1")]);
    let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
    let reader = Reader::new(
        &config(Dialect::GoogleSql).with_end_timestamp(end),
        executor.clone(),
    )
    .unwrap();
    let sink = CollectingSink::default();

    reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap();

    for token in ["", "child1", "child2"] {
        assert_eq!(
            reader.partition_state(token),
            PartitionState::Finished,
            "Partition {token:?} should be finished"
        );
        assert_eq!(executor.opened(token), 1, "Partition {token:?} read once");
    }

    assert_eq!(sink.len(), 5, "Every row of every partition is delivered");
    assert_eq!(sink.tables("child1"), vec!["a1", "a2"], "Rows keep stream order");
    assert_eq!(sink.tables("child2"), vec!["b1"]);

    let root = executor.query("").unwrap();
    assert!(root.is_root());
    assert_eq!(root.start_timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    assert_eq!(root.end_timestamp, Some(end));
    assert_eq!(root.heartbeat_millis(), 10_000);

    let child = executor.query("child1").unwrap();
    assert_eq!(child.partition_token.as_deref(), Some("child1"));
    assert_eq!(child.start_timestamp.to_rfc3339(), "2024-03-01T10:00:01+00:00");
    assert_eq!(child.end_timestamp, Some(end));
}

#[tokio::test]
async fn test_child_waits_for_every_parent() {
    let executor = ScriptedExecutor::new()
        .partition("", vec![children_row(&[("A", &[]), ("B", &[])])])
        .partition("A", vec![data_row("a"), children_row(&[("G", &["A", "B"])])])
        .partition("B", vec![children_row(&[("G", &["A", "B"])])])
        .partition("G", vec![data_row("g")]);
    let gate_b = executor.gate("B");
    let reader = Arc::new(reader(&executor));
    let sink = CollectingSink::default();

    let handle = tokio::spawn({
        let reader = Arc::clone(&reader);
        let sink = sink.clone();
        async move { reader.read(&CancellationToken::new(), sink).await }
    });

    wait_for(|| reader.partition_state("A") == PartitionState::Finished).await;

    assert_eq!(reader.partition_state("B"), PartitionState::Reading);
    assert_eq!(
        reader.partition_state("G"),
        PartitionState::Unknown,
        "Grandchild must wait for its second parent"
    );
    assert_eq!(executor.opened("G"), 0);

    gate_b.notify_one();

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("read should complete once B is released")
        .unwrap()
        .unwrap();

    assert_eq!(executor.opened("G"), 1, "Grandchild is read exactly once");
    assert_eq!(reader.partition_state("G"), PartitionState::Finished);
    assert_eq!(sink.tables("G"), vec!["g"]);
}

#[tokio::test]
async fn test_shared_child_read_once() {
    let executor = ScriptedExecutor::new()
        .partition("", vec![children_row(&[("A", &[]), ("B", &[])])])
        .partition("A", vec![children_row(&[("G", &["A", "B"])])])
        .partition("B", vec![children_row(&[("G", &["A", "B"])])])
        .partition("G", vec![data_row("g")]);
    let reader = reader(&executor);
    let sink = CollectingSink::default();

    reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap();

    assert_eq!(executor.opened("G"), 1);
    assert_eq!(sink.tables("G"), vec!["g"]);
    assert_eq!(
        reader.registry_stats(),
        RegistryStats {
            reading: 0,
            finished: 4
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_shared_child_spawned_once_across_workers() {
    let parents: Vec<String> = (0..8).map(|index| format!("P{index}")).collect();
    let parents: Vec<&str> = parents.iter().map(String::as_str).collect();
    let announced: Vec<(&str, &[&str])> = parents.iter().map(|parent| (*parent, &[][..])).collect();

    for _ in 0..100 {
        let mut executor = ScriptedExecutor::new()
            .partition("", vec![children_row(&announced)])
            .partition("G", vec![data_row("g")]);
        for parent in &parents {
            executor = executor.partition(
                parent,
                vec![data_row(parent), children_row(&[("G", parents.as_slice())])],
            );
        }

        let reader = reader(&executor);
        let sink = CollectingSink::default();

        reader
            .read(&CancellationToken::new(), sink.clone())
            .await
            .unwrap();

        assert_eq!(executor.opened("G"), 1, "Shared child is opened once");
        assert_eq!(sink.tables("G"), vec!["g"]);
        assert_eq!(
            reader.registry_stats(),
            RegistryStats {
                reading: 0,
                finished: parents.len() + 2
            }
        );
    }
}

#[tokio::test]
async fn test_duplicate_announcement_is_absorbed() {
    let executor = ScriptedExecutor::new()
        .partition(
            "",
            vec![children_row(&[("X", &[])]), children_row(&[("X", &[])])],
        )
        .partition("X", vec![data_row("x")]);
    let reader = reader(&executor);
    let sink = CollectingSink::default();

    reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap();

    assert_eq!(executor.opened("X"), 1, "Second spawn must no-op on the claim");
    assert_eq!(sink.len(), 3);
}

#[tokio::test]
async fn test_deep_chain() {
    let mut executor = ScriptedExecutor::new().partition("", vec![children_row(&[("p0", &[])])]);
    for depth in 0..20 {
        let token = format!("p{depth}");
        let next = format!("p{}", depth + 1);
        let parents: &[&str] = &[token.as_str()];
        executor = executor.partition(&token, vec![data_row(&token), children_row(&[(next.as_str(), parents)])]);
    }
    executor = executor.partition("p20", vec![data_row("p20")]);
    let reader = reader(&executor);
    let sink = CollectingSink::default();

    reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap();

    assert_eq!(reader.registry_stats().finished, 22);
    assert_eq!(sink.tables("p20"), vec!["p20"]);
}

// ============================================================
// Failure Tests
// ============================================================

#[tokio::test]
async fn test_stream_error_blocks_children() {
    let executor = ScriptedExecutor::new()
        .partition(
            "",
            vec![children_row(&[("C1", &[])]), stream_error("connection reset")],
        )
        .partition("C1", vec![data_row("c1")]);
    let reader = reader(&executor);
    let sink = CollectingSink::default();

    let err = reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap_err();

    assert!(
        matches!(&err, ReadError::Query { partition_token, source: QueryError::Stream(message) }
            if partition_token.is_empty() && message == "connection reset"),
        "{err}"
    );
    assert_eq!(reader.partition_state(""), PartitionState::Reading);
    assert_eq!(reader.partition_state("C1"), PartitionState::Unknown);
    assert_eq!(executor.opened("C1"), 0);
    assert_eq!(sink.len(), 1, "Rows before the failure were delivered");
}

#[tokio::test]
async fn test_sink_error_aborts_read() {
    let executor = ScriptedExecutor::new()
        .partition(
            "",
            vec![
                data_row("first"),
                data_row("second"),
                children_row(&[("C1", &[])]),
            ],
        )
        .partition("C1", vec![data_row("c1")]);
    let reader = reader(&executor);
    let sink = CollectingSink::failing_on(2);

    let err = reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, ReadError::Sink { .. }), "{err}");
    assert!(err.to_string().contains("rejected result #2"), "{err}");
    assert_eq!(sink.len(), 2, "No delivery after the sink failed");
    assert_eq!(executor.opened("C1"), 0);
}

#[tokio::test]
async fn test_decode_error_aborts_read() {
    let executor = ScriptedExecutor::new()
        .partition("", vec![Ok(Row::new(vec![json!("garbage")]))]);
    let reader = reader(&executor);

    let err = reader
        .read(&CancellationToken::new(), CollectingSink::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ReadError::Decode { .. }), "{err}");
    assert_eq!(err.partition_token(), Some(""));
}

#[tokio::test]
async fn test_first_error_cancels_siblings() {
    let executor = ScriptedExecutor::new()
        .partition("", vec![children_row(&[("bad", &[]), ("slow", &[])])])
        .partition("bad", vec![stream_error("boom")])
        .partition("slow", vec![data_row("never")]);
    // Never released: only cancellation can end this partition.
    let _gate = executor.gate("slow");
    let reader = reader(&executor);
    let sink = CollectingSink::default();

    let err = timeout(
        Duration::from_secs(5),
        reader.read(&CancellationToken::new(), sink.clone()),
    )
    .await
    .expect("read should unwind after the first failure")
    .unwrap_err();

    assert_eq!(err.partition_token(), Some("bad"), "{err}");
    assert_eq!(reader.partition_state("slow"), PartitionState::Reading);
    assert!(sink.tables("slow").is_empty());
}

#[tokio::test]
async fn test_caller_cancellation() {
    let executor = ScriptedExecutor::new().partition("", vec![heartbeat_row()]);
    let _gate = executor.gate("");
    let reader = Arc::new(reader(&executor));
    let cancellation = CancellationToken::new();

    let handle = tokio::spawn({
        let reader = Arc::clone(&reader);
        let cancellation = cancellation.clone();
        async move {
            reader
                .read(&cancellation, CollectingSink::default())
                .await
        }
    });

    wait_for(|| executor.opened("") == 1).await;
    cancellation.cancel();

    let err = timeout(Duration::from_secs(5), handle)
        .await
        .expect("read should stop once cancelled")
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, ReadError::Cancelled), "{err}");
    assert_eq!(reader.partition_state(""), PartitionState::Reading);
}

// ============================================================
// Reentry Tests
// ============================================================

#[tokio::test]
async fn test_read_twice_fails() {
    let executor = ScriptedExecutor::new().partition("", vec![heartbeat_row()]);
    let reader = reader(&executor);
    let cancellation = CancellationToken::new();

    reader
        .read(&cancellation, CollectingSink::default())
        .await
        .unwrap();

    let err = reader
        .read(&cancellation, CollectingSink::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ReadError::AlreadyStarted), "{err}");
    assert_eq!(executor.opened(""), 1, "No second root read");
}

#[tokio::test]
async fn test_concurrent_reads_fail() {
    let executor = ScriptedExecutor::new().partition("", vec![heartbeat_row()]);
    let reader = reader(&executor);
    let cancellation = CancellationToken::new();

    let (first, second) = tokio::join!(
        reader.read(&cancellation, CollectingSink::default()),
        reader.read(&cancellation, CollectingSink::default()),
    );

    let already_started = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(ReadError::AlreadyStarted)))
        .count();

    assert_eq!(already_started, 1, "{first:?} {second:?}");
    assert!(first.is_ok() || second.is_ok());
    assert_eq!(executor.opened(""), 1);
}

// ============================================================
// Dialect & Executor Tests
// ============================================================

#[tokio::test]
async fn test_postgres_dialect_traversal() {
    let executor = ScriptedExecutor::new()
        .partition(
            "",
            vec![Ok(Row::new(vec![json!({
                "child_partitions_record": {
                    "start_timestamp": CHILD_START,
                    "record_sequence": "1",
                    "child_partitions": [{"token": "c1", "parent_partition_tokens": []}]
                }
            })]))],
        )
        .partition(
            "c1",
            vec![Ok(Row::new(vec![Value::String(
                r#"{"data_change_record": {"commit_timestamp": "2024-03-01T10:00:02Z", "table_name": "Users", "mod_type": "UPDATE"}}"#
                    .to_owned(),
            )]))],
        );
    let reader = Reader::new(&config(Dialect::PostgreSql), executor.clone()).unwrap();
    let sink = CollectingSink::default();

    reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap();

    assert_eq!(sink.tables("c1"), vec!["Users"]);
    assert_eq!(reader.partition_state("c1"), PartitionState::Finished);
}

#[tokio::test]
async fn test_unsupported_dialect_is_rejected() {
    let mut config = ReaderConfig::new("Orders");
    config.dialect = "spanner-ql".to_owned();

    let err = Reader::new(&config, ScriptedExecutor::new()).unwrap_err();

    assert!(matches!(err, ConfigError::UnsupportedDialect(_)), "{err}");
}

#[tokio::test]
async fn test_closure_sink() {
    let executor = ScriptedExecutor::new().partition("", vec![heartbeat_row(), data_row("t")]);
    let reader = reader(&executor);
    let seen = Arc::new(Mutex::new(0_usize));

    let counter = Arc::clone(&seen);
    reader
        .read(&CancellationToken::new(), move |result: ReadResult| -> Result<(), SinkError> {
            assert!(result.partition_token.is_empty());
            *counter.lock() += 1;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock(), 2);
}

#[tokio::test]
async fn test_replayed_traversal() {
    let temp_dir = tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf()).unwrap();

    let line = |row: Result<Row, String>| {
        serde_json::to_string(&row.unwrap().into_columns()).unwrap()
    };
    create_dir_all(dir.join(PARTITIONS_DIR)).unwrap();
    write(
        dir.join(ROOT_FILE),
        line(children_row(&[("left", &[]), ("right", &[])])),
    )
    .unwrap();
    write(
        dir.join(PARTITIONS_DIR).join("left.jsonl"),
        format!(
            "{}\n{}\n",
            line(data_row("l")),
            line(children_row(&[("merged", &["left", "right"])]))
        ),
    )
    .unwrap();
    write(
        dir.join(PARTITIONS_DIR).join("right.jsonl"),
        line(children_row(&[("merged", &["left", "right"])])),
    )
    .unwrap();
    write(dir.join(PARTITIONS_DIR).join("merged.jsonl"), line(data_row("m"))).unwrap();

    let reader = Reader::new(&config(Dialect::GoogleSql), ReplayExecutor::new(dir)).unwrap();
    let sink = CollectingSink::default();

    reader
        .read(&CancellationToken::new(), sink.clone())
        .await
        .unwrap();

    assert_eq!(sink.tables("merged"), vec!["m"]);
    assert_eq!(reader.registry_stats().finished, 4);
}
