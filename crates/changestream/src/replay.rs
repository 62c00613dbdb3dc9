//! File-backed query executor
//!
//! Serves previously recorded change stream rows instead of querying a
//! database. Each partition lives in its own JSON-lines file: `root.jsonl` for
//! the root partition and `partitions/<token>.jsonl` for every other one, so
//! no token can shadow the root recording. Each line is a JSON array holding
//! the row's column values.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use crate::query::{PartitionQuery, QueryError, QueryExecutor, Row, RowStream};

pub const ROOT_FILE: &str = "root.jsonl";

pub const PARTITIONS_DIR: &str = "partitions";

#[derive(Clone, Debug)]
pub struct ReplayExecutor {
    dir: Utf8PathBuf,
}

impl ReplayExecutor {
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn partition_file(&self, query: &PartitionQuery) -> Result<Utf8PathBuf, QueryError> {
        let Some(token) = &query.partition_token else {
            return Ok(self.dir.join(ROOT_FILE));
        };

        if token.is_empty() || token.contains(['/', '\\']) || token.contains("..") {
            return Err(QueryError::Open(format!(
                "partition token {token:?} cannot be mapped to a replay file"
            )));
        }

        Ok(self.dir.join(PARTITIONS_DIR).join(format!("{token}.jsonl")))
    }
}

#[async_trait]
impl QueryExecutor for ReplayExecutor {
    async fn open(&self, query: &PartitionQuery) -> Result<RowStream, QueryError> {
        let path = self.partition_file(query)?;

        let file = File::open(&path)
            .await
            .map_err(|err| QueryError::Open(format!("{path}: {err}")))?;

        debug!(%path, partition_token = %query.token(), "Replaying partition");

        let lines = LinesStream::new(BufReader::new(file).lines());

        let rows = lines.filter_map(move |line| {
            let row = match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(parse_row(&line)),
                Err(err) => Some(Err(QueryError::Io(err))),
            };
            async move { row }
        });

        Ok(rows.boxed())
    }
}

fn parse_row(line: &str) -> Result<Row, QueryError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Array(columns)) => Ok(Row::new(columns)),
        Ok(_) => Err(QueryError::Stream(
            "replayed row is not a JSON array of columns".to_owned(),
        )),
        Err(err) => Err(QueryError::Stream(format!("malformed replayed row: {err}"))),
    }
}
