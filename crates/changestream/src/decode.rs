//! Row decoding strategies
//!
//! The database exposes change streams through two SQL dialects that encode the
//! same logical records differently:
//!
//! - **GoogleSQL** returns a single `ChangeRecord` column holding an array of
//!   fully typed record structs.
//! - **PostgreSQL** returns a single JSONB column holding one record object,
//!   with at most one record of each kind.
//!
//! The dialect is chosen once per reader. The traversal engine only ever sees
//! the decoded [`ReadResult`].

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::query::Row;
use crate::record::{ChangeRecord, ChildPartitionsRecord, DataChangeRecord, HeartbeatRecord, ReadResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    #[default]
    GoogleSql,
    PostgreSql,
}

#[derive(Debug, Error)]
#[error("unsupported database dialect: {0:?}")]
pub struct UnsupportedDialect(pub String);

impl FromStr for Dialect {
    type Err = UnsupportedDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "googlesql" | "google_standard_sql" => Ok(Self::GoogleSql),
            "postgresql" | "postgres" => Ok(Self::PostgreSql),
            _ => Err(UnsupportedDialect(s.to_owned())),
        }
    }
}

impl Display for Dialect {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GoogleSql => "googlesql",
            Self::PostgreSql => "postgresql",
        })
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("row has no column {0}")]
    MissingColumn(usize),

    #[error("expected {expected} in column {index}, found {found}")]
    UnexpectedColumn {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed change record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shape of a PostgreSQL change record before it is widened into [`ChangeRecord`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PostgresChangeRecord {
    data_change_record: Option<DataChangeRecord>,
    heartbeat_record: Option<HeartbeatRecord>,
    child_partitions_record: Option<ChildPartitionsRecord>,
}

impl From<PostgresChangeRecord> for ChangeRecord {
    fn from(record: PostgresChangeRecord) -> Self {
        Self {
            data_change_records: record.data_change_record.into_iter().collect(),
            heartbeat_records: record.heartbeat_record.into_iter().collect(),
            child_partitions_records: record.child_partitions_record.into_iter().collect(),
        }
    }
}

impl Dialect {
    /// Decodes one row read from `partition_token`.
    pub fn decode(self, partition_token: &str, row: Row) -> Result<ReadResult, DecodeError> {
        let column = row
            .into_columns()
            .into_iter()
            .next()
            .ok_or(DecodeError::MissingColumn(0))?;

        let change_records = match self {
            Self::GoogleSql => decode_google_sql(column)?,
            Self::PostgreSql => vec![decode_postgres(column)?],
        };

        Ok(ReadResult::new(partition_token.to_owned(), change_records))
    }
}

fn decode_google_sql(column: Value) -> Result<Vec<ChangeRecord>, DecodeError> {
    match column {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => Ok(Vec::<ChangeRecord>::deserialize(column)?),
        other => Err(DecodeError::UnexpectedColumn {
            index: 0,
            expected: "an array of change records",
            found: kind(&other),
        }),
    }
}

fn decode_postgres(column: Value) -> Result<ChangeRecord, DecodeError> {
    let record: PostgresChangeRecord = match column {
        // JSONB may arrive still serialized.
        Value::String(raw) => serde_json::from_str(&raw)?,
        Value::Object(_) => PostgresChangeRecord::deserialize(column)?,
        other => {
            return Err(DecodeError::UnexpectedColumn {
                index: 0,
                expected: "a JSON change record",
                found: kind(&other),
            })
        }
    };

    Ok(record.into())
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
