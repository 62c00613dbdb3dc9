//! Change stream record payloads
//!
//! Plain transfer objects decoded from one change stream row. Field names follow
//! the column names of the change stream table-valued function, so the same
//! shapes deserialize from both the typed (GoogleSQL) and the JSON (PostgreSQL)
//! row encodings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Commit and partition timestamps, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Everything decoded from a single row of one partition's stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    pub partition_token: String,
    #[serde(rename = "change_record", default, deserialize_with = "null_as_default")]
    pub change_records: Vec<ChangeRecord>,
}

impl ReadResult {
    #[must_use]
    pub const fn new(partition_token: String, change_records: Vec<ChangeRecord>) -> Self {
        Self {
            partition_token,
            change_records,
        }
    }

    /// Child partition announcements carried by this result, in row order.
    pub fn child_partitions_records(&self) -> impl Iterator<Item = &ChildPartitionsRecord> {
        self.change_records
            .iter()
            .flat_map(|record| record.child_partitions_records.iter())
    }
}

/// A single unit of the change stream.
///
/// At most one of the lists is non-empty in practice, but the stream schema
/// allows all three.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "data_change_record", default, deserialize_with = "null_as_default")]
    pub data_change_records: Vec<DataChangeRecord>,
    #[serde(rename = "heartbeat_record", default, deserialize_with = "null_as_default")]
    pub heartbeat_records: Vec<HeartbeatRecord>,
    #[serde(
        rename = "child_partitions_record",
        default,
        deserialize_with = "null_as_default"
    )]
    pub child_partitions_records: Vec<ChildPartitionsRecord>,
}

/// A set of changes committed to one table in one transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChangeRecord {
    pub commit_timestamp: Timestamp,
    pub record_sequence: String,
    pub server_transaction_id: String,
    pub is_last_record_in_transaction_in_partition: bool,
    pub table_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub column_types: Vec<ColumnType>,
    #[serde(deserialize_with = "null_as_default")]
    pub mods: Vec<Mod>,
    pub mod_type: String,
    pub value_capture_type: String,
    pub number_of_records_in_transaction: i64,
    pub number_of_partitions_in_transaction: i64,
    pub transaction_tag: String,
    pub is_system_transaction: bool,
}

/// Column metadata attached to a data change record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnType {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: Option<Value>,
    pub is_primary_key: bool,
    pub ordinal_position: i64,
}

/// One modified row: its keys plus old and new column values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mod {
    pub keys: Option<Value>,
    pub new_values: Option<Value>,
    pub old_values: Option<Value>,
}

/// Emitted when a partition has had no changes for a heartbeat interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub timestamp: Timestamp,
}

/// Announcement of the partitions continuing the stream after this one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPartitionsRecord {
    pub start_timestamp: Timestamp,
    #[serde(default)]
    pub record_sequence: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub child_partitions: Vec<ChildPartition>,
}

/// A child partition and every parent it must wait on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPartition {
    pub token: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parent_partition_tokens: Vec<String>,
}

/// Treats an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
