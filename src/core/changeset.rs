//! Change records produced by a logical replication source.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Position in the upstream change stream.
///
/// Ordered by LSN first, then by server time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// Log sequence number.
    pub lsn: u64,
    /// Server time of the record, in Unix milliseconds.
    pub server_time_ms: i64,
}

impl Watermark {
    /// Create a watermark.
    #[must_use]
    pub const fn new(lsn: u64, server_time_ms: i64) -> Self {
        Self {
            lsn,
            server_time_ms,
        }
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lsn
            .cmp(&other.lsn)
            .then(self.server_time_ms.cmp(&other.server_time_ms))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.lsn >> 32, self.lsn & 0xFFFF_FFFF)
    }
}

/// Kind of change carried by a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    /// Transaction start.
    Begin,
    /// Transaction commit.
    Commit,
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
    /// Table(s) truncated.
    Truncate,
    /// Any operation this crate has no dedicated variant for.
    Other(String),
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Other(op) => op,
        }
    }

    /// Verb used in event names.
    #[must_use]
    pub fn verb(&self) -> String {
        match self {
            Self::Begin => "tx-began".to_string(),
            Self::Commit => "tx-committed".to_string(),
            Self::Insert => "inserted".to_string(),
            Self::Update => "updated".to_string(),
            Self::Delete => "deleted".to_string(),
            Self::Truncate => "truncated".to_string(),
            Self::Other(op) => op.to_lowercase(),
        }
    }

    /// Whether the operation modifies rows.
    #[must_use]
    pub const fn is_dml(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::Truncate
        )
    }
}

impl From<String> for Operation {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "TRUNCATE" => Self::Truncate,
            _ => Self::Other(value),
        }
    }
}

impl From<Operation> for String {
    fn from(value: Operation) -> Self {
        match value {
            Operation::Other(op) => op,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a column value is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// SQL NULL.
    #[serde(rename = "n")]
    Null,
    /// Unchanged TOAST value; the data is not sent.
    #[serde(rename = "u")]
    UnchangedToast,
    /// Text representation.
    #[serde(rename = "t")]
    Text,
    /// Base64 encoded binary.
    #[serde(rename = "b")]
    Binary,
    /// Integer.
    #[serde(rename = "i")]
    Integer,
    /// Floating point.
    #[serde(rename = "f")]
    Float,
}

/// One column of a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    /// Encoding of `data`.
    pub encoding: Encoding,
    /// Raw value as received.
    pub data: serde_json::Value,
}

/// A column value interpreted according to its encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// SQL NULL.
    Null,
    /// The value did not change and was not transmitted.
    Unchanged,
    /// Text.
    Text(String),
    /// Binary bytes.
    Bytes(Vec<u8>),
    /// Integer.
    Integer(i64),
    /// Float.
    Float(f64),
}

/// A column value whose data does not match its encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("column encoded as {encoding:?} has invalid data: {reason}")]
pub struct DecodeError {
    /// Declared encoding.
    pub encoding: Encoding,
    /// What went wrong.
    pub reason: String,
}

impl ColumnValue {
    /// Build a text column.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            encoding: Encoding::Text,
            data: serde_json::Value::String(value.into()),
        }
    }

    /// Build an integer column.
    #[must_use]
    pub fn integer(value: i64) -> Self {
        Self {
            encoding: Encoding::Integer,
            data: serde_json::Value::from(value),
        }
    }

    /// Build a NULL column.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            encoding: Encoding::Null,
            data: serde_json::Value::Null,
        }
    }

    /// Interpret `data` according to `encoding`.
    ///
    /// Integers and floats are accepted either as JSON numbers or as their text form.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the data does not fit the encoding.
    pub fn decode(&self) -> Result<DecodedValue, DecodeError> {
        let fail = |reason: &str| DecodeError {
            encoding: self.encoding,
            reason: reason.to_string(),
        };

        match self.encoding {
            Encoding::Null => Ok(DecodedValue::Null),
            Encoding::UnchangedToast => Ok(DecodedValue::Unchanged),
            Encoding::Text => self
                .data
                .as_str()
                .map(|s| DecodedValue::Text(s.to_string()))
                .ok_or_else(|| fail("expected a string")),
            Encoding::Binary => {
                let raw = self.data.as_str().ok_or_else(|| fail("expected a string"))?;
                STANDARD
                    .decode(raw)
                    .map(DecodedValue::Bytes)
                    .map_err(|e| fail(&e.to_string()))
            }
            Encoding::Integer => match &self.data {
                serde_json::Value::Number(n) => {
                    n.as_i64().map(DecodedValue::Integer).ok_or_else(|| fail("out of range"))
                }
                serde_json::Value::String(s) => s
                    .parse()
                    .map(DecodedValue::Integer)
                    .map_err(|e: std::num::ParseIntError| fail(&e.to_string())),
                _ => Err(fail("expected a number")),
            },
            Encoding::Float => match &self.data {
                serde_json::Value::Number(n) => {
                    n.as_f64().map(DecodedValue::Float).ok_or_else(|| fail("not a float"))
                }
                serde_json::Value::String(s) => s
                    .parse()
                    .map(DecodedValue::Float)
                    .map_err(|e: std::num::ParseFloatError| fail(&e.to_string())),
                _ => Err(fail("expected a number")),
            },
        }
    }
}

/// Column name to value.
pub type ColumnMap = BTreeMap<String, ColumnValue>;

/// Operation-specific payload of a change record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesetData {
    /// Affected table, absent for transaction markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Tables affected by a TRUNCATE.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated_tables: Vec<String>,
    /// Tuple before the change (UPDATE/DELETE with replica identity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<ColumnMap>,
    /// Tuple after the change (INSERT/UPDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<ColumnMap>,
    /// Commit LSN of the enclosing transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_lsn: Option<u64>,
    /// Commit time of the enclosing transaction in Unix milliseconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_commit_time_ms: Option<i64>,
}

/// One record of the change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Stream position of this record.
    pub watermark: Watermark,
    /// Kind of change.
    pub operation: Operation,
    /// Operation payload.
    pub data: ChangesetData,
}

impl Changeset {
    /// Create a record without payload.
    #[must_use]
    pub fn new(watermark: Watermark, operation: Operation) -> Self {
        Self {
            watermark,
            operation,
            data: ChangesetData::default(),
        }
    }

    /// Set the affected table.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.data.table = Some(table.into());
        self
    }

    /// Set the new tuple.
    #[must_use]
    pub fn with_new(mut self, columns: ColumnMap) -> Self {
        self.data.new = Some(columns);
        self
    }

    /// Set the old tuple.
    #[must_use]
    pub fn with_old(mut self, columns: ColumnMap) -> Self {
        self.data.old = Some(columns);
        self
    }
}
