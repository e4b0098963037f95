//! Events emitted to the downstream sink.

use serde::{Deserialize, Serialize};

use super::changeset::{Changeset, ChangesetData};

/// One event as accepted by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `<prefix>/<table>.<verb>` or `<prefix>/<verb>`.
    pub name: String,
    /// The record's payload.
    pub data: serde_json::Value,
    /// Server time of the record in Unix milliseconds.
    pub ts: i64,
}

/// Name of the event emitted for `changeset`.
#[must_use]
pub fn event_name(prefix: &str, changeset: &Changeset) -> String {
    let verb = changeset.operation.verb();
    match changeset.data.table.as_deref() {
        Some(table) if !table.is_empty() => format!("{prefix}/{table}.{verb}"),
        _ => format!("{prefix}/{verb}"),
    }
}

impl Event {
    /// Convert a change record into an event.
    ///
    /// # Errors
    ///
    /// Fails only if the payload cannot be represented as JSON.
    pub fn from_changeset(prefix: &str, changeset: &Changeset) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: event_name(prefix, changeset),
            data: serde_json::to_value(&changeset.data)?,
            ts: changeset.watermark.server_time_ms,
        })
    }

    /// Decode the payload back into its typed form.
    ///
    /// # Errors
    ///
    /// Fails if `data` was not produced from a [`ChangesetData`].
    pub fn payload(&self) -> Result<ChangesetData, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}
