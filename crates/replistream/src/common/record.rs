//! Change record representation
//!
//! Unified record structure for everything that flows through a replication
//! stream: row mutations, schema mutations, ad-hoc statements and bulk dumps.
//!
//! ## Sequencing
//!
//! Every record produced by one master carries a strictly increasing
//! `sequence` (the replication key). Sequence values are never reused; all
//! records of one database transaction share the same `transaction_id` in
//! the order produced. Control records injected by the engine itself (end of
//! transition, end of data) may carry no sequence at all.

use crate::common::bus::BusMessage;
use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known record attribute keys.
///
/// Attributes travel as string key/value pairs on the message bus; these
/// constants are the only keys the engine reads or writes.
pub mod attr {
    /// Replication sequence ("replication key") of the record
    pub const SEQUENCE: &str = "_sequence";
    /// Transaction id shared by all records of one master transaction
    pub const TRANSACTION_ID: &str = "_transactionId";
    /// Record was already applied once; redelivery must be a no-op
    pub const ALREADY_PROCESSED: &str = "_alreadyProcessed";
    /// Marks the end of the initial-sync transition window
    pub const END_OF_TRANSITION: &str = "_endOfTransition";
    /// Marks the end of an out-of-band bulk snapshot delivery
    pub const END_OF_DATA: &str = "_endOfData";
    /// Directory for records that must be stored locally (manual transfer)
    pub const MANUAL_TRANSFER_LOCATION: &str = "_manualTransferLocation";
    /// Sub-directory id for manual-transfer chunks
    pub const DUMP_ID: &str = "_dumpId";
    /// The applier must keep the current transaction open across units
    pub const KEEP_TRANSACTION_OPEN: &str = "_keepTransactionOpen";
    /// Correlation id of a broadcast statement
    pub const STATEMENT_ID: &str = "_statementId";
    /// Reply topic for broadcast statement responses
    pub const SQL_TOPIC: &str = "_sqlTopic";
    /// Row cap for broadcast statement responses
    pub const MAX_ENTRIES: &str = "_maxEntries";
    /// Exception text attached to a failed statement response
    pub const EXCEPTION: &str = "_exception";
    /// File name carried by dump records
    pub const FILENAME: &str = "_filename";
}

/// Fully qualified table coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Catalog name (may be empty for databases without catalogs)
    pub catalog: String,
    /// Schema name
    pub schema: String,
    /// Table name
    pub name: String,
}

impl TableRef {
    /// Create a new table reference.
    pub fn new(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `schema.name`, or just `name` when no schema is set.
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Action carried by a change record.
///
/// A closed set: the applier matches exhaustively, so a new action is a
/// compile error until every consumer handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplAction {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Table created
    Create,
    /// Table dropped
    Drop,
    /// Table structurally altered
    Alter,
    /// Ad-hoc SQL statement broadcast
    Statement,
    /// Bulk file-based dump import
    Dump,
}

impl ReplAction {
    /// Check if this is a row-level mutation (INSERT/UPDATE/DELETE).
    pub fn is_row_mutation(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

impl std::fmt::Display for ReplAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Create => "CREATE",
            Self::Drop => "DROP",
            Self::Alter => "ALTER",
            Self::Statement => "STATEMENT",
            Self::Dump => "DUMP",
        };
        write!(f, "{s}")
    }
}

/// A single captured change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Replication sequence, strictly increasing per master.
    /// Control records injected by the engine may carry none.
    pub sequence: Option<u64>,
    /// Transaction id shared by records of one master transaction
    pub transaction_id: String,
    /// Source table coordinates
    pub table: TableRef,
    /// Action to replay
    pub action: ReplAction,
    /// New row state (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<serde_json::Value>,
    /// Old row state (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content: Option<serde_json::Value>,
    /// Producer-assigned row key, carried for transports that publish
    /// key-only records. The applier does not resolve rows from it:
    /// deletes still require `old_content` and fail without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    /// Control flags and routing attributes
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ChangeRecord {
    /// Create a new record with the given action.
    pub fn new(table: TableRef, action: ReplAction) -> Self {
        Self {
            sequence: None,
            transaction_id: String::new(),
            table,
            action,
            new_content: None,
            old_content: None,
            guid: None,
            attributes: HashMap::new(),
        }
    }

    /// Create an INSERT record.
    pub fn insert(table: TableRef, new_content: serde_json::Value) -> Self {
        let mut rec = Self::new(table, ReplAction::Insert);
        rec.new_content = Some(new_content);
        rec
    }

    /// Create an UPDATE record.
    pub fn update(
        table: TableRef,
        old_content: Option<serde_json::Value>,
        new_content: serde_json::Value,
    ) -> Self {
        let mut rec = Self::new(table, ReplAction::Update);
        rec.old_content = old_content;
        rec.new_content = Some(new_content);
        rec
    }

    /// Create a DELETE record.
    pub fn delete(table: TableRef, old_content: serde_json::Value) -> Self {
        let mut rec = Self::new(table, ReplAction::Delete);
        rec.old_content = Some(old_content);
        rec
    }

    /// Create an engine-injected end-of-transition control record.
    pub fn end_of_transition(table: TableRef) -> Self {
        let mut rec = Self::new(table, ReplAction::Statement);
        rec.set_flag(attr::END_OF_TRANSITION);
        rec
    }

    /// Set the sequence.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Set the transaction id.
    pub fn with_transaction_id(mut self, txn_id: impl Into<String>) -> Self {
        self.transaction_id = txn_id.into();
        self
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Set a boolean flag attribute to true.
    pub fn set_flag(&mut self, key: &str) {
        self.attributes.insert(key.to_string(), "true".to_string());
    }

    /// Read a boolean flag attribute; absent means false.
    pub fn flag(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Read a string attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// Check the already-processed redelivery marker.
    pub fn already_processed(&self) -> bool {
        self.flag(attr::ALREADY_PROCESSED)
    }

    /// Check the end-of-transition control marker.
    pub fn is_end_of_transition(&self) -> bool {
        self.flag(attr::END_OF_TRANSITION)
    }

    /// Check the end-of-data control marker.
    pub fn is_end_of_data(&self) -> bool {
        self.flag(attr::END_OF_DATA)
    }

    /// Location for records that must be stored locally, if any.
    pub fn manual_transfer_location(&self) -> Option<&str> {
        self.attribute(attr::MANUAL_TRANSFER_LOCATION)
    }

    /// Check the keep-transaction-open marker.
    pub fn keep_transaction_open(&self) -> bool {
        self.flag(attr::KEEP_TRANSACTION_OPEN)
    }

    /// Convert to a bus message for topic publishing.
    pub fn to_message(&self) -> Result<BusMessage> {
        let payload = serde_json::to_vec(self)?;
        let mut msg = BusMessage::new(bytes::Bytes::from(payload));
        if let Some(seq) = self.sequence {
            msg = msg.with_attribute(attr::SEQUENCE, seq.to_string());
        }
        msg = msg
            .with_attribute(attr::TRANSACTION_ID, self.transaction_id.clone())
            .with_attribute("table", self.table.qualified_name())
            .with_attribute("action", self.action.to_string());
        Ok(msg)
    }

    /// Topic name for this record: `repl.{catalog}.{schema}.{table}`.
    pub fn topic_name(&self) -> String {
        format!(
            "repl.{}.{}.{}",
            self.table.catalog, self.table.schema, self.table.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> TableRef {
        TableRef::new("db", "public", "users")
    }

    #[test]
    fn test_insert_record() {
        let rec = ChangeRecord::insert(users(), json!({"id": 1, "name": "Alice"}))
            .with_sequence(7)
            .with_transaction_id("txn-1");

        assert_eq!(rec.action, ReplAction::Insert);
        assert_eq!(rec.sequence, Some(7));
        assert!(rec.new_content.is_some());
        assert!(rec.old_content.is_none());
        assert_eq!(rec.topic_name(), "repl.db.public.users");
    }

    #[test]
    fn test_update_delete_payloads() {
        let upd = ChangeRecord::update(users(), Some(json!({"id": 1})), json!({"id": 2}));
        assert!(upd.old_content.is_some() && upd.new_content.is_some());

        let del = ChangeRecord::delete(users(), json!({"id": 1}));
        assert!(del.old_content.is_some() && del.new_content.is_none());
    }

    #[test]
    fn test_flags_default_false() {
        let rec = ChangeRecord::new(users(), ReplAction::Create);
        assert!(!rec.already_processed());
        assert!(!rec.is_end_of_transition());
        assert!(!rec.keep_transaction_open());
    }

    #[test]
    fn test_flag_roundtrip() {
        let mut rec = ChangeRecord::new(users(), ReplAction::Insert);
        rec.set_flag(attr::ALREADY_PROCESSED);
        assert!(rec.already_processed());

        let rec = rec.with_attribute(attr::MANUAL_TRANSFER_LOCATION, "/var/repl/chunks");
        assert_eq!(rec.manual_transfer_location(), Some("/var/repl/chunks"));
    }

    #[test]
    fn test_end_of_transition_record() {
        let rec = ChangeRecord::end_of_transition(users());
        assert!(rec.is_end_of_transition());
        assert!(rec.sequence.is_none());
    }

    #[test]
    fn test_action_is_row_mutation() {
        assert!(ReplAction::Insert.is_row_mutation());
        assert!(ReplAction::Update.is_row_mutation());
        assert!(ReplAction::Delete.is_row_mutation());
        assert!(!ReplAction::Create.is_row_mutation());
        assert!(!ReplAction::Statement.is_row_mutation());
    }

    #[test]
    fn test_serialization_omits_empty_payloads() {
        let rec = ChangeRecord::new(users(), ReplAction::Drop);
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("new_content"));
        assert!(!json.contains("old_content"));

        let parsed: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.action, ReplAction::Drop);
    }

    #[test]
    fn test_to_message_attributes() {
        let rec = ChangeRecord::insert(users(), json!({"id": 1}))
            .with_sequence(42)
            .with_transaction_id("t-9");
        let msg = rec.to_message().unwrap();
        assert_eq!(msg.attribute(attr::SEQUENCE), Some("42"));
        assert_eq!(msg.attribute("action"), Some("INSERT"));
        assert!(!msg.payload.is_empty());
    }
}
