//! Table watch registration
//!
//! One `TableWatch` per (catalog, schema, table) tuple registered for
//! capture. The watch tracks which row actions are replicated, the state of
//! the capture trigger on the master, and the bootstrap position assigned by
//! the dependency resolver.

use crate::common::record::TableRef;
use serde::{Deserialize, Serialize};

/// Subset of row actions replicated for one table.
///
/// An empty set means the table is registered but not replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicatedActions {
    /// Replicate inserts
    pub insert: bool,
    /// Replicate updates
    pub update: bool,
    /// Replicate deletes
    pub delete: bool,
}

impl ReplicatedActions {
    /// All three row actions.
    pub fn all() -> Self {
        Self {
            insert: true,
            update: true,
            delete: true,
        }
    }

    /// No replication at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether any action is replicated.
    pub fn is_replicated(&self) -> bool {
        self.insert || self.update || self.delete
    }

    /// Compact "IDU" flag notation: one letter per enabled action.
    pub fn to_flags(&self) -> String {
        let mut s = String::with_capacity(3);
        if self.insert {
            s.push('I');
        }
        if self.delete {
            s.push('D');
        }
        if self.update {
            s.push('U');
        }
        s
    }

    /// Parse "IDU" flag notation; unknown letters are ignored.
    pub fn from_flags(flags: &str) -> Self {
        let mut actions = Self::none();
        for c in flags.chars() {
            match c.to_ascii_uppercase() {
                'I' => actions.insert = true,
                'D' => actions.delete = true,
                'U' => actions.update = true,
                _ => {}
            }
        }
        actions
    }
}

/// Lifecycle status of a capture trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchStatus {
    /// Registered, trigger not yet confirmed on the master
    Creating,
    /// Trigger confirmed present, capture active
    Ok,
    /// Capture disabled, pending removal
    Remove,
}

/// A table registered for capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableWatch {
    /// Table coordinates
    pub table: TableRef,
    /// Actions replicated for this table
    pub actions: ReplicatedActions,
    /// Name of the capture trigger, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_name: Option<String>,
    /// Trigger lifecycle status
    pub status: WatchStatus,
    /// Position in the bootstrap order; -1 until resolved or when the
    /// table could not be ordered
    pub bootstrap_sequence: i64,
}

impl TableWatch {
    /// Register a table with all row actions enabled.
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            actions: ReplicatedActions::all(),
            trigger_name: None,
            status: WatchStatus::Creating,
            bootstrap_sequence: -1,
        }
    }

    /// Restrict the replicated actions.
    pub fn with_actions(mut self, actions: ReplicatedActions) -> Self {
        self.actions = actions;
        self
    }

    /// Mark the capture trigger confirmed.
    pub fn confirm_trigger(&mut self, trigger_name: impl Into<String>) {
        self.trigger_name = Some(trigger_name.into());
        self.status = WatchStatus::Ok;
    }

    /// Mark the watch for removal.
    pub fn mark_removed(&mut self) {
        self.status = WatchStatus::Remove;
    }

    /// Whether the resolver assigned this table a bootstrap position.
    pub fn is_ordered(&self) -> bool {
        self.bootstrap_sequence >= 0
    }
}
