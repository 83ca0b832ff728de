//! Database-dialect capability
//!
//! All vendor-specific SQL lives behind the [`Dialect`] trait: bootstrap
//! DDL, capture-trigger maintenance, row mutations driven by a table
//! description, ad-hoc statement execution and bulk imports. Dialects are
//! registered once at startup in a [`DialectRegistry`] keyed by identifier —
//! no per-call plugin lookup.

use crate::common::pool::DbConnection;
use crate::common::record::TableRef;
use crate::common::{ReplError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Description of one column of a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    /// Column name
    pub name: String,
    /// Vendor type name
    pub type_name: String,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Whether the column is part of the primary key
    pub primary_key: bool,
    /// Table referenced by a foreign key on this column, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_table: Option<String>,
}

impl ColumnDescription {
    /// Create a plain nullable column.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key: false,
            fk_table: None,
        }
    }

    /// Mark as primary key.
    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark as foreign key referencing another table.
    pub fn references(mut self, table: impl Into<String>) -> Self {
        self.fk_table = Some(table.into());
        self
    }

    /// Whether this column declares a foreign key.
    pub fn is_fk(&self) -> bool {
        self.fk_table.is_some()
    }
}

/// Structural description of one target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    /// Table coordinates
    pub table: TableRef,
    /// Column descriptions in ordinal order
    pub columns: Vec<ColumnDescription>,
}

impl TableDescription {
    /// Create a description.
    pub fn new(table: TableRef, columns: Vec<ColumnDescription>) -> Self {
        Self { table, columns }
    }

    /// Tables this one references through foreign keys, self-references
    /// excluded.
    pub fn foreign_tables(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| c.fk_table.as_deref())
            .filter(|t| !t.eq_ignore_ascii_case(&self.table.name))
            .collect()
    }

    /// Look up a column by name, case-insensitively.
    pub fn column(&self, name: &str) -> Option<&ColumnDescription> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Schema introspection, the only capability the dependency resolver needs.
#[async_trait]
pub trait SchemaIntrospect: Send + Sync {
    /// Describe a table on the master, including its foreign keys.
    async fn describe(&self, table: &TableRef) -> Result<TableDescription>;
}

/// Outcome of a pre-statement hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    /// Execute the row operation
    Proceed,
    /// Suppress the row operation; the post hook still runs
    Skip,
}

/// Vendor-specific operations consumed by the engine.
#[async_trait]
pub trait Dialect: Send + Sync {
    /// Identifier this dialect registers under ("oracle", "postgres", ...).
    fn id(&self) -> &'static str;

    /// One-time setup of replication support objects on a database.
    async fn bootstrap(&self, conn: &mut dyn DbConnection) -> Result<()>;

    /// Describe a table on the target.
    async fn describe_table(
        &self,
        conn: &mut dyn DbConnection,
        table: &TableRef,
    ) -> Result<TableDescription>;

    /// Generate the CREATE TABLE statement for a description.
    fn create_table_sql(&self, description: &TableDescription) -> Result<String>;

    /// Create or repair the capture trigger for a table.
    async fn ensure_trigger(
        &self,
        conn: &mut dyn DbConnection,
        table: &TableRef,
        trigger_name: &str,
    ) -> Result<()>;

    /// Whether a table exists on the target.
    async fn table_exists(&self, conn: &mut dyn DbConnection, table: &TableRef) -> Result<bool>;

    /// Drop a table. Returns false when it did not exist.
    async fn drop_table(&self, conn: &mut dyn DbConnection, table: &TableRef) -> Result<bool>;

    /// Remove every row from a table, keeping its structure.
    async fn truncate_table(&self, conn: &mut dyn DbConnection, table: &TableRef) -> Result<()>;

    /// Insert a row according to the description.
    async fn insert(
        &self,
        conn: &mut dyn DbConnection,
        description: &TableDescription,
        row: &serde_json::Value,
    ) -> Result<()>;

    /// Update a row according to the description.
    async fn update(
        &self,
        conn: &mut dyn DbConnection,
        description: &TableDescription,
        old_row: Option<&serde_json::Value>,
        new_row: &serde_json::Value,
    ) -> Result<()>;

    /// Delete a row according to the description.
    async fn delete(
        &self,
        conn: &mut dyn DbConnection,
        description: &TableDescription,
        old_row: &serde_json::Value,
    ) -> Result<()>;

    /// Execute raw DDL/DML (CREATE/DROP/TRUNCATE handling).
    async fn execute_ddl(&self, conn: &mut dyn DbConnection, sql: &str) -> Result<()>;

    /// Execute an ad-hoc statement, returning the raw result capped at
    /// `max_entries` rows (0 = uncapped).
    async fn execute_statement(
        &self,
        conn: &mut dyn DbConnection,
        sql: &str,
        max_entries: u64,
    ) -> Result<String>;

    /// Drop every object in a schema.
    async fn wipe_schema(
        &self,
        conn: &mut dyn DbConnection,
        catalog: Option<&str>,
        schema: &str,
    ) -> Result<()>;

    /// Replay a bulk dump file against the target.
    async fn import_dump(&self, conn: &mut dyn DbConnection, path: &str) -> Result<()>;

    /// Block until the vendor change-event primitive fires or the timeout
    /// elapses. Returns true when an event was signaled. Polling dialects
    /// may simply sleep and return true.
    async fn wait_for_event(&self, master_id: &str, timeout: Duration) -> Result<bool>;
}

/// Startup-time dialect registry keyed by identifier.
#[derive(Default)]
pub struct DialectRegistry {
    dialects: HashMap<&'static str, Arc<dyn Dialect>>,
}

impl DialectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialect under its own id. Re-registering an id replaces
    /// the previous entry.
    pub fn register(&mut self, dialect: Arc<dyn Dialect>) {
        self.dialects.insert(dialect.id(), dialect);
    }

    /// Resolve a dialect by id.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Dialect>> {
        self.dialects
            .get(id)
            .cloned()
            .ok_or_else(|| ReplError::config(format!("unknown dialect '{id}'")))
    }

    /// Registered dialect ids.
    pub fn ids(&self) -> Vec<&'static str> {
        self.dialects.keys().copied().collect()
    }
}
