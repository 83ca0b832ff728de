//! Name mapping between source and target
//!
//! Source and target rarely share coordinates exactly: catalogs differ,
//! schemas get consolidated, columns get renamed. The applier resolves every
//! record through a [`TableMapper`] before touching the target database.

use crate::common::record::TableRef;
use std::collections::HashMap;

/// Maps source table coordinates and column names to their target
/// counterparts.
pub trait TableMapper: Send + Sync {
    /// Target coordinates for a source table.
    fn map_table(&self, source: &TableRef) -> TableRef;

    /// Target name for a source column of a source table.
    fn map_column(&self, source: &TableRef, column: &str) -> String;

    /// Apply column renames to a JSON row object. Non-object payloads pass
    /// through unchanged.
    fn map_row(&self, source: &TableRef, row: &serde_json::Value) -> serde_json::Value {
        let serde_json::Value::Object(fields) = row else {
            return row.clone();
        };
        let mapped = fields
            .iter()
            .map(|(k, v)| (self.map_column(source, k), v.clone()))
            .collect();
        serde_json::Value::Object(mapped)
    }
}

/// Mapper configured from explicit overrides; anything not overridden maps
/// to itself.
#[derive(Default)]
pub struct DefaultMapper {
    catalog: Option<String>,
    schema: Option<String>,
    tables: HashMap<String, String>,
    columns: HashMap<(String, String), String>,
}

impl DefaultMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every record into one target catalog.
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Map every record into one target schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Rename one table.
    pub fn with_table(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.tables
            .insert(source.into().to_ascii_lowercase(), target.into());
        self
    }

    /// Rename one column of one table.
    pub fn with_column(
        mut self,
        table: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.columns.insert(
            (
                table.into().to_ascii_lowercase(),
                source.into().to_ascii_lowercase(),
            ),
            target.into(),
        );
        self
    }
}

impl TableMapper for DefaultMapper {
    fn map_table(&self, source: &TableRef) -> TableRef {
        let name = self
            .tables
            .get(&source.name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| source.name.clone());
        TableRef::new(
            self.catalog.clone().unwrap_or_else(|| source.catalog.clone()),
            self.schema.clone().unwrap_or_else(|| source.schema.clone()),
            name,
        )
    }

    fn map_column(&self, source: &TableRef, column: &str) -> String {
        self.columns
            .get(&(
                source.name.to_ascii_lowercase(),
                column.to_ascii_lowercase(),
            ))
            .cloned()
            .unwrap_or_else(|| column.to_string())
    }
}
