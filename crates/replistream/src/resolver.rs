//! Table dependency resolver
//!
//! Computes a safe creation/bootstrap order for the watched tables from
//! their foreign-key topology: every table referencing another (non-self)
//! table appears after the table it references. The order decides what the
//! initial snapshot contains and which `bootstrap_sequence` the applier's
//! CREATE handling consumes.
//!
//! The algorithm is an iterative sweep over the unresolved descriptions
//! rather than an explicit graph: a table is ready once every foreign key it
//! declares points at an already-resolved table or at a table outside the
//! watched set (which replication cannot guarantee anyway, so it only earns
//! a warning). Sweeps are capped at `max(2, initial remaining)`; hitting the
//! cap means a foreign-key cycle among the still-pending tables, which is a
//! fatal configuration error.

use crate::common::dialect::{SchemaIntrospect, TableDescription};
use crate::common::watch::TableWatch;
use crate::common::{ReplError, Result};
use std::collections::HashSet;
use tracing::{info, warn};

/// Internal pairing of a pending watch with its description.
struct Pending {
    watch: TableWatch,
    description: TableDescription,
}

/// Result of ordering one bootstrap.
#[derive(Debug)]
pub struct ResolvedBootstrap {
    /// Watches in safe creation order, `bootstrap_sequence` assigned
    pub ordered: Vec<TableWatch>,
    /// Descriptions matching `ordered`, index for index
    pub descriptions: Vec<TableDescription>,
    /// Watches whose introspection failed; their bootstrap position is not
    /// guaranteed and `bootstrap_sequence` stays -1
    pub unordered: Vec<TableWatch>,
}

/// Order the given watches for bootstrap.
///
/// Introspection failures are non-fatal: the table lands in `unordered`.
/// A foreign-key cycle among pending tables aborts with
/// [`ReplError::DependencyCycle`] naming the stuck tables.
pub async fn order_bootstrap(
    watches: &[TableWatch],
    introspect: &dyn SchemaIntrospect,
) -> Result<ResolvedBootstrap> {
    let mut remaining: Vec<Pending> = Vec::with_capacity(watches.len());
    let mut unordered: Vec<TableWatch> = Vec::new();
    let known: HashSet<String> = watches
        .iter()
        .map(|w| w.table.name.to_ascii_lowercase())
        .collect();

    for watch in watches {
        match introspect.describe(&watch.table).await {
            Ok(description) => remaining.push(Pending {
                watch: watch.clone(),
                description,
            }),
            Err(e) => {
                warn!(
                    table = %watch.table,
                    error = %e,
                    "introspection failed, table left unordered"
                );
                let mut w = watch.clone();
                w.bootstrap_sequence = -1;
                unordered.push(w);
            }
        }
    }

    let mut ordered: Vec<TableWatch> = Vec::new();
    let mut descriptions: Vec<TableDescription> = Vec::new();
    let mut resolved: HashSet<String> = HashSet::new();

    let max_sweeps = remaining.len().max(2);
    let mut sweeps = 0usize;

    while !remaining.is_empty() {
        let mut ready_idx: Vec<usize> = Vec::new();
        for (i, pending) in remaining.iter().enumerate() {
            if fks_resolved(&pending.description, &resolved, &known) {
                ready_idx.push(i);
            }
        }

        // Remove in reverse so indices stay valid; append in scan order.
        let mut picked: Vec<Pending> = Vec::with_capacity(ready_idx.len());
        for &i in ready_idx.iter().rev() {
            picked.push(remaining.remove(i));
        }
        picked.reverse();

        for mut pending in picked {
            resolved.insert(pending.watch.table.name.to_ascii_lowercase());
            pending.watch.bootstrap_sequence = ordered.len() as i64;
            info!(
                table = %pending.watch.table,
                bootstrap_sequence = pending.watch.bootstrap_sequence,
                "table ordered"
            );
            ordered.push(pending.watch);
            descriptions.push(pending.description);
        }

        sweeps += 1;
        if !remaining.is_empty() && sweeps >= max_sweeps {
            let stuck: Vec<String> = remaining
                .iter()
                .map(|p| p.watch.table.qualified_name())
                .collect();
            return Err(ReplError::DependencyCycle {
                sweeps,
                tables: stuck,
            });
        }
    }

    if !unordered.is_empty() {
        warn!(
            count = unordered.len(),
            "tables excluded from ordering; their bootstrap order is not guaranteed"
        );
    }

    Ok(ResolvedBootstrap {
        ordered,
        descriptions,
        unordered,
    })
}

/// Whether every foreign key of `description` points at a resolved table or
/// at a table outside the watched set.
fn fks_resolved(
    description: &TableDescription,
    resolved: &HashSet<String>,
    known: &HashSet<String>,
) -> bool {
    for fk_table in description.foreign_tables() {
        let key = fk_table.to_ascii_lowercase();
        if resolved.contains(&key) {
            continue;
        }
        if !known.contains(&key) {
            warn!(
                table = %description.table,
                fk_table,
                "foreign key references a table outside the replicated set; \
                 make sure it exists on the destination"
            );
            continue;
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dialect::ColumnDescription;
    use crate::common::record::TableRef;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MapIntrospect {
        tables: HashMap<String, TableDescription>,
    }

    impl MapIntrospect {
        fn new(descs: Vec<TableDescription>) -> Self {
            Self {
                tables: descs
                    .into_iter()
                    .map(|d| (d.table.name.clone(), d))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl SchemaIntrospect for MapIntrospect {
        async fn describe(&self, table: &TableRef) -> Result<TableDescription> {
            self.tables
                .get(&table.name)
                .cloned()
                .ok_or_else(|| ReplError::Introspection {
                    table: table.qualified_name(),
                    reason: "not found".into(),
                })
        }
    }

    fn table(name: &str, fks: &[&str]) -> TableDescription {
        let mut columns = vec![ColumnDescription::new("id", "BIGINT").primary()];
        for fk in fks {
            columns.push(ColumnDescription::new(format!("{fk}_id"), "BIGINT").references(*fk));
        }
        TableDescription::new(TableRef::new("db", "s", name), columns)
    }

    fn watch(name: &str) -> TableWatch {
        TableWatch::new(TableRef::new("db", "s", name))
    }

    fn names(watches: &[TableWatch]) -> Vec<&str> {
        watches.iter().map(|w| w.table.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_chain_submitted_reversed() {
        // A (no FK), B -> A, C -> B, submitted [C, B, A]
        let introspect = MapIntrospect::new(vec![
            table("a", &[]),
            table("b", &["a"]),
            table("c", &["b"]),
        ]);
        let result = order_bootstrap(&[watch("c"), watch("b"), watch("a")], &introspect)
            .await
            .unwrap();

        assert_eq!(names(&result.ordered), vec!["a", "b", "c"]);
        assert_eq!(
            result
                .ordered
                .iter()
                .map(|w| w.bootstrap_sequence)
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(result.unordered.is_empty());
    }

    #[tokio::test]
    async fn test_no_table_before_its_dependency() {
        let introspect = MapIntrospect::new(vec![
            table("orders", &["customers"]),
            table("customers", &[]),
            table("items", &["orders", "products"]),
            table("products", &[]),
        ]);
        let result = order_bootstrap(
            &[
                watch("items"),
                watch("orders"),
                watch("products"),
                watch("customers"),
            ],
            &introspect,
        )
        .await
        .unwrap();

        let order = names(&result.ordered);
        let pos = |n: &str| order.iter().position(|&t| t == n).unwrap();
        assert!(pos("customers") < pos("orders"));
        assert!(pos("orders") < pos("items"));
        assert!(pos("products") < pos("items"));
    }

    #[tokio::test]
    async fn test_self_reference_is_not_a_cycle() {
        let introspect = MapIntrospect::new(vec![table("tree", &["tree"])]);
        let result = order_bootstrap(&[watch("tree")], &introspect).await.unwrap();
        assert_eq!(names(&result.ordered), vec!["tree"]);
    }

    #[tokio::test]
    async fn test_fk_outside_watched_set_is_satisfied() {
        // "audit" is not watched; the FK only warns
        let introspect = MapIntrospect::new(vec![table("events", &["audit"])]);
        let result = order_bootstrap(&[watch("events")], &introspect).await.unwrap();
        assert_eq!(names(&result.ordered), vec!["events"]);
    }

    #[tokio::test]
    async fn test_cycle_fails_within_sweep_cap_naming_stuck_tables() {
        let introspect = MapIntrospect::new(vec![
            table("x", &["y"]),
            table("y", &["x"]),
            table("free", &[]),
        ]);
        let err = order_bootstrap(&[watch("x"), watch("y"), watch("free")], &introspect)
            .await
            .unwrap_err();

        match err {
            ReplError::DependencyCycle { sweeps, tables } => {
                assert!(sweeps <= 3);
                assert_eq!(tables.len(), 2);
                assert!(tables.iter().any(|t| t.ends_with('x')));
                assert!(tables.iter().any(|t| t.ends_with('y')));
            }
            other => panic!("expected DependencyCycle, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_two_table_cycle_fails_in_two_sweeps() {
        let introspect = MapIntrospect::new(vec![table("x", &["y"]), table("y", &["x"])]);
        let err = order_bootstrap(&[watch("x"), watch("y")], &introspect)
            .await
            .unwrap_err();
        match err {
            ReplError::DependencyCycle { sweeps, .. } => assert_eq!(sweeps, 2),
            other => panic!("expected DependencyCycle, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_introspection_failure_reported_unordered() {
        let introspect = MapIntrospect::new(vec![table("a", &[])]);
        let result = order_bootstrap(&[watch("a"), watch("dropped")], &introspect)
            .await
            .unwrap();

        assert_eq!(names(&result.ordered), vec!["a"]);
        assert_eq!(names(&result.unordered), vec!["dropped"]);
        assert_eq!(result.unordered[0].bootstrap_sequence, -1);
    }

    #[tokio::test]
    async fn test_descriptions_align_with_order() {
        let introspect = MapIntrospect::new(vec![table("b", &["a"]), table("a", &[])]);
        let result = order_bootstrap(&[watch("b"), watch("a")], &introspect)
            .await
            .unwrap();
        assert_eq!(result.descriptions.len(), result.ordered.len());
        for (w, d) in result.ordered.iter().zip(result.descriptions.iter()) {
            assert_eq!(w.table, d.table);
        }
    }
}
