//! End-to-end pipeline scenarios: snapshot reconciliation through the slave
//! actor into the transactional applier, bootstrap ordering, and statement
//! broadcast agreement.

use async_trait::async_trait;
use replistream::applier::{Applier, ApplierConfig, ApplyOutcome, DefaultMapper};
use replistream::common::{
    attr, ChangeRecord, ColumnDescription, ConnectionPool, DbConnection, Dialect, MemoryBus,
    MemoryDispatcher, MemoryQueue, MemoryStateStore, ReplError, Result, SchemaIntrospect,
    TableDescription, TableRef, TableWatch,
};
use replistream::quorum::{BroadcastRegistry, QuorumStatus};
use replistream::resolver::order_bootstrap;
use replistream::slave::{CheckOutcome, SlaveActor, SlaveConfig, SlaveState, SlaveStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct NoopConnection;

#[async_trait]
impl DbConnection for NoopConnection {
    fn autocommit(&self) -> bool {
        true
    }

    async fn set_autocommit(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

struct NoopPool;

#[async_trait]
impl ConnectionPool for NoopPool {
    async fn reserve(&self) -> Result<Box<dyn DbConnection>> {
        Ok(Box::new(NoopConnection))
    }

    async fn release(&self, _conn: Box<dyn DbConnection>) {}

    async fn discard(&self, _conn: Box<dyn DbConnection>) {}
}

/// Dialect recording every applied row.
#[derive(Default)]
struct RecordingDialect {
    applied: Mutex<Vec<String>>,
}

impl RecordingDialect {
    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialect for RecordingDialect {
    fn id(&self) -> &'static str {
        "recording"
    }

    async fn bootstrap(&self, _conn: &mut dyn DbConnection) -> Result<()> {
        Ok(())
    }

    async fn describe_table(
        &self,
        _conn: &mut dyn DbConnection,
        table: &TableRef,
    ) -> Result<TableDescription> {
        Ok(TableDescription::new(
            table.clone(),
            vec![ColumnDescription::new("id", "BIGINT").primary()],
        ))
    }

    fn create_table_sql(&self, description: &TableDescription) -> Result<String> {
        Ok(format!("CREATE TABLE {}", description.table))
    }

    async fn ensure_trigger(
        &self,
        _conn: &mut dyn DbConnection,
        _table: &TableRef,
        _trigger_name: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn table_exists(&self, _conn: &mut dyn DbConnection, _table: &TableRef) -> Result<bool> {
        Ok(false)
    }

    async fn drop_table(&self, _conn: &mut dyn DbConnection, _table: &TableRef) -> Result<bool> {
        Ok(false)
    }

    async fn truncate_table(&self, _conn: &mut dyn DbConnection, _table: &TableRef) -> Result<()> {
        Ok(())
    }

    async fn insert(
        &self,
        _conn: &mut dyn DbConnection,
        description: &TableDescription,
        row: &serde_json::Value,
    ) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(format!("insert {} {}", description.table.name, row));
        Ok(())
    }

    async fn update(
        &self,
        _conn: &mut dyn DbConnection,
        description: &TableDescription,
        _old_row: Option<&serde_json::Value>,
        new_row: &serde_json::Value,
    ) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(format!("update {} {}", description.table.name, new_row));
        Ok(())
    }

    async fn delete(
        &self,
        _conn: &mut dyn DbConnection,
        description: &TableDescription,
        old_row: &serde_json::Value,
    ) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(format!("delete {} {}", description.table.name, old_row));
        Ok(())
    }

    async fn execute_ddl(&self, _conn: &mut dyn DbConnection, _sql: &str) -> Result<()> {
        Ok(())
    }

    async fn execute_statement(
        &self,
        _conn: &mut dyn DbConnection,
        sql: &str,
        _max_entries: u64,
    ) -> Result<String> {
        Ok(format!("executed: {sql}"))
    }

    async fn wipe_schema(
        &self,
        _conn: &mut dyn DbConnection,
        _catalog: Option<&str>,
        _schema: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn import_dump(&self, _conn: &mut dyn DbConnection, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_for_event(&self, _master_id: &str, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

fn record(seq: u64) -> ChangeRecord {
    ChangeRecord::insert(TableRef::new("db", "public", "orders"), json!({"id": seq}))
        .with_sequence(seq)
        .with_transaction_id(format!("txn-{seq}"))
}

fn applier(dialect: Arc<RecordingDialect>) -> Applier {
    Applier::new(
        Arc::new(NoopPool),
        dialect,
        Arc::new(MemoryBus::new()),
        Arc::new(DefaultMapper::new()),
        ApplierConfig::default(),
    )
}

async fn admitted(slave: &replistream::SlaveHandle, batch: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    match slave.check(batch).await.unwrap() {
        CheckOutcome::Checked { admitted, .. } => admitted,
        CheckOutcome::NotInitialized => panic!("slave not initialized"),
    }
}

#[tokio::test]
async fn test_snapshot_reconciliation_end_to_end() {
    init_tracing();
    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Arc::new(MemoryDispatcher::new());
    let state = SlaveState::new(
        "warehouse-1",
        SlaveConfig::default(),
        queue.clone(),
        dispatcher,
        Arc::new(MemoryStateStore::new()),
    );
    let (slave, task) = SlaveActor::spawn(state, None);
    slave.register().await.unwrap();

    // snapshot requested; producer reports interval [100, 150]
    slave.initiate().await.unwrap();
    slave.snapshot_ready(100, 150).await.unwrap();

    let dialect = Arc::new(RecordingDialect::default());
    let mut applier = applier(dialect.clone());

    // 90 is already covered by the snapshot
    queue.push(record(90)).await;
    let out = admitted(&slave, vec![record(90)]).await;
    assert!(out.is_empty());
    assert!(queue.is_empty().await);

    // 120 is inside the interval: applied, still transitioning
    let out = admitted(&slave, vec![record(120)]).await;
    assert_eq!(applier.apply(out).await.unwrap(), ApplyOutcome::Committed);
    assert_eq!(slave.status().await.unwrap(), SlaveStatus::Transition);

    // 151 overtakes the snapshot: applied and the slave goes NORMAL
    let out = admitted(&slave, vec![record(151)]).await;
    assert_eq!(applier.apply(out).await.unwrap(), ApplyOutcome::Committed);
    assert_eq!(slave.status().await.unwrap(), SlaveStatus::Normal);

    assert_eq!(
        dialect.applied(),
        vec![
            r#"insert orders {"id":120}"#.to_string(),
            r#"insert orders {"id":151}"#.to_string(),
        ]
    );

    drop(slave);
    task.await.unwrap();
}

#[tokio::test]
async fn test_redelivered_duplicate_is_a_noop() {
    init_tracing();
    let queue = Arc::new(MemoryQueue::new());
    let state = SlaveState::new(
        "warehouse-1",
        SlaveConfig::default(),
        queue.clone(),
        Arc::new(MemoryDispatcher::new()),
        Arc::new(MemoryStateStore::new()),
    );
    let (slave, task) = SlaveActor::spawn(state, None);
    slave.register().await.unwrap();

    let mut dup = record(7);
    dup.set_flag(attr::ALREADY_PROCESSED);
    queue.push(dup.clone()).await;

    let dialect = Arc::new(RecordingDialect::default());
    let mut applier = applier(dialect.clone());

    let out = admitted(&slave, vec![dup]).await;
    assert_eq!(applier.apply(out).await.unwrap(), ApplyOutcome::Skipped);
    assert!(dialect.applied().is_empty());
    assert!(queue.is_empty().await, "duplicate removed from the queue");

    drop(slave);
    task.await.unwrap();
}

struct MapIntrospect {
    tables: HashMap<String, TableDescription>,
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

#[tokio::test]
async fn test_bootstrap_order_follows_foreign_keys() {
    init_tracing();
    // A has no FK, B references A, C references B; submitted [C, B, A]
    let mk = |name: &str, fk: Option<&str>| {
        let mut columns = vec![ColumnDescription::new("id", "BIGINT").primary()];
        if let Some(fk) = fk {
            columns.push(ColumnDescription::new(format!("{fk}_id"), "BIGINT").references(fk));
        }
        TableDescription::new(TableRef::new("db", "s", name), columns)
    };
    let introspect = MapIntrospect {
        tables: [
            ("a".to_string(), mk("a", None)),
            ("b".to_string(), mk("b", Some("a"))),
            ("c".to_string(), mk("c", Some("b"))),
        ]
        .into_iter()
        .collect(),
    };
    let watches: Vec<TableWatch> = ["c", "b", "a"]
        .iter()
        .map(|n| TableWatch::new(TableRef::new("db", "s", *n)))
        .collect();

    let result = order_bootstrap(&watches, &introspect).await.unwrap();
    let order: Vec<&str> = result.ordered.iter().map(|w| w.table.name.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_statement_broadcast_reaches_agreement() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let registry = BroadcastRegistry::new(bus.clone(), "sql.replies");

    let id = registry
        .broadcast(
            "master.db1",
            "SELECT count(*) FROM orders",
            vec!["warehouse-1".into(), "warehouse-2".into()],
            0,
        )
        .await
        .unwrap();
    assert_eq!(bus.published("master.db1").await.len(), 1);

    registry.master_response(&id, "42", None).await.unwrap();
    registry
        .slave_response(&id, "warehouse-1", "42", None)
        .await
        .unwrap();
    let status = registry
        .slave_response(&id, "warehouse-2", "42", None)
        .await
        .unwrap();
    assert_eq!(status, QuorumStatus::Ok);
}

#[tokio::test]
async fn test_statement_broadcast_flags_divergent_slave() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let registry = BroadcastRegistry::new(bus, "sql.replies");

    let id = registry
        .broadcast("master.db1", "SELECT 1", vec!["warehouse-1".into()], 0)
        .await
        .unwrap();
    registry.master_response(&id, "1", None).await.unwrap();
    let status = registry
        .slave_response(&id, "warehouse-1", "2", None)
        .await
        .unwrap();
    assert_eq!(status, QuorumStatus::Failed);
}
