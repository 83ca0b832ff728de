//! Transactional applier
//!
//! Replays admitted change units against the target database. One unit is an
//! ordered list of records sharing a transaction; the unit commits or rolls
//! back as a whole, and a `keepTransactionOpen` tag extends that atomicity
//! across chunked units by holding the reserved connection open until the
//! span's final unit commits.
//!
//! Transaction scope is explicit: the applier's held-connection state is a
//! value ([`Held`]) threaded through each call, not a sticky flag. A failure
//! inside a held span poisons the span; later units are skipped until the
//! next commit boundary clears it.

pub mod cache;
pub mod mapper;

pub use cache::DescriptionCache;
pub use mapper::{DefaultMapper, TableMapper};

use crate::common::bus::{BusMessage, MessageBus};
use crate::common::dialect::{Dialect, HookDecision, TableDescription};
use crate::common::pool::{ConnectionPool, DbConnection};
use crate::common::record::{attr, ChangeRecord, ReplAction, TableRef};
use crate::common::{ReplError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Vendor hook running around each row operation, typically a stored
/// procedure. `after` runs even when `before` suppressed the row operation.
#[async_trait]
pub trait RowHook: Send + Sync {
    /// Runs before the row operation; may suppress it.
    async fn before(
        &self,
        conn: &mut dyn DbConnection,
        record: &ChangeRecord,
    ) -> Result<HookDecision>;

    /// Runs after the row operation (or its suppression).
    async fn after(&self, conn: &mut dyn DbConnection, record: &ChangeRecord) -> Result<()>;
}

/// Per-action apply switches. Everything on by default; switching an action
/// off turns matching records into logged no-ops.
#[derive(Debug, Clone)]
pub struct EnabledActions {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    pub create: bool,
    pub drop: bool,
    pub alter: bool,
    pub statement: bool,
    pub dump: bool,
}

impl Default for EnabledActions {
    fn default() -> Self {
        Self {
            insert: true,
            update: true,
            delete: true,
            create: true,
            drop: true,
            alter: true,
            statement: true,
            dump: true,
        }
    }
}

impl EnabledActions {
    fn allows(&self, action: ReplAction) -> bool {
        match action {
            ReplAction::Insert => self.insert,
            ReplAction::Update => self.update,
            ReplAction::Delete => self.delete,
            ReplAction::Create => self.create,
            ReplAction::Drop => self.drop,
            ReplAction::Alter => self.alter,
            ReplAction::Statement => self.statement,
            ReplAction::Dump => self.dump,
        }
    }
}

/// Applier configuration.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// CREATE on an existing table replaces it instead of failing
    pub overwrite_tables: bool,
    /// With overwrite: drop-and-recreate instead of truncating
    pub recreate_tables: bool,
    /// Schema wiped before a DUMP import, if set
    pub wipe_schema_on_dump: Option<String>,
    /// Drain mode: acknowledge units without touching the target
    pub nirvana: bool,
    /// Table-description cache cap
    pub cache_capacity: usize,
    /// Per-action switches
    pub actions: EnabledActions,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            overwrite_tables: true,
            recreate_tables: false,
            wipe_schema_on_dump: None,
            nirvana: false,
            cache_capacity: cache::DEFAULT_CAPACITY,
            actions: EnabledActions::default(),
        }
    }
}

impl ApplierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overwrite_tables(mut self, on: bool) -> Self {
        self.overwrite_tables = on;
        self
    }

    pub fn recreate_tables(mut self, on: bool) -> Self {
        self.recreate_tables = on;
        self
    }

    pub fn wipe_schema_on_dump(mut self, schema: impl Into<String>) -> Self {
        self.wipe_schema_on_dump = Some(schema.into());
        self
    }

    pub fn nirvana(mut self, on: bool) -> Self {
        self.nirvana = on;
        self
    }

    pub fn actions(mut self, actions: EnabledActions) -> Self {
        self.actions = actions;
        self
    }
}

/// Outcome of applying one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Unit applied and committed
    Committed,
    /// Unit applied; transaction held open for the next unit of the span
    KeptOpen,
    /// Unit not applied: duplicate redelivery or drain mode
    Skipped,
    /// Unit not applied: an earlier unit of the held span failed
    SkippedPoisoned,
}

/// Transaction held across units, made explicit as a value.
enum Held {
    /// No transaction in progress
    None,
    /// A span is in progress on this connection
    Open {
        conn: Box<dyn DbConnection>,
        original_autocommit: bool,
    },
    /// A unit of the span failed; skip until the next commit boundary
    Poisoned,
}

/// The applier. One instance per consumer, invoked from the delivery
/// callback; not reentrant.
pub struct Applier {
    pool: Arc<dyn ConnectionPool>,
    dialect: Arc<dyn Dialect>,
    bus: Arc<dyn MessageBus>,
    mapper: Arc<dyn TableMapper>,
    cache: DescriptionCache,
    config: ApplierConfig,
    hook: Option<Arc<dyn RowHook>>,
    held: Held,
}

impl Applier {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        dialect: Arc<dyn Dialect>,
        bus: Arc<dyn MessageBus>,
        mapper: Arc<dyn TableMapper>,
        config: ApplierConfig,
    ) -> Self {
        let cache = DescriptionCache::new(config.cache_capacity);
        Self {
            pool,
            dialect,
            bus,
            mapper,
            cache,
            config,
            hook: None,
            held: Held::None,
        }
    }

    /// Attach a row hook.
    pub fn with_hook(mut self, hook: Arc<dyn RowHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Whether a transaction span is currently held open.
    pub fn holds_transaction(&self) -> bool {
        matches!(self.held, Held::Open { .. })
    }

    /// Apply one unit of records.
    pub async fn apply(&mut self, records: Vec<ChangeRecord>) -> Result<ApplyOutcome> {
        if records.is_empty() {
            return Ok(ApplyOutcome::Skipped);
        }
        if self.config.nirvana {
            info!(records = records.len(), "drain mode, unit discarded");
            return Ok(ApplyOutcome::Skipped);
        }
        if records.iter().any(|r| r.already_processed()) {
            warn!(records = records.len(), "unit already processed, skipped");
            return Ok(ApplyOutcome::Skipped);
        }

        let keep_open = records
            .last()
            .map(|r| r.keep_transaction_open())
            .unwrap_or(false);

        if matches!(self.held, Held::Poisoned) {
            if !keep_open {
                // Commit boundary: the failed span ends here.
                self.held = Held::None;
            }
            warn!(
                records = records.len(),
                "unit skipped, an earlier unit of this transaction span failed"
            );
            return Ok(ApplyOutcome::SkippedPoisoned);
        }

        let (mut conn, original_autocommit) =
            match std::mem::replace(&mut self.held, Held::None) {
                Held::Open {
                    conn,
                    original_autocommit,
                } => (conn, original_autocommit),
                Held::None => {
                    let mut conn = self.pool.reserve().await?;
                    let original = conn.autocommit();
                    conn.set_autocommit(false).await?;
                    (conn, original)
                }
                Held::Poisoned => unreachable!("poisoned span handled above"),
            };

        let applied = self.apply_records(conn.as_mut(), &records).await;

        if applied.is_ok() && keep_open {
            self.held = Held::Open {
                conn,
                original_autocommit,
            };
            return Ok(ApplyOutcome::KeptOpen);
        }

        let finished = match applied {
            Ok(()) => conn.commit().await,
            Err(e) => Err(e),
        };

        match finished {
            Ok(()) => {
                match conn.set_autocommit(original_autocommit).await {
                    Ok(()) => self.pool.release(conn).await,
                    Err(_) => self.pool.discard(conn).await,
                }
                Ok(ApplyOutcome::Committed)
            }
            Err(e) => {
                if let Err(rb) = conn.rollback().await {
                    warn!(error = %rb, "rollback failed, discarding connection");
                }
                self.pool.discard(conn).await;
                self.held = if keep_open { Held::Poisoned } else { Held::None };
                Err(e)
            }
        }
    }

    async fn apply_records(
        &self,
        conn: &mut dyn DbConnection,
        records: &[ChangeRecord],
    ) -> Result<()> {
        for record in records {
            if record.is_end_of_transition() {
                debug!("end-of-transition marker reached the applier, ignored");
                continue;
            }
            if !self.config.actions.allows(record.action) {
                debug!(action = %record.action, table = %record.table, "action disabled, skipped");
                continue;
            }
            match record.action {
                ReplAction::Insert | ReplAction::Update | ReplAction::Delete => {
                    self.apply_row(conn, record).await?
                }
                ReplAction::Create => self.apply_create(conn, record).await?,
                ReplAction::Drop => self.apply_drop(conn, record).await?,
                ReplAction::Alter => {
                    // Structural changes are not applied automatically.
                    warn!(
                        table = %record.table,
                        sequence = ?record.sequence,
                        "ALTER received, reported but not applied"
                    );
                }
                ReplAction::Statement => self.apply_statement(conn, record).await?,
                ReplAction::Dump => self.apply_dump(conn, record).await?,
            }
        }
        Ok(())
    }

    async fn describe(
        &self,
        conn: &mut dyn DbConnection,
        table: &TableRef,
    ) -> Result<TableDescription> {
        if let Some(description) = self.cache.get(table) {
            return Ok(description);
        }
        let description = self.dialect.describe_table(conn, table).await?;
        self.cache.insert(description.clone());
        Ok(description)
    }

    async fn apply_row(&self, conn: &mut dyn DbConnection, record: &ChangeRecord) -> Result<()> {
        let target = self.mapper.map_table(&record.table);
        let description = self.describe(conn, &target).await?;

        let decision = match &self.hook {
            Some(hook) => hook.before(conn, record).await?,
            None => HookDecision::Proceed,
        };

        if decision == HookDecision::Proceed {
            match record.action {
                ReplAction::Insert => {
                    let row = self.mapped_new(record)?;
                    self.dialect.insert(conn, &description, &row).await?;
                }
                ReplAction::Update => {
                    let new_row = self.mapped_new(record)?;
                    let old_row = record
                        .old_content
                        .as_ref()
                        .map(|old| self.mapper.map_row(&record.table, old));
                    self.dialect
                        .update(conn, &description, old_row.as_ref(), &new_row)
                        .await?;
                }
                ReplAction::Delete => {
                    let old_row = record.old_content.as_ref().ok_or_else(|| {
                        ReplError::schema(format!(
                            "DELETE on '{}' without old row content",
                            record.table
                        ))
                    })?;
                    let old_row = self.mapper.map_row(&record.table, old_row);
                    self.dialect.delete(conn, &description, &old_row).await?;
                }
                _ => unreachable!("row path only handles row mutations"),
            }
        } else {
            debug!(table = %record.table, "row operation suppressed by hook");
        }

        if let Some(hook) = &self.hook {
            hook.after(conn, record).await?;
        }
        Ok(())
    }

    fn mapped_new(&self, record: &ChangeRecord) -> Result<serde_json::Value> {
        let new_row = record.new_content.as_ref().ok_or_else(|| {
            ReplError::schema(format!(
                "{} on '{}' without new row content",
                record.action, record.table
            ))
        })?;
        Ok(self.mapper.map_row(&record.table, new_row))
    }

    async fn apply_create(&self, conn: &mut dyn DbConnection, record: &ChangeRecord) -> Result<()> {
        let target = self.mapper.map_table(&record.table);
        let carried: TableDescription = record
            .new_content
            .clone()
            .ok_or_else(|| {
                ReplError::schema(format!("CREATE of '{}' without table description", target))
            })
            .and_then(|v| serde_json::from_value(v).map_err(ReplError::from))?;
        let description = TableDescription::new(target.clone(), carried.columns);

        if self.dialect.table_exists(conn, &target).await? {
            if !self.config.overwrite_tables {
                return Err(ReplError::schema(format!(
                    "table '{}' already exists and overwriting is disabled",
                    target
                )));
            }
            if !self.config.recreate_tables {
                info!(table = %target, "table exists, truncating instead of recreating");
                self.dialect.truncate_table(conn, &target).await?;
                self.cache.invalidate(&target);
                return Ok(());
            }
            self.dialect.drop_table(conn, &target).await?;
        }

        let sql = self.dialect.create_table_sql(&description)?;
        self.dialect.execute_ddl(conn, &sql).await?;
        self.cache.invalidate(&target);
        info!(table = %target, "table created");
        Ok(())
    }

    async fn apply_drop(&self, conn: &mut dyn DbConnection, record: &ChangeRecord) -> Result<()> {
        let target = self.mapper.map_table(&record.table);
        let existed = self.dialect.drop_table(conn, &target).await?;
        if !existed {
            warn!(table = %target, "table did not exist, drop ignored");
        }
        self.cache.invalidate(&target);
        Ok(())
    }

    async fn apply_statement(
        &self,
        conn: &mut dyn DbConnection,
        record: &ChangeRecord,
    ) -> Result<()> {
        // An ad-hoc statement may have altered any table.
        self.cache.clear();

        let sql = record
            .new_content
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| ReplError::protocol("STATEMENT record without SQL text"))?;
        let max_entries: u64 = record
            .attribute(attr::MAX_ENTRIES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let result = self.dialect.execute_statement(conn, sql, max_entries).await;

        if let Some(topic) = record.attribute(attr::SQL_TOPIC) {
            let statement_id = record.attribute(attr::STATEMENT_ID).unwrap_or_default();
            let reply = match &result {
                Ok(body) => BusMessage::new(Bytes::from(body.clone().into_bytes())),
                Err(e) => BusMessage::new(Bytes::new())
                    .with_attribute(attr::EXCEPTION, e.to_string()),
            };
            self.bus
                .publish(topic, reply.with_attribute(attr::STATEMENT_ID, statement_id))
                .await?;
        }

        result.map(|_| ())
    }

    async fn apply_dump(&self, conn: &mut dyn DbConnection, record: &ChangeRecord) -> Result<()> {
        // A dump replaces arbitrary state; cached descriptions are stale.
        self.cache.clear();

        let path = record.attribute(attr::FILENAME).ok_or_else(|| {
            ReplError::protocol("DUMP record without a file name")
        })?;
        if let Some(schema) = &self.config.wipe_schema_on_dump {
            info!(schema = %schema, "wiping schema before dump import");
            self.dialect.wipe_schema(conn, None, schema).await?;
        }
        info!(path = %path, "importing dump");
        self.dialect.import_dump(conn, path).await
    }
}
