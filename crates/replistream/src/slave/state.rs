//! Per-slave replication state machine
//!
//! Decides which delivered records reach the applier and when. The machine
//! reconciles a live change stream with a bulk initial snapshot through a
//! `[min_sequence, max_sequence]` watermark interval reported by the
//! snapshot producer:
//!
//! - **Initial**: snapshot requested, live delivery suppressed
//! - **Transition**: live stream filtered against the watermark interval
//! - **Normal**: live stream passes through
//! - **Inconsistent**: operator-visible error state; admission behaves like
//!   Normal but monitoring is flagged
//!
//! Status, high-water mark and the dispatcher-paused flag are persisted via
//! the injected state store so redelivery resumes correctly after restart.

use crate::common::bus::{DeliveryQueue, DispatcherControl};
use crate::common::record::{attr, ChangeRecord};
use crate::common::store::{PersistedSlaveState, StateAccess, StateStore};
use crate::common::{ReplError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Admission status of one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlaveStatus {
    /// Snapshot requested, live stream suppressed
    Initial,
    /// Live stream filtered against the snapshot watermark interval
    Transition,
    /// Live stream passes through
    Normal,
    /// Automatic reconciliation failed; behaves like Normal for admission
    Inconsistent,
}

impl std::fmt::Display for SlaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "INITIAL",
            Self::Transition => "TRANSITION",
            Self::Normal => "NORMAL",
            Self::Inconsistent => "INCONSISTENT",
        };
        write!(f, "{s}")
    }
}

/// Cascaded replication target: when this slave finishes its transition, a
/// new replication request is initiated against the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeTarget {
    /// Slave to initiate
    pub slave_id: String,
    /// Replication prefix (stream identity) to request
    pub prefix: String,
}

/// Side channel persisting manual-transfer chunks outside the database path.
#[async_trait]
pub trait ManualTransferStore: Send + Sync {
    /// Store one chunk under `location`, grouped by `dump_id`.
    async fn store(
        &self,
        location: &str,
        dump_id: Option<&str>,
        record: &ChangeRecord,
    ) -> Result<()>;
}

/// Outcome of checking one delivered batch.
#[derive(Debug)]
pub enum CheckOutcome {
    /// Machine not initialized yet; the batch stays in the queue untouched
    /// and the caller retries later.
    NotInitialized,
    /// Batch checked; `admitted` may be forwarded to the applier.
    Checked {
        /// Records admitted for application, in delivery order
        admitted: Vec<ChangeRecord>,
        /// Whether this batch completed the transition to Normal
        became_normal: bool,
    },
}

/// Configuration for one slave.
#[derive(Debug, Clone, Default)]
pub struct SlaveConfig {
    /// Cascaded replication target, if any
    pub cascade: Option<CascadeTarget>,
    /// Escape hatch: admit everything unconditionally and report Normal
    pub force_sending: bool,
}

/// The state machine proper. Single-owner: wrap in a [`super::SlaveActor`]
/// for concurrent access.
pub struct SlaveState {
    id: String,
    status: SlaveStatus,
    min_sequence: u64,
    max_sequence: u64,
    high_water: u64,
    initialized: bool,
    check_invocations: u64,
    config: SlaveConfig,
    queue: Arc<dyn DeliveryQueue>,
    dispatcher: Arc<dyn DispatcherControl>,
    store: Arc<dyn StateStore>,
    transfer: Option<Arc<dyn ManualTransferStore>>,
}

impl SlaveState {
    /// Create a fresh, uninitialized machine.
    pub fn new(
        id: impl Into<String>,
        config: SlaveConfig,
        queue: Arc<dyn DeliveryQueue>,
        dispatcher: Arc<dyn DispatcherControl>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            id: id.into(),
            status: SlaveStatus::Normal,
            min_sequence: 0,
            max_sequence: 0,
            high_water: 0,
            initialized: false,
            check_invocations: 0,
            config,
            queue,
            dispatcher,
            store,
            transfer: None,
        }
    }

    /// Attach the manual-transfer side channel.
    pub fn with_transfer_store(mut self, transfer: Arc<dyn ManualTransferStore>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Register the slave: derive state from persistence (if any) and mark
    /// the machine initialized.
    pub async fn register(&mut self) -> Result<()> {
        if let Some(persisted) = StateAccess::load_slave(self.store.as_ref(), &self.id).await? {
            self.status = persisted.status;
            self.high_water = persisted.max_sequence;
            if persisted.dispatcher_paused {
                self.dispatcher.pause("restored paused state").await?;
            }
            info!(
                slave = %self.id,
                status = %self.status,
                high_water = self.high_water,
                "slave state restored"
            );
        }
        self.initialized = true;
        Ok(())
    }

    /// Slave identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reported status. With `force_sending` set the machine always reports
    /// Normal regardless of the internal state.
    pub fn status(&self) -> SlaveStatus {
        if self.config.force_sending {
            SlaveStatus::Normal
        } else {
            self.status
        }
    }

    /// Snapshot watermark interval currently in effect.
    pub fn watermarks(&self) -> (u64, u64) {
        (self.min_sequence, self.max_sequence)
    }

    /// Highest sequence seen so far (persisted redelivery watermark).
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Cascade target, if configured.
    pub fn cascade(&self) -> Option<&CascadeTarget> {
        self.config.cascade.as_ref()
    }

    async fn persist(&self) -> Result<()> {
        let state = PersistedSlaveState {
            status: self.status,
            max_sequence: self.high_water,
            dispatcher_paused: self.dispatcher.is_paused().await,
        };
        StateAccess::save_slave(self.store.as_ref(), &self.id, &state).await
    }

    async fn set_status(&mut self, status: SlaveStatus) -> Result<()> {
        if self.status != status {
            info!(slave = %self.id, from = %self.status, to = %status, "status change");
            self.status = status;
            self.persist().await?;
        }
        Ok(())
    }

    /// Begin a new initial-sync request.
    ///
    /// Refused while a request is already in flight (Initial/Transition):
    /// only Normal and Inconsistent slaves may initiate. Clears the callback
    /// queue of stale traffic, pauses outbound delivery and enters Initial.
    pub async fn begin_initial_request(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(ReplError::invalid_state(format!(
                "slave '{}' has not been initialized",
                self.id
            )));
        }
        if self.status == SlaveStatus::Initial || self.status == SlaveStatus::Transition {
            warn!(
                slave = %self.id,
                status = %self.status,
                "initial update request refused, one already ongoing"
            );
            return Err(ReplError::invalid_state(format!(
                "initial update already ongoing for slave '{}'",
                self.id
            )));
        }
        let cleared = self.queue.clear().await?;
        info!(
            slave = %self.id,
            cleared,
            "queue cleared before initiating, obsolete entries removed"
        );
        self.dispatcher.pause("initial sync").await?;
        self.set_status(SlaveStatus::Initial).await?;
        self.persist().await
    }

    /// The snapshot producer reported the `[min, max]` sequence interval it
    /// captured: enter Transition and resume delivery for filtering.
    ///
    /// Ignored when the request was cancelled in the meantime
    /// (Inconsistent).
    pub async fn snapshot_ready(&mut self, min_sequence: u64, max_sequence: u64) -> Result<()> {
        if !self.initialized {
            return Err(ReplError::invalid_state(format!(
                "slave '{}' has not been initialized",
                self.id
            )));
        }
        if self.status == SlaveStatus::Inconsistent {
            warn!(
                slave = %self.id,
                "ignoring snapshot interval, the initial update has been cancelled"
            );
            return Ok(());
        }
        info!(
            slave = %self.id,
            min_sequence,
            max_sequence,
            "initial operation completed, entering transition"
        );
        self.min_sequence = min_sequence;
        self.max_sequence = max_sequence;
        self.set_status(SlaveStatus::Transition).await?;
        self.dispatcher.resume().await?;
        self.persist().await
    }

    /// Cancel an in-flight snapshot: clear the queue and force
    /// Inconsistent. Manual reconciliation is required afterwards.
    pub async fn cancel_initial_request(&mut self) -> Result<()> {
        let cleared = self.queue.clear().await?;
        info!(
            slave = %self.id,
            cleared,
            "queue cleared on cancel request"
        );
        self.set_status(SlaveStatus::Inconsistent).await?;
        self.dispatcher.resume().await?;
        self.persist().await
    }

    /// Check one delivered batch, newest-first as delivered by the queue.
    ///
    /// Returns the records admitted for application. In Normal and
    /// Inconsistent every record passes through unfiltered: with multiple
    /// producers feeding one consumer this deliberately weakens the ordering
    /// guarantee instead of dropping foreign traffic.
    pub async fn check(&mut self, mut batch: Vec<ChangeRecord>) -> Result<CheckOutcome> {
        self.check_invocations += 1;
        debug!(
            slave = %self.id,
            status = %self.status,
            invocation = self.check_invocations,
            records = batch.len(),
            "check invoked"
        );
        if !self.initialized {
            warn!(
                slave = %self.id,
                "check invoked without initialization, batch left in queue"
            );
            return Ok(CheckOutcome::NotInitialized);
        }

        // Redelivery watermark: batches arrive newest-first, so the first
        // record carrying a sequence is the highest. The snapshot interval
        // bound set by snapshot_ready is a separate field and stays fixed
        // for the whole transition.
        if let Some(seq) = batch.iter().find_map(|r| r.sequence) {
            if seq > self.high_water {
                self.high_water = seq;
                self.persist().await?;
            }
        }

        if self.status == SlaveStatus::Initial && !self.config.force_sending {
            warn!(slave = %self.id, "check invoked in INITIAL, stopping the dispatcher");
            self.dispatcher.pause("initial sync").await?;
            self.persist().await?;
            return Ok(CheckOutcome::Checked {
                admitted: Vec::new(),
                became_normal: false,
            });
        }

        // Duplicate redeliveries leave both the batch and the durable queue.
        let mut deduped = Vec::with_capacity(batch.len());
        for record in batch.drain(..) {
            if record.already_processed() {
                warn!(
                    slave = %self.id,
                    sequence = ?record.sequence,
                    "record already processed, removing"
                );
                self.queue.remove(&record).await?;
            } else {
                deduped.push(record);
            }
        }

        let mut became_normal = false;
        let mut remote = Vec::with_capacity(deduped.len());
        for record in deduped {
            if record.is_end_of_data() {
                // Bulk snapshot went out of band; delivery waits until the
                // operator replays it. Later entries stay queued.
                self.dispatcher.pause("manual data transfer").await?;
                self.queue.remove(&record).await?;
                self.persist().await?;
                info!(
                    slave = %self.id,
                    location = ?record.manual_transfer_location(),
                    "end of out-of-band data, dispatcher paused"
                );
                break;
            }

            if let Some(location) = record.manual_transfer_location() {
                if !record.is_end_of_transition() {
                    let dump_id = record.attribute(attr::DUMP_ID);
                    match &self.transfer {
                        Some(transfer) => transfer.store(location, dump_id, &record).await?,
                        None => {
                            return Err(ReplError::config(format!(
                                "slave '{}' received a manual-transfer record but no \
                                 transfer store is configured",
                                self.id
                            )))
                        }
                    }
                    self.queue.remove(&record).await?;
                    continue;
                }
            }

            if record.is_end_of_transition() {
                info!(
                    slave = %self.id,
                    "end of initial update, going into NORMAL operations"
                );
                self.set_status(SlaveStatus::Normal).await?;
                self.dispatcher.resume().await?;
                self.persist().await?;
                became_normal = true;
            }
            remote.push(record);
        }

        if self.status == SlaveStatus::Normal || self.status == SlaveStatus::Inconsistent {
            return Ok(CheckOutcome::Checked {
                admitted: Self::chain_transaction(remote),
                became_normal,
            });
        }

        // Transition: filter against the snapshot watermark interval.
        let mut admitted = Vec::with_capacity(remote.len());
        for record in remote {
            let Some(seq) = record.sequence else {
                // Non-replication control traffic, delivered as-is.
                warn!(
                    slave = %self.id,
                    table = %record.table,
                    "record without sequence passed through"
                );
                admitted.push(record);
                continue;
            };
            if seq < self.min_sequence && !self.config.force_sending {
                // Already covered by the snapshot.
                info!(
                    slave = %self.id,
                    sequence = seq,
                    min_sequence = self.min_sequence,
                    "dropping record, older than the snapshot interval"
                );
                self.queue.remove(&record).await?;
                continue;
            }
            let above_max = seq > self.max_sequence;
            admitted.push(record);
            if above_max || self.config.force_sending {
                info!(
                    slave = %self.id,
                    sequence = seq,
                    max_sequence = self.max_sequence,
                    "sequence beyond the snapshot interval, switching to NORMAL"
                );
                self.set_status(SlaveStatus::Normal).await?;
                self.dispatcher.resume().await?;
                self.persist().await?;
                became_normal = true;
            }
        }

        Ok(CheckOutcome::Checked {
            admitted: Self::chain_transaction(admitted),
            became_normal,
        })
    }

    /// With more than one admitted record the whole batch must replay inside
    /// one applier transaction: every record but the last is tagged
    /// keep-transaction-open.
    fn chain_transaction(mut admitted: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
        if admitted.len() > 1 {
            let last = admitted.len() - 1;
            for record in &mut admitted[..last] {
                record.set_flag(attr::KEEP_TRANSACTION_OPEN);
            }
            debug!(records = admitted.len(), "batch chained into one transaction");
        }
        admitted
    }
}
