//! # replistream - trigger-based database replication
//!
//! A change-data-capture replication engine: changes captured on a master
//! database travel over a message bus to any number of slave consumers,
//! each of which reconciles a bulk initial snapshot with the live change
//! stream and replays the result transactionally against its target
//! database.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  capture   ┌─────────────┐  per-slave  ┌────────────┐
//! │  Master DB │ ─────────► │ Message bus │ ──────────► │ SlaveActor │
//! │ (triggers) │  scheduler │  (external) │   queue     │ state mach.│
//! └────────────┘            └─────────────┘             └─────┬──────┘
//!                                                             │ admitted
//!                                                             ▼
//!                                                       ┌────────────┐
//!                                                       │  Applier   │
//!                                                       │ txn replay │
//!                                                       └─────┬──────┘
//!                                                             ▼
//!                                                       ┌────────────┐
//!                                                       │ Target DB  │
//!                                                       └────────────┘
//! ```
//!
//! The initial sync works on a sequence watermark: the snapshot producer
//! reports the `[min, max]` replication-sequence interval it captured, and
//! the slave state machine filters the live stream against that interval
//! until the stream overtakes the snapshot (see [`slave`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> replistream::Result<()> {
//! use std::sync::Arc;
//! use replistream::common::{MemoryDispatcher, MemoryQueue, MemoryStateStore};
//! use replistream::slave::{SlaveActor, SlaveConfig, SlaveState};
//!
//! let state = SlaveState::new(
//!     "warehouse-1",
//!     SlaveConfig::default(),
//!     Arc::new(MemoryQueue::new()),
//!     Arc::new(MemoryDispatcher::new()),
//!     Arc::new(MemoryStateStore::new()),
//! );
//! let (slave, _task) = SlaveActor::spawn(state, None);
//! slave.register().await?;
//! slave.initiate().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! Core workflow types are re-exported at the crate root; the capability
//! seams (bus, pool, dialect, state store) and their in-memory
//! implementations live in [`common`].

pub mod applier;
pub mod common;
pub mod quorum;
pub mod resolver;
pub mod scheduler;
pub mod slave;

pub use applier::{Applier, ApplierConfig, ApplyOutcome, DefaultMapper, EnabledActions, RowHook, TableMapper};
pub use common::{
    attr, ChangeRecord, Dialect, DialectRegistry, ErrorCategory, ReplAction, ReplError, Result,
    TableRef, TableWatch,
};
pub use quorum::{BroadcastRegistry, QuorumStatus, SqlBroadcast};
pub use resolver::{order_bootstrap, ResolvedBootstrap};
pub use scheduler::{MasterPoller, MasterScheduler, SchedulerConfig};
pub use slave::{
    CascadeTarget, CheckOutcome, ReplicationInitiator, SlaveActor, SlaveConfig, SlaveHandle,
    SlaveState, SlaveStatus,
};
