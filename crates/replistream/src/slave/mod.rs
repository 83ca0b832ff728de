//! Per-slave replication: state machine plus its single-owner actor.

pub mod actor;
pub mod state;

pub use actor::{ReplicationInitiator, SlaveActor, SlaveHandle};
pub use state::{
    CascadeTarget, CheckOutcome, ManualTransferStore, SlaveConfig, SlaveState, SlaveStatus,
};
