//! Shared data model and capability seams
//!
//! Leaf types (records, watches), the error taxonomy, and the traits through
//! which the engine talks to its external collaborators: message bus,
//! durable queue, dispatcher control, state store, connection pool and
//! database dialect.

pub mod bus;
pub mod dialect;
pub mod error;
pub mod pool;
pub mod record;
pub mod store;
pub mod watch;

pub use bus::{
    BusMessage, ConsumerChannels, DeliveryQueue, DispatcherControl, MemoryBus, MemoryDispatcher,
    MemoryQueue, MessageBus,
};
pub use dialect::{
    ColumnDescription, Dialect, DialectRegistry, HookDecision, SchemaIntrospect, TableDescription,
};
pub use error::{ErrorCategory, ReplError, Result};
pub use pool::{ConnectionPool, DbConnection};
pub use record::{attr, ChangeRecord, ReplAction, TableRef};
pub use store::{
    FileStateStore, MemoryStateStore, PersistedMasterState, PersistedSlaveState, StateAccess,
    StateStore,
};
pub use watch::{ReplicatedActions, TableWatch, WatchStatus};
