//! Connection-pool seam
//!
//! Pool internals are external; the engine consumes a strict
//! reserve → use → (commit+release | rollback+discard) discipline. A
//! connection is never handed back with autocommit altered from its
//! original setting.

use crate::common::Result;
use async_trait::async_trait;

/// One reserved database connection.
#[async_trait]
pub trait DbConnection: Send {
    /// Current autocommit setting.
    fn autocommit(&self) -> bool;

    /// Switch autocommit on or off.
    async fn set_autocommit(&mut self, on: bool) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<()>;
}

/// Pool of target-database connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Reserve a connection; blocks or errors when exhausted.
    async fn reserve(&self) -> Result<Box<dyn DbConnection>>;

    /// Return a healthy connection to the pool.
    async fn release(&self, conn: Box<dyn DbConnection>);

    /// Destroy a connection that failed mid-transaction.
    async fn discard(&self, conn: Box<dyn DbConnection>);
}
