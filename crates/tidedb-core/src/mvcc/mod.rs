//! Multi-version concurrency control: version entries, visibility, record
//! locks and the transaction lifecycle.

pub mod entry;
pub mod lock_table;
pub mod transaction;
pub mod version_manager;
pub mod visibility;

pub use lock_table::{LockTable, LockWaiter, WaitOutcome};
pub use transaction::Transaction;
pub use version_manager::VersionManager;
