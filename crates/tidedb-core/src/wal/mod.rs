//! Write-ahead log and crash recovery.

pub mod log;
pub mod record;
pub mod recovery;

pub use log::WriteAheadLog;
pub use record::LogRecord;
pub use recovery::{RecoveryStats, recover};
