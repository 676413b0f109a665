//! # TideDB
//!
//! An embedded transactional storage engine: a page cache over a single data
//! file, a checksummed write-ahead log with crash recovery, and multi-version
//! records with read-committed and repeatable-read isolation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidedb_core::api::Database;
//! use tidedb_core::config::EngineConfig;
//! use tidedb_core::types::IsolationLevel;
//!
//! let db = Database::create("my_database", EngineConfig::default()).unwrap();
//!
//! let xid = db.begin(IsolationLevel::ReadCommitted).unwrap();
//! let uid = db.insert(xid, b"hello").unwrap();
//! db.commit(xid).unwrap();
//!
//! let reader = db.begin(IsolationLevel::RepeatableRead).unwrap();
//! assert_eq!(db.read(reader, uid).unwrap().as_deref(), Some(&b"hello"[..]));
//! db.commit(reader).unwrap();
//!
//! db.close().unwrap();
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod mvcc;
pub mod record;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use api::Database;
pub use error::{Error, Result};
