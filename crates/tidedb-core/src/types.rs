//! Core types: page numbers, record ids, transaction ids, on-disk constants.

use crate::error::TxnError;

/// 1-based page number inside the `.db` file.
pub type PageNo = u32;

/// Record identifier: page number in the high 32 bits, in-page offset in the
/// low 16 bits.
pub type Uid = u64;

/// Transaction identifier (monotonically increasing, 0 is reserved).
pub type Xid = u64;

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// The reserved transaction. Always committed, never active or aborted.
pub const SUPER_XID: Xid = 0;

/// Smallest page cache the engine will run with.
pub const MIN_CACHE_PAGES: usize = 10;

/// Build a record id from its page number and in-page offset.
pub fn address_to_uid(pgno: PageNo, offset: u16) -> Uid {
    ((pgno as u64) << 32) | offset as u64
}

/// Split a record id into `(page number, in-page offset)`.
pub fn uid_to_address(uid: Uid) -> (PageNo, u16) {
    let offset = (uid & 0xFFFF) as u16;
    let pgno = (uid >> 32) as PageNo;
    (pgno, offset)
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Level 0: every read sees the latest committed version.
    #[default]
    ReadCommitted = 0,
    /// Level 1: reads see the database as of `begin`.
    RepeatableRead = 1,
}

impl TryFrom<u8> for IsolationLevel {
    type Error = TxnError;

    /// Map the numeric level callers pass to `begin`: 0 or 1.
    fn try_from(level: u8) -> Result<Self, TxnError> {
        match level {
            0 => Ok(IsolationLevel::ReadCommitted),
            1 => Ok(IsolationLevel::RepeatableRead),
            other => Err(TxnError::InvalidIsolationLevel(other)),
        }
    }
}
