//! Log record payloads.
//!
//! ```text
//! INSERT  [0][xid: u64][pgno: u32][offset: u16][raw record bytes]
//! UPDATE  [1][xid: u64][uid: u64][old raw bytes][new raw bytes]
//! ```
//!
//! All integers are big-endian. An UPDATE's old and new images always have
//! the same length, so each is half of what follows the uid.

use crate::error::StorageError;
use crate::types::{PageNo, Uid, Xid, uid_to_address};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

const INSERT_HEADER: usize = 1 + 8 + 4 + 2;
const UPDATE_HEADER: usize = 1 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// `raw` was appended to page `pgno` at `offset`.
    Insert {
        xid: Xid,
        pgno: PageNo,
        offset: u16,
        raw: Vec<u8>,
    },
    /// The record at `uid` was overwritten in place.
    Update {
        xid: Xid,
        uid: Uid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } | LogRecord::Update { xid, .. } => *xid,
        }
    }

    /// Page the record touches.
    pub fn pgno(&self) -> PageNo {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => uid_to_address(*uid).0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut buf = Vec::with_capacity(INSERT_HEADER + raw.len());
                buf.push(TYPE_INSERT);
                buf.extend_from_slice(&xid.to_be_bytes());
                buf.extend_from_slice(&pgno.to_be_bytes());
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(raw);
                buf
            }
            LogRecord::Update { xid, uid, old, new } => {
                debug_assert_eq!(old.len(), new.len());
                let mut buf = Vec::with_capacity(UPDATE_HEADER + old.len() + new.len());
                buf.push(TYPE_UPDATE);
                buf.extend_from_slice(&xid.to_be_bytes());
                buf.extend_from_slice(&uid.to_be_bytes());
                buf.extend_from_slice(old);
                buf.extend_from_slice(new);
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StorageError> {
        match buf.first() {
            Some(&TYPE_INSERT) => {
                if buf.len() < INSERT_HEADER {
                    return Err(malformed("insert", buf.len()));
                }
                Ok(LogRecord::Insert {
                    xid: read_u64(&buf[1..9]),
                    pgno: read_u32(&buf[9..13]),
                    offset: u16::from_be_bytes([buf[13], buf[14]]),
                    raw: buf[INSERT_HEADER..].to_vec(),
                })
            }
            Some(&TYPE_UPDATE) => {
                if buf.len() < UPDATE_HEADER || (buf.len() - UPDATE_HEADER) % 2 != 0 {
                    return Err(malformed("update", buf.len()));
                }
                let half = (buf.len() - UPDATE_HEADER) / 2;
                let images = &buf[UPDATE_HEADER..];
                Ok(LogRecord::Update {
                    xid: read_u64(&buf[1..9]),
                    uid: read_u64(&buf[9..17]),
                    old: images[..half].to_vec(),
                    new: images[half..].to_vec(),
                })
            }
            Some(other) => Err(StorageError::BadLogFile(format!(
                "unknown log record type {other}"
            ))),
            None => Err(StorageError::BadLogFile("empty log record".into())),
        }
    }
}

fn malformed(kind: &str, len: usize) -> StorageError {
    StorageError::BadLogFile(format!("malformed {kind} record of {len} bytes"))
}

fn read_u64(b: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    u64::from_be_bytes(out)
}

fn read_u32(b: &[u8]) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(b);
    u32::from_be_bytes(out)
}
