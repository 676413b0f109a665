//! Append-only, checksummed log file.
//!
//! File layout:
//! ```text
//! [0..4]  rolling checksum of every record below: i32 big-endian
//! [4..]   records
//!
//! record:
//! [0..4]  payload length: u32 big-endian
//! [4..8]  checksum of the payload (seed 0): i32 big-endian
//! [8..]   payload
//! ```
//!
//! The header checksum is updated and synced after every append, so at rest it
//! always equals the fold of all complete records. A record cut short by a
//! crash fails its own checksum (or overruns the file) and is discarded at
//! open.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::StorageError;

const SEED: i32 = 13331;

const HEADER_LEN: u64 = 4;
const OF_CHECKSUM: usize = 4;
const OF_DATA: usize = 8;

/// Fold `bytes` into a running checksum.
pub fn checksum(mut acc: i32, bytes: &[u8]) -> i32 {
    for &b in bytes {
        acc = acc.wrapping_mul(SEED).wrapping_add(b as i8 as i32);
    }
    acc
}

struct LogState {
    /// Read cursor.
    position: u64,
    file_size: u64,
    /// Checksum of all records in the file.
    checksum: i32,
}

pub struct WriteAheadLog {
    file: File,
    state: Mutex<LogState>,
}

impl WriteAheadLog {
    /// Create an empty log at `path`. Fails if the file exists.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            return Err(StorageError::FileExists(path.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all_at(&0i32.to_be_bytes(), 0)?;
        file.sync_data()?;

        Ok(Self {
            file,
            state: Mutex::new(LogState {
                position: HEADER_LEN,
                file_size: HEADER_LEN,
                checksum: 0,
            }),
        })
    }

    /// Open an existing log, dropping any torn tail record.
    ///
    /// Returns `StorageError::BadLogFile` if the surviving records do not
    /// match the header checksum.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Err(StorageError::FileMissing(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_LEN {
            return Err(StorageError::BadLogFile(format!(
                "log file too short: {file_size} bytes"
            )));
        }

        let mut header = [0u8; 4];
        file.read_exact_at(&mut header, 0)?;
        let stored = i32::from_be_bytes(header);

        let wal = Self {
            file,
            state: Mutex::new(LogState {
                position: HEADER_LEN,
                file_size,
                checksum: stored,
            }),
        };
        wal.check_and_remove_tail()?;
        Ok(wal)
    }

    fn check_and_remove_tail(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.position = HEADER_LEN;

        let mut computed = 0i32;
        let mut records = 0usize;
        while let Some(record) = self.read_record(&mut state)? {
            computed = checksum(computed, &record);
            records += 1;
        }
        if computed != state.checksum {
            return Err(StorageError::BadLogFile(format!(
                "checksum mismatch: header={:#010x}, records={computed:#010x}",
                state.checksum
            )));
        }

        if state.position < state.file_size {
            warn!(
                valid_len = state.position,
                file_len = state.file_size,
                "discarding torn log tail"
            );
            self.file.set_len(state.position)?;
            self.file.sync_data()?;
            state.file_size = state.position;
        }
        info!(records, "log opened");

        state.position = HEADER_LEN;
        Ok(())
    }

    /// Read the full record at the cursor and advance past it.
    ///
    /// Returns `None` at end of log, at a record that would overrun the file,
    /// and at a record whose checksum does not verify.
    fn read_record(&self, state: &mut LogState) -> Result<Option<Vec<u8>>, StorageError> {
        if state.position + OF_DATA as u64 >= state.file_size {
            return Ok(None);
        }
        let mut len = [0u8; 4];
        self.file.read_exact_at(&mut len, state.position)?;
        let len = u32::from_be_bytes(len) as u64;
        if state.position + OF_DATA as u64 + len > state.file_size {
            return Ok(None);
        }

        let mut record = vec![0u8; OF_DATA + len as usize];
        self.file.read_exact_at(&mut record, state.position)?;
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&record[OF_CHECKSUM..OF_DATA]);
        if checksum(0, &record[OF_DATA..]) != i32::from_be_bytes(stored) {
            return Ok(None);
        }

        state.position += record.len() as u64;
        Ok(Some(record))
    }

    /// Append a payload and make it durable, together with the updated header
    /// checksum.
    pub fn append(&self, payload: &[u8]) -> Result<(), StorageError> {
        let record = wrap(payload);
        let mut state = self.state.lock();
        self.file.write_all_at(&record, state.file_size)?;
        state.file_size += record.len() as u64;
        state.checksum = checksum(state.checksum, &record);
        self.file.write_all_at(&state.checksum.to_be_bytes(), 0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Move the read cursor back to the first record.
    pub fn rewind(&self) {
        self.state.lock().position = HEADER_LEN;
    }

    /// Return the next payload, or `None` at the end of the log.
    ///
    /// The cursor is shared: two concurrent scans interleave.
    pub fn next(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut state = self.state.lock();
        Ok(self
            .read_record(&mut state)?
            .map(|record| record[OF_DATA..].to_vec()))
    }

    /// Current length of the log file in bytes.
    pub fn len(&self) -> u64 {
        self.state.lock().file_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == HEADER_LEN
    }
}

fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(OF_DATA + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(&checksum(0, payload).to_be_bytes());
    record.extend_from_slice(payload);
    record
}
