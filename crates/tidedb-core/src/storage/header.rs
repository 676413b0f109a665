//! Page 1: the clean-shutdown marker.
//!
//! Layout (within the 8192-byte page):
//! ```text
//! [100..108] open nonce: 8 random bytes written at every open
//! [108..116] close copy: the open nonce, copied over at clean close
//! ```
//!
//! If the two slots differ at open time the previous process never reached
//! `close`, and the engine runs crash recovery.

use crate::types::PAGE_SIZE;

use super::page::{Page, PageBuf};

const VC_OFFSET: usize = 100;
const VC_LEN: usize = 8;

/// Fresh contents for page 1, already marked open.
pub fn init_page_one() -> PageBuf {
    let mut buf = Box::new([0u8; PAGE_SIZE]);
    write_open_nonce(&mut buf);
    buf
}

/// Write a fresh open nonce (the database is now "in use").
pub fn set_open(page: &Page) {
    let mut buf = page.lock();
    page.set_dirty(true);
    write_open_nonce(&mut buf);
}

/// Copy the open nonce into the close slot (the database was shut down cleanly).
pub fn set_closed(page: &Page) {
    let mut buf = page.lock();
    page.set_dirty(true);
    buf.copy_within(VC_OFFSET..VC_OFFSET + VC_LEN, VC_OFFSET + VC_LEN);
}

/// True if the last shutdown was clean.
pub fn was_closed_cleanly(page: &Page) -> bool {
    check_nonce(&page.lock())
}

fn check_nonce(buf: &[u8; PAGE_SIZE]) -> bool {
    buf[VC_OFFSET..VC_OFFSET + VC_LEN] == buf[VC_OFFSET + VC_LEN..VC_OFFSET + 2 * VC_LEN]
}

fn write_open_nonce(buf: &mut [u8; PAGE_SIZE]) {
    let nonce: [u8; VC_LEN] = rand::random();
    buf[VC_OFFSET..VC_OFFSET + VC_LEN].copy_from_slice(&nonce);
}
