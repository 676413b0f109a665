use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::{PAGE_SIZE, PageNo};

/// Number of equal-width free-space intervals. Buckets run `0..=INTERVALS`.
const INTERVALS: usize = 40;

/// Width of one interval in bytes.
const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

/// A page and the free bytes it had when it was last indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub pgno: PageNo,
    pub free_space: usize,
}

/// In-memory first-fit index of data pages by free space.
///
/// Pages are bucketed by `free_space / THRESHOLD`. A selected page is removed
/// from the index; the caller re-adds it with its new free space once it is
/// done writing, so two writers never pick the same page. Rebuilt at open,
/// never persisted.
pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<VecDeque<PageInfo>>>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![VecDeque::new(); INTERVALS + 1]),
        }
    }

    /// Record that `pgno` has `free_space` bytes available.
    pub fn add(&self, pgno: PageNo, free_space: usize) {
        let bucket = (free_space / THRESHOLD).min(INTERVALS);
        self.buckets.lock()[bucket].push_back(PageInfo { pgno, free_space });
    }

    /// Take a page with room for at least `size` bytes out of the index.
    ///
    /// Searching starts one bucket above `size`'s own bucket, so every page in
    /// a lower bucket fits. The top bucket holds pages with anywhere from
    /// `INTERVALS * THRESHOLD` bytes up, so its pages are checked one by one.
    /// The oldest fitting page in the smallest such bucket wins.
    pub fn select(&self, size: usize) -> Option<PageInfo> {
        let mut buckets = self.buckets.lock();
        let first = (size / THRESHOLD + 1).min(INTERVALS);
        for bucket in &mut buckets[first..] {
            if let Some(pos) = bucket.iter().position(|info| info.free_space >= size) {
                return bucket.remove(pos);
            }
        }
        None
    }

    /// Number of indexed pages.
    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::MAX_FREE_SPACE;

    #[test]
    fn test_select_empty() {
        let index = FreeSpaceIndex::new();
        assert_eq!(index.select(10), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_select_removes_page() {
        let index = FreeSpaceIndex::new();
        index.add(2, MAX_FREE_SPACE);
        let info = index.select(100).unwrap();
        assert_eq!(info.pgno, 2);
        assert_eq!(info.free_space, MAX_FREE_SPACE);
        assert_eq!(index.select(100), None);
    }

    #[test]
    fn test_select_prefers_smallest_sufficient_bucket() {
        let index = FreeSpaceIndex::new();
        index.add(2, 8000);
        index.add(3, 1000);
        index.add(4, 300);

        // Buckets: page 4 -> 1, page 3 -> 4, page 2 -> 39. A 250-byte request
        // starts at bucket 2, so page 4 is never a candidate.
        assert_eq!(index.select(250).unwrap().pgno, 3);
        assert_eq!(index.select(250).unwrap().pgno, 2);
        assert_eq!(index.select(250), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_insufficient_page_is_skipped() {
        let index = FreeSpaceIndex::new();
        // 150 bytes free: bucket 0. A 100-byte request searches from bucket 1.
        index.add(5, 150);
        assert_eq!(index.select(100), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_fifo_within_bucket() {
        let index = FreeSpaceIndex::new();
        index.add(2, 4000);
        index.add(3, 4001);
        assert_eq!(index.select(10).unwrap().pgno, 2);
        assert_eq!(index.select(10).unwrap().pgno, 3);
    }

    #[test]
    fn test_top_bucket_checks_each_page() {
        let index = FreeSpaceIndex::new();
        // Both sit in the top bucket; only the fresh page fits 8180 bytes.
        index.add(2, MAX_FREE_SPACE - 20);
        index.add(3, MAX_FREE_SPACE);

        assert_eq!(index.select(8180).unwrap().pgno, 3);
        assert_eq!(index.select(8180), None);
        // The partly filled page stays indexed for smaller records.
        assert_eq!(index.len(), 1);
        assert_eq!(index.select(8170).unwrap().pgno, 2);
    }
}
