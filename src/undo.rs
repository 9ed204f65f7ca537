//! The undo-log engine.
//!
//! While the consumer replays commands, every store it executes is preceded
//! by a call into [`UndoLog::record`], which saves the 32-byte block the
//! store is about to dirty. The entry is flushed before the recording call
//! returns, and the store executes after, so a crash at any point leaves
//! either no trace of the store or a durable pre-image that recovery copies
//! back. A commit record (distinguished by a nonzero `commit_tail`) marks
//! the point up to which replay is durable; the ring tail never advances
//! past the last commit record.
//!
//! Three volatile accessories keep the hot path cheap: an open-addressed
//! presence filter deduplicates blocks within a commit epoch, a fresh-region
//! set skips stores into mappings that did not exist at the last commit, and
//! a `should_commit` threshold bounds the log length.

use std::path::Path;

use log::{debug, trace};
use nix::errno::Errno;
use static_assertions::const_assert_eq;

use crate::pm::{self, PmFile, CACHE_LINE};
use crate::ranges::RangeSet;
use crate::region::RegionManager;

/// Undo granularity: blocks of 32 aligned bytes, half a cache line, so no
/// block ever straddles a line.
pub const UNDO_BLK: usize = 32;
pub const UNDO_NUM_ENTRIES: usize = 1024 * 512;
/// Presence-filter capacity; must be a power of two.
pub const LOGGED_ADDR_HASH_SIZE: usize = 16384;
/// Commit once the log grows past this many entries.
pub const COMMIT_THRESHOLD: usize = LOGGED_ADDR_HASH_SIZE / 2;

pub const UNDO_LOG_FILE: &str = "undo_log";

const_assert_eq!(UNDO_BLK & (UNDO_BLK - 1), 0);
const_assert_eq!(LOGGED_ADDR_HASH_SIZE & (LOGGED_ADDR_HASH_SIZE - 1), 0);
// A logged block must not straddle a cache line.
const_assert_eq!(CACHE_LINE % UNDO_BLK, 0);

/// One undo-log entry, exactly one cache line. `addr == 0` with
/// `commit_tail > 0` marks a commit record whose `commit_tail - 1` is the
/// ring tail to publish on recovery; `commit_tail == 0` marks an undo
/// record; both zero marks the end of the log.
#[repr(C, align(64))]
struct UndoEntry {
    blk: [u8; UNDO_BLK],
    addr: usize,
    commit_tail: u64,
}

const_assert_eq!(std::mem::size_of::<UndoEntry>(), CACHE_LINE);

impl UndoEntry {
    fn is_null(&self) -> bool {
        self.addr == 0 && self.commit_tail == 0
    }
}

/// Parameters an external instrumentation engine needs to emit the inline
/// fast path in front of each store: a single load from
/// `hash_table_addr + (addr / block_size) % slot_count * 8` that skips the
/// slow-path call when the slot already holds the store's block address.
#[derive(Debug, Clone, Copy)]
pub struct FastPathSpec {
    pub hash_table_addr: usize,
    pub slot_count: usize,
    pub block_size: usize,
}

pub struct UndoLog {
    // Owns the mapping behind `entries`.
    _file: PmFile,
    entries: *mut UndoEntry,
    len: usize,
    /// Block addresses currently present in the log; 0 means empty. Purely
    /// volatile, rebuilt from the persisted entries on recovery.
    logged_addrs: Box<[usize]>,
    /// Ranges mapped since the last commit; stores into them are not logged
    /// because rollback tears the whole mapping down.
    fresh_regions: RangeSet,
}

// Owned by the single consumer thread; the raw entry pointer refers to a
// mapping owned by `file`.
unsafe impl Send for UndoLog {}

impl UndoLog {
    /// Maps `undo_log` in `pm_path`. With `recovered` set, the persisted
    /// entries are scanned to rebuild the length and the presence filter;
    /// otherwise the volatile state starts empty.
    pub fn open(pm_path: &Path, recovered: bool) -> Result<UndoLog, Errno> {
        let file = PmFile::map(
            &pm_path.join(UNDO_LOG_FILE),
            UNDO_NUM_ENTRIES * std::mem::size_of::<UndoEntry>(),
        )?;
        assert_eq!(file.base() as usize % CACHE_LINE, 0);

        let mut log = UndoLog {
            entries: file.base() as *mut UndoEntry,
            _file: file,
            len: 0,
            logged_addrs: vec![0usize; LOGGED_ADDR_HASH_SIZE].into_boxed_slice(),
            fresh_regions: RangeSet::new(),
        };

        if recovered {
            let mut i = 0;
            while i < UNDO_NUM_ENTRIES {
                let (addr, commit_tail) = {
                    let entry = log.entry(i);
                    if entry.is_null() {
                        break;
                    }
                    (entry.addr, entry.commit_tail)
                };
                if commit_tail > 0 {
                    assert_eq!(addr, 0);
                } else {
                    log.insert_logged_addr(addr);
                }
                i += 1;
            }
            log.len = i;
            debug!("undo log reopened with {} entries", log.len);
        }
        Ok(log)
    }

    fn entry(&self, i: usize) -> &UndoEntry {
        unsafe { &*self.entries.add(i) }
    }

    fn entry_mut(&mut self, i: usize) -> &mut UndoEntry {
        unsafe { &mut *self.entries.add(i) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn fast_path_spec(&self) -> FastPathSpec {
        FastPathSpec {
            hash_table_addr: self.logged_addrs.as_ptr() as usize,
            slot_count: LOGGED_ADDR_HASH_SIZE,
            block_size: UNDO_BLK,
        }
    }

    /// The check the instrumentation engine inlines in front of each store.
    /// Returns false when the store provably needs no slow-path call: it
    /// fits one block and that block's un-probed filter slot already holds
    /// it.
    #[inline(always)]
    pub fn store_needs_slow_path(&self, addr: usize, size: usize) -> bool {
        if (addr ^ (addr + size - 1)) > UNDO_BLK - 1 {
            // Straddles a block boundary.
            return true;
        }
        let slot = self.logged_addrs[(addr / UNDO_BLK) % LOGGED_ADDR_HASH_SIZE];
        (slot ^ addr) >= UNDO_BLK
    }

    /// Inserts `addr` into the presence filter. Returns true if it was not
    /// there (the caller should log the block). A full table also returns
    /// true: logging a duplicate is correct, just slower.
    fn insert_logged_addr(&mut self, addr: usize) -> bool {
        let hash = addr / UNDO_BLK;
        let mut i = hash;
        let mut perturb = hash;

        // It takes fewer than 13 shifts to drive perturb to zero.
        for _ in 0..LOGGED_ADDR_HASH_SIZE + 13 {
            let slot = &mut self.logged_addrs[i % LOGGED_ADDR_HASH_SIZE];
            if *slot == 0 {
                *slot = addr;
                return true;
            }
            if *slot == addr {
                return false;
            }
            i = i.wrapping_mul(5).wrapping_add(perturb).wrapping_add(1);
            perturb >>= 5;
        }
        true
    }

    /// Records the imminent store to `[addr, addr + size)`: one entry per
    /// touched block not already present in the filter. Returns true once
    /// the log is due for a commit; the caller latches that and commits
    /// after the current command.
    ///
    /// # Safety
    ///
    /// The target range must be readable, and the caller must perform the
    /// store only after this returns.
    pub unsafe fn record(&mut self, addr: usize, size: usize) -> bool {
        if self.fresh_regions.find(addr, size) {
            // Mapped after the previous commit; rollback unmaps it wholesale.
            return false;
        }

        let blk_start = addr & !(UNDO_BLK - 1);
        let mut pn = blk_start;
        while pn < addr + size {
            if self.insert_logged_addr(pn) {
                let len = self.len;
                let entry = self.entry_mut(len);
                // The three writes land in one cache line; the barriers pin
                // their order so a torn flush can't show a valid-looking
                // entry with a stale block image.
                std::ptr::copy_nonoverlapping(pn as *const u8, entry.blk.as_mut_ptr(), UNDO_BLK);
                pm::compiler_barrier();
                entry.addr = pn;
                pm::compiler_barrier();
                entry.commit_tail = 0;
                pm::flush(entry as *const UndoEntry);
                self.len += 1;
                assert!(self.len < UNDO_NUM_ENTRIES);
            }
            pn += UNDO_BLK;
        }
        // Entries may persist in any order, as long as all have by now.
        pm::drain();
        self.len > COMMIT_THRESHOLD
    }

    /// Marks `[addr, addr + size)` as freshly mapped: stores into it are not
    /// logged until the next commit, which flushes the whole range instead.
    pub fn record_fresh_region(&mut self, addr: usize, size: usize) {
        trace!("fresh region recorded: {:x}+{:x}", addr, size);
        self.fresh_regions.insert(addr, size);
    }

    pub fn remove_fresh_region(&mut self, addr: usize, size: usize) {
        self.fresh_regions.remove(addr, size);
    }

    /// Writes the commit record for ring position `tail`. First makes every
    /// store since the last commit durable: the consumer's new values in the
    /// logged blocks and in every fresh region must reach PM before the
    /// commit record claims they have.
    pub fn commit(&mut self, tail: usize) {
        for i in 0..self.len {
            pm::flush(self.entry(i).addr as *const u8);
        }
        for (start, size) in self.fresh_regions.iter() {
            let mut line = start & !(CACHE_LINE - 1);
            while line < start + size {
                pm::flush(line as *const u8);
                line += CACHE_LINE;
            }
        }
        pm::drain();

        let len = self.len;
        let entry = self.entry_mut(len);
        entry.addr = 0;
        entry.commit_tail = (tail + 1) as u64;
        pm::flush(entry as *const UndoEntry);
        self.len += 1;
        assert!(self.len < UNDO_NUM_ENTRIES);
        pm::drain();

        trace!("undo commit: {} entries, ring tail {}", self.len, tail);
    }

    /// Wipes the log after its commit record has served its purpose (the
    /// persistent ring tail has been published). Precondition: the last
    /// entry is a commit record.
    pub fn post_commit_cleanup(&mut self) {
        assert!(self.len > 0);
        assert!(self.entry(self.len - 1).commit_tail > 0);
        self.clear();
    }

    fn clear(&mut self) {
        unsafe {
            pm::memset_nt(
                self.entries as *mut u8,
                self.len * std::mem::size_of::<UndoEntry>(),
            )
        };
        self.len = 0;
        self.logged_addrs.fill(0);
        self.fresh_regions.clear();
        pm::drain();
    }

    /// Post-restore recovery. Decides the fate of the pending catalog
    /// update, maps the committed regions, and then either adopts the
    /// committed ring tail or rolls every logged block back, newest first.
    /// Returns the recovered ring tail, or `None` when the tail is
    /// unchanged. The log is empty afterwards.
    pub fn recover(&mut self, regions: &mut RegionManager) -> Result<Option<usize>, Errno> {
        if self.len > 0 && self.entry(self.len - 1).commit_tail > 0 {
            let tail = (self.entry(self.len - 1).commit_tail - 1) as usize;
            // Everything up to the commit record is durable; the catalog
            // update (if any) belongs to the committed state.
            regions.commit_new_region_table()?;
            regions.recover()?;
            self.clear();
            debug!("undo recovery adopted committed tail {}", tail);
            return Ok(Some(tail));
        }

        regions.clear_new_region_table()?;
        regions.recover()?;

        for i in (0..self.len).rev() {
            let (addr, commit_tail) = {
                let entry = self.entry(i);
                (entry.addr, entry.commit_tail)
            };
            assert_eq!(commit_tail, 0, "there should be no commit entry");
            assert!(addr != 0);
            // Writes to regions mapped after the last commit were never
            // logged, so every entry targets a managed region.
            assert!(
                regions.does_manage(addr),
                "undo entry target is not in a managed region"
            );
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.entry(i).blk.as_ptr(),
                    addr as *mut u8,
                    UNDO_BLK,
                );
            }
            pm::flush(addr as *const u8);
        }
        pm::drain();

        let rolled_back = self.len;
        self.clear();
        debug!("undo recovery rolled back {} entries", rolled_back);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn undo_log() -> (tempfile::TempDir, UndoLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = UndoLog::open(dir.path(), false).unwrap();
        (dir, log)
    }

    /// A 64-byte-aligned target buffer for instrumented "stores".
    fn target_buf(len: usize) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(len, CACHE_LINE).unwrap();
        let p = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!p.is_null());
        p
    }

    #[test]
    fn writes_to_one_block_log_once() {
        let (_dir, mut log) = undo_log();
        let buf = target_buf(64);
        unsafe {
            std::ptr::write_bytes(buf, 0x5a, 32);
        }
        let base = buf as usize;

        unsafe {
            assert!(!log.record(base, 8));
            assert!(!log.record(base + 16, 8));
            assert!(!log.record(base, 8));
        }
        assert_eq!(log.len(), 1);
        let entry = log.entry(0);
        assert_eq!(entry.addr, base);
        assert_eq!(entry.blk, [0x5a; 32]);
        assert_eq!(entry.commit_tail, 0);
    }

    #[test]
    fn straddling_store_logs_both_blocks() {
        let (_dir, mut log) = undo_log();
        let buf = target_buf(64);
        let base = buf as usize;

        // 16 bytes starting 0x18 into the buffer cross from the first block
        // into the second.
        assert!(log.store_needs_slow_path(base + 0x18, 16));
        unsafe { log.record(base + 0x18, 16) };
        assert_eq!(log.len(), 2);
        assert_eq!(log.entry(0).addr, base);
        assert_eq!(log.entry(1).addr, base + 32);
    }

    #[test]
    fn fast_path_skips_only_logged_blocks() {
        let (_dir, mut log) = undo_log();
        let buf = target_buf(64);
        let base = buf as usize;

        // Unlogged block: slow path.
        assert!(log.store_needs_slow_path(base, 8));
        unsafe { log.record(base, 8) };
        // Same block, any in-block offset: fast skip.
        assert!(!log.store_needs_slow_path(base, 8));
        assert!(!log.store_needs_slow_path(base + 24, 8));
        // Next block: slow path again.
        assert!(log.store_needs_slow_path(base + 32, 8));
        // Size 1 never fails the alignment check.
        assert!(!log.store_needs_slow_path(base + 31, 1));
    }

    #[test]
    fn fresh_region_stores_are_not_logged() {
        let (_dir, mut log) = undo_log();
        let buf = target_buf(4096);
        let base = buf as usize;

        log.record_fresh_region(base, 4096);
        assert!(!unsafe { log.record(base + 100, 8) });
        assert_eq!(log.len(), 0);

        // Once the range is removed, stores log again.
        log.remove_fresh_region(base, 4096);
        unsafe { log.record(base + 100, 8) };
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn filter_survives_being_full() {
        let (_dir, mut log) = undo_log();
        // Occupy every slot with distinct block addresses.
        for i in 0..LOGGED_ADDR_HASH_SIZE {
            assert!(log.insert_logged_addr(0x10_0000 + i * UNDO_BLK));
        }
        // A new address finds no slot; the engine logs it anyway.
        assert!(log.insert_logged_addr(0xdead_0000));
        // Present addresses are still found.
        assert!(!log.insert_logged_addr(0x10_0000));
    }

    #[test]
    fn commit_appends_single_commit_record() {
        let (_dir, mut log) = undo_log();
        let buf = target_buf(64);
        let base = buf as usize;
        unsafe { log.record(base, 8) };

        log.commit(5);
        assert_eq!(log.len(), 2);
        let last = log.entry(1);
        assert_eq!(last.addr, 0);
        assert_eq!(last.commit_tail, 6);
        // No earlier entry is a commit record.
        assert_eq!(log.entry(0).commit_tail, 0);

        log.post_commit_cleanup();
        assert_eq!(log.len(), 0);
        assert!(log.entry(0).is_null());
        assert!(log.entry(1).is_null());
        // The filter was wiped with the log.
        assert!(log.store_needs_slow_path(base, 8));
    }

    #[test]
    #[should_panic]
    fn cleanup_requires_commit_record() {
        let (_dir, mut log) = undo_log();
        let buf = target_buf(64);
        unsafe { log.record(buf as usize, 8) };
        log.post_commit_cleanup();
    }

    #[test]
    fn reopen_rebuilds_volatile_state() {
        let dir = tempfile::tempdir().unwrap();
        let buf = target_buf(128);
        let base = buf as usize;
        {
            let mut log = UndoLog::open(dir.path(), false).unwrap();
            unsafe {
                log.record(base, 8);
                log.record(base + 64, 8);
            }
        }
        let mut log = UndoLog::open(dir.path(), true).unwrap();
        assert_eq!(log.len(), 2);
        // The rebuilt filter deduplicates against the persisted entries.
        unsafe { log.record(base, 8) };
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn commit_threshold_trips_should_commit() {
        let (_dir, mut log) = undo_log();
        let span = (COMMIT_THRESHOLD + 1) * UNDO_BLK;
        let buf = target_buf(span);
        let base = buf as usize;

        let mut should_commit = false;
        for i in 0..=COMMIT_THRESHOLD {
            should_commit = unsafe { log.record(base + i * UNDO_BLK, 8) };
        }
        assert!(should_commit);
    }
}
