//! The surface the dynamic binary instrumentation engine drives.
//!
//! The engine itself lives outside this crate. Its obligations: insert, in
//! front of every application store in the consumer, (i) the block-alignment
//! pre-check, (ii) a single load from the presence-filter slot published by
//! [`FastPathSpec`], and (iii) on a miss, a clean call into
//! [`Instrumentation::record_write`]; and deliver intercepted `mmap` /
//! `munmap` syscalls to [`Instrumentation::handle_mmap_result`] /
//! [`Instrumentation::handle_munmap`]. Everything behind those entry points
//! (undo logging, the shadow region catalog, the commit latch) is owned
//! here.

use log::trace;
use nix::errno::Errno;
use std::path::Path;

use crate::region::{RegionManager, RemoveOutcome};
use crate::undo::{FastPathSpec, UndoLog};

pub struct Instrumentation {
    undo: UndoLog,
    regions: RegionManager,
    /// Latched by `record_write` when the undo log passes its threshold;
    /// the drain loop commits at the next command boundary and resets it.
    should_commit: bool,
}

impl Instrumentation {
    pub fn new(undo: UndoLog, regions: RegionManager) -> Instrumentation {
        Instrumentation {
            undo,
            regions,
            should_commit: false,
        }
    }

    pub fn fast_path_spec(&self) -> FastPathSpec {
        self.undo.fast_path_spec()
    }

    pub fn should_commit(&self) -> bool {
        self.should_commit
    }

    pub fn regions(&self) -> &RegionManager {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut RegionManager {
        &mut self.regions
    }

    pub fn undo_mut(&mut self) -> &mut UndoLog {
        &mut self.undo
    }

    /// The slow path the engine calls in front of a store to
    /// `[addr, addr + size)`. `rsp` is the application's stack pointer at
    /// the store: stack writes land above it and are not worth logging,
    /// since the stack below a crash point is garbage to the restored image
    /// anyway.
    ///
    /// # Safety
    ///
    /// Must be called before the store executes, with `addr..addr + size`
    /// readable.
    pub unsafe fn record_write(&mut self, addr: usize, size: usize, rsp: usize) {
        if addr >= rsp {
            // Most stack writes never get here (the engine filters
            // rsp-relative addressing); this catches the rest.
            return;
        }
        if self.undo.record(addr, size) {
            self.should_commit = true;
        }
    }

    /// Post-syscall hook for an intercepted successful `mmap`. Only
    /// anonymous private read-write mappings reach the consumer (the
    /// pre-syscall filter rejects everything else), so the region is always
    /// shadowed and marked fresh.
    pub fn handle_mmap_result(&mut self, addr: usize, size: usize) -> Result<(), Errno> {
        trace!("mmap intercepted: {:x}+{:x}", addr, size);
        self.regions.replace_region(addr, size)?;
        self.undo.record_fresh_region(addr, size);
        Ok(())
    }

    /// Pre-syscall hook for an intercepted `munmap`. Returns
    /// `RemoveOutcome::NotManaged` when the range is foreign and the
    /// syscall should pass through unchanged; otherwise the unmapping has
    /// been performed here.
    pub fn handle_munmap(&mut self, addr: usize, size: usize) -> Result<RemoveOutcome, Errno> {
        trace!("munmap intercepted: {:x}+{:x}", addr, size);
        self.undo.remove_fresh_region(addr, size);
        self.regions.remove_region(addr, size)
    }

    /// Commit boundary: persists replay effects, the commit record for ring
    /// position `tail`, and then the pending catalog rename. A crash between
    /// the record and the rename is benign: recovery sees the commit record
    /// and completes the rename. The persistent ring tail may be published
    /// once this returns.
    pub fn commit(&mut self, tail: usize) {
        self.undo.commit(tail);
        self.regions
            .commit_new_region_table()
            .expect("committing the region catalog failed");
        self.should_commit = false;
    }

    /// Wipe the undo log after the tail has been published.
    pub fn post_commit_cleanup(&mut self) {
        self.undo.post_commit_cleanup();
    }

    /// Consumer bring-up after a restore: applies the undo log (or adopts
    /// its committed tail) and re-maps the shadowed regions. Returns the
    /// ring tail to publish, if the log held a commit record.
    pub fn recover(&mut self) -> Result<Option<usize>, Errno> {
        self.undo.recover(&mut self.regions)
    }

    /// Consumer bring-up on first start: shadow the current address space.
    pub fn init_address_space(&mut self, skip: &crate::ranges::RangeSet) -> Result<(), Errno> {
        self.regions.init_address_space(skip)?;
        // The seeded catalog is the baseline committed state.
        self.regions.commit_new_region_table()
    }
}

/// Convenience constructor for the consumer's bring-up paths.
pub fn open(pm_path: &Path, recovered: bool) -> Result<Instrumentation, Errno> {
    let undo = UndoLog::open(pm_path, recovered)?;
    let regions = RegionManager::new(pm_path)?;
    Ok(Instrumentation::new(undo, regions))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrumentation() -> (tempfile::TempDir, Instrumentation) {
        let dir = tempfile::tempdir().unwrap();
        let inst = open(dir.path(), false).unwrap();
        (dir, inst)
    }

    fn anon_mapping(size: usize) -> usize {
        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ret, libc::MAP_FAILED);
        ret as usize
    }

    #[test]
    fn stack_writes_are_filtered() {
        let (_dir, mut inst) = instrumentation();
        let base = anon_mapping(4096);
        // Pretend the stack pointer sits below the target address.
        unsafe { inst.record_write(base + 128, 8, base) };
        assert_eq!(inst.undo.len(), 0);
    }

    #[test]
    fn fresh_mmap_then_write_logs_nothing() {
        let (_dir, mut inst) = instrumentation();
        let base = anon_mapping(4096);

        inst.handle_mmap_result(base, 4096).unwrap();
        unsafe { inst.record_write(base + 100, 8, usize::MAX) };
        assert_eq!(inst.undo.len(), 0);
        assert!(inst.regions.does_manage(base));

        // After a commit the region is no longer fresh; writes log again.
        inst.commit(0);
        inst.post_commit_cleanup();
        unsafe { inst.record_write(base + 100, 8, usize::MAX) };
        assert_eq!(inst.undo.len(), 1);
    }

    #[test]
    fn munmap_of_foreign_range_passes_through() {
        let (_dir, mut inst) = instrumentation();
        assert_eq!(
            inst.handle_munmap(0x4000_0000, 4096).unwrap(),
            RemoveOutcome::NotManaged
        );
    }

    #[test]
    fn commit_resets_latch() {
        let (_dir, mut inst) = instrumentation();
        let base = anon_mapping(4096);
        inst.handle_mmap_result(base, 4096).unwrap();
        inst.should_commit = true;
        inst.commit(3);
        assert!(!inst.should_commit());
        inst.post_commit_cleanup();
    }
}
