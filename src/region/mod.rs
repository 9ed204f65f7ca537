//! The shadow address-space manager.
//!
//! Every writable private anonymous mapping in the consumer process (minus
//! the ring and the instrumentation engine's own pages) is backed by a PM
//! image file and remapped `MAP_SHARED | MAP_SYNC` at the same address, so
//! the consumer's state can be rebuilt after a restore by re-mapping those
//! files. The catalog of `(base, size, file_id)` triples is persisted with a
//! two-file protocol: mutations land in `new_table.dat`, which is renamed
//! over `table.dat` when the undo log commits.

pub mod foreground;
pub mod maps;
pub mod table;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::fcntl::{open, openat, renameat, OFlag};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{fsync, ftruncate, unlinkat, write, UnlinkatFlags};

use crate::pm::PmFile;
use crate::ranges::RangeSet;
use table::{RegionRecord, NEW_TABLE_FILE, TABLE_FILE};

/// A shadowed region currently mapped in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: usize,
    pub size: usize,
    pub file_id: u32,
}

impl Region {
    fn end(&self) -> usize {
        self.base + self.size
    }

    fn includes_range(&self, base: usize, size: usize) -> bool {
        self.base <= base && base + size <= self.end()
    }

    fn overlaps(&self, base: usize, size: usize) -> bool {
        self.base < base + size && base < self.end()
    }

    fn record(&self) -> RegionRecord {
        RegionRecord {
            base: self.base as u64,
            size: self.size as u64,
            file_id: self.file_id,
        }
    }
}

/// Outcome of [`RegionManager::remove_region`].
#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The range is not in the catalog; the `munmap` should pass through.
    NotManaged,
}

pub struct RegionManager {
    dirfd: OwnedFd,
    regions: Vec<Region>,
    /// Membership index over `regions`.
    rs: RangeSet,
    /// Image files superseded since the last catalog commit. They stay on
    /// disk until the commit lands: the committed table still references
    /// them, and recovery must be able to map everything it lists.
    pending_unlinks: Vec<String>,
}

impl RegionManager {
    pub fn new(pm_path: &Path) -> Result<RegionManager, Errno> {
        let dirfd = open(pm_path, OFlag::O_DIRECTORY, Mode::empty())?;
        Ok(RegionManager {
            dirfd: unsafe { OwnedFd::from_raw_fd(dirfd) },
            regions: Vec::new(),
            rs: RangeSet::new(),
            pending_unlinks: Vec::new(),
        })
    }

    pub fn does_manage(&self, addr: usize) -> bool {
        self.rs.find_point(addr)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn find_overlap(&self, base: usize, size: usize) -> Option<usize> {
        self.regions.iter().position(|r| r.overlaps(base, size))
    }

    /// Writes the bytes at `[base, base + size)` to a fresh image file named
    /// after the base and a random file id, fsyncs the file and the
    /// directory, and returns the open fd and the id.
    fn persist_region(&self, base: usize, size: usize) -> Result<(OwnedFd, u32), Errno> {
        let file_id: u32 = rand::random();
        let name = table::image_file_name(base, file_id);
        let fd = openat(
            self.dirfd.as_raw_fd(),
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let contents = unsafe { std::slice::from_raw_parts(base as *const u8, size) };
        let mut written = 0;
        while written < size {
            written += write(fd.as_raw_fd(), &contents[written..])?;
        }
        fsync(fd.as_raw_fd())?;
        fsync(self.dirfd.as_raw_fd())?;
        Ok((fd, file_id))
    }

    /// Replaces `[base, base + size)` with a PM-file-backed mapping of the
    /// same contents at the same address, and adds it to the catalog.
    pub fn replace_region(&mut self, base: usize, size: usize) -> Result<(), Errno> {
        assert!(
            self.find_overlap(base, size).is_none(),
            "replace_region target overlaps a managed region"
        );

        let (fd, file_id) = self.persist_region(base, size)?;
        let (addr, _is_pmem) = PmFile::map_fixed(base as *mut u8, size, &fd)?;
        assert_eq!(addr as usize, base, "MAP_FIXED moved the region");
        drop(fd);

        trace!("region replaced: {:x}-{:x}", base, base + size);
        self.regions.push(Region {
            base,
            size,
            file_id,
        });
        self.rs.insert(base, size);
        self.persist_new_region_table()?;
        Ok(())
    }

    /// Handles an intercepted `munmap` of `[base, base + size)`. A range
    /// outside the catalog passes through untouched. The range must be fully
    /// covered by one region; unmapping across regions is unsupported.
    pub fn remove_region(&mut self, base: usize, size: usize) -> Result<RemoveOutcome, Errno> {
        let i = match self.find_overlap(base, size) {
            Some(i) => i,
            None => return Ok(RemoveOutcome::NotManaged),
        };
        let r = self.regions[i];
        assert!(
            r.includes_range(base, size),
            "munmap across region boundaries is unsupported"
        );
        self.regions.swap_remove(i);
        self.rs.remove(r.base, r.size);

        if unsafe { libc::munmap(base as *mut libc::c_void, size) } != 0 {
            return Err(Errno::last());
        }

        // A suffix remainder becomes a region of its own with a fresh image
        // file. A prefix remainder keeps the original file (its base is
        // unchanged) and just shrinks it; only a fully superseded file is
        // queued for deletion at the next catalog commit.
        if r.end() != base + size {
            self.replace_region(base + size, r.end() - (base + size))?;
        }
        if r.base != base {
            let new_size = base - r.base;
            let old_name = table::image_file_name(r.base, r.file_id);
            let fd = openat(
                self.dirfd.as_raw_fd(),
                old_name.as_str(),
                OFlag::O_WRONLY,
                Mode::empty(),
            )?;
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            ftruncate(fd.as_raw_fd(), new_size as i64)?;
            fsync(fd.as_raw_fd())?;

            self.regions.push(Region {
                base: r.base,
                size: new_size,
                file_id: r.file_id,
            });
            self.rs.insert(r.base, new_size);
        } else {
            self.pending_unlinks
                .push(table::image_file_name(r.base, r.file_id));
        }

        trace!("region removed: {:x}-{:x}", base, base + size);
        self.persist_new_region_table()?;
        Ok(RemoveOutcome::Removed)
    }

    /// Seeds the catalog from the current address space: every writable
    /// private anonymous mapping (heap included) except those intersecting
    /// `skip` is persisted and remapped. `skip` must cover the ring, the
    /// shared cursor block, the undo log, and the instrumentation engine's
    /// internal pages.
    pub fn init_address_space(&mut self, skip: &RangeSet) -> Result<(), Errno> {
        let mappings = maps::mappings_for_self().map_err(|e| {
            warn!("reading /proc/self/maps failed: {}", e);
            Errno::EIO
        })?;

        // Collect first; replacing regions mutates the address space we're
        // iterating over.
        let todo: Vec<_> = mappings
            .iter()
            .filter(|m| maps::is_candidate(m))
            .filter(|m| !skip.find_point(m.begin) && !skip.find_point(m.end - 1))
            .map(|m| (m.begin, m.len()))
            .collect();

        for (base, size) in todo {
            self.replace_region(base, size)?;
        }
        debug!("address space seeded: {} regions", self.regions.len());
        Ok(())
    }

    /// Writes the current catalog to `new_table.dat`. After this returns,
    /// the catalog update is ready to be committed.
    pub fn persist_new_region_table(&self) -> Result<(), Errno> {
        let bytes = table::encode_table(
            &self
                .regions
                .iter()
                .map(Region::record)
                .collect::<Vec<_>>(),
        );
        let fd = openat(
            self.dirfd.as_raw_fd(),
            NEW_TABLE_FILE,
            OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o666),
        )?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let mut written = 0;
        while written < bytes.len() {
            written += write(fd.as_raw_fd(), &bytes[written..])?;
        }
        fsync(fd.as_raw_fd())?;
        fsync(self.dirfd.as_raw_fd())?;
        Ok(())
    }

    /// Commits a pending catalog update by renaming `new_table.dat` over
    /// `table.dat`, then unlinks the image files the update superseded.
    /// No-op if there is no pending update.
    pub fn commit_new_region_table(&mut self) -> Result<(), Errno> {
        match renameat(
            Some(self.dirfd.as_raw_fd()),
            NEW_TABLE_FILE,
            Some(self.dirfd.as_raw_fd()),
            TABLE_FILE,
        ) {
            Ok(()) => fsync(self.dirfd.as_raw_fd())?,
            Err(Errno::ENOENT) => return Ok(()),
            Err(e) => return Err(e),
        }

        for name in self.pending_unlinks.drain(..) {
            match unlinkat(
                Some(self.dirfd.as_raw_fd()),
                name.as_str(),
                UnlinkatFlags::NoRemoveDir,
            ) {
                // Already gone (e.g. a recovery's orphan sweep beat us).
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }
        fsync(self.dirfd.as_raw_fd())
    }

    /// Drops a pending catalog update. No-op if there is none.
    pub fn clear_new_region_table(&mut self) -> Result<(), Errno> {
        self.pending_unlinks.clear();
        match unlinkat(
            Some(self.dirfd.as_raw_fd()),
            NEW_TABLE_FILE,
            UnlinkatFlags::NoRemoveDir,
        ) {
            Ok(()) => fsync(self.dirfd.as_raw_fd()),
            Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads the committed catalog back. Does not touch the address space.
    pub fn load_committed_table(&self) -> Result<Vec<RegionRecord>, Errno> {
        let fd = match openat(
            self.dirfd.as_raw_fd(),
            TABLE_FILE,
            OFlag::O_RDONLY,
            Mode::empty(),
        ) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(Errno::ENOENT) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = fstat(fd.as_raw_fd())?.st_size as usize;
        let mut bytes = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = nix::unistd::read(fd.as_raw_fd(), &mut bytes[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        decode_or_einval(&bytes[..got])
    }

    /// Post-restore bring-up: maps every committed region image at its
    /// recorded base and rebuilds the in-memory catalog. Image files not in
    /// the committed catalog are leftovers from an uncommitted mutation and
    /// are deleted.
    pub fn recover(&mut self) -> Result<(), Errno> {
        let committed = self.load_committed_table()?;

        let mut to_delete = Vec::new();
        {
            let mut dir = nix::dir::Dir::openat(
                self.dirfd.as_raw_fd(),
                ".",
                OFlag::O_RDONLY | OFlag::O_DIRECTORY,
                Mode::empty(),
            )?;
            for entry in dir.iter() {
                let entry = entry?;
                let name = match entry.file_name().to_str() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                let (base, file_id) = match table::parse_image_file_name(name) {
                    Some(parsed) => parsed,
                    None => continue,
                };
                let committed_here = committed
                    .iter()
                    .any(|r| r.base == base as u64 && r.file_id == file_id);
                if !committed_here {
                    trace!("orphan region image deleted: {}", name);
                    to_delete.push(name.to_owned());
                }
            }
        }
        for name in &to_delete {
            unlinkat(
                Some(self.dirfd.as_raw_fd()),
                name.as_str(),
                UnlinkatFlags::NoRemoveDir,
            )?;
        }
        if !to_delete.is_empty() {
            fsync(self.dirfd.as_raw_fd())?;
        }

        for record in &committed {
            let (base, size, file_id) =
                (record.base as usize, record.size as usize, record.file_id);
            let name = table::image_file_name(base, file_id);
            let fd = openat(
                self.dirfd.as_raw_fd(),
                name.as_str(),
                OFlag::O_RDWR,
                Mode::empty(),
            )?;
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let st = fstat(fd.as_raw_fd())?;
            assert_eq!(
                st.st_size as usize, size,
                "region image {} does not match its catalog size",
                name
            );
            let (addr, _is_pmem) = PmFile::map_fixed(base as *mut u8, size, &fd)?;
            assert_eq!(addr as usize, base, "region image mapped at a different address");

            trace!("region recovered: {:x}-{:x}", base, base + size);
            self.regions.push(Region {
                base,
                size,
                file_id,
            });
            self.rs.insert(base, size);
        }
        debug!("region catalog recovered: {} regions", self.regions.len());
        Ok(())
    }

    /// Streams the catalog to the foreground over `fd`: one record per
    /// region, then the all-zero sentinel.
    pub fn send_regions(&self, fd: i32) -> Result<(), Errno> {
        for region in &self.regions {
            write_record(fd, &region.record())?;
        }
        write_record(fd, &RegionRecord::sentinel())
    }
}

fn write_record(fd: i32, record: &RegionRecord) -> Result<(), Errno> {
    let bytes = bytemuck::bytes_of(record);
    let mut written = 0;
    while written < bytes.len() {
        written += write(fd, &bytes[written..])?;
    }
    Ok(())
}

fn decode_or_einval(bytes: &[u8]) -> Result<Vec<RegionRecord>, Errno> {
    table::decode_table(bytes).ok_or(Errno::EINVAL)
}
