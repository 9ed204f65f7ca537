//! Persistent-memory primitives: cache-line flushes, store fences, and
//! `MAP_SYNC` file mappings.
//!
//! Durability on PM is explicit: a store is not persistent until the cache
//! line holding it has been flushed and a store fence has drained the flush.
//! Everything above this module expresses durability in terms of
//! [`flush`] / [`drain`] pairs.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

/// Every ring record and undo-log entry starts on a cache-line boundary.
pub const CACHE_LINE: usize = 64;

/// Rounds `len` up to a multiple of the cache-line size.
#[inline(always)]
pub const fn align_to_cache_line(len: usize) -> usize {
    (len + (CACHE_LINE - 1)) & !(CACHE_LINE - 1)
}

/// Initiates write-back of the cache line containing `addr`. The line stays
/// valid in cache. Not ordered with respect to later stores; pair with
/// [`drain`].
#[inline(always)]
pub fn flush<T>(addr: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("clwb [{0}]", in(reg) addr as *const u8, options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Flushes and invalidates the cache line containing `addr`. Used for data
/// the writer will not read back soon (ring payload lines).
#[inline(always)]
pub fn flush_invalidate<T>(addr: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("clflushopt [{0}]", in(reg) addr as *const u8, options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Waits for previously issued flushes to reach the persistence domain.
#[inline(always)]
pub fn drain() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("sfence", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Prevents the compiler from reordering stores across this point. Used to
/// order the field writes within a single undo-log cache line; no fence
/// instruction is emitted.
#[inline(always)]
pub fn compiler_barrier() {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

/// Zeroes `[dst, dst + len)` with non-temporal stores where available, so the
/// wiped undo-log prefix does not displace useful cache lines. The stores are
/// not ordered; the caller must [`drain`].
///
/// # Safety
///
/// `dst..dst + len` must be writable.
pub unsafe fn memset_nt(dst: *mut u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let mut p = dst;
        let end = dst.add(len);
        // Head: byte stores up to 8-byte alignment.
        while (p as usize) % 8 != 0 && p < end {
            p.write(0);
            flush(p);
            p = p.add(1);
        }
        while p.add(8) <= end {
            core::arch::asm!("movnti [{0}], {1}", in(reg) p, in(reg) 0u64, options(nostack, preserves_flags));
            p = p.add(8);
        }
        while p < end {
            p.write(0);
            flush(p);
            p = p.add(1);
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::ptr::write_bytes(dst, 0, len);
        let mut line = dst as usize & !(CACHE_LINE - 1);
        while line < dst as usize + len {
            flush(line as *const u8);
            line += CACHE_LINE;
        }
    }
}

/// A file mapped for direct persistent-memory access.
///
/// The mapping is tried with `MAP_SHARED_VALIDATE | MAP_SYNC` first, which
/// the kernel only accepts on a DAX-capable filesystem; on failure it falls
/// back to a plain `MAP_SHARED` mapping with `is_pmem` unset so callers can
/// decide whether that is acceptable.
#[derive(Debug)]
pub struct PmFile {
    base: *mut u8,
    len: usize,
    is_pmem: bool,
}

// The mapping is owned by this struct; nothing else aliases it until the
// caller hands out pointers, at which point the caller takes over the
// aliasing discipline.
unsafe impl Send for PmFile {}

impl PmFile {
    /// Opens (creating if necessary) `path`, sizes it to `len`, and maps it.
    pub fn map(path: &Path, len: usize) -> Result<PmFile, Errno> {
        let fd = open(
            path,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        ftruncate(fd.as_raw_fd(), len as i64)?;

        let (base, is_pmem) = Self::mmap_sync_or_shared(std::ptr::null_mut(), len, &fd, false)?;
        debug!(
            "mapped {} ({} bytes) at {:p}, is_pmem={}",
            path.display(),
            len,
            base,
            is_pmem
        );
        Ok(PmFile {
            base,
            len,
            is_pmem,
        })
    }

    /// Maps an already-open region image file at a fixed address.
    pub fn map_fixed(addr: *mut u8, len: usize, fd: &OwnedFd) -> Result<(*mut u8, bool), Errno> {
        Self::mmap_sync_or_shared(addr, len, fd, true)
    }

    fn mmap_sync_or_shared(
        addr: *mut u8,
        len: usize,
        fd: &OwnedFd,
        fixed: bool,
    ) -> Result<(*mut u8, bool), Errno> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let fixed_flag = if fixed { libc::MAP_FIXED } else { 0 };

        let sync_flags = libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC | fixed_flag;
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                prot,
                sync_flags,
                fd.as_raw_fd(),
                0,
            )
        };
        if ret != libc::MAP_FAILED {
            return Ok((ret as *mut u8, true));
        }

        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                prot,
                libc::MAP_SHARED | fixed_flag,
                fd.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        Ok((ret as *mut u8, false))
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping supports synchronous persistence (`MAP_SYNC`).
    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }
}

impl Drop for PmFile {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) } != 0 {
            log::warn!("munmap of PM file mapping failed: {}", Errno::last());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_line_rounding() {
        assert_eq!(align_to_cache_line(0), 0);
        assert_eq!(align_to_cache_line(1), 64);
        assert_eq!(align_to_cache_line(64), 64);
        assert_eq!(align_to_cache_line(65), 128);
    }

    #[test]
    fn map_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmfile");
        let f = PmFile::map(&path, 4096).unwrap();
        unsafe {
            f.base().write(0xab);
            flush(f.base());
        }
        drain();
        assert_eq!(unsafe { f.base().read() }, 0xab);
        assert_eq!(f.len(), 4096);
        // tempdir is not DAX; the fallback path must have been taken.
        assert!(!f.is_pmem());
    }

    #[test]
    fn memset_nt_zeroes() {
        let mut buf = vec![0xffu8; 300];
        unsafe { memset_nt(buf.as_mut_ptr(), buf.len()) };
        drain();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
