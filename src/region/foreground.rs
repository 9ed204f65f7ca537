//! Foreground half of cooperating recovery.
//!
//! The restored consumer streams its region catalog over a pipe; the
//! foreground rebuilds each region by reserving the address range with an
//! anonymous `MAP_FIXED` mapping and then `read(2)`-ing the image file into
//! it. Reading instead of mapping keeps the foreground from holding a second
//! `MAP_SYNC` mapping of a file the consumer is about to write through.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::trace;
use nix::errno::Errno;
use nix::fcntl::{open, openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::read;

use super::table::{self, RegionRecord};

/// Reads `(base, size, file_id)` records from `pipe_fd` until the zero
/// sentinel, mapping and filling each region.
pub fn map_recovered_regions(pm_path: &Path, pipe_fd: RawFd) -> Result<(), Errno> {
    let dirfd = open(pm_path, OFlag::O_DIRECTORY, Mode::empty())?;
    let dirfd = unsafe { OwnedFd::from_raw_fd(dirfd) };

    loop {
        let mut buf = [0u8; RegionRecord::SIZE];
        read_exact(pipe_fd, &mut buf)?;
        let record = *bytemuck::from_bytes::<RegionRecord>(&buf);
        if record.is_sentinel() {
            return Ok(());
        }
        let (base, size, file_id) = (record.base as usize, record.size as usize, record.file_id);

        // Reserve the address range first; reading into unmapped memory
        // would fault, and mapping the image file itself is exactly what we
        // are avoiding.
        let addr = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        if addr as usize != base {
            return Err(Errno::EINVAL);
        }

        let name = table::image_file_name(base, file_id);
        let fd = openat(dirfd.as_raw_fd(), name.as_str(), OFlag::O_RDWR, Mode::empty())?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let dst = unsafe { std::slice::from_raw_parts_mut(base as *mut u8, size) };
        read_exact(fd.as_raw_fd(), dst)?;

        trace!("recovered region read in at {:x}, {} bytes", base, size);
    }
}

/// Fills `buf` completely or fails: a short stream here means the recovery
/// protocol broke and startup must be retried.
pub(crate) fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<(), Errno> {
    let mut got = 0;
    while got < buf.len() {
        match read(fd, &mut buf[got..])? {
            0 => return Err(Errno::EINVAL),
            n => got += n,
        }
    }
    Ok(())
}
