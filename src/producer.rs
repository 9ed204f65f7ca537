//! The foreground side: initialization, the fork, recovery synchronization
//! with a restored consumer, and the public append surface.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{close, fork, pipe, write, ForkResult, Pid};

use crate::chkpt::CheckpointOutcome;
use crate::config::{ConsumeFn, PsmConfig, PsmMode, SgArray};
use crate::consumer::{self, Consumer};
use crate::error::{os_err, InitError};
use crate::pm::PmFile;
use crate::ranges::RangeSet;
use crate::region::foreground::{map_recovered_regions, read_exact};
use crate::ring::{PsmLog, Ring, SharedCursors};

pub const PSM_LOG_FILE: &str = "psm_log";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The foreground handle to an initialized PSM instance.
///
/// Only one instance per producer/consumer process pair is supported; a
/// second `init` in the same process fails. The producer operations are
/// single-threaded by contract; the ring is strictly single-producer.
pub struct Psm {
    ring: Ring,
    // Keeps the ring file mapping alive.
    _ring_file: PmFile,
    child: Pid,
}

impl Psm {
    /// Maps the command ring, establishes the recovery landing point, and
    /// forks the consumer. When this process is a restored checkpoint
    /// image, it also synchronizes with the new consumer and replays
    /// outstanding commands.
    pub fn init(config: PsmConfig) -> Result<Psm, InitError> {
        config.validate().map_err(InitError::InvalidConfig)?;
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(InitError::AlreadyInitialized);
        }
        let result = Self::init_inner(config);
        if result.is_err() {
            INITIALIZED.store(false, Ordering::SeqCst);
        }
        result
    }

    fn init_inner(config: PsmConfig) -> Result<Psm, InitError> {
        let PsmConfig {
            mode,
            pm_path,
            pin_core,
            consume,
            mut checkpointer,
            ..
        } = config;

        // The cursor block must exist before the fork so both processes
        // share one copy.
        let cursors = map_shared_cursors().map_err(os_err("mapping shared cursors"))?;

        let ring_file = PmFile::map(
            &pm_path.join(PSM_LOG_FILE),
            std::mem::size_of::<PsmLog>(),
        )
        .map_err(os_err("mapping psm_log"))?;
        if mode != PsmMode::NoPersist && !ring_file.is_pmem() {
            return Err(InitError::NotPersistentMemory);
        }
        let mut ring = unsafe { Ring::new(ring_file.base() as *mut PsmLog, cursors) };

        let outcome = match checkpointer.as_mut() {
            Some(chkpt) => chkpt
                .set_recovery_point()
                .map_err(os_err("set_recovery_point"))?,
            None => CheckpointOutcome::FirstTime,
        };
        let restored = outcome == CheckpointOutcome::Restored;
        // The region/tail handshake and the replay pass exist for undo-mode
        // recovery; a restored checkpoint-mode pair just resumes from the
        // persisted cursors.
        let recovered = restored && mode == PsmMode::Undo;

        let mut replay_head = 0;
        if restored {
            let (head, tail) = ring.adopt_persisted();
            replay_head = head;
            debug!("restored image: ring head {}, tail {}", head, tail);
        } else {
            ring.init_fresh();
        }

        // Recovery handshake pipes: background-to-foreground and back.
        let (btf, ftb) = if recovered {
            (
                Some(pipe().map_err(os_err("pipe"))?),
                Some(pipe().map_err(os_err("pipe"))?),
            )
        } else {
            (None, None)
        };

        let mut skip = RangeSet::new();
        skip.insert(ring_file.base() as usize, ring_file.len());
        skip.insert(cursors as usize, std::mem::size_of::<SharedCursors>());

        match unsafe { fork() }.map_err(os_err("fork"))? {
            ForkResult::Child => {
                if let Some(core) = pin_core {
                    pin_to_core(core).expect("pinning the consumer failed");
                }
                let (send_fd, recv_fd) = match (btf, ftb) {
                    (Some((btf_rd, btf_wr)), Some((ftb_rd, ftb_wr))) => {
                        close(btf_rd).expect("closing pipe end failed");
                        close(ftb_wr).expect("closing pipe end failed");
                        (Some(btf_wr), Some(ftb_rd))
                    }
                    _ => (None, None),
                };
                consumer::run(Consumer {
                    ring,
                    mode,
                    consume,
                    pm_path,
                    recovered,
                    send_fd,
                    recv_fd,
                    checkpointer,
                    skip,
                });
            }
            ForkResult::Parent { child } => {
                if let (Some((btf_rd, btf_wr)), Some((ftb_rd, ftb_wr))) = (btf, ftb) {
                    close(btf_wr).map_err(os_err("close"))?;
                    close(ftb_rd).map_err(os_err("close"))?;
                    recover_foreground(&mut ring, &pm_path, consume, replay_head, btf_rd, ftb_wr)?;
                }
                debug!("psm initialized, consumer pid {}", child);
                Ok(Psm {
                    ring,
                    _ring_file: ring_file,
                    child,
                })
            }
        }
    }

    /// Reserves `len` payload bytes in the ring and returns the pointer to
    /// write them through. The length is rounded up to the cache-line size;
    /// the payload must not begin with a zero byte. Spins while the ring is
    /// full.
    pub fn reserve(&mut self, len: usize) -> *mut u8 {
        self.ring.reserve(len)
    }

    /// Copies a record into the ring. The record must not begin with a zero
    /// byte.
    pub fn push(&mut self, record: &[u8]) {
        self.ring.push(record)
    }

    /// Pushes a scatter/gather record: a leading segment count, then each
    /// segment as a native-endian `i32` length followed by its bytes. The
    /// consumer must have been configured with [`ConsumeFn::Sga`].
    pub fn push_sga(&mut self, sga: &SgArray) {
        let segs = sga.segs();
        assert!(!segs.is_empty(), "an sga record needs at least one segment");
        let total = 1 + segs
            .iter()
            .map(|seg| std::mem::size_of::<i32>() + seg.len())
            .sum::<usize>();

        let mut p = self.ring.reserve(total);
        unsafe {
            p.write(segs.len() as u8);
            p = p.add(1);
            for seg in segs {
                let len_bytes = (seg.len() as i32).to_ne_bytes();
                std::ptr::copy_nonoverlapping(len_bytes.as_ptr(), p, len_bytes.len());
                p = p.add(len_bytes.len());
                std::ptr::copy_nonoverlapping(seg.as_ptr(), p, seg.len());
                p = p.add(seg.len());
            }
        }
    }

    /// Publishes everything appended since the last commit. Pass
    /// `push_only` when every record went through [`Psm::push`] (whose
    /// copies are pre-flushed) to skip the buffer flush walk.
    pub fn commit(&mut self, push_only: bool) {
        self.ring.commit(push_only)
    }
}

impl Drop for Psm {
    fn drop(&mut self) {
        // The consumer has no work left that matters past this handle; any
        // in-flight replay is crash-consistent by construction.
        if kill(self.child, Signal::SIGKILL).is_ok() {
            if let Err(e) = waitpid(self.child, None) {
                warn!("reaping the consumer failed: {}", e);
            }
        }
    }
}

/// Maps the one-page shared block holding the cross-process head/tail
/// atomics.
fn map_shared_cursors() -> Result<*const SharedCursors, nix::errno::Errno> {
    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<SharedCursors>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(nix::errno::Errno::last());
    }
    let ptr = ret as *mut SharedCursors;
    SharedCursors::init_at(ptr);
    Ok(ptr)
}

fn pin_to_core(core: usize) -> Result<(), nix::errno::Errno> {
    let mut set = nix::sched::CpuSet::new();
    set.set(core)?;
    nix::sched::sched_setaffinity(Pid::from_raw(0), &set)
}

/// The foreground half of cooperating recovery: rebuild the shadowed
/// regions from their image files, learn the recovered tail, ack, and
/// replay the commands the consumer's committed state has not covered.
fn recover_foreground(
    ring: &mut Ring,
    pm_path: &std::path::Path,
    consume: ConsumeFn,
    replay_head: usize,
    recv_fd: RawFd,
    send_fd: RawFd,
) -> Result<(), InitError> {
    map_recovered_regions(pm_path, recv_fd).map_err(os_err("mapping recovered regions"))?;

    let mut tail_bytes = [0u8; 8];
    read_exact(recv_fd, &mut tail_bytes)
        .map_err(|_| InitError::RecoveryProtocol("short recovered-tail read"))?;
    let mut tail = u64::from_ne_bytes(tail_bytes) as usize;
    close(recv_fd).map_err(os_err("close"))?;

    let written = write(send_fd, &[0u8]).map_err(os_err("recovery ack"))?;
    if written != 1 {
        return Err(InitError::RecoveryProtocol("short recovery ack"));
    }
    close(send_fd).map_err(os_err("close"))?;

    // Re-run everything in [tail, replay_head). The consumer may be
    // replaying the same records concurrently and advancing the shared
    // tail; that's fine, the snapshot bounds are frozen here and the
    // consumer never rewrites ring contents. The consume function is
    // idempotent against committed state by contract.
    let mut replayed = 0;
    loop {
        let result = match consume {
            ConsumeFn::Bytes(f) => ring.consume(&mut |buf| f(buf), replay_head, tail),
            ConsumeFn::Sga(f) => ring.consume(
                &mut |buf| consumer::dispatch_sga(f, buf),
                replay_head,
                tail,
            ),
        };
        match result {
            Some(t) => {
                tail = t;
                replayed += 1;
            }
            None => break,
        }
    }
    debug!("foreground recovery replayed {} command(s)", replayed);
    Ok(())
}
