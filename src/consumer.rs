//! The background consumer: drains the ring, replays commands through the
//! embedder's consume function, and drives the commit cycle.
//!
//! Runs in the forked child. Failures here abort the process; the next
//! startup replays from the last commit record, which is exactly the state
//! an abort leaves behind.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use log::{debug, trace};
use nix::unistd::{close, write};

use crate::chkpt::{CheckpointOutcome, Checkpointer};
use crate::config::{ConsumeFn, PsmMode, SgArray};
use crate::instrument::{self, Instrumentation};
use crate::ranges::RangeSet;
use crate::ring::Ring;

/// Commit after this many idle spin rounds with nothing consumed (and at
/// least one success). This keeps the ring from deadlocking when the
/// producer has filled it but the undo log hasn't hit its threshold.
const IDLE_SPIN: u64 = 10;

/// Commit batch for the modes without a commit threshold of their own.
const COMMIT_BATCH: usize = 1;

pub(crate) struct Consumer {
    pub ring: Ring,
    pub mode: PsmMode,
    pub consume: ConsumeFn,
    pub pm_path: PathBuf,
    pub recovered: bool,
    /// Background-to-foreground pipe (write end); present when recovered.
    pub send_fd: Option<RawFd>,
    /// Foreground-to-background pipe (read end); present when recovered.
    pub recv_fd: Option<RawFd>,
    pub checkpointer: Option<Box<dyn Checkpointer + Send>>,
    /// Ranges the shadow manager must leave alone (the ring mapping, the
    /// shared cursor block, engine internals).
    pub skip: RangeSet,
}

/// Decodes an SGA-framed record and hands the segment list to `f`. Returns
/// the framed length. Shared with the foreground's recovery replay.
pub(crate) fn dispatch_sga(f: fn(&SgArray), buf: &[u8]) -> usize {
    let num_segs = buf[0];
    let mut off = 1;
    let mut sga = SgArray::new();
    for _ in 0..num_segs {
        let len = i32::from_ne_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        sga.push(&buf[off..off + len]);
        off += len;
    }
    f(&sga);
    off
}

pub(crate) fn run(mut consumer: Consumer) -> ! {
    let mut inst = match consumer.mode {
        PsmMode::Undo => Some(setup_undo(&mut consumer)),
        PsmMode::NoPersist | PsmMode::Checkpoint => {
            if !consumer.recovered {
                if let Some(chkpt) = consumer.checkpointer.as_mut() {
                    chkpt
                        .take_initial_checkpoint()
                        .expect("initial checkpoint failed");
                }
            }
            None
        }
    };

    let mut tail = consumer.ring.tail_acquire();
    debug!("consumer running, mode {:?}, tail {}", consumer.mode, tail);
    loop {
        tail = drain_once(&mut consumer, inst.as_mut(), tail);
    }
}

/// Undo-mode bring-up: initial checkpoint (first start) or undo recovery
/// plus the region handshake with the foreground (restored).
fn setup_undo(consumer: &mut Consumer) -> Instrumentation {
    if !consumer.recovered {
        consumer
            .checkpointer
            .as_mut()
            .expect("undo mode requires a checkpointer")
            .take_initial_checkpoint()
            .expect("initial checkpoint failed");
    }

    let mut inst =
        instrument::open(&consumer.pm_path, consumer.recovered).expect("undo log setup failed");

    if !consumer.recovered {
        inst.init_address_space(&consumer.skip)
            .expect("seeding the region catalog failed");
        return inst;
    }

    let recovered_tail = inst.recover().expect("undo recovery failed");
    if let Some(t) = recovered_tail {
        consumer.ring.update_tail(t);
    }
    let replay_from = recovered_tail.unwrap_or_else(|| consumer.ring.persisted_tail());

    // Hand the foreground what it needs to rebuild: the region list, then
    // the tail to replay from. Wait for its ack before touching any of
    // those regions: the foreground reads the image files while we could
    // otherwise already be writing through them.
    let send_fd = consumer.send_fd.take().expect("missing recovery pipe");
    let recv_fd = consumer.recv_fd.take().expect("missing recovery pipe");
    inst.regions()
        .send_regions(send_fd)
        .expect("sending recovered regions failed");
    let tail_bytes = (replay_from as u64).to_ne_bytes();
    let written = write(send_fd, &tail_bytes).expect("sending recovered tail failed");
    assert_eq!(written, tail_bytes.len());
    close(send_fd).expect("closing recovery pipe failed");

    let mut ack = [0u8; 1];
    crate::region::foreground::read_exact(recv_fd, &mut ack)
        .expect("waiting for foreground recovery failed");
    close(recv_fd).expect("closing recovery pipe failed");

    debug!("recovery handshake done, replaying from tail {}", replay_from);
    inst
}

/// One drain + commit cycle. Consumes until the undo log asks for a commit
/// (undo mode) or the batch bound is reached (other modes), with the idle
/// budget cutting batches short when the ring runs dry.
fn drain_once(consumer: &mut Consumer, mut inst: Option<&mut Instrumentation>, mut tail: usize) -> usize {
    let mut consumed: usize = 0;
    loop {
        let done_batch = match (&consumer.mode, &inst) {
            (PsmMode::Undo, Some(inst)) => inst.should_commit(),
            _ => consumed >= COMMIT_BATCH,
        };
        if done_batch {
            break;
        }

        let mut spin: u64 = 0;
        let new_tail = loop {
            let head = consumer.ring.head_acquire();
            let result = match consumer.consume {
                ConsumeFn::Bytes(f) => consumer.ring.consume(&mut |buf| f(buf), head, tail),
                ConsumeFn::Sga(f) => consumer
                    .ring
                    .consume(&mut |buf| dispatch_sga(f, buf), head, tail),
            };
            match result {
                Some(t) => break Some(t),
                None => {
                    spin += 1;
                    if spin >= IDLE_SPIN && consumed > 0 {
                        // Been spinning too long; free ring space by
                        // committing what we have.
                        break None;
                    }
                }
            }
        };
        match new_tail {
            Some(t) => {
                trace!("consumed a record, tail {} -> {}", tail, t);
                consumed += 1;
                tail = t;
            }
            None => break,
        }
    }

    match consumer.mode {
        PsmMode::NoPersist => {}
        PsmMode::Undo => {
            inst.as_mut().unwrap().commit(tail);
        }
        PsmMode::Checkpoint => {
            let outcome = consumer
                .checkpointer
                .as_mut()
                .unwrap()
                .checkpoint_commit()
                .expect("checkpoint commit failed");
            if outcome == CheckpointOutcome::Restored {
                // This process is now a resurrected image; resume from the
                // tail its checkpoint captured.
                return consumer.ring.persisted_tail();
            }
        }
    }

    consumer.ring.update_tail(tail);

    if let Some(inst) = inst {
        inst.post_commit_cleanup();
    }

    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sga_dispatch_decodes_frames() {
        // num_segs = 2, then (len, bytes) pairs.
        let mut record = vec![2u8];
        record.extend_from_slice(&3i32.to_ne_bytes());
        record.extend_from_slice(b"abc");
        record.extend_from_slice(&1i32.to_ne_bytes());
        record.extend_from_slice(b"z");
        record.resize(64, 0);

        static SEEN: std::sync::Mutex<Vec<Vec<u8>>> = std::sync::Mutex::new(Vec::new());
        fn collect(sga: &SgArray) {
            let mut seen = SEEN.lock().unwrap();
            seen.clear();
            for seg in sga.segs() {
                seen.push(seg.to_vec());
            }
        }

        let consumed = dispatch_sga(collect, &record);
        assert_eq!(consumed, 1 + 4 + 3 + 4 + 1);
        let seen = SEEN.lock().unwrap();
        assert_eq!(&*seen, &[b"abc".to_vec(), b"z".to_vec()]);
    }
}
