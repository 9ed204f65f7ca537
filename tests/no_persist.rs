//! End-to-end drain: a real forked consumer replays records pushed by this
//! process. The consume function bumps a counter in a `MAP_SHARED`
//! anonymous page, so the producer can watch the consumer's progress.
//!
//! One `Psm::init` per process pair, so this file holds a single test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use psm::{ConsumeFn, Psm, PsmConfig, PsmMode};

static COUNTER_ADDR: AtomicUsize = AtomicUsize::new(0);

fn counter() -> &'static AtomicUsize {
    unsafe { &*(COUNTER_ADDR.load(Ordering::Relaxed) as *const AtomicUsize) }
}

fn apply(record: &[u8]) -> usize {
    assert_eq!(record[0], 0x01);
    counter().fetch_add(1, Ordering::SeqCst);
    1
}

#[test]
fn forked_consumer_replays_all_records() {
    // The counter page must exist before the fork inside `init`.
    let page = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);
    COUNTER_ADDR.store(page as usize, Ordering::Relaxed);

    let dir = tempfile::tempdir().unwrap();
    let mut psm = Psm::init(PsmConfig {
        mode: PsmMode::NoPersist,
        pm_path: dir.path().to_path_buf(),
        pin_core: None,
        consume: ConsumeFn::Bytes(apply),
        checkpointer: None,
        service_path: None,
        imgs_dir: None,
    })
    .unwrap();

    // Enough records to wrap the 1 MiB ring several times, forcing the
    // producer to spin on the consumer's tail.
    const TOTAL: usize = 50_000;
    const BATCH: usize = 100;
    for _ in 0..TOTAL / BATCH {
        for _ in 0..BATCH {
            psm.push(&[0x01]);
        }
        psm.commit(true);
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while counter().load(Ordering::SeqCst) < TOTAL {
        assert!(
            Instant::now() < deadline,
            "consumer stalled at {} of {}",
            counter().load(Ordering::SeqCst),
            TOTAL
        );
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(counter().load(Ordering::SeqCst), TOTAL);
}
