//! Crash/recovery scenarios driven through the instrumentation surface,
//! each against its own scratch PM directory. "Crashing" means dropping the
//! engine without cleanup and reopening in recovered mode, which is exactly
//! the state a real crash leaves on disk.

use psm::instrument;

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

fn fill(addr: usize, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(addr as *mut u8, byte, len) };
}

fn read_byte(addr: usize) -> u8 {
    unsafe { (addr as *const u8).read() }
}

#[test]
fn crash_after_commit_record_adopts_tail_and_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let base = anon_mapping(4096);

    {
        let mut inst = instrument::open(dir.path(), false).unwrap();
        inst.handle_mmap_result(base, 4096).unwrap();
        // Commit record lands, but the crash hits before the catalog rename
        // and before the post-commit cleanup.
        inst.undo_mut().commit(41);
    }

    let mut inst = instrument::open(dir.path(), true).unwrap();
    let tail = inst.recover().unwrap();
    assert_eq!(tail, Some(41));
    // Recovery completed the pending catalog rename.
    assert!(inst.regions().does_manage(base));
    assert_eq!(inst.regions().regions().len(), 1);
}

#[test]
fn crash_mid_replay_rolls_back_stores() {
    let dir = tempfile::tempdir().unwrap();
    let size = 4096;
    let base = anon_mapping(size);

    {
        let mut inst = instrument::open(dir.path(), false).unwrap();
        inst.handle_mmap_result(base, size).unwrap();
        fill(base, size, 0x11);
        // Baseline commit: the region contents (all 0x11) are now the
        // committed state.
        inst.commit(0);
        inst.post_commit_cleanup();

        // Replay of the next command: two instrumented stores, then crash
        // before their commit.
        unsafe {
            inst.record_write(base + 64, 8, usize::MAX);
            fill(base + 64, 8, 0x22);
            inst.record_write(base + 256, 16, usize::MAX);
            fill(base + 256, 16, 0x33);
        }
    }
    assert_eq!(read_byte(base + 64), 0x22);

    let mut inst = instrument::open(dir.path(), true).unwrap();
    let tail = inst.recover().unwrap();
    // No commit record: the tail is unchanged and the stores are undone.
    assert_eq!(tail, None);
    assert_eq!(read_byte(base + 64), 0x11);
    assert_eq!(read_byte(base + 64 + 7), 0x11);
    assert_eq!(read_byte(base + 256), 0x11);
    assert_eq!(read_byte(base + 256 + 15), 0x11);
    // Untouched bytes kept their committed value all along.
    assert_eq!(read_byte(base + 128), 0x11);
    assert!(inst.regions().does_manage(base));
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let size = 4096;
    let base = anon_mapping(size);

    {
        let mut inst = instrument::open(dir.path(), false).unwrap();
        inst.handle_mmap_result(base, size).unwrap();
        fill(base, size, 0x44);
        inst.commit(7);
        inst.post_commit_cleanup();
        unsafe {
            inst.record_write(base + 512, 8, usize::MAX);
        }
        fill(base + 512, 8, 0x55);
    }

    let mut first = instrument::open(dir.path(), true).unwrap();
    assert_eq!(first.recover().unwrap(), None);
    let snapshot: Vec<u8> =
        unsafe { std::slice::from_raw_parts(base as *const u8, size) }.to_vec();
    drop(first);

    // A second recovery pass finds an empty log and changes nothing.
    let mut second = instrument::open(dir.path(), true).unwrap();
    assert_eq!(second.recover().unwrap(), None);
    let again = unsafe { std::slice::from_raw_parts(base as *const u8, size) };
    assert_eq!(again, &snapshot[..]);
}

#[test]
fn uncommitted_mmap_disappears_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let size = 4096;
    let committed = anon_mapping(size);
    let fresh = anon_mapping(size);

    {
        let mut inst = instrument::open(dir.path(), false).unwrap();
        inst.handle_mmap_result(committed, size).unwrap();
        inst.commit(0);
        inst.post_commit_cleanup();

        // A region mapped after the commit, with writes into it: neither
        // may survive recovery.
        inst.handle_mmap_result(fresh, size).unwrap();
        unsafe { inst.record_write(fresh + 64, 8, usize::MAX) };
        assert_eq!(inst.undo_mut().len(), 0);
    }

    let mut inst = instrument::open(dir.path(), true).unwrap();
    assert_eq!(inst.recover().unwrap(), None);
    assert!(inst.regions().does_manage(committed));
    assert!(!inst.regions().does_manage(fresh));
    // The fresh region's orphaned image file was cleaned up.
    let leftover: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            psm::region::table::parse_image_file_name(&name).map(|(base, _)| base)
        })
        .collect();
    assert_eq!(leftover, vec![committed]);
}
