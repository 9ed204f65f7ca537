//! The persistent command ring: a single-producer / single-consumer circular
//! log living in one PM file, shared between the foreground and background
//! processes.
//!
//! The producer owns `head` and the consumer owns `tail`; each side treats
//! the other's cursor as read-only. Both cursors exist twice: a persistent
//! word in the PM file (flushed before publication) and a process-shared
//! atomic used for cross-process visibility. A record is always contiguous
//! in the buffer; when a record would straddle the buffer end the producer
//! writes a single zero byte at the current head (records never start with
//! a zero byte) and restarts the record at offset zero.

use std::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert_eq;

use crate::pm::{self, align_to_cache_line, CACHE_LINE};

/// Capacity of the circular buffer.
pub const LOG_SIZE: usize = 1 << 20;

/// The ring's persistent layout. `head` and `tail` sit on their own cache
/// lines so flushing one never touches the other.
#[repr(C, align(64))]
pub struct PsmLog {
    head: usize,
    _pad0: [u8; CACHE_LINE - std::mem::size_of::<usize>()],
    tail: usize,
    _pad1: [u8; CACHE_LINE - std::mem::size_of::<usize>()],
    buf: [u8; LOG_SIZE],
}

const_assert_eq!(std::mem::size_of::<PsmLog>(), 2 * CACHE_LINE + LOG_SIZE);

/// Cross-process cursor mirror, placed in a `MAP_SHARED | MAP_ANONYMOUS`
/// mapping created before the fork. Cache-line padded so the producer's
/// `head` stores and the consumer's `tail` stores do not false-share.
#[repr(C, align(64))]
pub struct SharedCursors {
    pub head: AtomicUsize,
    _pad0: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    pub tail: AtomicUsize,
    _pad1: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
}

impl SharedCursors {
    pub fn init_at(ptr: *mut SharedCursors) {
        unsafe {
            ptr.write(SharedCursors {
                head: AtomicUsize::new(0),
                _pad0: [0; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
                tail: AtomicUsize::new(0),
                _pad1: [0; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            })
        }
    }
}

/// One side's handle to the ring. After the fork each process carries its
/// own copy; only the mappings behind `log` and `shared` are shared.
pub(crate) struct Ring {
    log: *mut PsmLog,
    shared: *const SharedCursors,
    /// Producer-only: the head as of the last `reserve`, not yet published.
    local_head: usize,
    /// Producer-only: cached copy of the consumer's published tail.
    local_tail: usize,
}

// The raw pointers refer to process-shared mappings whose SPSC ownership
// discipline is enforced by the fork split, not by the type system.
unsafe impl Send for Ring {}

impl Ring {
    /// `log` must point to a mapped `PsmLog` and `shared` to an initialized
    /// `SharedCursors`; both must stay valid for the ring's lifetime.
    pub unsafe fn new(log: *mut PsmLog, shared: *const SharedCursors) -> Ring {
        Ring {
            log,
            shared,
            local_head: 0,
            local_tail: 0,
        }
    }

    fn shared(&self) -> &SharedCursors {
        unsafe { &*self.shared }
    }

    fn buf(&self) -> *mut u8 {
        unsafe { std::ptr::addr_of_mut!((*self.log).buf) as *mut u8 }
    }

    /// First-time initialization: both cursors start at zero, persistently.
    pub fn init_fresh(&mut self) {
        unsafe {
            std::ptr::addr_of_mut!((*self.log).head).write(0);
            std::ptr::addr_of_mut!((*self.log).tail).write(0);
            pm::flush(std::ptr::addr_of!((*self.log).head));
            pm::flush(std::ptr::addr_of!((*self.log).tail));
        }
        pm::drain();
        self.shared().head.store(0, Ordering::Relaxed);
        self.shared().tail.store(0, Ordering::Relaxed);
        self.local_head = 0;
        self.local_tail = 0;
    }

    /// Restore path: adopt the persisted cursors. Runs before the fork, so
    /// relaxed stores suffice.
    pub fn adopt_persisted(&mut self) -> (usize, usize) {
        let (head, tail) = unsafe { ((*self.log).head, (*self.log).tail) };
        self.shared().head.store(head, Ordering::Relaxed);
        self.shared().tail.store(tail, Ordering::Relaxed);
        self.local_head = head;
        self.local_tail = tail;
        (head, tail)
    }

    pub fn head_acquire(&self) -> usize {
        self.shared().head.load(Ordering::Acquire)
    }

    /// The head word as persisted in the PM file.
    pub fn persisted_head(&self) -> usize {
        unsafe { (*self.log).head }
    }

    /// The tail word as persisted in the PM file.
    pub fn persisted_tail(&self) -> usize {
        unsafe { (*self.log).tail }
    }

    pub fn tail_acquire(&self) -> usize {
        self.shared().tail.load(Ordering::Acquire)
    }

    /// Persists then publishes a new head. Producer side only.
    pub fn update_head(&mut self, new_head: usize) {
        unsafe {
            std::ptr::addr_of_mut!((*self.log).head).write(new_head);
            pm::flush(std::ptr::addr_of!((*self.log).head));
        }
        pm::drain();
        self.shared().head.store(new_head, Ordering::Release);
    }

    /// Persists then publishes a new tail. Consumer side only.
    pub fn update_tail(&mut self, new_tail: usize) {
        unsafe {
            std::ptr::addr_of_mut!((*self.log).tail).write(new_tail);
            pm::flush(std::ptr::addr_of!((*self.log).tail));
        }
        pm::drain();
        self.shared().tail.store(new_tail, Ordering::Release);
    }

    /// Free bytes available to the producer right now, per its cached tail.
    /// One byte is always left unused so that `head == tail` means empty.
    fn free_capacity(&self) -> usize {
        (self.local_tail + LOG_SIZE - self.local_head - 1) % LOG_SIZE
    }

    /// Reserves space for a `len`-byte record and returns a pointer to write
    /// the payload into. The length is rounded up to the cache-line size.
    /// Spins until the consumer has freed enough space.
    ///
    /// The record must not begin with a zero byte.
    pub fn reserve(&mut self, len: usize) -> *mut u8 {
        let mut len = align_to_cache_line(len);
        assert!(len > 0, "must reserve a non-zero number of bytes");
        assert!(len <= LOG_SIZE - 1, "log entry length exceeds log length");

        let local_head = self.local_head;
        let mut wrapped = false;
        if local_head + len > LOG_SIZE {
            // The contiguous space after `local_head` is not enough. Charge
            // it to this record and restart at the front.
            wrapped = true;
            len += LOG_SIZE - local_head;
        }

        while self.free_capacity() < len {
            self.local_tail = self.shared().tail.load(Ordering::Acquire);
        }

        let mut p = unsafe { self.buf().add(local_head) };
        debug_assert_eq!(p as usize % CACHE_LINE, 0);
        if wrapped {
            // A zero byte at `local_head` tells the consumer the rest of the
            // buffer is unused.
            unsafe { p.write(0) };
            pm::flush_invalidate(p);
            p = self.buf();
        }

        self.local_head = (local_head + len) % LOG_SIZE;
        p
    }

    /// `reserve` + copy. The payload's cache lines are flushed here (without
    /// draining), so a later `commit(true)` can skip the buffer walk.
    pub fn push(&mut self, src: &[u8]) {
        debug_assert!(!src.is_empty() && src[0] != 0, "record starts with a zero byte");
        let dst = self.reserve(src.len());
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        let mut line = dst as usize;
        while line < dst as usize + src.len() {
            pm::flush_invalidate(line as *const u8);
            line += CACHE_LINE;
        }
    }

    /// Publishes all reservations since the last commit: flushes the dirty
    /// buffer range (skipped when `push_only`, i.e. everything went through
    /// `push`), drains, then persists and releases the new head.
    pub fn commit(&mut self, push_only: bool) {
        let local_head = self.local_head;
        if local_head == self.shared().head.load(Ordering::Relaxed) {
            return;
        }

        if !push_only {
            let mut i = self.shared().head.load(Ordering::Relaxed);
            while i != local_head {
                let p = unsafe { self.buf().add(i) };
                debug_assert_eq!(p as usize % CACHE_LINE, 0);
                pm::flush_invalidate(p);
                i = (i + CACHE_LINE) % LOG_SIZE;
            }
        }
        pm::drain();

        self.update_head(local_head);
    }

    /// Consumes one record at `tail`, if any: calls `f` with the buffer from
    /// the record's first byte to the buffer end, rounds the consumed length
    /// up to the cache-line size, and returns the advanced tail. Returns
    /// `None` when the ring is empty. Wrap markers are skipped silently.
    pub fn consume<F>(&self, f: &mut F, head: usize, mut tail: usize) -> Option<usize>
    where
        F: FnMut(&[u8]) -> usize,
    {
        loop {
            if tail == head {
                return None;
            }
            let first = unsafe { self.buf().add(tail).read() };
            if first == 0 {
                // Padding from a wrap; the rest of the buffer is unused.
                assert!(tail > head);
                tail = 0;
                continue;
            }
            debug_assert_eq!(
                unsafe { self.buf().add(tail) } as usize % CACHE_LINE,
                0,
                "tail is not cache-line aligned"
            );
            let rest = unsafe { std::slice::from_raw_parts(self.buf().add(tail), LOG_SIZE - tail) };
            let consumed = align_to_cache_line(f(rest));
            assert!(tail + consumed <= LOG_SIZE);
            return Some((tail + consumed) % LOG_SIZE);
        }
    }

    #[cfg(test)]
    fn force_cursors(&mut self, head: usize, tail: usize) {
        unsafe {
            std::ptr::addr_of_mut!((*self.log).head).write(head);
            std::ptr::addr_of_mut!((*self.log).tail).write(tail);
        }
        self.shared().head.store(head, Ordering::Relaxed);
        self.shared().tail.store(tail, Ordering::Relaxed);
        self.local_head = head;
        self.local_tail = tail;
    }
}
