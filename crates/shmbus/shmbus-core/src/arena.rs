//! Wrap-around byte arena with a single exclusive writer.
//!
//! The arena hands out contiguous spans from a fixed buffer. Allocation is
//! monotonic: each reservation starts where the previous one committed. When
//! the remaining tail is too small for a request the offset resets to zero
//! and older bytes get overwritten; the arena never reports "full".
//!
//! Exactly one span may be open at a time; the `in_use` flag in the shared
//! state enforces the single-producer invariant across processes.
//!
//! # Memory Layout
//!
//! ```text
//! ┌───────────────────────────────┬────────────────────────────┐
//! │ ArenaState { offset, size,    │  data bytes [0, size)      │
//! │              in_use }         │                            │
//! └───────────────────────────────┴────────────────────────────┘
//! ```

use crate::error::BusError;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[repr(C)]
struct ArenaState {
    /// Next byte to hand out. Only the span holder advances it.
    offset: AtomicU64,
    /// Data bytes available, fixed at init.
    size: u64,
    /// Writer lock. Set while a span is open.
    in_use: AtomicBool,
}

/// Byte arena over externally owned memory (a shared region or a test
/// allocation). The arena never frees or owns its backing storage.
pub struct CyclicArena {
    state: *mut ArenaState,
    buffer: *mut u8,
}

// The arena is shared between the publisher thread and the dispatcher; all
// mutation goes through the atomics in ArenaState or is guarded by `in_use`.
unsafe impl Send for CyclicArena {}
unsafe impl Sync for CyclicArena {}

impl CyclicArena {
    /// Bytes needed to host an arena with `data_size` data bytes.
    pub const fn size_of(data_size: u64) -> usize {
        size_of::<ArenaState>() + data_size as usize
    }

    /// Initializes a fresh arena at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `size_of(data_size)` writable bytes with
    /// 8-byte alignment, exclusively owned during the call.
    pub unsafe fn init(base: *mut u8, data_size: u64) -> Self {
        unsafe {
            let state = base as *mut ArenaState;
            std::ptr::write(
                state,
                ArenaState {
                    offset: AtomicU64::new(0),
                    size: data_size,
                    in_use: AtomicBool::new(false),
                },
            );
            Self {
                state,
                buffer: base.add(size_of::<ArenaState>()),
            }
        }
    }

    /// Attaches to an arena previously initialized at `base`.
    ///
    /// # Safety
    /// `base` must point to memory where [`CyclicArena::init`] ran, still
    /// mapped for the lifetime of the returned value.
    pub unsafe fn attach(base: *mut u8) -> Self {
        unsafe {
            Self {
                state: base as *mut ArenaState,
                buffer: base.add(size_of::<ArenaState>()),
            }
        }
    }

    #[inline]
    fn state(&self) -> &ArenaState {
        // SAFETY: state points at an initialized ArenaState for self's
        // lifetime; mutation happens only through its atomics.
        unsafe { &*self.state }
    }

    /// Data bytes this arena can hold.
    #[inline]
    pub fn data_size(&self) -> u64 {
        self.state().size
    }

    /// Pointer to the byte at `offset` inside the data area.
    #[inline]
    pub(crate) fn data_ptr(&self, offset: u64) -> *mut u8 {
        // SAFETY: callers pass offsets inside [0, size), established by the
        // span they obtained the offset from.
        unsafe { self.buffer.add(offset as usize) }
    }

    /// Reserves a write span of at least `min_size` bytes.
    ///
    /// Wraps to offset zero when the tail is too small. The returned span
    /// covers all contiguous free bytes from the (possibly reset) offset.
    pub fn reserve(&self, min_size: u64) -> Result<Span<'_>, BusError> {
        let state = self.state();
        if min_size > state.size {
            return Err(BusError::TooLarge {
                requested: min_size,
                arena_size: state.size,
            });
        }

        if state
            .in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(BusError::ArenaBusy);
        }

        let mut offset = state.offset.load(Ordering::Relaxed);
        if state.size - offset < min_size {
            offset = 0;
            state.offset.store(0, Ordering::Relaxed);
        }

        Ok(Span {
            arena: self,
            start: offset,
            capacity: state.size - offset,
            committed: 0,
        })
    }

    /// Forcibly clears the writer lock. Returns whether it was set.
    ///
    /// Recovery hook for reopening a region whose producer died mid-write;
    /// must not be called while a live producer exists.
    pub fn unlock(&self) -> bool {
        self.state()
            .in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// An exclusive write window into the arena. Dropping the span releases the
/// writer lock; committed bytes stay behind at `[start, start + committed)`.
pub struct Span<'a> {
    arena: &'a CyclicArena,
    start: u64,
    capacity: u64,
    committed: u64,
}

impl<'a> Span<'a> {
    /// Offset of the first byte of this span inside the arena.
    #[inline]
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// The whole reserved window as a mutable slice.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the span holds the writer lock, so this window is ours
        // exclusively until drop.
        unsafe {
            std::slice::from_raw_parts_mut(self.arena.data_ptr(self.start), self.capacity as usize)
        }
    }

    /// Integrates `len` more bytes into the arena. May be called repeatedly
    /// while the running total stays within the span capacity.
    pub fn commit(&mut self, len: u64) -> Result<(), BusError> {
        if len > self.capacity - self.committed {
            return Err(BusError::Overcommit {
                requested: len,
                remaining: self.capacity - self.committed,
            });
        }
        self.committed += len;
        self.arena.state().offset.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Span<'_> {
    fn drop(&mut self) {
        self.arena.state().in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-byte-aligned scratch memory for hosting an arena in tests.
    fn backing(data_size: u64) -> Vec<u64> {
        vec![0u64; CyclicArena::size_of(data_size).div_ceil(8)]
    }

    #[test]
    fn reserve_commit_release() {
        let mut mem = backing(64);
        let arena = unsafe { CyclicArena::init(mem.as_mut_ptr() as *mut u8, 64) };

        let mut span = arena.reserve(16).unwrap();
        assert_eq!(span.start_offset(), 0);
        assert_eq!(span.capacity(), 64);
        span.bytes_mut()[..4].copy_from_slice(b"abcd");
        span.commit(4).unwrap();
        assert_eq!(span.committed(), 4);
        drop(span);

        let span = arena.reserve(16).unwrap();
        assert_eq!(span.start_offset(), 4);
        assert_eq!(span.capacity(), 60);
    }

    #[test]
    fn second_reserve_while_open_is_busy() {
        let mut mem = backing(64);
        let arena = unsafe { CyclicArena::init(mem.as_mut_ptr() as *mut u8, 64) };

        let _span = arena.reserve(8).unwrap();
        assert!(matches!(arena.reserve(8), Err(BusError::ArenaBusy)));
    }

    #[test]
    fn oversized_reserve_fails() {
        let mut mem = backing(32);
        let arena = unsafe { CyclicArena::init(mem.as_mut_ptr() as *mut u8, 32) };
        assert!(matches!(
            arena.reserve(33),
            Err(BusError::TooLarge { requested: 33, .. })
        ));
    }

    #[test]
    fn exact_size_reserve_then_wrap() {
        let mut mem = backing(32);
        let arena = unsafe { CyclicArena::init(mem.as_mut_ptr() as *mut u8, 32) };

        let mut span = arena.reserve(32).unwrap();
        assert_eq!(span.start_offset(), 0);
        span.commit(32).unwrap();
        drop(span);

        // Tail is empty now; the next reserve wraps to offset 0.
        let span = arena.reserve(8).unwrap();
        assert_eq!(span.start_offset(), 0);
        assert_eq!(span.capacity(), 32);
    }

    #[test]
    fn commit_past_span_is_overcommit() {
        let mut mem = backing(32);
        let arena = unsafe { CyclicArena::init(mem.as_mut_ptr() as *mut u8, 32) };

        let mut span = arena.reserve(8).unwrap();
        span.commit(30).unwrap();
        assert!(matches!(
            span.commit(3),
            Err(BusError::Overcommit { requested: 3, remaining: 2 })
        ));
    }

    #[test]
    fn unlock_clears_stale_lock() {
        let mut mem = backing(32);
        let arena = unsafe { CyclicArena::init(mem.as_mut_ptr() as *mut u8, 32) };

        assert!(!arena.unlock());
        let span = arena.reserve(8).unwrap();
        std::mem::forget(span);
        assert!(arena.unlock());
        assert!(arena.reserve(8).is_ok());
    }

    #[test]
    fn attach_sees_existing_state() {
        let mut mem = backing(64);
        let base = mem.as_mut_ptr() as *mut u8;
        let arena = unsafe { CyclicArena::init(base, 64) };
        let mut span = arena.reserve(8).unwrap();
        span.bytes_mut()[0] = 0x5A;
        span.commit(8).unwrap();
        drop(span);

        let other = unsafe { CyclicArena::attach(base) };
        assert_eq!(other.data_size(), 64);
        unsafe {
            assert_eq!(*other.data_ptr(0), 0x5A);
        }
        let span = other.reserve(8).unwrap();
        assert_eq!(span.start_offset(), 8);
    }
}
