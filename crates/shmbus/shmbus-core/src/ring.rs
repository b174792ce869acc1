//! Message ring: a fixed entry index over the byte arena.
//!
//! Entries are 24-byte descriptors addressed by a monotonically increasing
//! sequence number modulo capacity. `next_index` is the linearization point:
//! the writer publishes the entry record first and increments `next_index`
//! with release ordering after; readers compare their cursor against an
//! acquire load before touching the entry.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────┬──────────────┬───────────────┐
//! │ RingState { next_index,      │ Entry[C]     │ arena         │
//! │   current_size, capacity }   │              │ (state+bytes) │
//! └──────────────────────────────┴──────────────┴───────────────┘
//! ```

use crate::arena::{CyclicArena, Span};
use crate::error::BusError;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
struct RingState {
    /// Sequence number of the next entry to publish. Monotonic.
    next_index: AtomicU64,
    /// Sum of entry sizes currently addressable in the ring window.
    current_size: AtomicU64,
    /// Entry slots. Fixed at init; not required to be a power of two.
    capacity: u64,
}

/// One committed message: where it lives in the arena and what it is.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub size: u64,
    pub tag: u64,
    pub offset: u64,
}

/// Writer side of the ring. Owns publication; composed into the server-side
/// topic.
pub struct Ring {
    state: *mut RingState,
    entries: *mut Entry,
    arena: CyclicArena,
}

// Shared between publisher and dispatcher threads; all cross-thread state is
// atomic or guarded by the arena writer lock.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

fn entries_offset() -> usize {
    size_of::<RingState>()
}

fn arena_offset(capacity: u64) -> usize {
    entries_offset() + capacity as usize * size_of::<Entry>()
}

impl Ring {
    /// Bytes needed for a ring of `capacity` entries over `arena_bytes` of
    /// payload.
    pub fn size_of(capacity: u64, arena_bytes: u64) -> usize {
        arena_offset(capacity) + CyclicArena::size_of(arena_bytes)
    }

    /// Initializes a fresh ring at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `size_of(capacity, arena_bytes)`
    /// writable, 8-byte-aligned bytes, exclusively owned during the call.
    pub unsafe fn init(base: *mut u8, capacity: u64, arena_bytes: u64) -> Self {
        unsafe {
            let state = base as *mut RingState;
            std::ptr::write(
                state,
                RingState {
                    next_index: AtomicU64::new(0),
                    current_size: AtomicU64::new(0),
                    capacity,
                },
            );
            let entries = base.add(entries_offset()) as *mut Entry;
            std::ptr::write_bytes(entries, 0, capacity as usize);
            let arena = CyclicArena::init(base.add(arena_offset(capacity)), arena_bytes);
            Self {
                state,
                entries,
                arena,
            }
        }
    }

    /// Attaches to a ring previously initialized at `base`.
    ///
    /// # Safety
    /// `base` must point to memory where [`Ring::init`] ran, still mapped for
    /// the lifetime of the returned value.
    pub unsafe fn attach(base: *mut u8) -> Self {
        unsafe {
            let state = base as *mut RingState;
            let capacity = (*state).capacity;
            Self {
                state,
                entries: base.add(entries_offset()) as *mut Entry,
                arena: CyclicArena::attach(base.add(arena_offset(capacity))),
            }
        }
    }

    #[inline]
    fn state(&self) -> &RingState {
        // SAFETY: state points at an initialized RingState for self's
        // lifetime.
        unsafe { &*self.state }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.state().capacity
    }

    #[inline]
    pub fn next_index(&self) -> u64 {
        self.state().next_index.load(Ordering::Acquire)
    }

    /// Sum of sizes of the entries currently addressable in the window. Can
    /// exceed the arena size, which means some entries were overwritten by
    /// wrap.
    #[inline]
    pub fn buffered_size(&self) -> u64 {
        self.state().current_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn arena(&self) -> &CyclicArena {
        &self.arena
    }

    /// Clears a stale arena writer lock left by a crashed producer.
    pub fn unlock(&self) -> bool {
        self.arena.unlock()
    }

    /// Opens a writer scope over at least `min_size` bytes. On drop with a
    /// positive committed size the entry becomes visible to readers.
    pub fn writer_scope(&self, min_size: u64, tag: u64) -> Result<WriterScope<'_>, BusError> {
        let span = self.arena.reserve(min_size)?;
        Ok(WriterScope {
            ring: self,
            span: Some(span),
            tag,
        })
    }

    fn publish(&self, span: &Span<'_>, tag: u64) {
        let state = self.state();
        let written = span.committed();
        let next = state.next_index.load(Ordering::Relaxed);
        let slot = (next % state.capacity) as usize;

        // The entry being replaced leaves the addressable window.
        let evicted = if next >= state.capacity {
            // SAFETY: slot < capacity.
            unsafe { (*self.entries.add(slot)).size }
        } else {
            0
        };
        state
            .current_size
            .fetch_add(written.wrapping_sub(evicted), Ordering::Relaxed);

        // SAFETY: the arena writer lock serializes publishers, so this slot
        // is written by at most one thread; readers only touch it after the
        // release increment below.
        unsafe {
            std::ptr::write(
                self.entries.add(slot),
                Entry {
                    size: written,
                    tag,
                    offset: span.start_offset(),
                },
            );
        }
        state.next_index.fetch_add(1, Ordering::Release);
    }
}

/// RAII hold over one pending entry. Write through [`WriterScope::bytes_mut`],
/// [`WriterScope::commit`] the final size, drop to publish. Dropping with
/// nothing committed publishes nothing.
pub struct WriterScope<'a> {
    ring: &'a Ring,
    span: Option<Span<'a>>,
    tag: u64,
}

impl<'a> WriterScope<'a> {
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.span.as_mut().expect("span present until drop").bytes_mut()
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.span.as_ref().expect("span present until drop").capacity()
    }

    #[inline]
    pub fn committed(&self) -> u64 {
        self.span.as_ref().expect("span present until drop").committed()
    }

    pub fn commit(&mut self, len: u64) -> Result<(), BusError> {
        self.span.as_mut().expect("span present until drop").commit(len)
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl Drop for WriterScope<'_> {
    fn drop(&mut self) {
        let span = self.span.take().expect("span present until drop");
        if span.committed() > 0 {
            self.ring.publish(&span, self.tag);
        }
        // span drops here, releasing the arena writer lock after the entry
        // is visible.
    }
}

/// Read side of the ring, usable over a read-only mapping.
pub struct RingView {
    state: *const RingState,
    entries: *const Entry,
    arena_data: *const u8,
}

// Read-only view over shared state; safe to hand across threads.
unsafe impl Send for RingView {}
unsafe impl Sync for RingView {}

impl RingView {
    /// Attaches a read-only view to a ring previously initialized at `base`.
    ///
    /// # Safety
    /// Same contract as [`Ring::attach`], minus writability.
    pub unsafe fn attach(base: *const u8) -> Self {
        unsafe {
            let state = base as *const RingState;
            let capacity = (*state).capacity;
            let arena_base = base.add(arena_offset(capacity));
            Self {
                state,
                entries: base.add(entries_offset()) as *const Entry,
                // Skip the arena's own state header to reach the data bytes.
                arena_data: arena_base.add(CyclicArena::size_of(0)),
            }
        }
    }

    #[inline]
    fn state(&self) -> &RingState {
        // SAFETY: state points at an initialized RingState for self's
        // lifetime.
        unsafe { &*self.state }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.state().capacity
    }

    #[inline]
    pub fn next_index(&self) -> u64 {
        self.state().next_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn buffered_size(&self) -> u64 {
        self.state().current_size.load(Ordering::Relaxed)
    }

    /// Opens a chasing cursor positioned so that the entry at `at` is the
    /// first it yields. Readers that fall more than `capacity` entries
    /// behind may observe bytes reused by wrap; there is no per-entry
    /// generation counter to detect that.
    pub fn open_cursor(&self, at: u64) -> RingCursor {
        RingCursor {
            index: at.wrapping_sub(1),
        }
    }

    /// Opens a cursor at the current head; it yields only entries published
    /// after this call.
    pub fn open_cursor_at_head(&self) -> RingCursor {
        self.open_cursor(self.next_index())
    }

    /// In-place accessor for the entry under the cursor.
    pub fn entry(&self, cursor: &RingCursor) -> EntryAccessor<'_> {
        let slot = (cursor.index % self.capacity()) as usize;
        // SAFETY: slot < capacity; the descriptor was published before
        // next_index covered it (release/acquire pairing in try_read).
        let entry = unsafe { *self.entries.add(slot) };
        // SAFETY: committed entries lie entirely within the arena data area.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                self.arena_data.add(entry.offset as usize),
                entry.size as usize,
            )
        };
        EntryAccessor {
            size: entry.size,
            tag: entry.tag,
            bytes,
        }
    }
}

/// Consumer-side position. The cursor chases the producer: it yields entries
/// published after the position it was opened at, without ever blocking the
/// producer.
#[derive(Debug)]
pub struct RingCursor {
    index: u64,
}

impl RingCursor {
    /// Advances to the next entry if one is visible. Both outcomes are
    /// normal operation.
    #[inline]
    pub fn try_read(&mut self, view: &RingView) -> bool {
        let diff = view.next_index().wrapping_sub(self.index);
        if diff > 1 {
            self.index = self.index.wrapping_add(1);
            true
        } else {
            false
        }
    }

    /// Entries published beyond the current position.
    pub fn remaining(&self, view: &RingView) -> u64 {
        view.next_index().wrapping_sub(self.index).wrapping_sub(1)
    }
}

/// Zero-copy window onto one committed entry.
pub struct EntryAccessor<'a> {
    size: u64,
    tag: u64,
    bytes: &'a [u8],
}

impl<'a> EntryAccessor<'a> {
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Reads the payload as a plain value. The caller asserts the entry was
    /// published with this type's layout.
    pub fn read_as<T: Copy>(&self) -> T {
        assert!(self.bytes.len() >= size_of::<T>());
        // SAFETY: length checked; alignment handled by read_unaligned.
        unsafe { std::ptr::read_unaligned(self.bytes.as_ptr() as *const T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRing {
        _mem: Vec<u64>,
        ring: Ring,
        view: RingView,
    }

    fn test_ring(capacity: u64, arena_bytes: u64) -> TestRing {
        let mut mem = vec![0u64; Ring::size_of(capacity, arena_bytes).div_ceil(8)];
        let base = mem.as_mut_ptr() as *mut u8;
        let ring = unsafe { Ring::init(base, capacity, arena_bytes) };
        let view = unsafe { RingView::attach(base) };
        TestRing {
            _mem: mem,
            ring,
            view,
        }
    }

    fn publish(ring: &Ring, tag: u64, payload: &[u8]) {
        let mut scope = ring.writer_scope(payload.len() as u64, tag).unwrap();
        scope.bytes_mut()[..payload.len()].copy_from_slice(payload);
        scope.commit(payload.len() as u64).unwrap();
    }

    #[test]
    fn publish_then_read() {
        let t = test_ring(8, 256);
        let mut cursor = t.view.open_cursor(0);

        assert!(!cursor.try_read(&t.view));
        publish(&t.ring, 7, b"hello ring");

        assert_eq!(t.ring.next_index(), 1);
        assert!(cursor.try_read(&t.view));
        let acc = t.view.entry(&cursor);
        assert_eq!(acc.tag(), 7);
        assert_eq!(acc.size(), 10);
        assert_eq!(acc.bytes(), b"hello ring");
        assert!(!cursor.try_read(&t.view));
    }

    #[test]
    fn uncommitted_scope_publishes_nothing() {
        let t = test_ring(8, 256);
        {
            let mut scope = t.ring.writer_scope(16, 1).unwrap();
            scope.bytes_mut()[0] = 0xFF;
            // no commit
        }
        assert_eq!(t.ring.next_index(), 0);
        assert_eq!(t.ring.buffered_size(), 0);
        // Lock released, the next publish goes through.
        publish(&t.ring, 1, b"x");
        assert_eq!(t.ring.next_index(), 1);
    }

    #[test]
    fn failed_reserve_changes_nothing() {
        let t = test_ring(8, 64);
        let before = t.ring.next_index();
        assert!(t.ring.writer_scope(65, 0).is_err());
        assert_eq!(t.ring.next_index(), before);
        assert_eq!(t.ring.buffered_size(), 0);
    }

    #[test]
    fn current_size_tracks_window() {
        let t = test_ring(2, 1024);
        publish(&t.ring, 0, &[0u8; 10]);
        publish(&t.ring, 0, &[0u8; 20]);
        assert_eq!(t.ring.buffered_size(), 30);

        // Third publish evicts the 10-byte entry from the window.
        publish(&t.ring, 0, &[0u8; 40]);
        assert_eq!(t.ring.buffered_size(), 60);
    }

    #[test]
    fn window_entries_stay_within_arena() {
        let t = test_ring(4, 128);
        for i in 0..10u64 {
            publish(&t.ring, i, &[i as u8; 48]);
        }

        let next = t.view.next_index();
        let cap = t.view.capacity();
        for k in next.saturating_sub(cap)..next {
            let mut cursor = t.view.open_cursor(k);
            assert!(cursor.try_read(&t.view));
            let acc = t.view.entry(&cursor);
            assert!(acc.size() > 0);
            assert!(
                acc.size() + (acc.bytes().as_ptr() as u64 - t.view.arena_data as u64) <= 128,
                "entry escapes the arena"
            );
        }
    }

    #[test]
    fn cursor_chases_across_wrap() {
        let t = test_ring(4, 64);
        let mut cursor = t.view.open_cursor(0);
        let mut read = 0u64;
        for i in 0..9u8 {
            publish(&t.ring, u64::from(i), &[i; 16]);
            while cursor.try_read(&t.view) {
                let acc = t.view.entry(&cursor);
                assert_eq!(acc.bytes()[0], i);
                read += 1;
            }
        }
        assert_eq!(read, 9);
    }

    #[test]
    fn typed_read_roundtrip() {
        let t = test_ring(4, 256);
        #[repr(C)]
        #[derive(Clone, Copy, PartialEq, Debug)]
        struct Record {
            value: u64,
            stamp: u64,
        }

        let rec = Record {
            value: 42,
            stamp: 777,
        };
        let mut scope = t
            .ring
            .writer_scope(size_of::<Record>() as u64, 7)
            .unwrap();
        // SAFETY: span is at least size_of::<Record>() bytes.
        unsafe {
            std::ptr::write_unaligned(scope.bytes_mut().as_mut_ptr() as *mut Record, rec);
        }
        scope.commit(size_of::<Record>() as u64).unwrap();
        drop(scope);

        let mut cursor = t.view.open_cursor(0);
        assert!(cursor.try_read(&t.view));
        let acc = t.view.entry(&cursor);
        assert_eq!(acc.read_as::<Record>(), rec);
    }
}
