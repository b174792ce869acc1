//! Shared helpers for the shmbus benchmarks.

use shmbus_core::{Ring, RingView};

/// A ring plus its read view hosted on plain heap memory, so benchmarks
/// measure the protocol rather than region setup.
pub struct BenchRing {
    _mem: Vec<u64>,
    pub ring: Ring,
    pub view: RingView,
}

pub fn bench_ring(capacity: u64, arena_bytes: u64) -> BenchRing {
    let mut mem = vec![0u64; Ring::size_of(capacity, arena_bytes).div_ceil(8)];
    let base = mem.as_mut_ptr() as *mut u8;
    // SAFETY: mem is 8-byte aligned, sized by Ring::size_of and kept alive
    // by the returned struct.
    let ring = unsafe { Ring::init(base, capacity, arena_bytes) };
    let view = unsafe { RingView::attach(base) };
    BenchRing {
        _mem: mem,
        ring,
        view,
    }
}
