//! Per-subscriber slot records, one fixed table per topic region.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One row of the subscriber table, living in shared memory.
///
/// The broker owns all transitions except `pending_remove`, which is flipped
/// through the control plane on behalf of the unsubscribing client and
/// observed lazily by the next notify pass.
#[repr(C)]
pub struct SlotRecord {
    /// Ring index of the first entry this subscriber should see. Written
    /// once per subscription, on the first notify.
    pub start_index: AtomicU64,
    /// Signals delivered to this slot. The 0 → 1 transition captures
    /// `start_index`.
    pub notified: AtomicU64,
    /// Eviction request; honored at the next publish.
    pub pending_remove: AtomicBool,
    /// Slot is allocated.
    pub active: AtomicBool,
    /// Owning process.
    pub pid: AtomicU32,
}

impl SlotRecord {
    /// Claims the slot for `pid`.
    pub fn reset(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
        self.notified.store(0, Ordering::Relaxed);
        self.start_index.store(0, Ordering::Relaxed);
        self.pending_remove.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Requests lazy eviction, but only while `pid` still owns the slot.
    /// Returns whether the request was recorded.
    pub fn request_remove(&self, pid: u32) -> bool {
        if self.pid.load(Ordering::Relaxed) != pid {
            return false;
        }
        self.pending_remove
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}
