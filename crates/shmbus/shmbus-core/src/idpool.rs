//! Lock-free pool of small integer ids.
//!
//! A Treiber-style free list threaded through a fixed node array by index.
//! The head packs a 32-bit version next to the index so that pops are immune
//! to ABA. `try_rent` re-adopts a specific id during crash recovery: a pop
//! from the middle of the list marks the node and re-verifies the links, the
//! same optimistic protocol the head CAS gives us for free.

use crate::error::BusError;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

const NIL: u32 = u32::MAX;

struct Node {
    next: AtomicU32,
    in_use: AtomicBool,
}

pub struct IdPool {
    /// Packed `(version << 32) | head_index`.
    head: AtomicU64,
    nodes: Box<[Node]>,
}

#[inline]
fn pack(version: u32, index: u32) -> u64 {
    (u64::from(version) << 32) | u64::from(index)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl IdPool {
    /// A pool over the id universe `[0, capacity)`, all ids free.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity < NIL, "capacity must leave room for the NIL marker");
        let nodes: Box<[Node]> = (0..capacity)
            .map(|i| Node {
                next: AtomicU32::new(if i + 1 < capacity { i + 1 } else { NIL }),
                in_use: AtomicBool::new(false),
            })
            .collect();
        Self {
            head: AtomicU64::new(pack(0, if capacity > 0 { 0 } else { NIL })),
            nodes,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Pops any free id, or `None` when the pool is exhausted.
    pub fn rent(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (version, index) = unpack(head);
            if index == NIL {
                return None;
            }
            let next = self.nodes[index as usize].next.load(Ordering::Acquire);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(version.wrapping_add(1), next),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.nodes[index as usize].in_use.store(true, Ordering::Release);
                return Some(index);
            }
        }
    }

    /// Pops a specific id if it is currently free.
    pub fn try_rent(&self, target: u32) -> bool {
        if target >= self.capacity() {
            return false;
        }
        'retry: loop {
            let head = self.head.load(Ordering::Acquire);
            let (version, index) = unpack(head);
            if index == NIL {
                return false;
            }

            if index == target {
                let next = self.nodes[target as usize].next.load(Ordering::Acquire);
                if self
                    .head
                    .compare_exchange(
                        head,
                        pack(version.wrapping_add(1), next),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.nodes[target as usize].in_use.store(true, Ordering::Release);
                    return true;
                }
                continue 'retry;
            }

            // Walk to the target, then mark it and verify the list did not
            // move under us before unlinking.
            let mut prev = index;
            let mut cur = self.nodes[prev as usize].next.load(Ordering::Acquire);
            while cur != NIL {
                if cur == target {
                    let next = self.nodes[cur as usize].next.load(Ordering::Acquire);
                    self.nodes[cur as usize].in_use.store(true, Ordering::SeqCst);

                    if self.head.load(Ordering::SeqCst) != head
                        || self.nodes[prev as usize].next.load(Ordering::SeqCst) != cur
                    {
                        self.nodes[cur as usize].in_use.store(false, Ordering::SeqCst);
                        continue 'retry;
                    }

                    self.nodes[prev as usize].next.store(next, Ordering::Release);
                    return true;
                }
                prev = cur;
                cur = self.nodes[cur as usize].next.load(Ordering::Acquire);
            }
            return false;
        }
    }

    /// Returns an id to the pool. Detects double frees.
    pub fn give_back(&self, id: u32) -> Result<(), BusError> {
        assert!(id < self.capacity(), "id out of range");
        let node = &self.nodes[id as usize];

        if node
            .in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(BusError::AlreadyFree(id));
        }

        loop {
            let head = self.head.load(Ordering::Acquire);
            let (version, index) = unpack(head);
            node.next.store(index, Ordering::Release);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(version.wrapping_add(1), id),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let (_, index) = unpack(self.head.load(Ordering::Acquire));
        index == NIL
    }
}
