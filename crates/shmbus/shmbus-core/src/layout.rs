//! Shared region layout and the IPC naming scheme.
//!
//! One contiguous region per topic:
//!
//! ```text
//! ┌─────────────┬────────────────┬─────────────────────────────┐
//! │ TopicHeader │ SlotRecord[256]│ ring (state + entries +     │
//! │             │                │        arena)               │
//! └─────────────┴────────────────┴─────────────────────────────┘
//! ```
//!
//! Little-endian, natural alignment for 8-byte integers; the layout is a
//! same-host, same-ABI contract, not a portable serialization format.

use crate::ring::Ring;
use crate::slots::SlotRecord;
use std::mem::size_of;

/// Fixed number of subscriber slots per topic.
pub const SLOT_COUNT: usize = 256;

/// Longest topic name on the wire, excluding the terminator.
pub const MAX_TOPIC_NAME: usize = 255;

/// Self-describing header at offset 0 of every topic region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicHeader {
    /// Bytes of the ring (state + entries + arena).
    pub total_buffer_size: u64,
    /// Bytes of the subscriber table.
    pub subscriber_table_size: u64,
    /// Ring entry capacity C.
    pub buffer_item_capacity: u64,
    /// Arena data bytes.
    pub buffer_size: u64,
}

impl TopicHeader {
    pub fn new(message_count: u32, buffer_bytes: u32) -> Self {
        Self {
            total_buffer_size: Ring::size_of(u64::from(message_count), u64::from(buffer_bytes))
                as u64,
            subscriber_table_size: (SLOT_COUNT * size_of::<SlotRecord>()) as u64,
            buffer_item_capacity: u64::from(message_count),
            buffer_size: u64::from(buffer_bytes),
        }
    }

    /// Total bytes of the region described by this header.
    pub fn total_size(&self) -> usize {
        size_of::<Self>() + self.subscriber_table_size as usize + self.total_buffer_size as usize
    }

    pub const fn slots_offset() -> usize {
        size_of::<Self>()
    }

    pub fn ring_offset(&self) -> usize {
        Self::slots_offset() + self.subscriber_table_size as usize
    }
}

/// Shared region name for a topic: `<channel>.<topic>.buffer`.
pub fn topic_region_name(channel: &str, topic: &str) -> String {
    format!("{channel}.{topic}.buffer")
}

/// Per-client reply queue name: `<channel>.<pid>`.
pub fn reply_queue_name(channel: &str, pid: u32) -> String {
    format!("{channel}.{pid}")
}

/// Per-slot semaphore name: `<channel>.<topic>.<pid>.<slot>.sem`.
pub fn slot_sem_name(channel: &str, topic: &str, pid: u32, slot: u8) -> String {
    format!("{channel}.{topic}.{pid}.{slot}.sem")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_accounts_for_every_section() {
        let h = TopicHeader::new(256, 8 * 1024 * 1024);
        assert_eq!(h.buffer_item_capacity, 256);
        assert_eq!(h.buffer_size, 8 * 1024 * 1024);
        assert_eq!(
            h.total_size(),
            size_of::<TopicHeader>()
                + SLOT_COUNT * size_of::<SlotRecord>()
                + Ring::size_of(256, 8 * 1024 * 1024)
        );
        assert!(h.ring_offset() > TopicHeader::slots_offset());
    }

    #[test]
    fn names_follow_the_scheme() {
        assert_eq!(topic_region_name("Foo", "Boo"), "Foo.Boo.buffer");
        assert_eq!(reply_queue_name("Foo", 4321), "Foo.4321");
        assert_eq!(slot_sem_name("Foo", "Boo", 4321, 9), "Foo.Boo.4321.9.sem");
    }
}
