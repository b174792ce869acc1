//! Client-side read-only view over a topic's shared region.

use crate::error::BusError;
use crate::layout::{self, TopicHeader};
use crate::ring::RingView;
use crate::slots::SlotRecord;
use shmbus_mmap::ShmRegion;

/// Read-only mapping of one topic region: the header, the subscriber table
/// and the ring. A subscriber owns exactly one slot row for the lifetime of
/// its cursor; everything else is observation.
pub struct TopicView {
    channel: String,
    name: String,
    /// Keeps the mapping alive; all access goes through the cached pointers.
    _region: ShmRegion,
    header: TopicHeader,
    slots: *const SlotRecord,
    ring: RingView,
}

// Read-only view; slot records are atomics, the ring view synchronizes on
// next_index.
unsafe impl Send for TopicView {}
unsafe impl Sync for TopicView {}

impl TopicView {
    /// Maps an existing topic region read-only.
    pub fn open(channel: &str, topic: &str) -> Result<Self, BusError> {
        let region = ShmRegion::open(&layout::topic_region_name(channel, topic))?;
        let base = region.as_ptr();
        // SAFETY: the region was initialized by the broker before any client
        // could learn the topic exists; the header locates the sections.
        let (header, slots, ring) = unsafe {
            let header = std::ptr::read(base as *const TopicHeader);
            let slots = base.add(TopicHeader::slots_offset()) as *const SlotRecord;
            let ring = RingView::attach(base.add(header.ring_offset()));
            (header, slots, ring)
        };
        Ok(Self {
            channel: channel.to_string(),
            name: topic.to_string(),
            _region: region,
            header,
            slots,
            ring,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &TopicHeader {
        &self.header
    }

    #[inline]
    pub fn slot(&self, id: u8) -> &SlotRecord {
        // SAFETY: id < SLOT_COUNT by type; the table has SLOT_COUNT rows.
        unsafe { &*self.slots.add(id as usize) }
    }

    #[inline]
    pub fn ring(&self) -> &RingView {
        &self.ring
    }
}
