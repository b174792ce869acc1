//! Server-side topic: one single-producer stream over a shared region.
//!
//! The topic owns the region mapping, the ring, the subscriber table and the
//! in-process set of per-slot semaphores. Publishing runs entirely on the
//! producer thread; subscription changes arrive from the broker dispatcher
//! and are reconciled lazily at the next publish.

use crate::error::BusError;
use crate::idpool::IdPool;
use crate::layout::{self, SLOT_COUNT, TopicHeader};
use crate::ring::Ring;
use crate::slots::SlotRecord;
use parking_lot::RwLock;
use shmbus_ipc::{NamedSemaphore, process_alive};
use shmbus_mmap::{ShmRegionMut, region_exists, remove_region};
use std::io;
use std::mem::size_of;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

struct Subscription {
    slot: u8,
    sem: NamedSemaphore,
    sem_name: String,
}

pub struct Topic {
    channel: String,
    name: String,
    region_name: String,
    /// Keeps the mapping alive; all access goes through the cached pointers.
    _region: ShmRegionMut,
    slots: *const SlotRecord,
    ring: Ring,
    subs: RwLock<Vec<Subscription>>,
    pool: IdPool,
}

// The region mapping outlives every cached pointer (owned field). Slot
// records are atomics; the ring guards its writer through the arena lock;
// the subscription set is behind an RwLock.
unsafe impl Send for Topic {}
unsafe impl Sync for Topic {}

impl Topic {
    /// Creates the topic region, or reopens and recovers an existing one.
    pub fn open_or_create(
        channel: &str,
        name: &str,
        message_count: u32,
        buffer_bytes: u32,
    ) -> Result<Self, BusError> {
        let header = TopicHeader::new(message_count, buffer_bytes);
        let region_name = layout::topic_region_name(channel, name);
        let (mut region, fresh) =
            ShmRegionMut::open_or_create(&region_name, header.total_size() as u64)?;
        let base = region.as_mut_ptr();

        if fresh {
            // SAFETY: freshly created region of header.total_size() zeroed
            // bytes, exclusively ours until this function returns.
            let (slots, ring) = unsafe {
                std::ptr::write(base as *mut TopicHeader, header);
                let slots = base.add(TopicHeader::slots_offset()) as *const SlotRecord;
                let ring = Ring::init(
                    base.add(header.ring_offset()),
                    u64::from(message_count),
                    u64::from(buffer_bytes),
                );
                (slots, ring)
            };
            return Ok(Self {
                channel: channel.to_string(),
                name: name.to_string(),
                region_name,
                _region: region,
                slots,
                ring,
                subs: RwLock::new(Vec::new()),
                pool: IdPool::new(SLOT_COUNT as u32),
            });
        }

        info!("channel '{channel}' already has a region for topic '{name}', reusing it");

        // SAFETY: the region was initialized by a previous open_or_create;
        // the self-describing header locates the sections.
        let (slots, ring) = unsafe {
            let header = std::ptr::read(base as *const TopicHeader);
            let slots = base.add(TopicHeader::slots_offset()) as *const SlotRecord;
            let ring = Ring::attach(base.add(header.ring_offset()));
            (slots, ring)
        };

        if ring.unlock() {
            warn!("topic '{name}': cleared a stale writer lock left by a dead producer");
        }

        let topic = Self {
            channel: channel.to_string(),
            name: name.to_string(),
            region_name,
            _region: region,
            slots,
            ring,
            subs: RwLock::new(Vec::new()),
            pool: IdPool::new(SLOT_COUNT as u32),
        };
        topic.recover_slots()?;
        Ok(topic)
    }

    /// Reconciles the subscriber table after a reopen: dead or half-removed
    /// slots are cleaned up, live ones are re-adopted.
    fn recover_slots(&self) -> Result<(), BusError> {
        let mut subs = self.subs.write();
        for i in 0..SLOT_COUNT as u8 {
            let rec = self.slot(i);
            if !rec.active.load(Ordering::Acquire) {
                continue;
            }
            let pid = rec.pid.load(Ordering::Relaxed);
            let sem_name = layout::slot_sem_name(&self.channel, &self.name, pid, i);

            if rec.pending_remove.load(Ordering::Acquire) || !process_alive(pid) {
                NamedSemaphore::remove(&sem_name);
                rec.pending_remove.store(false, Ordering::Release);
                rec.active.store(false, Ordering::Release);
                debug!("topic '{}': reclaimed dangling slot {i} (pid {pid})", self.name);
                continue;
            }

            if !self.pool.try_rent(u32::from(i)) {
                return Err(BusError::Io(io::Error::other(format!(
                    "cannot re-adopt subscription slot {i}"
                ))));
            }
            let sem = NamedSemaphore::open_or_create(&sem_name, 0)?;
            subs.push(Subscription {
                slot: i,
                sem,
                sem_name,
            });
            info!("topic '{}': recovered subscription slot {i} for pid {pid}", self.name);
        }
        Ok(())
    }

    /// If a region exists for this topic, truncates it back to the computed
    /// size and reinitializes it empty. Returns whether a region was found.
    pub fn clear_if_exists(
        channel: &str,
        name: &str,
        message_count: u32,
        buffer_bytes: u32,
    ) -> Result<bool, BusError> {
        let region_name = layout::topic_region_name(channel, name);
        if !region_exists(&region_name) {
            return Ok(false);
        }

        let header = TopicHeader::new(message_count, buffer_bytes);
        let mut region = ShmRegionMut::create(&region_name, header.total_size() as u64)?;
        let base = region.as_mut_ptr();
        // SAFETY: just truncated and zeroed, exclusively mapped here.
        unsafe {
            std::ptr::write(base as *mut TopicHeader, header);
            Ring::init(
                base.add(header.ring_offset()),
                u64::from(message_count),
                u64::from(buffer_bytes),
            );
        }
        Ok(true)
    }

    /// Unlinks the topic region by name. Returns whether a file was removed.
    pub fn try_remove(channel: &str, name: &str) -> bool {
        remove_region(&layout::topic_region_name(channel, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Largest payload a single publish can carry: the arena size.
    pub fn max_message_size(&self) -> u64 {
        self.ring.arena().data_size()
    }

    /// The underlying ring. Replication internals write through it directly
    /// when they need to decouple commits from notification.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    #[inline]
    fn slot(&self, id: u8) -> &SlotRecord {
        // SAFETY: id < SLOT_COUNT by type; the table has SLOT_COUNT rows.
        unsafe { &*self.slots.add(id as usize) }
    }

    /// Opens a publish scope of at least `min_size` bytes. When the scope
    /// drops with a positive committed size, the entry is published and all
    /// live subscribers are signaled.
    ///
    /// Fails with [`BusError::ArenaBusy`] when another publish is in flight;
    /// two concurrent publishers on one topic are a programmer error.
    pub fn publish(&self, min_size: u64, tag: u64) -> Result<PublishScope<'_>, BusError> {
        let scope = self.ring.writer_scope(min_size, tag)?;
        Ok(PublishScope {
            scope: Some(scope),
            topic: self,
        })
    }

    /// Publishes a plain value in place.
    pub fn publish_value<T: Copy>(&self, tag: u64, value: &T) -> Result<(), BusError> {
        let len = size_of::<T>() as u64;
        let mut scope = self.publish(len, tag)?;
        // SAFETY: the span holds at least size_of::<T>() bytes.
        unsafe {
            std::ptr::write_unaligned(scope.bytes_mut().as_mut_ptr().cast::<T>(), *value);
        }
        scope.commit(len)?;
        Ok(())
    }

    /// Allocates a subscriber slot for `pid` and creates its semaphore.
    pub fn subscribe(&self, pid: u32) -> Result<u8, BusError> {
        let id = self.pool.rent().ok_or(BusError::NoSlotAvailable)?;
        let slot = id as u8;
        let sem_name = layout::slot_sem_name(&self.channel, &self.name, pid, slot);
        let sem = match NamedSemaphore::open_or_create(&sem_name, 0) {
            Ok(sem) => sem,
            Err(err) => {
                let _ = self.pool.give_back(id);
                return Err(err.into());
            }
        };
        self.slot(slot).reset(pid);
        self.subs.write().push(Subscription {
            slot,
            sem,
            sem_name,
        });
        debug!("topic '{}': pid {pid} subscribed on slot {slot}", self.name);
        Ok(slot)
    }

    /// Lazily unsubscribes: flips `pending_remove` iff `pid` still owns the
    /// slot. The slot is reclaimed at the next publish.
    pub fn unsubscribe(&self, pid: u32, slot: u8) -> bool {
        self.slot(slot).request_remove(pid)
    }

    /// Signals every live slot once and reconciles pending removals.
    ///
    /// Runs after the entry is visible (`next_index` already incremented);
    /// the first signal to a slot captures the index of that entry as the
    /// subscriber's start position.
    pub fn notify_all(&self) {
        let published = self.ring.next_index().saturating_sub(1);

        let mut evict: Vec<u8> = Vec::new();
        {
            let subs = self.subs.read();
            for sub in subs.iter() {
                let rec = self.slot(sub.slot);
                if rec.pending_remove.load(Ordering::Acquire) {
                    evict.push(sub.slot);
                    continue;
                }
                if rec.notified.fetch_add(1, Ordering::AcqRel) == 0 {
                    rec.start_index.store(published, Ordering::Release);
                }
                if let Err(err) = sub.sem.release(1) {
                    // Contained per slot; the publisher's success is not
                    // affected.
                    warn!("topic '{}': failed to signal slot {}: {err}", self.name, sub.slot);
                }
            }
        }

        if evict.is_empty() {
            return;
        }
        let mut subs = self.subs.write();
        for slot in evict {
            let Some(pos) = subs.iter().position(|s| s.slot == slot) else {
                continue;
            };
            let sub = subs.swap_remove(pos);
            NamedSemaphore::remove(&sub.sem_name);
            let rec = self.slot(slot);
            rec.active.store(false, Ordering::Release);
            rec.pending_remove.store(false, Ordering::Release);
            if let Err(err) = self.pool.give_back(u32::from(slot)) {
                warn!("topic '{}': slot {slot} return failed: {err}", self.name);
            }
            debug!("topic '{}': evicted slot {slot}", self.name);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        // With no live subscriptions nothing can reference the region; an
        // abandoned region would otherwise require an explicit clear.
        if self.subs.get_mut().is_empty() {
            remove_region(&self.region_name);
        }
    }
}

/// RAII hold over one pending publish. Dropping with committed bytes makes
/// the entry visible and signals subscribers; dropping untouched publishes
/// nothing.
pub struct PublishScope<'a> {
    scope: Option<crate::ring::WriterScope<'a>>,
    topic: &'a Topic,
}

impl<'a> PublishScope<'a> {
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.scope.as_mut().expect("scope present until drop").bytes_mut()
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.scope.as_ref().expect("scope present until drop").capacity()
    }

    pub fn commit(&mut self, len: u64) -> Result<(), BusError> {
        self.scope.as_mut().expect("scope present until drop").commit(len)
    }
}

impl Drop for PublishScope<'_> {
    fn drop(&mut self) {
        let scope = self.scope.take().expect("scope present until drop");
        let committed = scope.committed() > 0;
        // Publishes the entry and releases the writer lock.
        drop(scope);
        if committed {
            self.topic.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("shmbus_topic_{tag}_{}_{ts}", std::process::id())
    }

    /// A pid that cannot belong to a live process (beyond pid_max).
    const DEAD_PID: u32 = 0x3FFF_FFF0;

    #[test]
    fn subscribe_then_unsubscribe_recycles_slot_lazily() {
        let channel = unique("lazy");
        let topic = Topic::open_or_create(&channel, "t", 16, 4096).unwrap();

        let me = shmbus_ipc::current_pid();
        let a = topic.subscribe(me).unwrap();
        let b = topic.subscribe(me).unwrap();
        assert_ne!(a, b);

        assert!(topic.unsubscribe(me, a));
        // Slot survives until the next publish.
        assert_eq!(topic.subscriber_count(), 2);

        topic.publish_value(1, &42u64).unwrap();
        assert_eq!(topic.subscriber_count(), 1);

        // The evicted id is back at the head of the pool and gets reused.
        let c = topic.subscribe(me).unwrap();
        assert_eq!(c, a);

        for s in [b, c] {
            assert!(topic.unsubscribe(me, s));
        }
        topic.publish_value(1, &43u64).unwrap();
        drop(topic);
        Topic::try_remove(&channel, "t");
    }

    #[test]
    fn unsubscribe_rejects_wrong_pid() {
        let channel = unique("owner");
        let topic = Topic::open_or_create(&channel, "t", 16, 4096).unwrap();
        let me = shmbus_ipc::current_pid();
        let slot = topic.subscribe(me).unwrap();
        assert!(!topic.unsubscribe(DEAD_PID, slot));
        drop(topic);
        Topic::try_remove(&channel, "t");
        NamedSemaphore::remove(&layout::slot_sem_name(&channel, "t", me, slot));
    }

    #[test]
    fn reopen_recovers_live_and_reaps_dead_slots() {
        let channel = unique("recover");
        let me = shmbus_ipc::current_pid();
        let (live, dead);
        {
            let topic = Topic::open_or_create(&channel, "t", 16, 4096).unwrap();
            live = topic.subscribe(me).unwrap();
            dead = topic.subscribe(DEAD_PID).unwrap();
            // Subscriptions exist, so dropping keeps the region.
        }

        let topic = Topic::open_or_create(&channel, "t", 16, 4096).unwrap();
        assert_eq!(topic.subscriber_count(), 1);
        assert!(topic.slot(live).active.load(Ordering::Acquire));
        assert!(!topic.slot(dead).active.load(Ordering::Acquire));

        // The dead slot id is free again.
        assert!(topic.pool.try_rent(u32::from(dead)));
        drop(topic);
        Topic::try_remove(&channel, "t");
        NamedSemaphore::remove(&layout::slot_sem_name(&channel, "t", me, live));
    }

    #[test]
    fn clear_if_exists_resets_state() {
        let channel = unique("clear");
        let me = shmbus_ipc::current_pid();
        let kept;
        {
            let topic = Topic::open_or_create(&channel, "t", 16, 4096).unwrap();
            topic.publish_value(9, &7u32).unwrap();
            assert_eq!(topic.ring().next_index(), 1);
            kept = topic.subscribe(me).unwrap();
        }

        assert!(Topic::clear_if_exists(&channel, "t", 16, 4096).unwrap());
        let topic = Topic::open_or_create(&channel, "t", 16, 4096).unwrap();
        assert_eq!(topic.ring().next_index(), 0);
        assert_eq!(topic.subscriber_count(), 0);
        drop(topic);
        Topic::try_remove(&channel, "t");
        NamedSemaphore::remove(&layout::slot_sem_name(&channel, "t", me, kept));

        assert!(!Topic::clear_if_exists(&channel, "missing", 16, 4096).unwrap());
    }
}
