//! Bounded cross-process message queue.
//!
//! A fixed ring of fixed-size slots in a shared region, paced by two named
//! semaphores: `<name>.mq.space` counts free slots (producers wait on it),
//! `<name>.mq.items` counts committed messages (the consumer waits on it).
//! Multiple producers serialize slot claims through a spinlock in the
//! header; the single consumer advances `head` without locking.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ QueueHeader │ Slot[0] │ Slot[1] │ ... │ Slot[capacity-1] │
//! └──────────────────────────────────────────────┘
//! Slot = { len: u64, bytes: [u8; max_msg] }
//! ```

use shmbus_mmap::{ShmRegionMut, remove_region};
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::sem::NamedSemaphore;

const QUEUE_MAGIC: u64 = 0x5348_4D42_5553_4D51; // "SHMBUSMQ"

#[repr(C)]
struct QueueHeader {
    magic: u64,
    capacity: u64,
    max_msg: u64,
    /// Next slot a producer will fill.
    tail: AtomicU64,
    /// Next slot the consumer will drain.
    head: AtomicU64,
    /// Serializes producers claiming a slot.
    push_lock: AtomicU32,
}

fn slot_stride(max_msg: usize) -> usize {
    // len prefix plus payload, kept 8-byte aligned.
    (size_of::<u64>() + max_msg + 7) & !7
}

fn region_len(capacity: usize, max_msg: usize) -> u64 {
    (size_of::<QueueHeader>() + capacity * slot_stride(max_msg)) as u64
}

pub struct MsgQueue {
    _region: ShmRegionMut,
    base: *mut u8,
    items: NamedSemaphore,
    space: NamedSemaphore,
    name: String,
    capacity: usize,
    max_msg: usize,
}

// Producers share the queue across threads; the push spinlock and the
// semaphores provide the synchronization.
unsafe impl Send for MsgQueue {}
unsafe impl Sync for MsgQueue {}

impl MsgQueue {
    /// Creates a fresh queue, discarding any leftover region or semaphores
    /// with the same name.
    pub fn create(name: &str, capacity: usize, max_msg: usize) -> io::Result<Self> {
        Self::remove(name);

        let mut region = ShmRegionMut::create(name, region_len(capacity, max_msg))?;
        let base = region.as_mut_ptr();
        unsafe {
            let h = base as *mut QueueHeader;
            std::ptr::write(
                h,
                QueueHeader {
                    magic: QUEUE_MAGIC,
                    capacity: capacity as u64,
                    max_msg: max_msg as u64,
                    tail: AtomicU64::new(0),
                    head: AtomicU64::new(0),
                    push_lock: AtomicU32::new(0),
                },
            );
        }

        let items = NamedSemaphore::create(&Self::items_sem_name(name), 0)?;
        let space = NamedSemaphore::create(&Self::space_sem_name(name), capacity as u32)?;

        Ok(Self {
            _region: region,
            base,
            items,
            space,
            name: name.to_string(),
            capacity,
            max_msg,
        })
    }

    /// Opens the queue if it exists, creates it otherwise.
    pub fn open_or_create(name: &str, capacity: usize, max_msg: usize) -> io::Result<Self> {
        let (mut region, fresh) =
            ShmRegionMut::open_or_create(name, region_len(capacity, max_msg))?;
        let base = region.as_mut_ptr();

        if fresh {
            unsafe {
                let h = base as *mut QueueHeader;
                std::ptr::write(
                    h,
                    QueueHeader {
                        magic: QUEUE_MAGIC,
                        capacity: capacity as u64,
                        max_msg: max_msg as u64,
                        tail: AtomicU64::new(0),
                        head: AtomicU64::new(0),
                        push_lock: AtomicU32::new(0),
                    },
                );
            }
        } else {
            Self::validate(base)?;
        }

        let items = NamedSemaphore::open_or_create(&Self::items_sem_name(name), 0)?;
        let space =
            NamedSemaphore::open_or_create(&Self::space_sem_name(name), capacity as u32)?;

        let (capacity, max_msg) = Self::dimensions(base);
        Ok(Self {
            _region: region,
            base,
            items,
            space,
            name: name.to_string(),
            capacity,
            max_msg,
        })
    }

    /// Opens an existing queue, failing if it does not exist.
    pub fn open(name: &str) -> io::Result<Self> {
        let mut region = ShmRegionMut::open(name)?;
        let base = region.as_mut_ptr();
        Self::validate(base)?;

        let items = NamedSemaphore::open(&Self::items_sem_name(name))?;
        let space = NamedSemaphore::open(&Self::space_sem_name(name))?;

        let (capacity, max_msg) = Self::dimensions(base);
        Ok(Self {
            _region: region,
            base,
            items,
            space,
            name: name.to_string(),
            capacity,
            max_msg,
        })
    }

    /// Unlinks the queue region and its semaphores. Returns `true` if the
    /// region existed.
    pub fn remove(name: &str) -> bool {
        let existed = remove_region(name);
        NamedSemaphore::remove(&Self::items_sem_name(name));
        NamedSemaphore::remove(&Self::space_sem_name(name));
        existed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_msg(&self) -> usize {
        self.max_msg
    }

    /// Blocking send. Waits for a free slot, copies `msg` in, signals the
    /// consumer.
    pub fn send(&self, msg: &[u8]) -> io::Result<()> {
        if msg.len() > self.max_msg {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message exceeds queue slot size",
            ));
        }
        self.space.acquire()?;
        self.push(msg);
        self.items.release(1)
    }

    /// Non-blocking send. Returns `false` if the queue is full.
    pub fn try_send(&self, msg: &[u8]) -> io::Result<bool> {
        if msg.len() > self.max_msg {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message exceeds queue slot size",
            ));
        }
        if !self.space.try_acquire()? {
            return Ok(false);
        }
        self.push(msg);
        self.items.release(1)?;
        Ok(true)
    }

    /// Waits up to `timeout` for a message and copies it into `buf`.
    /// Returns the message length, or `None` on timeout.
    pub fn timed_receive(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !self.items.try_acquire_for(timeout)? {
            return Ok(None);
        }

        let header = self.header();
        let slot = header.head.load(Ordering::Acquire) % header.capacity;
        let len = unsafe {
            let slot_ptr = self.slot_ptr(slot as usize);
            let len = std::ptr::read(slot_ptr as *const u64) as usize;
            std::ptr::copy_nonoverlapping(
                slot_ptr.add(size_of::<u64>()),
                buf.as_mut_ptr(),
                len.min(buf.len()),
            );
            len
        };
        header.head.fetch_add(1, Ordering::AcqRel);
        self.space.release(1)?;
        Ok(Some(len))
    }

    fn push(&self, msg: &[u8]) {
        let header = self.header();

        // Claim a slot under the producer spinlock; the payload copy happens
        // inside the critical section so `items` is only released for fully
        // written messages.
        while header
            .push_lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let tail = header.tail.load(Ordering::Relaxed);
        let slot = tail % header.capacity;
        unsafe {
            let slot_ptr = self.slot_ptr(slot as usize);
            std::ptr::write(slot_ptr as *mut u64, msg.len() as u64);
            std::ptr::copy_nonoverlapping(msg.as_ptr(), slot_ptr.add(size_of::<u64>()), msg.len());
        }
        header.tail.store(tail + 1, Ordering::Release);

        header.push_lock.store(0, Ordering::Release);
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        // SAFETY: base points at a validated or freshly initialized header.
        unsafe { &*(self.base as *const QueueHeader) }
    }

    #[inline]
    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        // SAFETY: slot < capacity, region sized to capacity slots.
        unsafe {
            self.base
                .add(size_of::<QueueHeader>() + slot * slot_stride(self.max_msg))
        }
    }

    fn validate(base: *const u8) -> io::Result<()> {
        let magic = unsafe { std::ptr::read(base as *const u64) };
        if magic != QUEUE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region is not a message queue",
            ));
        }
        Ok(())
    }

    fn dimensions(base: *const u8) -> (usize, usize) {
        let header = unsafe { &*(base as *const QueueHeader) };
        (header.capacity as usize, header.max_msg as usize)
    }

    fn items_sem_name(name: &str) -> String {
        format!("{name}.mq.items")
    }

    fn space_sem_name(name: &str) -> String {
        format!("{name}.mq.space")
    }
}
