//! Control-plane envelopes.
//!
//! Every request and response on the IPC queues is a fixed-size `#[repr(C)]`
//! struct copied byte-wise, with a small integer `kind` discriminator first
//! and a correlation id second so the dispatchers can route without knowing
//! the full message. The layouts are a same-host contract; fields are
//! explicitly padded so no byte is ever uninitialized.

use crate::error::BusError;
use crate::layout::MAX_TOPIC_NAME;
use shmbus_ipc::current_pid;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const KIND_SHUTDOWN: u64 = 0;
pub const KIND_SUBSCRIBE: u64 = 1;
pub const KIND_CREATE_TOPIC: u64 = 2;
pub const KIND_HELLO: u64 = 3;
pub const KIND_HELLO_RESPONSE: u64 = 4;
pub const KIND_SUBSCRIBE_RESPONSE: u64 = 5;
pub const KIND_UNSUBSCRIBE: u64 = 6;
pub const KIND_UNSUBSCRIBE_RESPONSE: u64 = 7;
pub const KIND_REMOVE_TOPIC: u64 = 8;

/// Largest envelope the queues must fit. Matches the queue slot size.
pub const ENVELOPE_MAX: usize = 1024;

/// A zero-kind envelope; posting it unblocks and ends a dispatcher.
pub const SHUTDOWN_ENVELOPE: [u8; 8] = [0; 8];

static NEXT_CORRELATION: AtomicU64 = AtomicU64::new(1);

/// Process-locally unique correlation id. Responses travel on per-process
/// reply queues, so no cross-process uniqueness is needed.
pub fn next_correlation_id() -> u64 {
    NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Marker for envelope structs that travel as raw bytes.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, `Copy`, and explicitly padded so that
/// every byte of a value is initialized.
pub unsafe trait Wire: Copy {}

/// The envelope as bytes, ready for the queue.
pub fn encode<T: Wire>(msg: &T) -> &[u8] {
    // SAFETY: Wire guarantees fully initialized, repr(C) bytes.
    unsafe { std::slice::from_raw_parts((msg as *const T).cast::<u8>(), size_of::<T>()) }
}

/// Reads an envelope back from queue bytes; `None` if the buffer is shorter
/// than the message.
pub fn decode<T: Wire>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    // SAFETY: length checked; read_unaligned tolerates any buffer alignment.
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<T>()) })
}

/// Discriminator of a raw envelope; zero for buffers too short to carry one.
pub fn kind_of(buf: &[u8]) -> u64 {
    if buf.len() < 8 {
        return KIND_SHUTDOWN;
    }
    u64::from_le_bytes(buf[..8].try_into().expect("checked length"))
}

/// Correlation id of a raw envelope.
pub fn correlation_of(buf: &[u8]) -> u64 {
    if buf.len() < 16 {
        return 0;
    }
    u64::from_le_bytes(buf[8..16].try_into().expect("checked length"))
}

/// Fixed-size topic name field: up to 255 bytes, NUL-padded.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TopicName([u8; MAX_TOPIC_NAME + 1]);

impl TopicName {
    pub fn new(name: &str) -> Result<Self, BusError> {
        if name.len() > MAX_TOPIC_NAME {
            return Err(BusError::TopicNameTooLong(name.to_string()));
        }
        let mut bytes = [0u8; MAX_TOPIC_NAME + 1];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self(bytes))
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl std::fmt::Debug for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HelloRequest {
    pub kind: u64,
    pub correlation_id: u64,
    pub pid: u32,
    _pad: u32,
    pub created_ms: u64,
}

impl HelloRequest {
    pub fn new() -> Self {
        Self {
            kind: KIND_HELLO,
            correlation_id: next_correlation_id(),
            pid: current_pid(),
            _pad: 0,
            created_ms: now_millis(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HelloResponse {
    pub kind: u64,
    pub correlation_id: u64,
    pub request_created_ms: u64,
}

impl HelloResponse {
    pub fn new(correlation_id: u64, request_created_ms: u64) -> Self {
        Self {
            kind: KIND_HELLO_RESPONSE,
            correlation_id,
            request_created_ms,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SubscribeRequest {
    pub kind: u64,
    pub correlation_id: u64,
    pub pid: u32,
    _pad: u32,
    pub topic: TopicName,
}

impl SubscribeRequest {
    pub fn new(topic: &str) -> Result<Self, BusError> {
        Ok(Self {
            kind: KIND_SUBSCRIBE,
            correlation_id: next_correlation_id(),
            pid: current_pid(),
            _pad: 0,
            topic: TopicName::new(topic)?,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SubscribeResponse {
    pub kind: u64,
    pub correlation_id: u64,
    pub slot_id: u8,
    pub ok: u8,
    _pad: [u8; 6],
}

impl SubscribeResponse {
    pub fn new(correlation_id: u64, slot_id: Option<u8>) -> Self {
        Self {
            kind: KIND_SUBSCRIBE_RESPONSE,
            correlation_id,
            slot_id: slot_id.unwrap_or(0),
            ok: u8::from(slot_id.is_some()),
            _pad: [0; 6],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UnsubscribeRequest {
    pub kind: u64,
    pub correlation_id: u64,
    pub pid: u32,
    pub slot_id: u8,
    _pad: [u8; 3],
    pub topic: TopicName,
}

impl UnsubscribeRequest {
    pub fn new(topic: &str, slot_id: u8) -> Result<Self, BusError> {
        Ok(Self {
            kind: KIND_UNSUBSCRIBE,
            correlation_id: next_correlation_id(),
            pid: current_pid(),
            slot_id,
            _pad: [0; 3],
            topic: TopicName::new(topic)?,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UnsubscribeResponse {
    pub kind: u64,
    pub correlation_id: u64,
    pub ok: u8,
    pub slot_id: u8,
    _pad: [u8; 6],
    pub topic: TopicName,
}

impl UnsubscribeResponse {
    pub fn new(correlation_id: u64, ok: bool, slot_id: u8, topic: TopicName) -> Self {
        Self {
            kind: KIND_UNSUBSCRIBE_RESPONSE,
            correlation_id,
            ok: u8::from(ok),
            slot_id,
            _pad: [0; 6],
            topic,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CreateTopicRequest {
    pub kind: u64,
    pub correlation_id: u64,
    pub pid: u32,
    _pad: u32,
    pub max_messages: u32,
    pub buffer_bytes: u32,
    pub topic: TopicName,
}

impl CreateTopicRequest {
    pub fn new(topic: &str, max_messages: u32, buffer_bytes: u32) -> Result<Self, BusError> {
        Ok(Self {
            kind: KIND_CREATE_TOPIC,
            correlation_id: next_correlation_id(),
            pid: current_pid(),
            _pad: 0,
            max_messages,
            buffer_bytes,
            topic: TopicName::new(topic)?,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RemoveTopicRequest {
    pub kind: u64,
    pub correlation_id: u64,
    pub pid: u32,
    _pad: u32,
    pub topic: TopicName,
}

impl RemoveTopicRequest {
    pub fn new(topic: &str) -> Result<Self, BusError> {
        Ok(Self {
            kind: KIND_REMOVE_TOPIC,
            correlation_id: next_correlation_id(),
            pid: current_pid(),
            _pad: 0,
            topic: TopicName::new(topic)?,
        })
    }
}

unsafe impl Wire for HelloRequest {}
unsafe impl Wire for HelloResponse {}
unsafe impl Wire for SubscribeRequest {}
unsafe impl Wire for SubscribeResponse {}
unsafe impl Wire for UnsubscribeRequest {}
unsafe impl Wire for UnsubscribeResponse {}
unsafe impl Wire for CreateTopicRequest {}
unsafe impl Wire for RemoveTopicRequest {}
