//! `shmbus-core`: zero-copy, multi-topic, single-producer / many-consumer
//! publish-subscribe over shared memory.
//!
//! Messages are written once into a per-topic shared ring and read in place
//! by every subscriber; no per-subscriber copy ever exists. A broker process
//! owns the topics and the control plane; clients discover topics, subscribe
//! and unsubscribe over two bounded IPC queues, and then consume entirely
//! through shared memory and per-slot semaphores.
//!
//! # Architecture
//!
//! ```text
//!                 control plane (request / reply queues)
//!  ┌───────────┐  ◄──────────────────────────────────►  ┌───────────┐
//!  │ Broker    │                                        │ BusClient │
//!  │  Topic ───┼── shared region: ring + slot table ────┼── Cursor  │
//!  └───────────┘        ▲ publish      read ▲           └───────────┘
//!                       │ NotifyAll → per-slot semaphore │
//! ```
//!
//! # Core types
//!
//! - [`BrokerServer`]: owns the request queue and the topic map.
//! - [`Topic`]: single-producer stream; [`Topic::publish`] returns an RAII
//!   scope that signals all live subscribers on drop.
//! - [`BusClient`]: control-plane client; [`BusClient::subscribe`] yields a
//!   [`Cursor`].
//! - [`Cursor`]: blocking/polling reader returning in-place accessors.
//! - [`Ring`], [`CyclicArena`], [`IdPool`]: the building blocks, usable on
//!   their own over any suitably sized memory.

mod arena;
mod client;
mod cursor;
mod envelope;
mod error;
mod idpool;
mod layout;
mod ring;
mod server;
mod slots;
mod topic;
mod view;

pub use arena::{CyclicArena, Span};
pub use client::BusClient;
pub use cursor::Cursor;
pub use envelope::{
    CreateTopicRequest, ENVELOPE_MAX, HelloRequest, HelloResponse, KIND_CREATE_TOPIC, KIND_HELLO,
    KIND_HELLO_RESPONSE, KIND_REMOVE_TOPIC, KIND_SHUTDOWN, KIND_SUBSCRIBE,
    KIND_SUBSCRIBE_RESPONSE, KIND_UNSUBSCRIBE, KIND_UNSUBSCRIBE_RESPONSE, RemoveTopicRequest,
    SubscribeRequest, SubscribeResponse, TopicName, UnsubscribeRequest, UnsubscribeResponse,
};
pub use error::BusError;
pub use idpool::IdPool;
pub use layout::{MAX_TOPIC_NAME, SLOT_COUNT, TopicHeader, reply_queue_name, slot_sem_name, topic_region_name};
pub use ring::{Entry, EntryAccessor, Ring, RingCursor, RingView, WriterScope};
pub use server::BrokerServer;
pub use slots::SlotRecord;
pub use topic::{PublishScope, Topic};
pub use view::TopicView;
