//! Broker control server: owns the channel request queue and the topics.
//!
//! A single cooperative dispatcher thread drains the request queue, switches
//! on the envelope kind and replies on the requester's per-pid queue. Topic
//! creation and removal are same-process conveniences: the caller parks on
//! an in-process rendezvous keyed by correlation id and the dispatcher
//! resolves it after acting. Only plain envelopes cross the queue; no
//! pointer ever does.

use crate::envelope::{
    self, CreateTopicRequest, ENVELOPE_MAX, HelloRequest, HelloResponse, KIND_CREATE_TOPIC,
    KIND_HELLO, KIND_REMOVE_TOPIC, KIND_SHUTDOWN, KIND_SUBSCRIBE, KIND_UNSUBSCRIBE,
    RemoveTopicRequest, SHUTDOWN_ENVELOPE, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest, UnsubscribeResponse,
};
use crate::error::BusError;
use crate::layout;
use crate::topic::Topic;
use parking_lot::Mutex;
use shmbus_ipc::MsgQueue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const QUEUE_CAPACITY: usize = 256;
const DISPATCH_WAKE: Duration = Duration::from_secs(30);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dispatcher-side resolution of a same-process control call.
enum LocalReply {
    Created(Arc<Topic>),
    Removed(bool),
}

struct ServerCore {
    channel: String,
    request_q: MsgQueue,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    /// pid → reply queue, opened lazily on first response.
    clients: Mutex<HashMap<u32, MsgQueue>>,
    /// Correlation id → parked local caller of create/remove topic.
    local: Mutex<HashMap<u64, SyncSender<LocalReply>>>,
}

impl ServerCore {
    /// Sends `bytes` on the requester's reply queue, opening it by name on
    /// first contact. Failures are logged and swallowed; one misbehaving
    /// client must not stall the dispatcher.
    fn reply(&self, pid: u32, bytes: &[u8]) {
        let mut clients = self.clients.lock();
        let queue = match clients.entry(pid) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                match MsgQueue::open(&layout::reply_queue_name(&self.channel, pid)) {
                    Ok(q) => e.insert(q),
                    Err(err) => {
                        error!("cannot open reply queue for pid {pid}: {err}");
                        return;
                    }
                }
            }
        };
        match queue.try_send(bytes) {
            Ok(true) => {}
            Ok(false) => error!("reply queue for pid {pid} is full, dropping response"),
            Err(err) => error!("cannot send to client pid {pid}: {err}"),
        }
    }

    fn resolve_local(&self, correlation_id: u64, reply: LocalReply) {
        if let Some(tx) = self.local.lock().remove(&correlation_id) {
            let _ = tx.send(reply);
        }
    }

    fn on_subscribe(&self, bytes: &[u8]) {
        let Some(req) = envelope::decode::<SubscribeRequest>(bytes) else {
            warn!("malformed subscribe envelope");
            return;
        };
        let topic_name = req.topic.as_str();
        debug!("handling subscribe to '{topic_name}' from pid {}", req.pid);

        let topic = self.topics.lock().get(topic_name).cloned();
        let slot = match topic {
            Some(topic) => match topic.subscribe(req.pid) {
                Ok(slot) => Some(slot),
                Err(err) => {
                    error!("subscribe to '{topic_name}' failed: {err}");
                    None
                }
            },
            None => {
                error!("subscribe to unknown topic '{topic_name}' from pid {}", req.pid);
                None
            }
        };

        self.reply(req.pid, envelope::encode(&SubscribeResponse::new(req.correlation_id, slot)));
        if let Some(slot) = slot {
            info!("topic '{topic_name}' subscribed from pid {} on slot {slot}", req.pid);
        }
    }

    fn on_unsubscribe(&self, bytes: &[u8]) {
        let Some(req) = envelope::decode::<UnsubscribeRequest>(bytes) else {
            warn!("malformed unsubscribe envelope");
            return;
        };
        let topic_name = req.topic.as_str();

        let ok = self
            .topics
            .lock()
            .get(topic_name)
            .is_some_and(|t| t.unsubscribe(req.pid, req.slot_id));

        self.reply(
            req.pid,
            envelope::encode(&UnsubscribeResponse::new(
                req.correlation_id,
                ok,
                req.slot_id,
                req.topic,
            )),
        );
        info!(
            "topic '{topic_name}' unsubscribe of slot {} from pid {}: {}",
            req.slot_id,
            req.pid,
            if ok { "accepted" } else { "rejected" }
        );
    }

    fn on_create_topic(&self, bytes: &[u8]) {
        let Some(req) = envelope::decode::<CreateTopicRequest>(bytes) else {
            warn!("malformed create-topic envelope");
            return;
        };
        let topic_name = req.topic.as_str();
        debug!(
            "handling create topic '{topic_name}' ({} messages, {} bytes)",
            req.max_messages, req.buffer_bytes
        );

        let result = {
            let mut topics = self.topics.lock();
            if let Some(existing) = topics.get(topic_name) {
                Ok(existing.clone())
            } else {
                Topic::open_or_create(&self.channel, topic_name, req.max_messages, req.buffer_bytes)
                    .map(Arc::new)
                    .inspect(|topic| {
                        topics.insert(topic_name.to_string(), topic.clone());
                    })
            }
        };
        match result {
            Ok(topic) => self.resolve_local(req.correlation_id, LocalReply::Created(topic)),
            Err(err) => {
                // The parked caller observes the dropped sender.
                error!("create topic '{topic_name}' failed: {err}");
                self.local.lock().remove(&req.correlation_id);
            }
        }
    }

    fn on_remove_topic(&self, bytes: &[u8]) {
        let Some(req) = envelope::decode::<RemoveTopicRequest>(bytes) else {
            warn!("malformed remove-topic envelope");
            return;
        };
        let topic_name = req.topic.as_str();
        info!("removing topic '{topic_name}'");

        let removed = self.topics.lock().remove(topic_name).is_some();
        // The region leaves the namespace regardless of outstanding handles;
        // live mappings stay valid until unmapped.
        Topic::try_remove(&self.channel, topic_name);
        self.resolve_local(req.correlation_id, LocalReply::Removed(removed));
    }

    fn on_hello(&self, bytes: &[u8]) {
        let Some(req) = envelope::decode::<HelloRequest>(bytes) else {
            warn!("malformed hello envelope");
            return;
        };
        debug!("handling hello from pid {}", req.pid);
        self.reply(
            req.pid,
            envelope::encode(&HelloResponse::new(req.correlation_id, req.created_ms)),
        );
    }
}

fn dispatch_requests(core: &ServerCore) {
    let mut buf = [0u8; ENVELOPE_MAX];
    loop {
        match core.request_q.timed_receive(&mut buf, DISPATCH_WAKE) {
            Ok(Some(len)) => {
                let bytes = &buf[..len];
                match envelope::kind_of(bytes) {
                    KIND_SHUTDOWN => break,
                    KIND_SUBSCRIBE => core.on_subscribe(bytes),
                    KIND_CREATE_TOPIC => core.on_create_topic(bytes),
                    KIND_HELLO => core.on_hello(bytes),
                    KIND_UNSUBSCRIBE => core.on_unsubscribe(bytes),
                    KIND_REMOVE_TOPIC => core.on_remove_topic(bytes),
                    other => debug!("ignoring envelope kind {other}"),
                }
            }
            Ok(None) => debug!("no messages at the broker dispatcher"),
            Err(err) => {
                error!("broker dispatcher receive failed: {err}");
                break;
            }
        }
    }
    debug!("broker dispatcher exited");
}

/// One broker instance: a channel name, its request queue, its topics.
pub struct BrokerServer {
    core: Arc<ServerCore>,
    dispatcher: Option<JoinHandle<()>>,
}

impl BrokerServer {
    /// Opens (or creates) the channel request queue and starts dispatching.
    pub fn new(channel: &str) -> Result<Self, BusError> {
        let request_q = MsgQueue::open_or_create(channel, QUEUE_CAPACITY, ENVELOPE_MAX)?;
        let core = Arc::new(ServerCore {
            channel: channel.to_string(),
            request_q,
            topics: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
        });

        let for_thread = core.clone();
        let dispatcher = std::thread::Builder::new()
            .name(format!("shmbus-broker-{channel}"))
            .spawn(move || dispatch_requests(&for_thread))?;

        info!("broker serving channel '{channel}'");
        Ok(Self {
            core,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn channel(&self) -> &str {
        &self.core.channel
    }

    /// Ensures a topic exists and returns the caller-local handle to it.
    /// Idempotent per name: a second call returns the same topic.
    pub fn create_topic(
        &self,
        name: &str,
        max_messages: u32,
        buffer_bytes: u32,
    ) -> Result<Arc<Topic>, BusError> {
        let req = CreateTopicRequest::new(name, max_messages, buffer_bytes)?;
        let (tx, rx) = mpsc::sync_channel(1);
        self.core.local.lock().insert(req.correlation_id, tx);
        self.core.request_q.send(envelope::encode(&req))?;

        match rx.recv_timeout(CONTROL_TIMEOUT) {
            Ok(LocalReply::Created(topic)) => Ok(topic),
            Ok(LocalReply::Removed(_)) | Err(_) => {
                self.core.local.lock().remove(&req.correlation_id);
                Err(BusError::Io(std::io::Error::other(format!(
                    "create topic '{name}' did not complete"
                ))))
            }
        }
    }

    /// Destroys a topic and unlinks its region. Returns whether the topic
    /// existed.
    pub fn remove_topic(&self, name: &str) -> Result<bool, BusError> {
        let req = RemoveTopicRequest::new(name)?;
        let (tx, rx) = mpsc::sync_channel(1);
        self.core.local.lock().insert(req.correlation_id, tx);
        self.core.request_q.send(envelope::encode(&req))?;

        match rx.recv_timeout(CONTROL_TIMEOUT) {
            Ok(LocalReply::Removed(removed)) => Ok(removed),
            Ok(LocalReply::Created(_)) | Err(_) => {
                self.core.local.lock().remove(&req.correlation_id);
                Err(BusError::Io(std::io::Error::other(format!(
                    "remove topic '{name}' did not complete"
                ))))
            }
        }
    }

    /// Unlinks a channel's request queue by name.
    pub fn remove_channel(channel: &str) -> bool {
        MsgQueue::remove(channel)
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        let had_topics = !self.core.topics.lock().is_empty();

        if let Err(err) = self.core.request_q.send(&SHUTDOWN_ENVELOPE) {
            warn!("failed to post broker shutdown: {err}");
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        self.core.topics.lock().clear();

        // A channel that never hosted topics cleans its queue up with it.
        if !had_topics {
            MsgQueue::remove(&self.core.channel);
        }
        info!("broker on channel '{}' closed", self.core.channel);
    }
}
