//! Bus client: the consumer-facing end of the control plane.
//!
//! A client owns its per-process reply queue and a dispatcher thread that
//! demultiplexes responses by correlation id. Application threads post a
//! request, park on a rendezvous channel, and the dispatcher wakes exactly
//! one of them when the matching response arrives. Requests never cancel in
//! flight; only the initial handshake is allowed to time out.

use crate::cursor::Cursor;
use crate::envelope::{
    self, ENVELOPE_MAX, HelloRequest, HelloResponse, KIND_SHUTDOWN, SHUTDOWN_ENVELOPE,
    SubscribeRequest, SubscribeResponse, UnsubscribeRequest, UnsubscribeResponse,
};
use crate::error::BusError;
use crate::layout;
use crate::view::TopicView;
use parking_lot::{Mutex, RwLock};
use shmbus_ipc::{MsgQueue, NamedSemaphore, current_pid};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request queue depth, matching the broker side.
const QUEUE_CAPACITY: usize = 256;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DISPATCH_WAKE: Duration = Duration::from_secs(30);

/// State the dispatcher thread shares with request issuers.
struct DispatchShared {
    reply_q: MsgQueue,
    /// Correlation id → waiting request thread. The dispatcher reads while
    /// application threads insert.
    pending: RwLock<HashMap<u64, SyncSender<Vec<u8>>>>,
}

pub(crate) struct ClientCore {
    channel: String,
    request_q: MsgQueue,
    shared: Arc<DispatchShared>,
    views: Mutex<HashMap<String, Arc<TopicView>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ClientCore {
    /// Sends `request` and parks until the response with the same
    /// correlation id arrives. `None` timeout waits indefinitely (while the
    /// dispatcher lives). Returns `Ok(None)` on timeout.
    fn roundtrip(
        &self,
        correlation_id: u64,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, BusError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.pending.write().insert(correlation_id, tx);

        if let Err(err) = self.request_q.send(request) {
            self.shared.pending.write().remove(&correlation_id);
            return Err(err.into());
        }

        let outcome = match timeout {
            Some(t) => match rx.recv_timeout(t) {
                Ok(bytes) => Some(bytes),
                Err(_) => None,
            },
            None => rx.recv().ok(),
        };
        if outcome.is_none() {
            self.shared.pending.write().remove(&correlation_id);
        }
        Ok(outcome)
    }

    /// Lazy unsubscribe on behalf of a dropping cursor. Bounded wait: this
    /// runs on drop paths where a vanished broker must not wedge teardown;
    /// the slot is reclaimed by recovery in that case.
    pub(crate) fn unsubscribe(&self, topic: &str, slot_id: u8) -> Result<bool, BusError> {
        let req = UnsubscribeRequest::new(topic, slot_id)?;
        let Some(bytes) = self.roundtrip(
            req.correlation_id,
            envelope::encode(&req),
            Some(Duration::from_secs(5)),
        )?
        else {
            return Ok(false);
        };
        let rsp: UnsubscribeResponse =
            envelope::decode(&bytes).ok_or_else(|| BusError::SubscribeFailed(topic.into()))?;
        Ok(rsp.ok != 0)
    }

    fn view(&self, topic: &str) -> Result<Arc<TopicView>, BusError> {
        let mut views = self.views.lock();
        if let Some(view) = views.get(topic) {
            return Ok(view.clone());
        }
        let view = Arc::new(TopicView::open(&self.channel, topic)?);
        views.insert(topic.to_string(), view.clone());
        Ok(view)
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        // A zero-kind envelope unblocks the dispatcher; then the reply queue
        // leaves the namespace with us.
        if let Err(err) = self.shared.reply_q.send(&SHUTDOWN_ENVELOPE) {
            warn!("failed to post dispatcher shutdown: {err}");
        }
        if let Some(handle) = self.dispatcher.get_mut().take() {
            let _ = handle.join();
        }
        MsgQueue::remove(&layout::reply_queue_name(&self.channel, current_pid()));
    }
}

/// Client handle for one channel. Cheap to share: cursors keep the
/// underlying state alive until the last of them drops.
pub struct BusClient {
    core: Arc<ClientCore>,
}

impl BusClient {
    /// Opens the channel's request queue and starts the response dispatcher.
    pub fn new(channel: &str) -> Result<Self, BusError> {
        let request_q = MsgQueue::open_or_create(channel, QUEUE_CAPACITY, ENVELOPE_MAX)?;
        let reply_name = layout::reply_queue_name(channel, current_pid());
        let reply_q = MsgQueue::create(&reply_name, QUEUE_CAPACITY, ENVELOPE_MAX)?;

        let shared = Arc::new(DispatchShared {
            reply_q,
            pending: RwLock::new(HashMap::new()),
        });
        let for_thread = shared.clone();
        let dispatcher = std::thread::Builder::new()
            .name(format!("shmbus-client-{channel}"))
            .spawn(move || dispatch_responses(&for_thread))?;

        Ok(Self {
            core: Arc::new(ClientCore {
                channel: channel.to_string(),
                request_q,
                shared,
                views: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    pub fn channel(&self) -> &str {
        &self.core.channel
    }

    /// Round-trips a Hello through the broker. Fails with
    /// [`BusError::ConnectFailed`] when no broker answers in time.
    pub fn connect(&self) -> Result<(), BusError> {
        let req = HelloRequest::new();
        let bytes = self
            .core
            .roundtrip(req.correlation_id, envelope::encode(&req), Some(CONNECT_TIMEOUT))?
            .ok_or_else(|| BusError::ConnectFailed(self.core.channel.clone()))?;
        let rsp: HelloResponse = envelope::decode(&bytes)
            .ok_or_else(|| BusError::ConnectFailed(self.core.channel.clone()))?;

        let elapsed = envelope::now_millis().saturating_sub(rsp.request_created_ms);
        info!("connection to channel '{}' established [{elapsed} ms]", self.core.channel);
        Ok(())
    }

    /// Subscribes to a topic and returns the reading cursor bound to the
    /// allocated slot.
    pub fn subscribe(&self, topic: &str) -> Result<Cursor, BusError> {
        let req = SubscribeRequest::new(topic)?;
        let bytes = self
            .core
            .roundtrip(req.correlation_id, envelope::encode(&req), None)?
            .ok_or_else(|| BusError::SubscribeFailed(topic.into()))?;
        let rsp: SubscribeResponse =
            envelope::decode(&bytes).ok_or_else(|| BusError::SubscribeFailed(topic.into()))?;
        if rsp.ok == 0 {
            return Err(BusError::SubscribeFailed(topic.into()));
        }

        let view = self.core.view(topic)?;
        let sem_name = layout::slot_sem_name(&self.core.channel, topic, current_pid(), rsp.slot_id);
        let sem = NamedSemaphore::open(&sem_name)?;
        debug!("subscribed to '{topic}' on slot {}", rsp.slot_id);

        Ok(Cursor::new(
            topic.to_string(),
            rsp.slot_id,
            view,
            sem,
            sem_name,
            self.core.clone(),
        ))
    }
}

fn dispatch_responses(shared: &DispatchShared) {
    let mut buf = [0u8; ENVELOPE_MAX];
    loop {
        match shared.reply_q.timed_receive(&mut buf, DISPATCH_WAKE) {
            Ok(Some(len)) => {
                let bytes = &buf[..len];
                if envelope::kind_of(bytes) == KIND_SHUTDOWN {
                    break;
                }
                let correlation_id = envelope::correlation_of(bytes);
                let waiter = shared.pending.write().remove(&correlation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(bytes.to_vec());
                    }
                    None => debug!("response with no waiter, correlation id {correlation_id}"),
                }
            }
            Ok(None) => debug!("no messages at the client dispatcher"),
            Err(err) => {
                warn!("client dispatcher receive failed: {err}");
                break;
            }
        }
    }
    // Anything still parked gets a disconnect instead of a hang.
    shared.pending.write().clear();
    debug!("client dispatcher exited");
}
