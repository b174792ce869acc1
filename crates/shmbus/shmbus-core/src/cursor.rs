//! Consumer-side cursor: blocks on the slot semaphore, chases the ring.
//!
//! The cursor opens lazily: the first successful acquire reads the slot's
//! `start_index` (captured by the broker on the first notify) and positions
//! just before it. Entry publication pairs a release increment of
//! `next_index` with the acquire load in `try_read`, so the post-acquire
//! spin below is a belt for the cross-process cache window rather than the
//! primary ordering mechanism.

use crate::client::ClientCore;
use crate::error::BusError;
use crate::ring::{EntryAccessor, RingCursor};
use crate::view::TopicView;
use shmbus_ipc::NamedSemaphore;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded busy-wait after a successful acquire: rounds × cycles.
const SPIN_ROUNDS: u32 = 50;
const SPIN_WAIT_CYCLES: u32 = 200;

#[inline]
fn spin_wait(cycles: u32) {
    for _ in 0..cycles {
        std::hint::spin_loop();
    }
}

/// Exclusive reader over one subscription slot.
///
/// Dropping the cursor requests a lazy unsubscribe through the control plane
/// and removes the slot semaphore from the namespace.
pub struct Cursor {
    topic: String,
    slot_id: u8,
    view: Arc<TopicView>,
    sem: NamedSemaphore,
    sem_name: String,
    position: Option<RingCursor>,
    client: Arc<ClientCore>,
}

impl Cursor {
    pub(crate) fn new(
        topic: String,
        slot_id: u8,
        view: Arc<TopicView>,
        sem: NamedSemaphore,
        sem_name: String,
        client: Arc<ClientCore>,
    ) -> Self {
        Self {
            topic,
            slot_id,
            view,
            sem,
            sem_name,
            position: None,
            client,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub fn view(&self) -> &TopicView {
        &self.view
    }

    /// Blocks until the producer signals, then returns an in-place accessor
    /// to the next entry. Fails with [`BusError::TryReadFailed`] if the
    /// entry does not become visible within the spin budget.
    pub fn read(&mut self) -> Result<EntryAccessor<'_>, BusError> {
        self.sem.acquire()?;
        self.advance()
    }

    /// Non-blocking variant; `Ok(None)` when no signal is pending.
    pub fn try_read(&mut self) -> Result<Option<EntryAccessor<'_>>, BusError> {
        if !self.sem.try_acquire()? {
            return Ok(None);
        }
        self.advance().map(Some)
    }

    /// Timed variant; `Ok(None)` when the timeout elapses unsignaled.
    pub fn try_read_for(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<EntryAccessor<'_>>, BusError> {
        if !self.sem.try_acquire_for(timeout)? {
            return Ok(None);
        }
        self.advance().map(Some)
    }

    fn advance(&mut self) -> Result<EntryAccessor<'_>, BusError> {
        if self.position.is_none() {
            let start = self
                .view
                .slot(self.slot_id)
                .start_index
                .load(Ordering::Acquire);
            debug!("cursor on '{}' slot {}: start index {start}", self.topic, self.slot_id);
            self.position = Some(self.view.ring().open_cursor(start));
        }

        let position = self.position.as_mut().expect("opened above");
        for round in 0..SPIN_ROUNDS {
            if position.try_read(self.view.ring()) {
                if round > 0 {
                    debug!(
                        "waited {} spin cycles before the entry was in sync",
                        round * SPIN_WAIT_CYCLES
                    );
                }
                return Ok(self.view.ring().entry(position));
            }
            spin_wait(SPIN_WAIT_CYCLES);
        }
        Err(BusError::TryReadFailed)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Err(err) = self.client.unsubscribe(&self.topic, self.slot_id) {
            warn!(
                "unsubscribe of slot {} on topic '{}' failed: {err}",
                self.slot_id, self.topic
            );
        }
        NamedSemaphore::remove(&self.sem_name);
    }
}
