//! Error surface of the bus core.
//!
//! Publisher-side arena errors (`ArenaBusy`, `TooLarge`, `Overcommit`) are
//! programmer errors and surface immediately; consumer-side failures are
//! returned from the failing cursor call and never affect the producer or
//! other consumers.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A second writer tried to open a span while one is in flight.
    #[error("arena is already in use by another writer")]
    ArenaBusy,

    /// The requested span can never fit, even in an empty arena.
    #[error("requested span of {requested} bytes exceeds arena size {arena_size}")]
    TooLarge { requested: u64, arena_size: u64 },

    /// A commit ran past the reserved span.
    #[error("commit of {requested} bytes exceeds reserved span ({remaining} bytes left)")]
    Overcommit { requested: u64, remaining: u64 },

    /// The subscriber slot pool is exhausted.
    #[error("no subscriber slot available")]
    NoSlotAvailable,

    /// A slot id was returned to the pool twice.
    #[error("slot id {0} is already free")]
    AlreadyFree(u32),

    /// The control-plane handshake did not complete.
    #[error("connect to channel '{0}' failed")]
    ConnectFailed(String),

    /// The broker returned an unsuccessful subscription.
    #[error("subscription to topic '{0}' failed")]
    SubscribeFailed(String),

    /// A signal arrived but the entry never became visible within the spin
    /// budget.
    #[error("entry did not become visible within the spin budget")]
    TryReadFailed,

    /// A topic name does not fit the fixed wire field (255 bytes).
    #[error("topic name '{0}' exceeds 255 bytes")]
    TopicNameTooLong(String),

    #[error("I/O failure")]
    Io(#[from] io::Error),
}
