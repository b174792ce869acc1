//! `shmbus-ipc`: host-platform IPC primitives for the bus.
//!
//! Three building blocks, each keyed by a flat string name so that unrelated
//! processes can rendezvous on them:
//!
//! - [`NamedSemaphore`]: portable counting semaphore (create / open /
//!   open-or-create, blocking and timed waits, remove-by-name).
//! - [`MsgQueue`]: bounded multi-producer message queue over a shared-memory
//!   ring, used for the control plane's request and reply channels.
//! - [`process_alive`]: pid liveness probe used during crash recovery.
//!
//! Callers supply plain identifiers; platform prefixes (the leading `/` of
//! POSIX semaphore names) are applied internally.

mod process;
mod queue;
mod sem;

pub use process::{current_pid, process_alive};
pub use queue::MsgQueue;
pub use sem::NamedSemaphore;
