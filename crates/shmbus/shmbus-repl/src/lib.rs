//! `shmbus-repl`: network replication for the shared-memory bus.
//!
//! Mirrors topics between hosts in two flavors:
//!
//! - [`TcpSource`] / [`TcpTarget`]: reliable, framed streaming with
//!   reconnect-on-transient-error inside the target task.
//! - [`UdpSource`] / [`UdpTarget`]: unreliable datagrams with an in-process
//!   fragmentation protocol ([`FragmentIter`] / [`Defragmentator`]) sized to
//!   the chosen MTU.
//!
//! Either way the remote side is just another broker: a replicated topic is
//! indistinguishable from a locally published one.

mod defrag;
mod error;
mod fragment;
mod tcp;
mod udp;
pub mod wire;

pub use defrag::Defragmentator;
pub use error::ReplError;
pub use fragment::FragmentIter;
pub use tcp::{TcpSource, TcpTarget};
pub use udp::{UdpSource, UdpTarget};
