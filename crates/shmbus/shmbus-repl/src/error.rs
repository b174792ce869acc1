use shmbus_core::BusError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// Protocol-level wire error on the TCP or UDP path.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("I/O failure")]
    Io(#[from] io::Error),
}
