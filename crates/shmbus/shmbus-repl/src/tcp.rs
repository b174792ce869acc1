//! Reliable topic replication over TCP.
//!
//! The source side accepts subscribers, reads their topic requests, and
//! streams every ring entry as a framed message through its own bus client.
//! The target side connects out, requests topics, and writes incoming
//! frames into a topic on its local broker. Each direction is a one-way
//! task; reconnection lives inside the target task.

use crate::error::ReplError;
use crate::wire::{self, TCP_FRAME_HEADER, TcpFrameHeader};
use parking_lot::Mutex;
use shmbus_core::{BrokerServer, BusClient, Cursor, Topic};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a replication task parks on its cursor or socket before it
/// rechecks the running flags.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Transient stream failures that warrant a reconnect rather than giving up.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted
    )
}

/// Reads exactly `buf.len()` bytes, riding out read timeouts so a slow peer
/// cannot desynchronize the frame stream. Fails on EOF or shutdown.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], running: &AtomicBool) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if !running.load(Ordering::Acquire) {
            return Err(io::Error::new(ErrorKind::Interrupted, "shutting down"));
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed")),
            Ok(n) => filled += n,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Accepting side of the bridge: streams local topics to remote targets.
pub struct TcpSource {
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl TcpSource {
    /// Connects a bus client on `channel` and starts accepting replication
    /// subscribers on `port` (0 picks an ephemeral port).
    pub fn bind(channel: &str, port: u16) -> Result<Self, ReplError> {
        let client = Arc::new(BusClient::new(channel)?);
        client.connect()?;

        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let accept_thread = std::thread::Builder::new()
            .name("shmbus-tcp-accept".into())
            .spawn(move || accept_loop(&listener, &client, &thread_running))?;

        info!("TCP replication source listening on {local_addr}");
        Ok(Self {
            running,
            accept_thread: Some(accept_thread),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: &TcpListener, client: &Arc<BusClient>, running: &Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("replication subscriber connected from {peer}");
                let client = client.clone();
                let running = running.clone();
                let _ = std::thread::Builder::new()
                    .name("shmbus-tcp-conn".into())
                    .spawn(move || handle_connection(stream, &client, &running));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => {
                warn!("accept failed: {err}, retrying");
                std::thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
    debug!("TCP accept loop exited");
}

/// Reads subscription requests off one connection; each starts a
/// replication task that shares the connection for writes.
fn handle_connection(stream: TcpStream, client: &Arc<BusClient>, running: &Arc<AtomicBool>) {
    let writer = match stream.try_clone() {
        Ok(clone) => Arc::new(Mutex::new(clone)),
        Err(err) => {
            error!("cannot clone replication socket: {err}");
            return;
        }
    };
    let mut reader = stream;

    loop {
        match wire::read_subscribe(&mut reader) {
            Ok(topic) => {
                info!("replication request for topic '{topic}'");
                match client.subscribe(&topic) {
                    Ok(cursor) => {
                        let writer = writer.clone();
                        let running = running.clone();
                        let _ = std::thread::Builder::new()
                            .name(format!("shmbus-tcp-repl-{topic}"))
                            .spawn(move || replicate_entries(cursor, &writer, &running));
                    }
                    Err(err) => error!("cannot subscribe to '{topic}': {err}"),
                }
            }
            Err(err) => {
                debug!("subscription stream ended: {err}");
                return;
            }
        }
    }
}

/// Streams entries from one cursor until the connection breaks or the
/// source shuts down. Any write failure discards the subscription.
fn replicate_entries(
    mut cursor: Cursor,
    writer: &Arc<Mutex<TcpStream>>,
    running: &Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let accessor = match cursor.try_read_for(POLL_TIMEOUT) {
            Ok(Some(accessor)) => accessor,
            Ok(None) => continue,
            Err(err) => {
                warn!("replication cursor read failed: {err}");
                break;
            }
        };

        let header = TcpFrameHeader {
            size: accessor.size() as u32,
            tag: accessor.tag(),
        };
        // Header and payload go out as one logical frame.
        let mut stream = writer.lock();
        let result = stream
            .write_all(&header.encode())
            .and_then(|()| stream.write_all(accessor.bytes()));
        if let Err(err) = result {
            debug!("replication connection closed ({err}), dropping subscription");
            break;
        }
    }
    // The cursor drop unsubscribes the slot.
}

/// Connecting side of the bridge: mirrors remote topics into a local broker.
pub struct TcpTarget {
    server: Arc<BrokerServer>,
    host: String,
    port: u16,
    message_count: u32,
    buffer_bytes: u32,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTarget {
    pub fn new(
        server: Arc<BrokerServer>,
        host: &str,
        port: u16,
        message_count: u32,
        buffer_bytes: u32,
    ) -> Self {
        Self {
            server,
            host: host.to_string(),
            port,
            message_count,
            buffer_bytes,
            running: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Ensures the local broker has `name` and starts mirroring it from the
    /// remote source.
    pub fn replicate_topic(&self, name: &str) -> Result<(), ReplError> {
        let topic = self
            .server
            .create_topic(name, self.message_count, self.buffer_bytes)?;

        let host = self.host.clone();
        let port = self.port;
        let name = name.to_string();
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name(format!("shmbus-tcp-target-{name}"))
            .spawn(move || run_target_task(&topic, &name, &host, port, &running))?;
        self.tasks.lock().push(handle);
        Ok(())
    }
}

impl Drop for TcpTarget {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.tasks.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn connect_with_retry(host: &str, port: u16, running: &AtomicBool) -> Option<TcpStream> {
    loop {
        if !running.load(Ordering::Acquire) {
            return None;
        }
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                info!("connected to replication source {host}:{port}");
                return Some(stream);
            }
            Err(err) if matches!(err.kind(), ErrorKind::ConnectionRefused | ErrorKind::TimedOut) => {
                warn!("connect to {host}:{port} failed: {err}, retrying");
                std::thread::sleep(RECONNECT_BACKOFF);
            }
            Err(err) => {
                error!("cannot connect to {host}:{port}: {err}");
                return None;
            }
        }
    }
}

fn run_target_task(
    topic: &Arc<Topic>,
    name: &str,
    host: &str,
    port: u16,
    running: &Arc<AtomicBool>,
) {
    'session: while running.load(Ordering::Acquire) {
        let Some(mut stream) = connect_with_retry(host, port, running) else {
            return;
        };
        if stream.set_read_timeout(Some(POLL_TIMEOUT)).is_err() {
            warn!("cannot arm read timeout, replication may stall on shutdown");
        }
        if let Err(err) = wire::write_subscribe(&mut stream, name) {
            warn!("subscription request for '{name}' failed: {err}, reconnecting");
            std::thread::sleep(RECONNECT_BACKOFF);
            continue 'session;
        }
        info!("replicating '{name}' from {host}:{port}");

        loop {
            if !running.load(Ordering::Acquire) {
                return;
            }

            let mut header_buf = [0u8; TCP_FRAME_HEADER];
            match read_full(&mut stream, &mut header_buf, running) {
                Ok(()) => {}
                Err(err) if is_transient(&err) => {
                    error!("connection issue on '{name}': {err}, reconnecting");
                    continue 'session;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => return,
                Err(err) => {
                    error!("replication of '{name}' failed: {err}");
                    return;
                }
            }
            let header = TcpFrameHeader::decode(&header_buf);

            // Reserve the announced size and read the payload straight into
            // the span; the publish scope notifies subscribers on drop.
            let mut scope = match topic.publish(u64::from(header.size), header.tag) {
                Ok(scope) => scope,
                Err(err) => {
                    error!("cannot reserve {} bytes on '{name}': {err}", header.size);
                    return;
                }
            };
            match read_full(
                &mut stream,
                &mut scope.bytes_mut()[..header.size as usize],
                running,
            ) {
                Ok(()) => {}
                Err(err) if is_transient(&err) => {
                    // Nothing committed; the scope drop publishes nothing.
                    drop(scope);
                    error!("connection issue on '{name}': {err}, reconnecting");
                    continue 'session;
                }
                Err(err) => {
                    error!("replication of '{name}' failed: {err}");
                    return;
                }
            }
            if let Err(err) = scope.commit(u64::from(header.size)) {
                error!("commit failed on '{name}': {err}");
                return;
            }
        }
    }
}
