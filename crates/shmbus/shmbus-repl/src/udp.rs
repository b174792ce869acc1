//! Unreliable topic replication over UDP with fragmentation.
//!
//! The source fragments each ring entry to the configured MTU and sends the
//! pieces as individual datagrams. The target binds one socket per topic,
//! feeds every datagram to the defragmentator, and signals the local topic
//! whenever a frame completes. Loss and reorder tolerance live entirely in
//! the defragmentator; the sockets stay plain blocking-with-timeout.

use crate::defrag::Defragmentator;
use crate::error::ReplError;
use crate::fragment::FragmentIter;
use crate::wire::UDP_HEADER;
use parking_lot::Mutex;
use shmbus_core::{BrokerServer, BusClient, Cursor, Topic};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const CURSOR_POLL: Duration = Duration::from_secs(5);
const RECV_POLL: Duration = Duration::from_millis(100);
const SEND_BACKOFF: Duration = Duration::from_millis(100);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sending side: fragments local topic entries toward remote targets.
pub struct UdpSource {
    client: Arc<BusClient>,
    socket: Arc<UdpSocket>,
    mtu: usize,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpSource {
    /// Connects a bus client on `channel` and binds an ephemeral local port.
    pub fn new(channel: &str, mtu: usize) -> Result<Self, ReplError> {
        assert!(mtu > UDP_HEADER, "mtu must leave room for the header");
        let client = Arc::new(BusClient::new(channel)?);
        client.connect()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            client,
            socket: Arc::new(socket),
            mtu,
            running: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts fragment-and-send replication of `topic` to `target`
    /// (a `host:port` endpoint).
    pub fn replicate_topic(&self, topic: &str, target: &str) -> Result<(), ReplError> {
        let endpoint = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ReplError::ReplicationFailed(format!("cannot resolve '{target}'")))?;
        let cursor = self.client.subscribe(topic)?;

        let socket = self.socket.clone();
        let running = self.running.clone();
        let mtu = self.mtu;
        let name = topic.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("shmbus-udp-source-{name}"))
            .spawn(move || send_fragments(cursor, &socket, endpoint, mtu, &running, &name))?;
        self.tasks.lock().push(handle);
        info!("UDP replication of '{topic}' to {endpoint} started");
        Ok(())
    }
}

impl Drop for UdpSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.tasks.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn send_fragments(
    mut cursor: Cursor,
    socket: &UdpSocket,
    endpoint: SocketAddr,
    mtu: usize,
    running: &AtomicBool,
    topic: &str,
) {
    let mut datagram = vec![0u8; mtu];
    while running.load(Ordering::Acquire) {
        let accessor = match cursor.try_read_for(CURSOR_POLL) {
            Ok(Some(accessor)) => accessor,
            Ok(None) => continue,
            Err(err) => {
                warn!("UDP replication cursor on '{topic}' failed: {err}");
                break;
            }
        };

        let created = now_millis();
        let mut failed = false;
        for (header, chunk) in
            FragmentIter::new(accessor.bytes(), accessor.tag() as u8, created, mtu)
        {
            datagram[..UDP_HEADER].copy_from_slice(&header.encode());
            datagram[UDP_HEADER..UDP_HEADER + chunk.len()].copy_from_slice(chunk);
            if let Err(err) = socket.send_to(&datagram[..UDP_HEADER + chunk.len()], endpoint) {
                error!("failed to send UDP datagram to {endpoint}: {err}");
                failed = true;
                break;
            }
        }
        if failed {
            // Back off but keep the task; UDP loss is survivable.
            std::thread::sleep(SEND_BACKOFF);
        }
    }
}

/// Receiving side: reassembles datagrams into a topic on the local broker.
pub struct UdpTarget {
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl UdpTarget {
    /// Binds `host:port` (port 0 picks an ephemeral one) and mirrors the
    /// incoming fragment stream into `topic` on the local broker.
    pub fn bind(
        server: &Arc<BrokerServer>,
        host: &str,
        port: u16,
        topic: &str,
        message_count: u32,
        buffer_bytes: u32,
        mtu: usize,
    ) -> Result<Self, ReplError> {
        assert!(mtu > UDP_HEADER, "mtu must leave room for the header");
        let topic = server.create_topic(topic, message_count, buffer_bytes)?;
        let socket = UdpSocket::bind((host, port))?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        let local_addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let task = std::thread::Builder::new()
            .name(format!("shmbus-udp-target-{}", topic.name()))
            .spawn(move || receive_fragments(&socket, &topic, mtu, &thread_running))?;

        info!("UDP replication target listening on {local_addr}");
        Ok(Self {
            running,
            task: Some(task),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for UdpTarget {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.task.take() {
            let _ = handle.join();
        }
    }
}

fn receive_fragments(socket: &UdpSocket, topic: &Arc<Topic>, mtu: usize, running: &AtomicBool) {
    let mut defrag = Defragmentator::new(topic.ring(), mtu);
    let mut buf = vec![0u8; 65536];

    while running.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => len,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                error!("UDP receive error: {err}");
                std::thread::sleep(SEND_BACKOFF);
                continue;
            }
        };

        match defrag.process_datagram(&buf[..len]) {
            Ok(true) => topic.notify_all(),
            Ok(false) => {}
            Err(err) => {
                error!("dropping datagram: {err}");
                std::thread::sleep(SEND_BACKOFF);
            }
        }
    }
    debug!("UDP target task for '{}' exited", topic.name());
}
