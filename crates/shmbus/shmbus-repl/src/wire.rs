//! Wire formats of the two bridges.
//!
//! TCP stream: one `SubscribeRequest` (`u32` name length + name bytes) per
//! replicated topic, then a stream of `{u32 size, u64 tag}` headers each
//! followed by `size` payload bytes.
//!
//! UDP datagram: a packed 15-byte header `{u64 created, u32 size,
//! u16 sequence, u8 tag}` followed by the fragment payload. All integers
//! little-endian, encoded explicitly.

use std::io::{self, Read, Write};

/// Bytes of the TCP frame header on the wire.
pub const TCP_FRAME_HEADER: usize = 12;

/// Bytes of the UDP fragment header on the wire.
pub const UDP_HEADER: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFrameHeader {
    pub size: u32,
    pub tag: u64,
}

impl TcpFrameHeader {
    pub fn encode(&self) -> [u8; TCP_FRAME_HEADER] {
        let mut buf = [0u8; TCP_FRAME_HEADER];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..12].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; TCP_FRAME_HEADER]) -> Self {
        Self {
            size: u32::from_le_bytes(buf[0..4].try_into().expect("sized")),
            tag: u64::from_le_bytes(buf[4..12].try_into().expect("sized")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Frame identity: producer wall-clock milliseconds at entry read time.
    pub created: u64,
    /// Total frame size, not the fragment size.
    pub size: u32,
    /// Fragment position, starting at 0.
    pub sequence: u16,
    pub tag: u8,
}

impl UdpHeader {
    pub fn encode(&self) -> [u8; UDP_HEADER] {
        let mut buf = [0u8; UDP_HEADER];
        buf[0..8].copy_from_slice(&self.created.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..14].copy_from_slice(&self.sequence.to_le_bytes());
        buf[14] = self.tag;
        buf
    }

    /// `None` when the buffer is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_HEADER {
            return None;
        }
        Some(Self {
            created: u64::from_le_bytes(buf[0..8].try_into().expect("checked")),
            size: u32::from_le_bytes(buf[8..12].try_into().expect("checked")),
            sequence: u16::from_le_bytes(buf[12..14].try_into().expect("checked")),
            tag: buf[14],
        })
    }
}

/// Writes a topic subscription request to a TCP stream.
pub fn write_subscribe(stream: &mut impl Write, topic: &str) -> io::Result<()> {
    stream.write_all(&(topic.len() as u32).to_le_bytes())?;
    stream.write_all(topic.as_bytes())
}

/// Reads one topic subscription request from a TCP stream.
pub fn read_subscribe(stream: &mut impl Read) -> io::Result<String> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > 255 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "topic name length exceeds 255",
        ));
    }
    let mut name = vec![0u8; len];
    stream.read_exact(&mut name)?;
    String::from_utf8(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "topic name is not UTF-8"))
}
