//! Fragmenting a source entry into MTU-sized datagram parts.

use crate::wire::{UDP_HEADER, UdpHeader};

/// Yields `(header, payload_chunk)` pairs covering one source entry in
/// order. Every chunk carries `min(mtu - header, remaining)` bytes; the
/// sequence starts at 0 and increments per fragment.
pub struct FragmentIter<'a> {
    buffer: &'a [u8],
    header: UdpHeader,
    offset: usize,
    payload_size: usize,
}

impl<'a> FragmentIter<'a> {
    pub fn new(buffer: &'a [u8], tag: u8, created: u64, mtu: usize) -> Self {
        assert!(mtu > UDP_HEADER, "mtu must leave room for the header");
        Self {
            buffer,
            header: UdpHeader {
                created,
                size: buffer.len() as u32,
                sequence: 0,
                tag,
            },
            offset: 0,
            payload_size: mtu - UDP_HEADER,
        }
    }
}

impl<'a> Iterator for FragmentIter<'a> {
    type Item = (UdpHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buffer.len() {
            return None;
        }
        let chunk = self.payload_size.min(self.buffer.len() - self.offset);
        let item = (self.header, &self.buffer[self.offset..self.offset + chunk]);
        self.offset += chunk;
        self.header.sequence += 1;
        Some(item)
    }
}
