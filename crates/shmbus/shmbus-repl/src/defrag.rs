//! Reassembly of fragmented UDP frames into ring entries.
//!
//! At most two frames are in flight: the one currently arriving and the one
//! it displaced (whose stragglers may still arrive out of order). Frames are
//! identified by their `created` stamp, which is unique because the topic
//! has a single producer. Fragments accumulate in a staging buffer; a frame
//! that completes is committed to the ring through a short-lived writer
//! scope, which keeps the arena's single-span invariant intact while both
//! frames are open.
//!
//! Tolerance for reordering is bounded: once more than
//! `MAX_NEXT_FRAME_MESSAGES` fragments of newer frames have arrived, the
//! displaced frame is given up on.

use crate::error::ReplError;
use crate::wire::{UDP_HEADER, UdpHeader};
use shmbus_core::Ring;

const MAX_NEXT_FRAME_MESSAGES: u16 = 16;

struct FrameState {
    buf: Vec<u8>,
    received: Vec<bool>,
    received_count: u16,
    expected_chunks: u16,
    tag: u8,
}

impl FrameState {
    fn new(size: usize, chunks: usize, tag: u8) -> Self {
        Self {
            buf: vec![0u8; size],
            received: vec![false; chunks],
            received_count: 0,
            expected_chunks: chunks as u16,
            tag,
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.expected_chunks
    }
}

pub struct Defragmentator<'a> {
    ring: &'a Ring,
    current: Option<FrameState>,
    previous: Option<FrameState>,
    current_created: u64,
    previous_created: u64,
    next_frame_messages: u16,
    max_payload: usize,
}

impl<'a> Defragmentator<'a> {
    pub fn new(ring: &'a Ring, mtu: usize) -> Self {
        assert!(mtu > UDP_HEADER, "mtu must leave room for the header");
        Self {
            ring,
            current: None,
            previous: None,
            current_created: 0,
            previous_created: 0,
            next_frame_messages: 0,
            max_payload: mtu - UDP_HEADER,
        }
    }

    /// Feeds one raw datagram. Returns `true` when a frame completed and was
    /// committed to the ring.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> Result<bool, ReplError> {
        let header = UdpHeader::decode(datagram).ok_or_else(|| {
            ReplError::ReplicationFailed("datagram shorter than the fragment header".into())
        })?;
        self.process(header, &datagram[UDP_HEADER..])
    }

    /// Feeds one parsed `(header, payload)` fragment.
    pub fn process(&mut self, header: UdpHeader, payload: &[u8]) -> Result<bool, ReplError> {
        // A payload covering the whole announced size is a complete,
        // unfragmented message.
        if header.size as usize == payload.len() {
            self.commit_bytes(payload, header.tag)?;
            return Ok(true);
        }

        // Straggler of the displaced frame.
        if self.previous.is_some() && header.created == self.previous_created {
            let mut frame = self.previous.take().expect("checked above");
            let completed = Self::write_chunk(&mut frame, &header, payload, self.max_payload)?;
            if completed {
                self.commit_frame(frame)?;
            } else {
                self.previous = Some(frame);
            }
            return Ok(completed);
        }

        // Fragment of the frame currently arriving.
        if self.current.is_some() && header.created == self.current_created {
            let mut frame = self.current.take().expect("checked above");
            let completed = Self::write_chunk(&mut frame, &header, payload, self.max_payload)?;
            if completed {
                self.commit_frame(frame)?;
            } else {
                self.current = Some(frame);
            }
            return Ok(completed);
        }

        // First fragment of a newer frame: displace the current one.
        if header.created > self.current_created {
            if self.current.is_some() {
                self.previous = self.current.take();
                self.previous_created = self.current_created;
                self.next_frame_messages = 1;
            }

            let chunks = (header.size as usize).div_ceil(self.max_payload);
            let mut frame = FrameState::new(header.size as usize, chunks, header.tag);
            Self::write_chunk(&mut frame, &header, payload, self.max_payload)?;
            self.current = Some(frame);
            self.current_created = header.created;
            return Ok(false);
        }

        // A fragment newer than the displaced frame but older than the
        // current one: count it against the reordering budget.
        if self.current.is_some() && header.created > self.previous_created {
            self.next_frame_messages += 1;
            if self.next_frame_messages > MAX_NEXT_FRAME_MESSAGES && self.previous.is_some() {
                self.previous = None;
            }
        }

        Ok(false)
    }

    /// Places a chunk at `sequence × payload_size`; duplicates are ignored.
    /// Returns whether the frame just completed.
    fn write_chunk(
        frame: &mut FrameState,
        header: &UdpHeader,
        payload: &[u8],
        max_payload: usize,
    ) -> Result<bool, ReplError> {
        let seq = header.sequence as usize;
        if seq >= frame.received.len() {
            return Err(ReplError::ReplicationFailed(format!(
                "fragment sequence {seq} out of range for {} chunks",
                frame.received.len()
            )));
        }
        if frame.received[seq] {
            return Ok(false);
        }

        let offset = seq * max_payload;
        if offset + payload.len() > frame.buf.len() {
            return Err(ReplError::ReplicationFailed(format!(
                "fragment at offset {offset} overruns frame of {} bytes",
                frame.buf.len()
            )));
        }
        frame.buf[offset..offset + payload.len()].copy_from_slice(payload);
        frame.received[seq] = true;
        frame.received_count += 1;
        Ok(frame.is_complete())
    }

    fn commit_frame(&mut self, frame: FrameState) -> Result<(), ReplError> {
        self.commit_bytes(&frame.buf, frame.tag)
    }

    fn commit_bytes(&mut self, bytes: &[u8], tag: u8) -> Result<(), ReplError> {
        let mut scope = self.ring.writer_scope(bytes.len() as u64, u64::from(tag))?;
        scope.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        scope.commit(bytes.len() as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentIter;
    use shmbus_core::{Ring, RingView};

    struct TestRing {
        _mem: Vec<u64>,
        ring: Ring,
        view: RingView,
    }

    fn test_ring(capacity: u64, arena_bytes: u64) -> TestRing {
        let mut mem = vec![0u64; Ring::size_of(capacity, arena_bytes).div_ceil(8)];
        let base = mem.as_mut_ptr() as *mut u8;
        let ring = unsafe { Ring::init(base, capacity, arena_bytes) };
        let view = unsafe { RingView::attach(base) };
        TestRing {
            _mem: mem,
            ring,
            view,
        }
    }

    const MTU: usize = 4 + UDP_HEADER;

    fn frame(created: u64, tag: u8, body: &[u8]) -> Vec<(UdpHeader, Vec<u8>)> {
        FragmentIter::new(body, tag, created, MTU)
            .map(|(h, c)| (h, c.to_vec()))
            .collect()
    }

    #[test]
    fn unfragmented_message_commits_directly() {
        let t = test_ring(16, 65536);
        let mut defrag = Defragmentator::new(&t.ring, MTU);
        let mut cursor = t.view.open_cursor(0);

        let header = UdpHeader {
            created: 1,
            size: 3,
            sequence: 0,
            tag: 5,
        };
        assert!(defrag.process(header, b"abc").unwrap());

        assert!(cursor.try_read(&t.view));
        let acc = t.view.entry(&cursor);
        assert_eq!(acc.bytes(), b"abc");
        assert_eq!(acc.tag(), 5);
    }

    #[test]
    fn in_order_fragments_reassemble() {
        let t = test_ring(16, 65536);
        let mut defrag = Defragmentator::new(&t.ring, MTU);
        let mut cursor = t.view.open_cursor(0);

        let body = b"Hello, World";
        let fragments = frame(10, 0, body);
        assert_eq!(fragments.len(), 3);

        assert!(!defrag.process(fragments[0].0, &fragments[0].1).unwrap());
        assert!(!defrag.process(fragments[1].0, &fragments[1].1).unwrap());
        assert!(defrag.process(fragments[2].0, &fragments[2].1).unwrap());

        assert!(cursor.try_read(&t.view));
        assert_eq!(t.view.entry(&cursor).bytes(), body);
        assert!(!cursor.try_read(&t.view));
    }

    #[test]
    fn shuffled_fragments_reassemble() {
        let t = test_ring(16, 65536);
        let mut defrag = Defragmentator::new(&t.ring, MTU);
        let mut cursor = t.view.open_cursor(0);

        let body: Vec<u8> = (0..64u8).collect();
        let mut fragments = frame(10, 2, &body);
        fragments.reverse();
        fragments.swap(1, 7);

        let mut completions = 0;
        for (h, c) in &fragments {
            if defrag.process(*h, c).unwrap() {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);

        assert!(cursor.try_read(&t.view));
        assert_eq!(t.view.entry(&cursor).bytes(), body.as_slice());
    }

    #[test]
    fn duplicate_fragments_do_not_double_commit() {
        let t = test_ring(16, 65536);
        let mut defrag = Defragmentator::new(&t.ring, MTU);

        let body = b"Hello, World";
        let fragments = frame(10, 0, body);

        defrag.process(fragments[0].0, &fragments[0].1).unwrap();
        defrag.process(fragments[0].0, &fragments[0].1).unwrap();
        defrag.process(fragments[1].0, &fragments[1].1).unwrap();
        assert!(defrag.process(fragments[2].0, &fragments[2].1).unwrap());
        // A late duplicate of an already committed frame is ignored.
        assert!(!defrag.process(fragments[2].0, &fragments[2].1).unwrap());

        assert_eq!(t.ring.next_index(), 1);
    }

    #[test]
    fn straggler_of_displaced_frame_still_completes() {
        let t = test_ring(16, 65536);
        let mut defrag = Defragmentator::new(&t.ring, MTU);
        let mut cursor = t.view.open_cursor(0);

        let old_body = b"old frame bytes!";
        let new_body = b"new frame bytes!";
        let old = frame(10, 1, old_body);
        let new = frame(20, 2, new_body);

        // Old frame misses its last fragment when the new frame begins.
        for (h, c) in &old[..old.len() - 1] {
            assert!(!defrag.process(*h, c).unwrap());
        }
        for (h, c) in &new {
            let _ = defrag.process(*h, c).unwrap();
        }
        // The straggler arrives and the displaced frame commits.
        let (h, c) = &old[old.len() - 1];
        assert!(defrag.process(*h, c).unwrap());

        // Both frames are on the ring, in completion order.
        let mut bodies = Vec::new();
        while cursor.try_read(&t.view) {
            bodies.push(t.view.entry(&cursor).bytes().to_vec());
        }
        assert_eq!(bodies, vec![new_body.to_vec(), old_body.to_vec()]);
    }

    #[test]
    fn reordering_budget_drops_the_displaced_frame() {
        let t = test_ring(16, 1 << 20);
        let mut defrag = Defragmentator::new(&t.ring, MTU);

        // A frame that will never complete...
        let old = frame(10, 1, &[1u8; 64]);
        for (h, c) in &old[..4] {
            defrag.process(*h, c).unwrap();
        }
        // ...displaced by a newer frame.
        let new = frame(30, 2, &[2u8; 64]);
        defrag.process(new[0].0, &new[0].1).unwrap();

        // Fragments of an intermediate frame (newer than the displaced one,
        // older than the current one) burn the reordering budget.
        let middle = frame(20, 3, &vec![3u8; 4 * (MAX_NEXT_FRAME_MESSAGES as usize + 2)]);
        for (h, c) in middle.iter().take(MAX_NEXT_FRAME_MESSAGES as usize + 1) {
            assert!(!defrag.process(*h, c).unwrap());
        }

        // The displaced frame is gone; its straggler is ignored.
        let (h, c) = &old[4];
        assert!(!defrag.process(*h, c).unwrap());
        assert_eq!(t.ring.next_index(), 0);
    }

    #[test]
    fn out_of_range_sequence_is_rejected() {
        let t = test_ring(16, 65536);
        let mut defrag = Defragmentator::new(&t.ring, MTU);

        let fragments = frame(10, 0, b"Hello, World");
        defrag.process(fragments[0].0, &fragments[0].1).unwrap();

        let mut bogus = fragments[1].0;
        bogus.sequence = 999;
        assert!(matches!(
            defrag.process(bogus, &fragments[1].1),
            Err(ReplError::ReplicationFailed(_))
        ));
    }
}
