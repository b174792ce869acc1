//! `shmbus-testframe`: synthetic integrity-checked frames for soak and
//! conformance tests.
//!
//! A frame is a fixed header followed by a random body:
//!
//! ```text
//! FrameHeader { digest: [u8; 32], created_ms: u64, len: u64 } │ body bytes
//! ```
//!
//! The digest is SHA-256 over the body, computed at fill time. Frames are
//! written directly into a publish span and verified wherever the bytes
//! come back out, so any corruption on the bus or the bridges shows up as a
//! digest mismatch. The bus itself never looks inside.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::mem::size_of;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DIGEST_LEN: usize = 32;

/// Header preceding every test frame body.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FrameHeader {
    pub digest: [u8; DIGEST_LEN],
    pub created_ms: u64,
    pub len: u64,
}

pub const HEADER_LEN: usize = size_of::<FrameHeader>();

/// Bytes a frame with `body_len` body bytes occupies on the ring.
pub const fn frame_size(body_len: usize) -> usize {
    HEADER_LEN + body_len
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn digest_of(body: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.finalize().into()
}

/// Fills `buf` with a complete frame: random body, current timestamp,
/// matching digest. `buf` must hold at least [`HEADER_LEN`] bytes; the rest
/// becomes the body.
///
/// Panics if `buf` is shorter than a header.
pub fn fill(rng: &mut impl RngCore, buf: &mut [u8]) {
    assert!(buf.len() >= HEADER_LEN, "buffer too small for a frame header");
    let (head, body) = buf.split_at_mut(HEADER_LEN);
    rng.fill_bytes(body);

    let header = FrameHeader {
        digest: digest_of(body),
        created_ms: now_millis(),
        len: body.len() as u64,
    };
    // SAFETY: head is exactly HEADER_LEN bytes; FrameHeader is repr(C) with
    // no implicit padding.
    unsafe {
        std::ptr::write_unaligned(head.as_mut_ptr().cast::<FrameHeader>(), header);
    }
}

/// Parses the header off a frame. `None` when the buffer is too short or
/// the announced body length does not match.
pub fn header(frame: &[u8]) -> Option<FrameHeader> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    // SAFETY: length checked; read_unaligned tolerates any alignment.
    let header = unsafe { std::ptr::read_unaligned(frame.as_ptr().cast::<FrameHeader>()) };
    if frame.len() - HEADER_LEN != header.len as usize {
        return None;
    }
    Some(header)
}

/// Recomputes the body digest and compares it to the recorded one.
pub fn verify(frame: &[u8]) -> bool {
    match header(frame) {
        Some(h) => digest_of(&frame[HEADER_LEN..]) == h.digest,
        None => false,
    }
}

/// Time since the frame was filled, saturating at zero.
pub fn age(frame: &[u8]) -> Option<Duration> {
    header(frame).map(|h| Duration::from_millis(now_millis().saturating_sub(h.created_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn filled_frame_verifies() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut frame = vec![0u8; frame_size(4096)];
        fill(&mut rng, &mut frame);

        assert!(verify(&frame));
        let h = header(&frame).unwrap();
        assert_eq!(h.len, 4096);
        assert!(age(&frame).unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn corruption_is_detected() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut frame = vec![0u8; frame_size(1024)];
        fill(&mut rng, &mut frame);

        frame[HEADER_LEN + 100] ^= 0xFF;
        assert!(!verify(&frame));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut frame = vec![0u8; frame_size(1024)];
        fill(&mut rng, &mut frame);

        assert!(header(&frame[..frame.len() - 1]).is_none());
        assert!(!verify(&frame[..HEADER_LEN - 1]));
    }

    #[test]
    fn empty_body_frame_is_valid() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut frame = vec![0u8; frame_size(0)];
        fill(&mut rng, &mut frame);
        assert!(verify(&frame));
    }
}
