//! Wire framing: `u32 magic | u32 payload_length | payload`.

use static_assertions::const_assert;

/// Four-byte magic signature that opens every frame.
pub const MAGIC: u32 = 0xFEED_FEED;

/// Size of the frame header (magic + length), in bytes.
pub const HEADER_LEN: usize = 8;

/// Minimum number of bytes in the listener's buffer before a header can
/// even be considered: the 8-byte header plus at least one payload byte.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Largest payload a single frame may carry: the pipe buffer size minus the
/// header, so header + payload always fits inside one atomic pipe write.
pub fn max_payload_len() -> usize {
    pipe_buf() - HEADER_LEN
}

/// `PIPE_BUF` as reported by libc; POSIX guarantees writes of this size or
/// smaller to a pipe are atomic.
pub fn pipe_buf() -> usize {
    libc::PIPE_BUF
}

const_assert!(libc::PIPE_BUF >= MIN_FRAME_LEN);

/// Prepends the frame header to `payload` and returns the full frame bytes.
/// Caller must have already checked `1 <= payload.len() <= max_payload_len()`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC.to_ne_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Outcome of attempting to parse a frame header out of a byte buffer.
pub enum ParseOutcome {
    /// A full, valid frame was found; `payload` borrows from the input and
    /// `consumed` is the number of bytes (header + payload) to drop.
    Frame { payload_start: usize, payload_len: usize, consumed: usize },
    /// Not enough bytes yet for even a header; wait for more input.
    NeedMore,
    /// The header was structurally invalid (bad magic, zero length, or a
    /// length over the cap); the caller should drop the rest of the current
    /// session.
    Invalid,
}

/// Attempts to parse one frame header from the front of `buf`.
pub fn parse_header(buf: &[u8]) -> ParseOutcome {
    if buf.len() < MIN_FRAME_LEN {
        return ParseOutcome::NeedMore;
    }
    let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return ParseOutcome::Invalid;
    }
    let len = u32::from_ne_bytes(buf[4..8].try_into().unwrap()) as usize;
    if len == 0 || len > max_payload_len() {
        return ParseOutcome::Invalid;
    }
    let total = HEADER_LEN + len;
    if buf.len() < total {
        return ParseOutcome::NeedMore;
    }
    ParseOutcome::Frame {
        payload_start: HEADER_LEN,
        payload_len: len,
        consumed: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_parse_round_trips() {
        let payload = b"hello";
        let frame = encode(payload);
        match parse_header(&frame) {
            ParseOutcome::Frame { payload_start, payload_len, consumed } => {
                assert_eq!(&frame[payload_start..payload_start + payload_len], payload);
                assert_eq!(consumed, frame.len());
            }
            _ => panic!("expected a full frame"),
        }
    }

    #[test]
    fn bad_magic_is_invalid() {
        let mut frame = encode(b"x");
        frame[0] ^= 0xFF;
        assert!(matches!(parse_header(&frame), ParseOutcome::Invalid));
    }

    #[test]
    fn zero_length_is_invalid() {
        let mut frame = encode(b"x");
        frame[4..8].copy_from_slice(&0u32.to_ne_bytes());
        assert!(matches!(parse_header(&frame), ParseOutcome::Invalid));
    }

    #[test]
    fn short_buffer_needs_more() {
        let frame = encode(b"hello");
        assert!(matches!(parse_header(&frame[..4]), ParseOutcome::NeedMore));
        assert!(matches!(parse_header(&frame[..frame.len() - 1]), ParseOutcome::NeedMore));
    }
}
