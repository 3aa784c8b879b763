//! On-air frame layout: fixed 32-byte frames, a 3-byte fragment header and
//! zero padding.

/// Every frame occupies exactly this many bytes on the wire.
pub const FRAME_SIZE: usize = 32;

/// Fragment header: code byte plus little-endian u16 index.
pub const HEADER_SIZE: usize = 3;

/// Message bytes carried per frame.
pub const PAYLOAD_SIZE: usize = FRAME_SIZE - HEADER_SIZE;

/// First fragment of a message.
pub const START_CODE: u8 = b'M';

/// Every following fragment.
pub const CONTINUE_CODE: u8 = b'C';

/// Parsed fragment header. `index` counts fragments still to come: the first
/// fragment of a k-fragment message carries `k - 1`, the last carries 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub code: u8,
    pub index: u16,
}

impl FrameHeader {
    /// Read a header from the front of an unpadded frame.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            code: buf[0],
            index: u16::from_le_bytes([buf[1], buf[2]]),
        })
    }
}

/// Number of frames needed to carry `len` message bytes.
pub fn total_fragments(len: usize) -> usize {
    (len + PAYLOAD_SIZE - 1) / PAYLOAD_SIZE
}

/// Build the padded 32-byte frame for the fragment starting at `offset`.
/// Returns the frame and the number of message bytes it consumed.
pub fn build_fragment(msg: &[u8], offset: usize) -> ([u8; FRAME_SIZE], usize) {
    let total = total_fragments(msg.len()).max(1);
    let chunk = (msg.len() - offset).min(PAYLOAD_SIZE);
    let code = if offset == 0 { START_CODE } else { CONTINUE_CODE };
    let index = (total - 1 - offset / PAYLOAD_SIZE) as u16;

    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = code;
    frame[1..HEADER_SIZE].copy_from_slice(&index.to_le_bytes());
    frame[HEADER_SIZE..HEADER_SIZE + chunk].copy_from_slice(&msg[offset..offset + chunk]);
    (frame, chunk)
}

/// Zero-pad (or truncate) `buf` to exactly `size` bytes.
pub fn pad(buf: &mut Vec<u8>, size: usize) {
    buf.resize(size, 0);
}

/// Strip trailing zero bytes. Ambiguous for payloads that genuinely end in
/// zeros; the wire format accepts that trade-off.
pub fn unpad(buf: &mut Vec<u8>) {
    while buf.last() == Some(&0) {
        buf.pop();
    }
}
