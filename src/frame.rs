//! Dialect-agnostic frame reassembly.
//!
//! A `FramingRule` tells [`scan_frame`] where the declared length of a wire
//! protocol frame lives in the leading bytes of a buffer. The Session Proxy
//! appends freshly-read socket bytes to a buffer and calls `scan_frame` after
//! every read until a complete frame is available — this is the same
//! information a blocking `read_frame(stream) -> bytes` call would return,
//! restated so it composes with a non-blocking accumulate-then-extract loop.

use bytes::Bytes;

/// Maximum frame size before a frame is considered hostile. 16 MiB per
/// `SPEC_FULL.md` §4.1.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One complete, length-delimited protocol frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: u8,
    pub bytes: Bytes,
}

/// Result of inspecting a buffer's leading bytes for a complete frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameScan {
    /// Not enough bytes yet to know the frame's full length.
    NeedMoreBytes,
    /// A complete frame of `len` bytes (including any header) is present,
    /// tagged `kind` for dialect-level dispatch.
    Ready { len: usize, kind: u8 },
    /// The buffer starts with an impossible or hostile length field.
    Oversized { declared: usize },
}

/// Supplies the byte offsets of a dialect's length field. Implementations are
/// pure and hold no state — all session state lives in the `DialectCodec`.
pub trait FramingRule: Send {
    /// Inspect `buf` (which may be shorter than one frame) and report what is
    /// known about the next frame boundary.
    fn scan(&self, buf: &[u8]) -> FrameScan;
}

/// Oracle TNS: bytes [0..2) are the big-endian total packet length, byte [4]
/// is the packet type. Minimum frame size is 8 bytes.
pub struct OracleFramingRule;

impl FramingRule for OracleFramingRule {
    fn scan(&self, buf: &[u8]) -> FrameScan {
        if buf.len() < 2 {
            return FrameScan::NeedMoreBytes;
        }
        let len = (buf[0] as usize) * 256 + buf[1] as usize;
        if len < 8 {
            // A well-formed TNS packet is never shorter than its own header.
            return FrameScan::Oversized { declared: len };
        }
        if len > MAX_FRAME_SIZE {
            return FrameScan::Oversized { declared: len };
        }
        if buf.len() < len {
            return FrameScan::NeedMoreBytes;
        }
        let kind = if buf.len() > 4 { buf[4] } else { 0 };
        FrameScan::Ready { len, kind }
    }
}

/// MySQL: bytes [0..3) are a 24-bit little-endian payload length, byte [3] is
/// the sequence id, then `length` bytes of payload follow.
pub struct MySqlFramingRule;

impl FramingRule for MySqlFramingRule {
    fn scan(&self, buf: &[u8]) -> FrameScan {
        if buf.len() < 4 {
            return FrameScan::NeedMoreBytes;
        }
        let payload_len = buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16;
        let total_len = 4 + payload_len;
        if total_len > MAX_FRAME_SIZE {
            return FrameScan::Oversized { declared: total_len };
        }
        if buf.len() < total_len {
            return FrameScan::NeedMoreBytes;
        }
        // MySQL frames carry no type tag in the header; the command byte
        // (first payload byte) stands in for `kind` when present.
        let kind = if payload_len > 0 { buf[4] } else { 0 };
        FrameScan::Ready { len: total_len, kind }
    }
}

/// PostgreSQL v3: a one-character message type followed by a big-endian u32
/// length (including itself), except the very first client message
/// (StartupMessage/SSLRequest/CancelRequest), which has no type byte.
pub struct PostgresFramingRule {
    pub startup: bool,
}

impl FramingRule for PostgresFramingRule {
    fn scan(&self, buf: &[u8]) -> FrameScan {
        if self.startup {
            if buf.len() < 4 {
                return FrameScan::NeedMoreBytes;
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if !(8..=MAX_FRAME_SIZE).contains(&len) {
                return FrameScan::Oversized { declared: len };
            }
            if buf.len() < len {
                return FrameScan::NeedMoreBytes;
            }
            FrameScan::Ready { len, kind: 0 }
        } else {
            if buf.len() < 5 {
                return FrameScan::NeedMoreBytes;
            }
            let kind = buf[0];
            let raw_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if raw_len < 4 {
                return FrameScan::Oversized { declared: raw_len };
            }
            let total_len = 1 + raw_len;
            if total_len > MAX_FRAME_SIZE {
                return FrameScan::Oversized { declared: total_len };
            }
            if buf.len() < total_len {
                return FrameScan::NeedMoreBytes;
            }
            FrameScan::Ready { len: total_len, kind }
        }
    }
}

/// Slice a complete frame out of `buf` once [`FrameScan::Ready`] says one is
/// present. Returns the frame and how many bytes it consumed.
pub fn take_frame(buf: &bytes::BytesMut, len: usize, kind: u8) -> Frame {
    Frame {
        kind,
        bytes: Bytes::copy_from_slice(&buf[..len]),
    }
}
