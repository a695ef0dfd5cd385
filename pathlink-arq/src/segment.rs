//! Format of an ARQ segment:
//! +------+-----+-----+-----+----+----+-----+--------+----------+
//! | CONV | CMD | FRG | WND | TS | SN | UNA | LENGTH |   DATA   |
//! +------+-----+-----+-----+----+----+-----+--------+----------+
//! |  4   |  1  |  1  |  2  | 4  | 4  |  4  |   4    | VARIABLE |
//! +------+-----+-----+-----+----+----+-----+--------+----------+
//!
//! All integers are little-endian. `CONV` identifies the connection, `FRG` counts the fragments
//! remaining in a message (always 0 in stream mode), `WND` advertises the sender's free receive
//! window, `TS` is the sender's clock, `SN` the segment's sequence number and `UNA` the first
//! sequence number the sender has not yet received. A datagram may hold several segments.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The size (in bytes) of a segment header.
pub const SEGMENT_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Carries data.
    Push = 81,

    /// Acknowledges a single pushed segment.
    Ack = 82,

    /// Asks the remote for its window size.
    WindowAsk = 83,

    /// Tells the remote our window size.
    WindowTell = 84,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl SegmentHeader {
    /// Parses a header. The caller guarantees `buf` holds at least [`SEGMENT_HEADER_SIZE`] bytes.
    pub fn parse(mut buf: &[u8]) -> Self {
        Self {
            conv: buf.get_u32_le(),
            cmd: buf.get_u8(),
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }
}

/// A segment waiting in one of the engine's queues.
#[derive(Debug, Default)]
pub(crate) struct Segment {
    pub frg: u8,
    pub ts: u32,
    pub sn: u32,
    pub resend_ts: u32,
    pub rto: u32,
    pub fast_ack: u32,
    pub xmit: u32,
    pub data: BytesMut,
}

impl Segment {
    pub fn with_data(data: BytesMut, frg: u8) -> Self {
        Self {
            frg,
            data,
            ..Default::default()
        }
    }
}

/// Signed distance between two wrapping sequence numbers or timestamps.
#[inline]
pub(crate) fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}
