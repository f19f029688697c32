//! Modular arithmetic for RTP sequence numbers and stream timestamps.
//!
//! Both counters wrap: seqnums are 16-bit, stream timestamps 32-bit. All
//! comparisons go through signed differences so that values straddling a
//! wrap order correctly.

/// RTP sequence number.
pub type Seqnum = u16;

/// RTP stream timestamp: samples since stream start, modulo 2^32.
pub type StreamTimestamp = u32;

/// Signed distance from `b` to `a` in sequence-number space.
pub fn seqnum_diff(a: Seqnum, b: Seqnum) -> i16 {
    a.wrapping_sub(b) as i16
}

/// True if `a` is before `b` in sequence-number space.
pub fn seqnum_lt(a: Seqnum, b: Seqnum) -> bool {
    seqnum_diff(a, b) < 0
}

/// Signed distance from `b` to `a` in stream-timestamp space.
pub fn stream_timestamp_diff(a: StreamTimestamp, b: StreamTimestamp) -> i32 {
    a.wrapping_sub(b) as i32
}

/// True if `a` is before `b` in stream-timestamp space.
pub fn stream_timestamp_lt(a: StreamTimestamp, b: StreamTimestamp) -> bool {
    stream_timestamp_diff(a, b) < 0
}
