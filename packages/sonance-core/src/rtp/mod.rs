//! Minimal RTP wire format support.
//!
//! Parses and composes the fixed version-2 RTP header. Extension headers are
//! skipped on parse and never produced; CSRC lists are skipped.

mod filter;

pub use filter::{FilterConfig, RtpFilter};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::{Rtp, Seqnum, StreamTimestamp};

/// RTP protocol version.
const VERSION: u8 = 2;

/// Size of the fixed RTP header without CSRC entries.
pub const HEADER_SIZE: usize = 12;

/// Parses an RTP datagram into an [`Rtp`] view.
///
/// The returned view's payload is a sub-slice of `buffer`.
pub fn parse(buffer: &Bytes) -> Result<Rtp> {
    if buffer.len() < HEADER_SIZE {
        return Err(Error::BadPacket);
    }

    let b0 = buffer[0];
    let version = b0 >> 6;
    if version != VERSION {
        return Err(Error::BadPacket);
    }
    let has_padding = b0 & 0x20 != 0;
    let has_extension = b0 & 0x10 != 0;
    let csrc_count = (b0 & 0x0F) as usize;

    let b1 = buffer[1];
    let marker = b1 & 0x80 != 0;
    let payload_type = b1 & 0x7F;

    let seqnum = u16::from_be_bytes([buffer[2], buffer[3]]);
    let stream_timestamp =
        u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
    let source_id = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);

    let mut payload_begin = HEADER_SIZE + csrc_count * 4;
    if payload_begin > buffer.len() {
        return Err(Error::BadPacket);
    }

    if has_extension {
        if payload_begin + 4 > buffer.len() {
            return Err(Error::BadPacket);
        }
        let ext_words = u16::from_be_bytes([
            buffer[payload_begin + 2],
            buffer[payload_begin + 3],
        ]) as usize;
        payload_begin += 4 + ext_words * 4;
        if payload_begin > buffer.len() {
            return Err(Error::BadPacket);
        }
    }

    let mut payload_end = buffer.len();
    if has_padding {
        let pad = buffer[buffer.len() - 1] as usize;
        if pad == 0 || payload_begin + pad > payload_end {
            return Err(Error::BadPacket);
        }
        payload_end -= pad;
    }

    Ok(Rtp::new(
        source_id,
        seqnum,
        stream_timestamp,
        payload_type,
        marker,
        buffer.slice(payload_begin..payload_end),
    ))
}

/// Writes a fixed RTP header for the given stream parameters.
pub fn compose_header(
    out: &mut BytesMut,
    source_id: u32,
    seqnum: Seqnum,
    stream_timestamp: StreamTimestamp,
    payload_type: u8,
    marker: bool,
) {
    out.put_u8(VERSION << 6);
    out.put_u8((payload_type & 0x7F) | if marker { 0x80 } else { 0 });
    out.put_u16(seqnum);
    out.put_u32(stream_timestamp);
    out.put_u32(source_id);
}
