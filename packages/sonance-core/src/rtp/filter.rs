//! RTP stream validation.

use serde::{Deserialize, Serialize};

use crate::audio::{FrameDecoder, SampleSpec};
use crate::error::{Error, Result};
use crate::packet::{
    self, seqnum_diff, stream_timestamp_diff, PacketPtr, PacketReader, ReadMode,
};

/// Validation thresholds for an RTP stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Maximum allowed delta between sequence numbers of subsequent packets.
    pub max_sn_jump: u16,
    /// Maximum allowed delta between stream timestamps of subsequent
    /// packets, in nanoseconds.
    pub max_ts_jump_ns: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_sn_jump: 100,
            max_ts_jump_ns: crate::time::SECOND,
        }
    }
}

#[derive(Clone, Copy)]
struct PrevRtp {
    source_id: u32,
    seqnum: u16,
    stream_timestamp: u32,
    payload_type: u8,
    capture_timestamp: i64,
}

/// Drops packets that do not belong to the established RTP stream.
///
/// A packet is rejected when its SSRC or payload type differs from the
/// stream's, when its seqnum or timestamp jumps implausibly far, or when its
/// capture timestamp regresses to zero or goes negative. Also populates the
/// packet duration from the payload size when the sender left it zero.
pub struct RtpFilter {
    inner: Box<dyn PacketReader + Send>,
    decoder: Box<dyn FrameDecoder + Send>,
    config: FilterConfig,
    spec: SampleSpec,
    prev: Option<PrevRtp>,
}

impl RtpFilter {
    pub fn new(
        inner: Box<dyn PacketReader + Send>,
        decoder: Box<dyn FrameDecoder + Send>,
        config: FilterConfig,
        spec: SampleSpec,
    ) -> Self {
        Self {
            inner,
            decoder,
            config,
            spec,
            prev: None,
        }
    }

    fn validate(&self, packet: &PacketPtr) -> bool {
        if !packet.has_flags(packet::flags::RTP) {
            log::debug!("[RtpFilter] dropping non-rtp packet");
            return false;
        }
        if !packet.has_flags(packet::flags::AUDIO) {
            log::debug!("[RtpFilter] dropping non-audio packet");
            return false;
        }

        let rtp = packet.rtp().expect("flag checked");
        let prev = match &self.prev {
            Some(prev) => prev,
            None => return true,
        };

        if rtp.source_id != prev.source_id {
            log::debug!(
                "[RtpFilter] source id jump: prev={} next={}",
                prev.source_id,
                rtp.source_id
            );
            return false;
        }

        if rtp.payload_type != prev.payload_type {
            log::debug!(
                "[RtpFilter] payload type jump: prev={} next={}",
                prev.payload_type,
                rtp.payload_type
            );
            return false;
        }

        let sn_dist = seqnum_diff(rtp.seqnum, prev.seqnum).unsigned_abs();
        if sn_dist > self.config.max_sn_jump {
            log::debug!(
                "[RtpFilter] too long seqnum jump: prev={} next={} dist={}",
                prev.seqnum,
                rtp.seqnum,
                sn_dist
            );
            return false;
        }

        let ts_dist = stream_timestamp_diff(rtp.stream_timestamp, prev.stream_timestamp)
            .unsigned_abs();
        let ts_dist_ns = self.spec.stream_timestamp_delta_to_ns(ts_dist as i32);
        if ts_dist_ns.abs() > self.config.max_ts_jump_ns {
            log::debug!(
                "[RtpFilter] too long timestamp jump: prev={} next={} dist={}",
                prev.stream_timestamp,
                rtp.stream_timestamp,
                ts_dist
            );
            return false;
        }

        if rtp.capture_timestamp() < 0 {
            log::debug!(
                "[RtpFilter] invalid negative capture ts: next={}",
                rtp.capture_timestamp()
            );
            return false;
        }

        if rtp.capture_timestamp() == 0 && prev.capture_timestamp != 0 {
            log::debug!("[RtpFilter] invalid zero capture ts after non-zero capture ts");
            return false;
        }

        true
    }

    fn populate(&self, packet: &PacketPtr) {
        let rtp = packet.rtp().expect("validated");
        if rtp.duration() == 0 {
            rtp.set_duration(self.decoder.decoded_sample_count(&rtp.payload));
        }
    }

    fn remember(&mut self, packet: &PacketPtr) {
        let rtp = packet.rtp().expect("validated");
        let newer = match &self.prev {
            Some(prev) => seqnum_diff(rtp.seqnum, prev.seqnum) > 0,
            None => true,
        };
        if newer {
            self.prev = Some(PrevRtp {
                source_id: rtp.source_id,
                seqnum: rtp.seqnum,
                stream_timestamp: rtp.stream_timestamp,
                payload_type: rtp.payload_type,
                capture_timestamp: rtp.capture_timestamp(),
            });
        }
    }
}

impl PacketReader for RtpFilter {
    fn read_packet(&mut self, mode: ReadMode) -> Result<PacketPtr> {
        loop {
            let packet = self.inner.read_packet(mode)?;

            if !self.validate(&packet) {
                if mode == ReadMode::Peek {
                    // can't consume the bad packet in peek mode; report
                    // emptiness and let the next fetch discard it
                    return Err(Error::Drain);
                }
                continue;
            }

            self.populate(&packet);
            self.remember(&packet);

            return Ok(packet);
        }
    }
}
