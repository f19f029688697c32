//! Depacketizer: turns a validated packet stream into a gapless frame stream.

use super::{
    frame_flags, Frame, FrameDecoder, FrameMode, FrameReader, Sample, SampleSpec,
};
use crate::error::{Error, Result};
use crate::packet::{
    stream_timestamp_diff, stream_timestamp_lt, PacketPtr, PacketReader, ReadMode,
    StreamTimestamp,
};
use crate::sync::RateLimiter;
use crate::time;

const REPORT_INTERVAL: i64 = 20 * time::SECOND;

/// Frequency of the gap-marker tone, used instead of silence when enabled.
const BEEP_FREQUENCY: f64 = 880.0;

#[derive(Default)]
struct FrameInfo {
    /// Interleaved samples decoded from packets.
    n_decoded: usize,
    /// Interleaved samples filled with silence after the stream started.
    n_gap: usize,
    /// Late packets dropped while the frame was being built.
    n_dropped: usize,
    /// Stream position of the first frame sample, recorded at first fill.
    start_pos: Option<StreamTimestamp>,
}

/// Reads packets, decodes their payloads and produces frames of exactly the
/// requested duration, concealing losses with silence (or a marker tone).
///
/// For every produced frame: `HAS_SIGNAL` is set iff at least one sample came
/// from a packet, `HAS_GAPS` iff any sample was silence-filled after the
/// stream started, and `HAS_DROPS` iff a late packet was discarded while the
/// frame was being built. Late means a stream timestamp strictly less than
/// the current read position; wrap-around is handled with 32-bit modular
/// arithmetic.
pub struct Depacketizer {
    reader: Box<dyn PacketReader + Send>,
    decoder: Box<dyn FrameDecoder + Send>,
    spec: SampleSpec,
    beep: bool,

    packet: Option<PacketPtr>,
    stream_ts: StreamTimestamp,
    started: bool,

    /// Maps stream timestamps to capture timestamps once a packet with a
    /// known capture time has been seen: (stream position, unix ns).
    capture_anchor: Option<(StreamTimestamp, i64)>,

    decoded_total: u64,
    gap_total: u64,
    dropped_total: u64,
    rate_limiter: RateLimiter,
}

impl Depacketizer {
    pub fn new(
        reader: Box<dyn PacketReader + Send>,
        decoder: Box<dyn FrameDecoder + Send>,
        spec: SampleSpec,
        beep: bool,
    ) -> Self {
        Self {
            reader,
            decoder,
            spec,
            beep,
            packet: None,
            stream_ts: 0,
            started: false,
            capture_anchor: None,
            decoded_total: 0,
            gap_total: 0,
            dropped_total: 0,
            rate_limiter: RateLimiter::new(REPORT_INTERVAL),
        }
    }

    /// True once the first packet has been seen.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Stream timestamp of the next sample to be rendered.
    ///
    /// Meaningful only after [`is_started`](Self::is_started) returns true.
    pub fn next_timestamp(&self) -> StreamTimestamp {
        self.stream_ts
    }

    fn capture_ts_at(&self, position: StreamTimestamp) -> i64 {
        match self.capture_anchor {
            Some((anchor_pos, anchor_cts)) => {
                let delta = stream_timestamp_diff(position, anchor_pos);
                let cts = anchor_cts + self.spec.stream_timestamp_delta_to_ns(delta);
                cts.max(0)
            }
            None => 0,
        }
    }

    fn fetch_packet(&mut self, info: &mut FrameInfo) {
        loop {
            let packet = match self.reader.read_packet(ReadMode::Fetch) {
                Ok(packet) => packet,
                Err(Error::Drain) => return,
                Err(err) => {
                    log::debug!("[Depacketizer] packet read failed: {}", err.code());
                    return;
                }
            };

            let (start_ts, payload, cts) = match packet.rtp() {
                Some(rtp) => (
                    rtp.stream_timestamp,
                    rtp.payload.clone(),
                    rtp.capture_timestamp(),
                ),
                None => {
                    log::debug!("[Depacketizer] dropping packet without rtp view");
                    continue;
                }
            };

            if !self.started {
                self.started = true;
                self.stream_ts = start_ts;
                log::debug!(
                    "[Depacketizer] got first packet: start_ts={}",
                    start_ts
                );
            } else if stream_timestamp_lt(start_ts, self.stream_ts) {
                info.n_dropped += 1;
                self.dropped_total += 1;
                log::debug!(
                    "[Depacketizer] dropping late packet: ts={} position={}",
                    start_ts,
                    self.stream_ts
                );
                continue;
            }

            if cts > 0 {
                self.capture_anchor = Some((start_ts, cts));
            }

            self.decoder.begin(start_ts, payload);
            self.packet = Some(packet);
            return;
        }
    }

    fn fill_missing(
        &mut self,
        frame: &mut Frame,
        from: usize,
        to: usize,
        info: &mut FrameInfo,
    ) {
        if self.beep {
            let rate = self.spec.sample_rate() as f64;
            let channels = self.spec.num_channels() as usize;
            let out = &mut frame.samples_mut()[from..to];
            for (index, sample) in out.iter_mut().enumerate() {
                let tick = self.stream_ts as f64 + (index / channels) as f64;
                *sample = (2.0 * std::f64::consts::PI * BEEP_FREQUENCY * tick / rate).sin()
                    as Sample
                    * 0.5;
            }
        }
        // without beep the frame storage is already zeroed

        let ticks = self.spec.samples_to_stream_timestamp(to - from);
        self.stream_ts = self.stream_ts.wrapping_add(ticks);
        if self.started {
            info.n_gap += to - from;
            self.gap_total += (to - from) as u64;
        }
    }

    fn decode_samples(
        &mut self,
        frame: &mut Frame,
        from: usize,
        to: usize,
        info: &mut FrameInfo,
    ) -> usize {
        let out = &mut frame.samples_mut()[from..to];
        let ticks = self.decoder.read(out);
        let n_samples = self.spec.stream_timestamp_to_samples(ticks);

        self.stream_ts = self.stream_ts.wrapping_add(ticks);
        info.n_decoded += n_samples;
        self.decoded_total += n_samples as u64;

        from + n_samples
    }

    fn read_some(
        &mut self,
        frame: &mut Frame,
        mut filled: usize,
        total: usize,
        info: &mut FrameInfo,
    ) -> usize {
        if self.packet.is_none() {
            self.fetch_packet(info);
        }

        if info.start_pos.is_none() {
            // every fill advances stream_ts in lock-step with the frame, so
            // the first frame sample sits `filled` samples behind it
            let offset = self.spec.samples_to_stream_timestamp(filled);
            info.start_pos = Some(self.stream_ts.wrapping_sub(offset));
        }

        if self.packet.is_none() {
            self.fill_missing(frame, filled, total, info);
            return total;
        }

        let packet_pos = self.decoder.position();
        if stream_timestamp_lt(self.stream_ts, packet_pos) {
            // conceal the hole before the packet
            let gap_ticks =
                stream_timestamp_diff(packet_pos, self.stream_ts).max(0) as StreamTimestamp;
            let gap_samples = self.spec.stream_timestamp_to_samples(gap_ticks);
            let end = total.min(filled + gap_samples);
            self.fill_missing(frame, filled, end, info);
            filled = end;
        }

        if filled < total {
            filled = self.decode_samples(frame, filled, total, info);
        }

        if self.decoder.available() == 0 {
            self.decoder.end();
            self.packet = None;
        }

        filled
    }

    fn set_frame_props(
        &self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        info: &FrameInfo,
    ) {
        frame.set_duration(duration);

        let mut flags = 0;
        if info.n_decoded > 0 {
            flags |= frame_flags::HAS_SIGNAL;
        }
        if info.n_gap > 0 {
            flags |= frame_flags::HAS_GAPS;
        }
        if info.n_dropped > 0 {
            flags |= frame_flags::HAS_DROPS;
        }
        frame.add_flags(flags);

        if let Some(start_pos) = info.start_pos {
            let capture_ts = self.capture_ts_at(start_pos);
            if capture_ts > 0 {
                frame.set_capture_timestamp(capture_ts);
            }
        }
    }

    fn report_stats(&self) {
        if !self.rate_limiter.allow() {
            return;
        }
        log::debug!(
            "[Depacketizer] decoded={} gaps={} late_drops={} position={}",
            self.decoded_total,
            self.gap_total,
            self.dropped_total,
            self.stream_ts
        );
    }
}

impl FrameReader for Depacketizer {
    fn read_frame(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        _mode: FrameMode,
    ) -> Result<()> {
        let total = self.spec.stream_timestamp_to_samples(duration);

        frame.clear();
        frame.resize(total);

        let mut info = FrameInfo::default();

        let mut filled = 0;
        while filled < total {
            filled = self.read_some(frame, filled, total, &mut info);
        }

        self.set_frame_props(frame, duration, &info);
        self.report_stats();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FrameFactory, PcmDecoder, PcmEncoder, FrameEncoder};
    use crate::packet::{PacketFactory, PacketPtr, Rtp, SortedQueue};
    use bytes::BytesMut;

    const RATE: u32 = 44100;
    const CHANNELS: u16 = 2;

    fn spec() -> SampleSpec {
        SampleSpec::new(RATE, CHANNELS).unwrap()
    }

    fn sample_packet(
        factory: &PacketFactory,
        seqnum: u16,
        ts: u32,
        n_samples: u32,
        value: Sample,
    ) -> PacketPtr {
        let mut payload = BytesMut::new();
        let mut encoder = PcmEncoder::new(spec());
        let samples = vec![value; n_samples as usize * CHANNELS as usize];
        encoder.write(&samples, &mut payload);

        let packet = factory.new_packet_from_bytes(payload.freeze()).unwrap();
        let rtp = Rtp::new(1, seqnum, ts, 10, false, packet.buffer().clone());
        rtp.set_duration(n_samples);
        packet.set_rtp(rtp);
        packet
    }

    fn depacketizer_over(packets: Vec<PacketPtr>) -> Depacketizer {
        let mut queue = SortedQueue::new();
        for p in packets {
            queue.push(p);
        }
        Depacketizer::new(
            Box::new(queue),
            Box::new(PcmDecoder::new(spec())),
            spec(),
            false,
        )
    }

    fn read(depacketizer: &mut Depacketizer, duration: u32) -> Frame {
        let factory = FrameFactory::new(4);
        let mut frame = factory.allocate_frame().unwrap();
        depacketizer
            .read_frame(&mut frame, duration, FrameMode::Hard)
            .unwrap();
        frame
    }

    fn assert_all_close(frame: &Frame, value: Sample) {
        for sample in frame.samples() {
            assert!((sample - value).abs() < 1e-3, "{sample} != {value}");
        }
    }

    #[test]
    fn contiguous_packets_produce_signal_frames() {
        let factory = PacketFactory::new(2048, 16);
        let mut d = depacketizer_over(vec![
            sample_packet(&factory, 0, 1000, 200, 0.11),
            sample_packet(&factory, 1, 1200, 200, 0.11),
            sample_packet(&factory, 2, 1400, 200, 0.11),
        ]);

        for _ in 0..3 {
            let frame = read(&mut d, 200);
            assert_eq!(frame.num_samples(), 400);
            assert!(frame.has_flags(frame_flags::HAS_SIGNAL));
            assert!(!frame.has_flags(frame_flags::HAS_GAPS));
            assert_all_close(&frame, 0.11);
        }
        assert!(d.is_started());
        assert_eq!(d.next_timestamp(), 1600);
    }

    #[test]
    fn missing_packet_becomes_silent_gap_frame() {
        let factory = PacketFactory::new(2048, 16);
        let mut d = depacketizer_over(vec![
            sample_packet(&factory, 0, 1000, 200, 0.11),
            // seqnum 1 at ts 1200 lost
            sample_packet(&factory, 2, 1400, 200, 0.11),
        ]);

        let first = read(&mut d, 200);
        assert!(first.has_flags(frame_flags::HAS_SIGNAL));
        assert_all_close(&first, 0.11);

        let second = read(&mut d, 200);
        assert!(!second.has_flags(frame_flags::HAS_SIGNAL));
        assert!(second.has_flags(frame_flags::HAS_GAPS));
        assert_all_close(&second, 0.0);

        let third = read(&mut d, 200);
        assert!(third.has_flags(frame_flags::HAS_SIGNAL));
        assert!(!third.has_flags(frame_flags::HAS_GAPS));
        assert_all_close(&third, 0.11);
    }

    #[test]
    fn late_packet_is_dropped_and_flagged() {
        use crate::packet::{QueueReader, SharedQueue};

        let factory = PacketFactory::new(2048, 16);
        let shared: SharedQueue =
            std::sync::Arc::new(parking_lot::Mutex::new(SortedQueue::new()));
        shared.lock().push(sample_packet(&factory, 10, 5000, 100, 0.2));

        let mut d = Depacketizer::new(
            Box::new(QueueReader::new(shared.clone())),
            Box::new(PcmDecoder::new(spec())),
            spec(),
            false,
        );

        // consume the first packet; read position advances to 5100
        let frame = read(&mut d, 100);
        assert!(frame.has_flags(frame_flags::HAS_SIGNAL));

        // a late packet arrives behind the read position, then an on-time one
        shared.lock().push(sample_packet(&factory, 11, 4000, 100, 0.9));
        shared.lock().push(sample_packet(&factory, 12, 5100, 100, 0.2));

        let frame = read(&mut d, 100);
        assert!(frame.has_flags(frame_flags::HAS_DROPS));
        assert!(frame.has_flags(frame_flags::HAS_SIGNAL));
        assert_all_close(&frame, 0.2);
    }

    #[test]
    fn partial_packet_spans_two_frames() {
        let factory = PacketFactory::new(4096, 16);
        let mut d = depacketizer_over(vec![sample_packet(&factory, 0, 0, 300, 0.25)]);

        let first = read(&mut d, 200);
        assert!(first.has_flags(frame_flags::HAS_SIGNAL));
        assert_all_close(&first, 0.25);

        let second = read(&mut d, 200);
        assert!(second.has_flags(frame_flags::HAS_SIGNAL));
        assert!(second.has_flags(frame_flags::HAS_GAPS));
        let samples = second.samples();
        for s in &samples[..200] {
            assert!((s - 0.25).abs() < 1e-3);
        }
        for s in &samples[200..] {
            assert_eq!(*s, 0.0);
        }
    }

    #[test]
    fn zero_duration_frame_is_a_no_op() {
        let factory = PacketFactory::new(2048, 16);
        let mut d = depacketizer_over(vec![sample_packet(&factory, 0, 0, 10, 0.5)]);
        let frame = read(&mut d, 0);
        assert_eq!(frame.num_samples(), 0);
        assert_eq!(frame.flags(), 0);
    }

    #[test]
    fn timestamp_wrap_is_handled() {
        let factory = PacketFactory::new(2048, 16);
        let start = u32::MAX - 99;
        let mut d = depacketizer_over(vec![
            sample_packet(&factory, 0, start, 100, 0.4),
            sample_packet(&factory, 1, 0, 100, 0.4),
        ]);

        let frame = read(&mut d, 200);
        assert!(frame.has_flags(frame_flags::HAS_SIGNAL));
        assert!(!frame.has_flags(frame_flags::HAS_GAPS));
        assert_all_close(&frame, 0.4);
        assert_eq!(d.next_timestamp(), 100);
    }

    #[test]
    fn capture_timestamp_propagates_to_frame() {
        let factory = PacketFactory::new(2048, 16);
        let packet = sample_packet(&factory, 0, 1000, 200, 0.1);
        packet.rtp().unwrap().set_capture_timestamp(1_000_000_000);
        let mut d = depacketizer_over(vec![packet]);

        let frame = read(&mut d, 100);
        assert_eq!(frame.capture_timestamp(), 1_000_000_000);

        // the second frame starts 100 ticks later
        let frame = read(&mut d, 100);
        let expected = 1_000_000_000 + spec().stream_timestamp_delta_to_ns(100);
        assert_eq!(frame.capture_timestamp(), expected);
    }
}
