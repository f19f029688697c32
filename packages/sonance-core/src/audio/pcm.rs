//! PCM payload codec.
//!
//! The wire format is network-endian signed 16-bit interleaved PCM, the
//! payload format of the classic L16 RTP encodings. Internally samples are
//! floats; conversion clamps to the nominal range.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Sample, SampleSpec};
use crate::packet::StreamTimestamp;

/// Decodes packet payloads into samples.
///
/// The decoder is stateful: a payload is attached with [`begin`](Self::begin)
/// and consumed incrementally with [`read`](Self::read) and
/// [`shift`](Self::shift) until [`end`](Self::end).
pub trait FrameDecoder: Send {
    /// Number of samples per channel encoded in `payload`.
    fn decoded_sample_count(&self, payload: &[u8]) -> StreamTimestamp;

    /// Attaches a payload starting at the given stream timestamp.
    fn begin(&mut self, stream_timestamp: StreamTimestamp, payload: Bytes);

    /// Stream timestamp of the next sample to be decoded.
    fn position(&self) -> StreamTimestamp;

    /// Remaining samples per channel in the attached payload.
    fn available(&self) -> StreamTimestamp;

    /// Decodes up to `out.len()` interleaved samples; returns the decoded
    /// count in samples per channel.
    fn read(&mut self, out: &mut [Sample]) -> StreamTimestamp;

    /// Skips up to `n` samples per channel; returns the skipped count.
    fn shift(&mut self, n: StreamTimestamp) -> StreamTimestamp;

    /// Detaches the payload.
    fn end(&mut self);
}

/// Encodes samples into packet payloads.
pub trait FrameEncoder: Send {
    /// Payload bytes needed for `n` samples per channel.
    fn encoded_byte_count(&self, n: StreamTimestamp) -> usize;

    /// Appends interleaved samples to `out`; returns the written count in
    /// samples per channel.
    fn write(&mut self, samples: &[Sample], out: &mut BytesMut) -> StreamTimestamp;
}

const SAMPLE_BYTES: usize = 2;

fn sample_to_wire(sample: Sample) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn wire_to_sample(wire: i16) -> Sample {
    wire as Sample / i16::MAX as Sample
}

/// 16-bit big-endian PCM decoder.
pub struct PcmDecoder {
    spec: SampleSpec,
    payload: Option<Bytes>,
    start_timestamp: StreamTimestamp,
    consumed: StreamTimestamp,
}

impl PcmDecoder {
    pub fn new(spec: SampleSpec) -> Self {
        Self {
            spec,
            payload: None,
            start_timestamp: 0,
            consumed: 0,
        }
    }

    fn total(&self) -> StreamTimestamp {
        self.payload
            .as_ref()
            .map(|p| self.decoded_sample_count(p))
            .unwrap_or(0)
    }
}

impl FrameDecoder for PcmDecoder {
    fn decoded_sample_count(&self, payload: &[u8]) -> StreamTimestamp {
        (payload.len() / SAMPLE_BYTES / self.spec.num_channels() as usize) as StreamTimestamp
    }

    fn begin(&mut self, stream_timestamp: StreamTimestamp, payload: Bytes) {
        self.payload = Some(payload);
        self.start_timestamp = stream_timestamp;
        self.consumed = 0;
    }

    fn position(&self) -> StreamTimestamp {
        self.start_timestamp.wrapping_add(self.consumed)
    }

    fn available(&self) -> StreamTimestamp {
        self.total().saturating_sub(self.consumed)
    }

    fn read(&mut self, out: &mut [Sample]) -> StreamTimestamp {
        let payload = match &self.payload {
            Some(payload) => payload,
            None => return 0,
        };
        let channels = self.spec.num_channels() as usize;
        let want = (out.len() / channels) as StreamTimestamp;
        let take = want.min(self.available());

        let mut offset = self.consumed as usize * channels * SAMPLE_BYTES;
        let mut written = 0usize;
        for _ in 0..take {
            for _ in 0..channels {
                let wire = i16::from_be_bytes([payload[offset], payload[offset + 1]]);
                out[written] = wire_to_sample(wire);
                offset += SAMPLE_BYTES;
                written += 1;
            }
        }

        self.consumed += take;
        take
    }

    fn shift(&mut self, n: StreamTimestamp) -> StreamTimestamp {
        let take = n.min(self.available());
        self.consumed += take;
        take
    }

    fn end(&mut self) {
        self.payload = None;
        self.consumed = 0;
    }
}

/// 16-bit big-endian PCM encoder.
pub struct PcmEncoder {
    spec: SampleSpec,
}

impl PcmEncoder {
    pub fn new(spec: SampleSpec) -> Self {
        Self { spec }
    }
}

impl FrameEncoder for PcmEncoder {
    fn encoded_byte_count(&self, n: StreamTimestamp) -> usize {
        n as usize * self.spec.num_channels() as usize * SAMPLE_BYTES
    }

    fn write(&mut self, samples: &[Sample], out: &mut BytesMut) -> StreamTimestamp {
        let channels = self.spec.num_channels() as usize;
        let n = samples.len() / channels;
        for sample in &samples[..n * channels] {
            out.put_i16(sample_to_wire(*sample));
        }
        n as StreamTimestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SampleSpec {
        SampleSpec::new(44100, 2).unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let samples: Vec<Sample> = vec![0.11, -0.11, 0.5, -0.5, 0.0, 1.0];
        let mut payload = BytesMut::new();
        let mut encoder = PcmEncoder::new(spec());
        assert_eq!(encoder.write(&samples, &mut payload), 3);

        let mut decoder = PcmDecoder::new(spec());
        decoder.begin(100, payload.freeze());
        assert_eq!(decoder.available(), 3);
        assert_eq!(decoder.position(), 100);

        let mut out = vec![0.0; 6];
        assert_eq!(decoder.read(&mut out), 3);
        for (a, b) in samples.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
        assert_eq!(decoder.available(), 0);
        assert_eq!(decoder.position(), 103);
    }

    #[test]
    fn shift_skips_samples() {
        let mut payload = BytesMut::new();
        let mut encoder = PcmEncoder::new(spec());
        encoder.write(&[0.1, 0.1, 0.2, 0.2, 0.3, 0.3], &mut payload);

        let mut decoder = PcmDecoder::new(spec());
        decoder.begin(0, payload.freeze());
        assert_eq!(decoder.shift(2), 2);
        assert_eq!(decoder.position(), 2);

        let mut out = vec![0.0; 2];
        assert_eq!(decoder.read(&mut out), 1);
        assert!((out[0] - 0.3).abs() < 1e-3);
    }

    #[test]
    fn clamps_out_of_range_samples() {
        let mut payload = BytesMut::new();
        let mut encoder = PcmEncoder::new(SampleSpec::new(8000, 1).unwrap());
        encoder.write(&[2.0, -2.0], &mut payload);

        let mut decoder = PcmDecoder::new(SampleSpec::new(8000, 1).unwrap());
        decoder.begin(0, payload.freeze());
        let mut out = vec![0.0; 2];
        decoder.read(&mut out);
        assert!((out[0] - 1.0).abs() < 1e-3);
        assert!((out[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn sample_count_matches_payload_size() {
        let decoder = PcmDecoder::new(spec());
        assert_eq!(decoder.decoded_sample_count(&[0u8; 800]), 200);
    }
}
