//! Audio frames, sample formats and the packetize/depacketize stages.

mod depacketizer;
mod frame;
mod mapper;
mod packetizer;
mod pcm;
mod watchdog;

pub use depacketizer::Depacketizer;
pub use frame::{frame_flags, Frame, FrameFactory, FrameMode, FrameReader};
pub use mapper::{ChannelMapper, PassthroughResampler, Resampler};
pub use packetizer::{Packetizer, PacketizerConfig};
pub use pcm::{FrameDecoder, FrameEncoder, PcmDecoder, PcmEncoder};
pub use watchdog::{Watchdog, WatchdogConfig};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::StreamTimestamp;
use crate::time;

/// One audio sample. Interleaved 32-bit float in the nominal range [-1, 1].
pub type Sample = f32;

/// Describes a raw audio stream: rate and channel layout.
///
/// All conversions between wall-clock durations, stream timestamps (samples
/// per channel) and interleaved sample counts go through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    sample_rate: u32,
    num_channels: u16,
}

impl SampleSpec {
    pub fn new(sample_rate: u32, num_channels: u16) -> Result<Self> {
        if sample_rate == 0 || num_channels == 0 {
            return Err(Error::BadArgument);
        }
        Ok(Self {
            sample_rate,
            num_channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> u16 {
        self.num_channels
    }

    /// Converts a non-negative duration to a stream timestamp delta.
    pub fn ns_to_stream_timestamp(&self, ns: i64) -> StreamTimestamp {
        debug_assert!(ns >= 0, "duration should not be negative");
        let ticks = (ns.max(0) as f64 / time::SECOND as f64 * self.sample_rate as f64).round();
        ticks.min(u32::MAX as f64) as StreamTimestamp
    }

    /// Converts a stream timestamp delta to nanoseconds.
    pub fn stream_timestamp_to_ns(&self, ts: StreamTimestamp) -> i64 {
        (ts as f64 / self.sample_rate as f64 * time::SECOND as f64).round() as i64
    }

    /// Converts a signed stream timestamp delta to nanoseconds.
    pub fn stream_timestamp_delta_to_ns(&self, delta: i32) -> i64 {
        (delta as f64 / self.sample_rate as f64 * time::SECOND as f64).round() as i64
    }

    /// Number of interleaved samples covering `ts` ticks.
    pub fn stream_timestamp_to_samples(&self, ts: StreamTimestamp) -> usize {
        ts as usize * self.num_channels as usize
    }

    /// Stream ticks covered by `n` interleaved samples.
    pub fn samples_to_stream_timestamp(&self, n: usize) -> StreamTimestamp {
        (n / self.num_channels as usize) as StreamTimestamp
    }
}
