//! Audio frame.

use crate::error::{Error, Result};
use crate::packet::StreamTimestamp;
use crate::pool::{ObjectPool, PoolSlot};

use super::{Sample, SampleSpec};

/// Frame flag bits.
///
/// Flags are designed so that a bitwise OR of the flags of several frames
/// gives the correct flags for their concatenation or mix.
pub mod frame_flags {
    /// At least some samples were filled from packets; if clear, the frame
    /// is entirely zero because of lack of packets.
    pub const HAS_SIGNAL: u32 = 1 << 0;
    /// Some samples are zero because of lack of packets.
    pub const HAS_GAPS: u32 = 1 << 1;
    /// Late packets were dropped while the frame was being built.
    pub const HAS_DROPS: u32 = 1 << 2;
}

/// Frame read mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// The full requested duration must be produced.
    Hard,
    /// A partial result is acceptable.
    Soft,
}

/// A contiguous block of interleaved samples exchanged with the application.
pub struct Frame {
    samples: Vec<Sample>,
    raw: bool,
    flags: u32,
    duration: StreamTimestamp,
    capture_timestamp: i64,
    _slot: Option<PoolSlot>,
}

impl Frame {
    fn new(slot: Option<PoolSlot>) -> Self {
        Self {
            samples: Vec::new(),
            raw: true,
            flags: 0,
            duration: 0,
            capture_timestamp: 0,
            _slot: slot,
        }
    }

    /// Resets all state but keeps the allocated storage.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.raw = true;
        self.flags = 0;
        self.duration = 0;
        self.capture_timestamp = 0;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flags(&self, flags: u32) -> bool {
        self.flags & flags == flags
    }

    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Resizes sample storage, zero-filling new samples.
    pub fn resize(&mut self, num_samples: usize) {
        self.samples.clear();
        self.samples.resize(num_samples, 0.0);
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Frame data viewed as bytes.
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }

    pub fn duration(&self) -> StreamTimestamp {
        self.duration
    }

    pub fn set_duration(&mut self, duration: StreamTimestamp) {
        self.duration = duration;
    }

    pub fn has_capture_timestamp(&self) -> bool {
        self.capture_timestamp != 0
    }

    /// Unix-epoch ns of the first sample, zero if unknown.
    pub fn capture_timestamp(&self) -> i64 {
        self.capture_timestamp
    }

    pub fn set_capture_timestamp(&mut self, cts: i64) {
        self.capture_timestamp = cts;
    }
}

/// Produces pool-bounded frames.
#[derive(Clone)]
pub struct FrameFactory {
    pool: ObjectPool,
}

impl FrameFactory {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: ObjectPool::new(capacity),
        }
    }

    /// Allocates an empty frame.
    pub fn allocate_frame(&self) -> Result<Frame> {
        let slot = self.pool.acquire().ok_or(Error::NoMem)?;
        Ok(Frame::new(Some(slot)))
    }

    /// Allocates a zero-filled raw frame of `duration` ticks.
    pub fn allocate_raw_frame(&self, spec: &SampleSpec, duration: StreamTimestamp) -> Result<Frame> {
        let mut frame = self.allocate_frame()?;
        frame.resize(spec.stream_timestamp_to_samples(duration));
        frame.set_duration(duration);
        Ok(frame)
    }
}

/// Source of frames: the receiver-side chain is a stack of these.
pub trait FrameReader: Send {
    /// Fills `frame` with `duration` ticks of audio.
    fn read_frame(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()>;
}
