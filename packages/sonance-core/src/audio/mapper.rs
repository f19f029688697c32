//! Channel mapping and the resampler seam.

use super::{Frame, FrameFactory, FrameMode, FrameReader, SampleSpec};
use crate::error::Result;
use crate::packet::StreamTimestamp;

/// Resampler seam.
///
/// The toolkit treats resampling as an external concern: implementations
/// adjust the frame in place. [`PassthroughResampler`] is the identity.
pub trait Resampler: Send {
    fn process(&mut self, frame: &mut Frame) -> Result<()>;
}

/// Identity resampler.
pub struct PassthroughResampler;

impl Resampler for PassthroughResampler {
    fn process(&mut self, _frame: &mut Frame) -> Result<()> {
        Ok(())
    }
}

/// Remaps channel layouts between the stream and the application.
///
/// Mono to multi-channel duplicates, multi-channel to mono averages, and
/// wider mappings copy shared channels while duplicating the last one into
/// any extra outputs.
pub struct ChannelMapper {
    inner: Box<dyn FrameReader + Send>,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    scratch_factory: FrameFactory,
}

impl ChannelMapper {
    pub fn new(
        inner: Box<dyn FrameReader + Send>,
        in_spec: SampleSpec,
        out_spec: SampleSpec,
    ) -> Self {
        Self {
            inner,
            in_spec,
            out_spec,
            scratch_factory: FrameFactory::new(1),
        }
    }
}

impl FrameReader for ChannelMapper {
    fn read_frame(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        if self.in_spec.num_channels() == self.out_spec.num_channels() {
            return self.inner.read_frame(frame, duration, mode);
        }

        let mut scratch = self.scratch_factory.allocate_frame()?;
        self.inner.read_frame(&mut scratch, duration, mode)?;

        let in_ch = self.in_spec.num_channels() as usize;
        let out_ch = self.out_spec.num_channels() as usize;

        frame.clear();
        frame.resize(duration as usize * out_ch);
        frame.set_duration(duration);
        frame.set_flags(scratch.flags());
        frame.set_capture_timestamp(scratch.capture_timestamp());

        let input = scratch.samples();
        let output = frame.samples_mut();

        for tick in 0..duration as usize {
            let in_frame = &input[tick * in_ch..(tick + 1) * in_ch];
            let out_frame = &mut output[tick * out_ch..(tick + 1) * out_ch];

            if out_ch == 1 {
                out_frame[0] = in_frame.iter().sum::<f32>() / in_ch as f32;
            } else {
                for (index, sample) in out_frame.iter_mut().enumerate() {
                    *sample = in_frame[index.min(in_ch - 1)];
                }
            }
        }

        Ok(())
    }
}
