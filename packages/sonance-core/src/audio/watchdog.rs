//! Session liveness watchdog.

use serde::{Deserialize, Serialize};

use super::{frame_flags, Frame, FrameMode, FrameReader, SampleSpec};
use crate::error::{Error, Result};
use crate::packet::StreamTimestamp;
use crate::time;

/// Watchdog thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Terminate the session after this long without any signal.
    pub no_signal_timeout_ns: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            no_signal_timeout_ns: 2 * time::SECOND,
        }
    }
}

/// Declares a session dead after prolonged silence.
///
/// Counts contiguous signal-free output; once the configured timeout worth
/// of samples has passed without a single packet-filled sample, every
/// subsequent read returns `StreamEnd`.
pub struct Watchdog {
    inner: Box<dyn FrameReader + Send>,
    max_blank: u64,
    blank: u64,
    alive: bool,
}

impl Watchdog {
    pub fn new(
        inner: Box<dyn FrameReader + Send>,
        spec: SampleSpec,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            inner,
            max_blank: spec.ns_to_stream_timestamp(config.no_signal_timeout_ns) as u64,
            blank: 0,
            alive: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

impl FrameReader for Watchdog {
    fn read_frame(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        if !self.alive {
            return Err(Error::StreamEnd);
        }

        self.inner.read_frame(frame, duration, mode)?;

        if frame.has_flags(frame_flags::HAS_SIGNAL) {
            self.blank = 0;
        } else {
            self.blank += duration as u64;
            if self.blank >= self.max_blank {
                log::warn!(
                    "[Watchdog] no signal for {} samples, terminating session",
                    self.blank
                );
                self.alive = false;
            }
        }

        Ok(())
    }
}
