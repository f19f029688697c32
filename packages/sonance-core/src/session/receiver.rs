//! Receiver session: packets in, frames out.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio::{
    ChannelMapper, Depacketizer, Frame, FrameMode, FrameReader, PassthroughResampler,
    PcmDecoder, Resampler, SampleSpec, Watchdog, WatchdogConfig,
};
use crate::error::{Error, Result};
use crate::fec::BlockDecoder;
use crate::packet::{
    self, ConcurrentQueue, ConcurrentQueueWriter, PacketFactory, PacketPtr, QueueReader,
    SharedQueue, SortedQueue, StreamTimestamp,
};
use crate::pipeline::{PipelineBackend, PipelineTask};
use crate::rtp::{FilterConfig, RtpFilter};
use crate::sync::RateLimiter;
use crate::time;

const REPORT_INTERVAL: i64 = 30 * time::SECOND;

/// Receiver session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Stream sample rate and channel layout on the wire.
    pub sample_spec: SampleSpec,
    /// Channel layout delivered to the application; `None` keeps the wire
    /// layout.
    pub output_spec: Option<SampleSpec>,
    /// RTP payload type of the audio stream.
    pub payload_type: u8,
    /// RTP payload type of the repair stream.
    pub repair_payload_type: u8,
    /// Target latency accumulated before playback starts.
    pub target_latency_ns: i64,
    /// RTP stream validation thresholds.
    pub filter: FilterConfig,
    /// No-signal watchdog; `None` disables it.
    pub watchdog: Option<WatchdogConfig>,
    /// Fill losses with a marker tone instead of silence.
    pub beep_on_gaps: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            sample_spec: SampleSpec::new(44100, 2).expect("valid literal"),
            output_spec: None,
            payload_type: 10,
            repair_payload_type: 20,
            target_latency_ns: 0,
            filter: FilterConfig::default(),
            watchdog: None,
            beep_on_gaps: false,
        }
    }
}

/// Point-in-time session counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReceiverMetrics {
    pub packets_received: u64,
    pub packets_malformed: u64,
    pub source_queue_len: usize,
    pub repair_queue_len: usize,
}

/// Per-remote-peer receive pipeline.
///
/// Inbound packets are pushed from the network loop through a concurrent
/// queue; on every frame read the session drains the queue, parses and
/// routes the packets into the source and repair reorder queues, and pulls
/// the frame through the chain: sorted queue, RTP filter, delay, FEC merge,
/// depacketizer and channel mapping.
pub struct ReceiverSession {
    config: ReceiverConfig,

    inbound: Arc<ConcurrentQueue>,
    source_queue: SharedQueue,
    repair_queue: SharedQueue,

    reader: Box<dyn FrameReader + Send>,
    resampler: Box<dyn Resampler + Send>,

    packets_received: u64,
    packets_malformed: u64,
    report_limiter: RateLimiter,
}

impl ReceiverSession {
    /// Creates the session.
    ///
    /// `fec_decoder` enables loss repair from the repair endpoint's packets.
    pub fn new(
        config: ReceiverConfig,
        factory: PacketFactory,
        fec_decoder: Option<Box<dyn BlockDecoder + Send>>,
    ) -> Result<Self> {
        let spec = config.sample_spec;

        let inbound = ConcurrentQueue::new();
        let source_queue: SharedQueue = Arc::new(Mutex::new(SortedQueue::new()));
        let repair_queue: SharedQueue = Arc::new(Mutex::new(SortedQueue::new()));

        // packet chain, innermost first: sorted queue, filter, delay, FEC
        let mut packet_reader: Box<dyn packet::PacketReader + Send> =
            Box::new(QueueReader::new(Arc::clone(&source_queue)));

        packet_reader = Box::new(RtpFilter::new(
            packet_reader,
            Box::new(PcmDecoder::new(spec)),
            config.filter,
            spec,
        ));

        packet_reader = Box::new(packet::DelayedReader::new(
            packet_reader,
            spec.ns_to_stream_timestamp(config.target_latency_ns),
        ));

        // FEC sits after the delay so that a missing seqnum means a genuine
        // loss, not a packet the latency buffer is still waiting for
        if let Some(decoder) = fec_decoder {
            packet_reader = Box::new(crate::fec::FecReader::new(
                packet_reader,
                Arc::clone(&repair_queue),
                decoder,
                factory.clone(),
            ));
        }

        // frame chain on top of the packet chain
        let mut frame_reader: Box<dyn FrameReader + Send> = Box::new(Depacketizer::new(
            packet_reader,
            Box::new(PcmDecoder::new(spec)),
            spec,
            config.beep_on_gaps,
        ));

        if let Some(watchdog) = config.watchdog {
            frame_reader = Box::new(Watchdog::new(frame_reader, spec, watchdog));
        }

        if let Some(output_spec) = config.output_spec {
            if output_spec.sample_rate() != spec.sample_rate() {
                return Err(Error::BadArgument);
            }
            if output_spec.num_channels() != spec.num_channels() {
                frame_reader = Box::new(ChannelMapper::new(frame_reader, spec, output_spec));
            }
        }

        Ok(Self {
            config,
            inbound,
            source_queue,
            repair_queue,
            reader: frame_reader,
            resampler: Box::new(PassthroughResampler),
            packets_received: 0,
            packets_malformed: 0,
            report_limiter: RateLimiter::new(REPORT_INTERVAL),
        })
    }

    /// Replaces the resampler stage; the default is the identity.
    pub fn set_resampler(&mut self, resampler: Box<dyn Resampler + Send>) {
        self.resampler = resampler;
    }

    /// Writer handed to `StartUdpRecv`; usable from the network thread.
    pub fn inbound_writer(&self) -> ConcurrentQueueWriter {
        self.inbound.writer()
    }

    /// Routes one packet into the session directly.
    pub fn route_packet(&self, packet: PacketPtr) {
        self.inbound.push(packet);
    }

    /// Packets delivered by the network loop but not yet drained.
    pub fn num_pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    fn drain_inbound(&mut self) {
        while let Some(packet) = self.inbound.pop() {
            self.packets_received += 1;

            if !packet.has_flags(packet::flags::RTP) {
                match crate::rtp::parse(packet.buffer()) {
                    Ok(view) => packet.set_rtp(view),
                    Err(_) => {
                        self.packets_malformed += 1;
                        log::debug!("[Receiver] dropping malformed packet");
                        continue;
                    }
                }
            }

            let rtp = packet.rtp().expect("parsed above");
            if rtp.payload_type == self.config.repair_payload_type {
                packet.add_flags(packet::flags::REPAIR);
                self.repair_queue.lock().push(packet);
            } else {
                packet.add_flags(packet::flags::AUDIO);
                self.source_queue.lock().push(packet);
            }
        }
    }

    /// Reads one frame of `duration` ticks from the session.
    pub fn read_frame(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        self.drain_inbound();
        self.reader.read_frame(frame, duration, mode)?;
        self.resampler.process(frame)?;
        self.report_stats();
        Ok(())
    }

    pub fn metrics(&self) -> ReceiverMetrics {
        ReceiverMetrics {
            packets_received: self.packets_received,
            packets_malformed: self.packets_malformed,
            source_queue_len: self.source_queue.lock().len(),
            repair_queue_len: self.repair_queue.lock().len(),
        }
    }

    fn report_stats(&self) {
        if !self.report_limiter.allow() {
            return;
        }
        if let Ok(snapshot) = serde_json::to_string(&self.metrics()) {
            log::debug!("[Receiver] metrics={snapshot}");
        }
    }
}

/// Control-plane requests understood by [`ReceiverBackend`].
pub enum ReceiverCommand {
    /// Attach a session to the pipeline.
    AddSession(Box<ReceiverSession>),
    /// Detach all sessions.
    RemoveAllSessions,
    /// Collect metrics of every attached session.
    QueryMetrics(Vec<ReceiverMetrics>),
}

/// Pipeline backend mixing all attached receiver sessions into the frames
/// requested by the frame caller.
pub struct ReceiverBackend {
    spec: SampleSpec,
    sessions: Vec<ReceiverSession>,
    scratch_factory: crate::audio::FrameFactory,
}

impl ReceiverBackend {
    pub fn new(spec: SampleSpec) -> Self {
        Self {
            spec,
            sessions: Vec::new(),
            scratch_factory: crate::audio::FrameFactory::new(1),
        }
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl PipelineBackend for ReceiverBackend {
    fn process_subframe(
        &mut self,
        frame: &mut Frame,
        duration: StreamTimestamp,
        mode: FrameMode,
    ) -> Result<()> {
        if self.sessions.is_empty() {
            // no sessions: deliver silence of the requested duration
            frame.clear();
            frame.resize(self.spec.stream_timestamp_to_samples(duration));
            frame.set_duration(duration);
            return Ok(());
        }

        if self.sessions.len() == 1 {
            return self.sessions[0].read_frame(frame, duration, mode);
        }

        // mix sessions sample-wise; flags accumulate by OR
        let mut scratch_frame = self.scratch_factory.allocate_frame()?;
        let mut first = true;
        for session in &mut self.sessions {
            if first {
                session.read_frame(frame, duration, mode)?;
                first = false;
                continue;
            }
            session.read_frame(&mut scratch_frame, duration, mode)?;
            for (out, add) in frame
                .samples_mut()
                .iter_mut()
                .zip(scratch_frame.samples().iter())
            {
                *out += add;
            }
            frame.add_flags(scratch_frame.flags());
        }
        Ok(())
    }

    fn process_task(&mut self, task: &PipelineTask) -> bool {
        let boxed = match task.payload().take() {
            Some(boxed) => boxed,
            None => return false,
        };
        let command = match boxed.downcast::<ReceiverCommand>() {
            Ok(command) => command,
            Err(_) => return false,
        };

        match *command {
            ReceiverCommand::AddSession(session) => {
                self.sessions.push(*session);
                true
            }
            ReceiverCommand::RemoveAllSessions => {
                self.sessions.clear();
                true
            }
            ReceiverCommand::QueryMetrics(mut out) => {
                out.clear();
                out.extend(self.sessions.iter().map(|session| session.metrics()));
                // hand the filled report back through the payload slot
                *task.payload() = Some(Box::new(ReceiverCommand::QueryMetrics(out)));
                true
            }
        }
    }
}
