//! Sender session: frames in, packets out.

use serde::{Deserialize, Serialize};

use crate::audio::{Frame, FrameMode, PcmEncoder, Packetizer, PacketizerConfig, SampleSpec};
use crate::error::Result;
use crate::fec::BlockEncoder;
use crate::packet::{PacketFactory, PacketWriter, StreamTimestamp};
use crate::pipeline::{PipelineBackend, PipelineTask};

/// FEC parameters of a sender session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SenderFecConfig {
    /// Source packets per block.
    pub source_count: usize,
    /// Repair packets emitted per block.
    pub repair_count: usize,
    /// RTP payload type of the repair stream.
    pub repair_payload_type: u8,
}

/// Sender session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Stream sample rate and channel layout.
    pub sample_spec: SampleSpec,
    /// RTP payload type of the audio stream.
    pub payload_type: u8,
    /// Samples per channel carried by one packet.
    pub samples_per_packet: StreamTimestamp,
    /// FEC block parameters; `None` sends a bare source stream.
    pub fec: Option<SenderFecConfig>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            sample_spec: SampleSpec::new(44100, 2).expect("valid literal"),
            payload_type: 10,
            samples_per_packet: 200,
            fec: None,
        }
    }
}

/// Per-remote-peer send pipeline: encode, packetize, optionally FEC-encode,
/// and hand packets to the outbound writer (typically a UDP port's writer).
pub struct SenderSession {
    packetizer: Packetizer,
}

impl SenderSession {
    /// Creates the session.
    ///
    /// With FEC enabled, `repair_writer` and `fec_encoder` must be given;
    /// repair packets go to the repair writer after each full block.
    pub fn new(
        config: SenderConfig,
        factory: PacketFactory,
        source_writer: Box<dyn PacketWriter>,
        repair_writer: Option<Box<dyn PacketWriter>>,
        fec_encoder: Option<Box<dyn BlockEncoder>>,
    ) -> Result<Self> {
        let writer: Box<dyn PacketWriter> = match (config.fec, repair_writer, fec_encoder) {
            (Some(fec), Some(repair_writer), Some(encoder)) => {
                Box::new(crate::fec::FecWriter::new(
                    source_writer,
                    repair_writer,
                    encoder,
                    factory.clone(),
                    fec.source_count,
                    fec.repair_count,
                    fec.repair_payload_type,
                )?)
            }
            (None, _, _) => source_writer,
            _ => return Err(crate::error::Error::BadArgument),
        };

        let packetizer = Packetizer::new(
            writer,
            Box::new(PcmEncoder::new(config.sample_spec)),
            factory,
            config.sample_spec,
            PacketizerConfig {
                samples_per_packet: config.samples_per_packet,
                payload_type: config.payload_type,
            },
        )?;

        Ok(Self { packetizer })
    }

    /// SSRC of the outgoing stream.
    pub fn source_id(&self) -> u32 {
        self.packetizer.source_id()
    }

    /// Number of packets emitted so far.
    pub fn packets_emitted(&self) -> u64 {
        self.packetizer.packets_emitted()
    }

    /// Consumes one frame of samples.
    pub fn write_frame(&mut self, frame: &mut Frame) -> Result<()> {
        self.packetizer.write_frame(frame)
    }

    /// Emits the accumulating partial packet, if any.
    pub fn flush(&mut self) -> Result<()> {
        self.packetizer.flush()
    }
}

/// Control-plane requests understood by [`SenderBackend`].
pub enum SenderCommand {
    /// Attach a session; written frames fan out to all attached sessions.
    AddSession(Box<SenderSession>),
    /// Flush and detach all sessions.
    RemoveAllSessions,
}

/// Pipeline backend fanning written frames out to all attached sender
/// sessions.
#[derive(Default)]
pub struct SenderBackend {
    sessions: Vec<SenderSession>,
}

impl SenderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl PipelineBackend for SenderBackend {
    fn process_subframe(
        &mut self,
        frame: &mut Frame,
        _duration: StreamTimestamp,
        _mode: FrameMode,
    ) -> Result<()> {
        for session in &mut self.sessions {
            session.write_frame(frame)?;
        }
        Ok(())
    }

    fn process_task(&mut self, task: &PipelineTask) -> bool {
        let boxed = match task.payload().take() {
            Some(boxed) => boxed,
            None => return false,
        };
        let command = match boxed.downcast::<SenderCommand>() {
            Ok(command) => command,
            Err(_) => return false,
        };

        match *command {
            SenderCommand::AddSession(session) => {
                self.sessions.push(*session);
                true
            }
            SenderCommand::RemoveAllSessions => {
                let mut ok = true;
                for session in &mut self.sessions {
                    ok &= session.flush().is_ok();
                }
                self.sessions.clear();
                ok
            }
        }
    }
}
