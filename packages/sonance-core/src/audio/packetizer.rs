//! Packetizer: turns a frame stream into RTP packets.

use serde::{Deserialize, Serialize};

use super::{Frame, FrameEncoder, SampleSpec};
use crate::error::{Error, Result};
use crate::packet::{self, PacketFactory, PacketWriter, Rtp, Seqnum, StreamTimestamp};
use crate::pool::PooledBuffer;
use crate::rtp;

/// Packetizer parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PacketizerConfig {
    /// Samples per channel carried by one full packet.
    pub samples_per_packet: StreamTimestamp,
    /// RTP payload type for the configured encoding.
    pub payload_type: u8,
}

struct InProgress {
    buffer: PooledBuffer,
    start_timestamp: StreamTimestamp,
    capture_timestamp: i64,
    filled: StreamTimestamp,
}

/// Accumulates samples into fixed-size payloads and emits RTP packets.
///
/// The sequence number grows by one per packet, the stream timestamp by the
/// per-packet sample count; the SSRC is fixed per session. A partially
/// accumulated packet is emitted with its true sample count by
/// [`flush`](Self::flush).
pub struct Packetizer {
    writer: Box<dyn PacketWriter>,
    encoder: Box<dyn FrameEncoder>,
    factory: PacketFactory,
    spec: SampleSpec,
    config: PacketizerConfig,

    source_id: u32,
    seqnum: Seqnum,
    stream_timestamp: StreamTimestamp,

    current: Option<InProgress>,
    packets_emitted: u64,
}

impl Packetizer {
    pub fn new(
        writer: Box<dyn PacketWriter>,
        encoder: Box<dyn FrameEncoder>,
        factory: PacketFactory,
        spec: SampleSpec,
        config: PacketizerConfig,
    ) -> Result<Self> {
        if config.samples_per_packet == 0 {
            return Err(Error::BadArgument);
        }
        let max_payload = encoder.encoded_byte_count(config.samples_per_packet);
        if rtp::HEADER_SIZE + max_payload > factory.buffer_size() {
            return Err(Error::BadArgument);
        }

        Ok(Self {
            writer,
            encoder,
            factory,
            spec,
            config,
            source_id: rand::random(),
            seqnum: rand::random(),
            stream_timestamp: rand::random(),
            current: None,
            packets_emitted: 0,
        })
    }

    /// SSRC of the outgoing stream.
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// Number of packets emitted so far, flushed partials included.
    pub fn packets_emitted(&self) -> u64 {
        self.packets_emitted
    }

    /// Consumes a frame, emitting packets as payloads fill up.
    pub fn write_frame(&mut self, frame: &mut Frame) -> Result<()> {
        let channels = self.spec.num_channels() as usize;
        let frame_cts = frame.capture_timestamp();

        let mut consumed: usize = 0;
        let total = frame.num_samples();

        while consumed < total {
            if self.current.is_none() {
                let mut buffer = self.factory.new_buffer()?;
                rtp::compose_header(
                    &mut buffer,
                    self.source_id,
                    self.seqnum,
                    self.stream_timestamp,
                    self.config.payload_type,
                    false,
                );
                let capture_timestamp = if frame_cts != 0 {
                    let offset =
                        self.spec.samples_to_stream_timestamp(consumed) as i32;
                    frame_cts + self.spec.stream_timestamp_delta_to_ns(offset)
                } else {
                    0
                };
                self.current = Some(InProgress {
                    buffer,
                    start_timestamp: self.stream_timestamp,
                    capture_timestamp,
                    filled: 0,
                });
            }

            let current = self.current.as_mut().expect("just ensured");
            let room = self.config.samples_per_packet - current.filled;
            let remaining =
                self.spec.samples_to_stream_timestamp(total - consumed);
            let take = room.min(remaining);

            let samples =
                &frame.samples()[consumed..consumed + take as usize * channels];
            let written = self.encoder.write(samples, &mut current.buffer);
            debug_assert_eq!(written, take);

            current.filled += take;
            self.stream_timestamp = self.stream_timestamp.wrapping_add(take);
            consumed += take as usize * channels;

            if current.filled == self.config.samples_per_packet {
                self.emit()?;
            }
        }

        Ok(())
    }

    /// Emits the currently accumulating partial packet, if any.
    pub fn flush(&mut self) -> Result<()> {
        if self.current.as_ref().is_some_and(|c| c.filled > 0) {
            self.emit()?;
        } else {
            self.current = None;
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        let current = self.current.take().expect("packet in progress");

        let packet = self.factory.new_packet(current.buffer)?;
        let view = Rtp::new(
            self.source_id,
            self.seqnum,
            current.start_timestamp,
            self.config.payload_type,
            false,
            packet.buffer().slice(rtp::HEADER_SIZE..),
        );
        view.set_duration(current.filled);
        if current.capture_timestamp > 0 {
            view.set_capture_timestamp(current.capture_timestamp);
        }
        packet.set_rtp(view);
        packet.add_flags(packet::flags::AUDIO);

        self.seqnum = self.seqnum.wrapping_add(1);
        self.packets_emitted += 1;

        self.writer.write_packet(packet)
    }
}
