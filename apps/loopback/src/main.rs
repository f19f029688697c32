//! Loopback demo: streams a generated tone to itself over RTP/UDP.
//!
//! A sender session packetizes a sine wave and ships it through a real UDP
//! socket pair on the loopback interface; a receiver session reorders,
//! repairs and decodes the packets back into frames and reports quality
//! counters at the end.

use std::f32::consts::PI;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use sonance_core::audio::{frame_flags, FrameFactory, FrameMode};
use sonance_core::fec::XorBlockCodec;
use sonance_core::net::{NetworkTask, UdpConfig};
use sonance_core::session::{
    AddressedWriter, ReceiverConfig, ReceiverSession, SenderConfig, SenderFecConfig,
    SenderSession,
};
use sonance_core::{Endpoint, NetworkLoop, PacketFactory, Protocol, SampleSpec};

#[derive(Parser, Debug)]
#[command(name = "sonance-loopback")]
#[command(about = "Stream a tone to yourself over RTP/UDP and verify reception")]
struct Args {
    /// Sample rate in Hz
    #[arg(long, default_value_t = 44100)]
    rate: u32,

    /// Number of channels
    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,

    /// How long to stream, in milliseconds
    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,

    /// Frame size in samples per channel
    #[arg(long, default_value_t = 441)]
    frame_size: u32,

    /// Protect the stream with single-parity FEC
    #[arg(long, default_value_t = false)]
    fec: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let spec = SampleSpec::new(args.rate, args.channels)
        .ok()
        .context("invalid sample spec")?;

    let factory = PacketFactory::new(4096, 4096);
    let net = NetworkLoop::new(factory.clone())
        .ok()
        .context("can't start network loop")?;

    // receiver side
    let mut receiver = ReceiverSession::new(
        ReceiverConfig {
            sample_spec: spec,
            target_latency_ns: 0,
            ..ReceiverConfig::default()
        },
        factory.clone(),
        args.fec
            .then(|| Box::new(XorBlockCodec) as Box<dyn sonance_core::fec::BlockDecoder + Send>),
    )
    .ok()
    .context("can't create receiver session")?;

    let bind: SocketAddr = "127.0.0.1:0".parse()?;

    let add_recv = NetworkTask::new_add_udp_port(UdpConfig {
        bind_address: bind,
        ..UdpConfig::default()
    });
    if !net.schedule_and_wait(Arc::clone(&add_recv)) {
        bail!("can't bind receiver port");
    }
    let recv_handle = add_recv.port_handle().context("missing port handle")?;
    let recv_addr = add_recv
        .udp_bind_address()
        .context("missing bind address")?;

    let start_recv =
        NetworkTask::new_start_udp_recv(recv_handle, Box::new(receiver.inbound_writer()));
    if !net.schedule_and_wait(start_recv) {
        bail!("can't start receiving");
    }

    // sender side
    let add_send = NetworkTask::new_add_udp_port(UdpConfig {
        bind_address: bind,
        ..UdpConfig::default()
    });
    if !net.schedule_and_wait(Arc::clone(&add_send)) {
        bail!("can't bind sender port");
    }
    let send_handle = add_send.port_handle().context("missing port handle")?;
    let send_addr = add_send
        .udp_bind_address()
        .context("missing bind address")?;

    let start_send = NetworkTask::new_start_udp_send(send_handle);
    if !net.schedule_and_wait(Arc::clone(&start_send)) {
        bail!("can't start sending");
    }
    let writer = start_send
        .take_outbound_writer()
        .context("missing outbound writer")?;
    let send_port = writer.port().clone();

    let make_writer = || {
        Box::new(AddressedWriter::new(
            Box::new(writer.clone()),
            send_addr,
            recv_addr,
        )) as Box<dyn sonance_core::PacketWriter>
    };

    let mut sender = SenderSession::new(
        SenderConfig {
            sample_spec: spec,
            samples_per_packet: 200,
            fec: args.fec.then_some(SenderFecConfig {
                source_count: 10,
                repair_count: 1,
                repair_payload_type: 20,
            }),
            ..SenderConfig::default()
        },
        factory.clone(),
        make_writer(),
        args.fec.then(make_writer),
        args.fec
            .then(|| Box::new(XorBlockCodec) as Box<dyn sonance_core::fec::BlockEncoder>),
    )
    .ok()
    .context("can't create sender session")?;

    let endpoint = Endpoint {
        protocol: if args.fec { Protocol::RtpRs8m } else { Protocol::Rtp },
        host: recv_addr.ip().to_string(),
        port: recv_addr.port(),
    };
    log::info!(
        "streaming {endpoint} <- {send_addr} for {} ms",
        args.duration_ms
    );

    let frames = FrameFactory::new(8);
    let frame_interval =
        Duration::from_nanos(spec.stream_timestamp_to_ns(args.frame_size) as u64);
    let total_frames = (args.duration_ms as u128 * 1_000_000
        / frame_interval.as_nanos().max(1)) as u32;

    let mut phase: f32 = 0.0;
    let phase_step = 2.0 * PI * args.frequency / args.rate as f32;

    let mut signal_frames = 0u64;
    let mut gap_frames = 0u64;

    let start = Instant::now();
    for index in 0..total_frames {
        // generate and send one frame of the tone
        let mut frame = frames
            .allocate_raw_frame(&spec, args.frame_size)
            .ok()
            .context("frame pool exhausted")?;
        {
            let channels = args.channels as usize;
            let samples = frame.samples_mut();
            for tick in 0..args.frame_size as usize {
                let value = (phase + phase_step * tick as f32).sin() * 0.4;
                for channel in 0..channels {
                    samples[tick * channels + channel] = value;
                }
            }
        }
        phase = (phase + phase_step * args.frame_size as f32) % (2.0 * PI);

        sender
            .write_frame(&mut frame)
            .ok()
            .context("send failed")?;

        // pace to real time, then pull the delivered audio back out
        let next = start + frame_interval * (index + 1);
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        }

        let mut received = frames
            .allocate_frame()
            .ok()
            .context("frame pool exhausted")?;
        receiver
            .read_frame(&mut received, args.frame_size, FrameMode::Hard)
            .ok()
            .context("receive failed")?;

        if received.has_flags(frame_flags::HAS_SIGNAL) {
            signal_frames += 1;
        }
        if received.has_flags(frame_flags::HAS_GAPS) {
            gap_frames += 1;
        }
    }

    sender.flush().ok().context("flush failed")?;

    let metrics = receiver.metrics();
    log::info!(
        "done: frames={total_frames} signal={signal_frames} gaps={gap_frames} \
         packets_sent={} packets_received={} malformed={}",
        send_port.num_sent_packets(),
        metrics.packets_received,
        metrics.packets_malformed,
    );

    if signal_frames == 0 {
        bail!("no audio made it through the loopback");
    }

    Ok(())
}
