//! Sender-to-receiver round trips without a network in between.

use std::sync::Arc;

use parking_lot::Mutex;
use sonance_core::audio::{frame_flags, FrameFactory, FrameMode};
use sonance_core::fec::XorBlockCodec;
use sonance_core::packet::{QueueWriter, SortedQueue};
use sonance_core::session::{
    ReceiverConfig, ReceiverSession, SenderConfig, SenderFecConfig, SenderSession,
};
use sonance_core::{Frame, PacketFactory, SampleSpec};

fn spec() -> SampleSpec {
    SampleSpec::new(44100, 2).unwrap()
}

fn factory() -> PacketFactory {
    PacketFactory::new(4096, 1024)
}

fn tone_frame(frames: &FrameFactory, ticks: u32, seed: u32) -> Frame {
    let mut frame = frames.allocate_raw_frame(&spec(), ticks).unwrap();
    for (index, sample) in frame.samples_mut().iter_mut().enumerate() {
        // deterministic, full-scale-safe waveform
        *sample = (((seed as usize + index) % 200) as f32 / 200.0) - 0.5;
    }
    frame
}

#[test]
fn packetize_then_depacketize_preserves_samples() {
    let factory = factory();
    let frames = FrameFactory::new(8);

    let queue = Arc::new(Mutex::new(SortedQueue::new()));
    let mut sender = SenderSession::new(
        SenderConfig {
            sample_spec: spec(),
            samples_per_packet: 160,
            ..SenderConfig::default()
        },
        factory.clone(),
        Box::new(QueueWriter::new(queue.clone())),
        None,
        None,
    )
    .unwrap();

    let mut receiver =
        ReceiverSession::new(ReceiverConfig::default(), factory.clone(), None).unwrap();

    const FRAME_TICKS: u32 = 441;
    const FRAMES: u32 = 10;

    let mut sent = Vec::new();
    for index in 0..FRAMES {
        let mut frame = tone_frame(&frames, FRAME_TICKS, index * 7);
        sent.extend_from_slice(frame.samples());
        sender.write_frame(&mut frame).unwrap();
    }
    sender.flush().unwrap();

    // hand every emitted packet to the receiver, unchanged
    while let Some(packet) = queue.lock().pop() {
        receiver.route_packet(packet);
    }

    let mut received = Vec::new();
    for _ in 0..FRAMES {
        let mut frame = frames.allocate_frame().unwrap();
        receiver
            .read_frame(&mut frame, FRAME_TICKS, FrameMode::Hard)
            .unwrap();
        assert!(frame.has_flags(frame_flags::HAS_SIGNAL));
        assert!(!frame.has_flags(frame_flags::HAS_GAPS));
        received.extend_from_slice(frame.samples());
    }

    assert_eq!(sent.len(), received.len());
    for (offset, (a, b)) in sent.iter().zip(received.iter()).enumerate() {
        assert!(
            (a - b).abs() < 1e-3,
            "sample {offset} diverged: sent={a} received={b}"
        );
    }
}

#[test]
fn fec_repairs_a_lost_source_packet() {
    let factory = factory();
    let frames = FrameFactory::new(8);

    let source = Arc::new(Mutex::new(SortedQueue::new()));
    let repair = Arc::new(Mutex::new(SortedQueue::new()));

    let mut sender = SenderSession::new(
        SenderConfig {
            sample_spec: spec(),
            samples_per_packet: 100,
            fec: Some(SenderFecConfig {
                source_count: 5,
                repair_count: 1,
                repair_payload_type: 20,
            }),
            ..SenderConfig::default()
        },
        factory.clone(),
        Box::new(QueueWriter::new(source.clone())),
        Some(Box::new(QueueWriter::new(repair.clone()))),
        Some(Box::new(XorBlockCodec)),
    )
    .unwrap();

    let mut receiver = ReceiverSession::new(
        ReceiverConfig::default(),
        factory.clone(),
        Some(Box::new(XorBlockCodec)),
    )
    .unwrap();

    // one full FEC block of audio
    let mut frame = tone_frame(&frames, 500, 3);
    let sent: Vec<f32> = frame.samples().to_vec();
    sender.write_frame(&mut frame).unwrap();

    // drop the middle source packet, keep the parity packet
    let mut source_packets = Vec::new();
    while let Some(packet) = source.lock().pop() {
        source_packets.push(packet);
    }
    assert_eq!(source_packets.len(), 5);
    source_packets.remove(2);

    for packet in source_packets {
        receiver.route_packet(packet);
    }
    while let Some(packet) = repair.lock().pop() {
        receiver.route_packet(packet);
    }

    let mut out = frames.allocate_frame().unwrap();
    receiver.read_frame(&mut out, 500, FrameMode::Hard).unwrap();

    assert!(out.has_flags(frame_flags::HAS_SIGNAL));
    assert!(
        !out.has_flags(frame_flags::HAS_GAPS),
        "the lost packet should have been repaired, not concealed"
    );
    for (offset, (a, b)) in sent.iter().zip(out.samples().iter()).enumerate() {
        assert!(
            (a - b).abs() < 1e-3,
            "sample {offset} diverged after repair: sent={a} received={b}"
        );
    }
}
