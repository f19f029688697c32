//! End-to-end RTP over UDP scenarios on the loopback interface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sonance_core::audio::{frame_flags, FrameEncoder, FrameFactory, FrameMode, PcmEncoder};
use sonance_core::net::{NetworkTask, UdpConfig};
use sonance_core::packet::{PacketPtr, PacketWriter, Udp};
use sonance_core::session::{ReceiverConfig, ReceiverSession};
use sonance_core::{rtp, NetworkLoop, PacketFactory, SampleSpec};

const PAYLOAD_TYPE: u8 = 10;

fn spec() -> SampleSpec {
    SampleSpec::new(44100, 2).unwrap()
}

fn factory() -> PacketFactory {
    PacketFactory::new(4096, 2048)
}

struct Fixture {
    net: NetworkLoop,
    factory: PacketFactory,
    session: ReceiverSession,
    send_writer: sonance_core::net::UdpWriter,
    recv_addr: std::net::SocketAddr,
    send_addr: std::net::SocketAddr,
}

fn fixture() -> Fixture {
    let factory = factory();
    let net = NetworkLoop::new(factory.clone()).unwrap();

    let session = ReceiverSession::new(
        ReceiverConfig {
            sample_spec: spec(),
            target_latency_ns: 0,
            ..ReceiverConfig::default()
        },
        factory.clone(),
        None,
    )
    .unwrap();

    // receiver port
    let recv_config = UdpConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..UdpConfig::default()
    };
    let add_recv = NetworkTask::new_add_udp_port(recv_config);
    assert!(net.schedule_and_wait(Arc::clone(&add_recv)));
    let recv_handle = add_recv.port_handle().unwrap();

    let start_recv = NetworkTask::new_start_udp_recv(
        recv_handle,
        Box::new(session.inbound_writer()),
    );
    assert!(net.schedule_and_wait(start_recv));

    let recv_addr = add_recv.udp_bind_address().unwrap();

    // sender port
    let send_config = UdpConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..UdpConfig::default()
    };
    let add_send = NetworkTask::new_add_udp_port(send_config);
    assert!(net.schedule_and_wait(Arc::clone(&add_send)));
    let send_handle = add_send.port_handle().unwrap();

    let start_send = NetworkTask::new_start_udp_send(send_handle);
    assert!(net.schedule_and_wait(Arc::clone(&start_send)));
    let send_writer = start_send.take_outbound_writer().unwrap();
    let send_addr = send_writer.port().bind_address();

    Fixture {
        net,
        factory,
        session,
        send_writer,
        recv_addr,
        send_addr,
    }
}

fn rtp_packet(
    fixture: &Fixture,
    seqnum: u16,
    ts: u32,
    n_samples: u32,
    value: f32,
) -> PacketPtr {
    let mut buffer = fixture.factory.new_buffer().unwrap();
    rtp::compose_header(&mut buffer, 0x11223344, seqnum, ts, PAYLOAD_TYPE, false);
    let samples = vec![value; n_samples as usize * 2];
    PcmEncoder::new(spec()).write(&samples, &mut buffer);

    let packet = fixture.factory.new_packet(buffer).unwrap();
    packet.set_udp(Udp {
        src_addr: fixture.send_addr,
        dst_addr: fixture.recv_addr,
        receive_timestamp: 0,
    });
    packet
}

fn wait_inbound(session: &ReceiverSession, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.num_pending_inbound() < count {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {count} packets, got {}",
            session.num_pending_inbound()
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn read_frame(session: &mut ReceiverSession, duration: u32) -> sonance_core::Frame {
    let frames = FrameFactory::new(4);
    let mut frame = frames.allocate_frame().unwrap();
    session
        .read_frame(&mut frame, duration, FrameMode::Hard)
        .unwrap();
    frame
}

fn assert_all_close(frame: &sonance_core::Frame, value: f32) {
    for sample in frame.samples() {
        assert!((sample - value).abs() < 1e-3, "{sample} != {value}");
    }
}

// Three packets with consecutive timestamps produce three clean frames.
#[test]
fn continuous_stream_delivers_clean_frames() {
    let mut fixture = fixture();

    let base_ts = 48_000;
    for (index, seqnum) in (0u16..3).enumerate() {
        let packet = rtp_packet(&fixture, seqnum, base_ts + index as u32 * 200, 200, 0.11);
        fixture.send_writer.write_packet(packet).unwrap();
    }

    wait_inbound(&fixture.session, 3);

    for _ in 0..3 {
        let frame = read_frame(&mut fixture.session, 200);
        assert_eq!(frame.num_samples(), 400);
        assert!(frame.has_flags(frame_flags::HAS_SIGNAL));
        assert!(!frame.has_flags(frame_flags::HAS_GAPS));
        assert_all_close(&frame, 0.11);
    }
}

// A lost middle packet is concealed with a silent gap frame.
#[test]
fn lost_packet_becomes_silent_gap() {
    let mut fixture = fixture();

    let base_ts = 48_000;
    for (seqnum, offset) in [(0u16, 0u32), (2, 400)] {
        let packet = rtp_packet(&fixture, seqnum, base_ts + offset, 200, 0.11);
        fixture.send_writer.write_packet(packet).unwrap();
    }

    wait_inbound(&fixture.session, 2);

    let first = read_frame(&mut fixture.session, 200);
    assert!(first.has_flags(frame_flags::HAS_SIGNAL));
    assert!(!first.has_flags(frame_flags::HAS_GAPS));
    assert_all_close(&first, 0.11);

    let second = read_frame(&mut fixture.session, 200);
    assert!(!second.has_flags(frame_flags::HAS_SIGNAL));
    assert!(second.has_flags(frame_flags::HAS_GAPS));
    assert_all_close(&second, 0.0);

    let third = read_frame(&mut fixture.session, 200);
    assert!(third.has_flags(frame_flags::HAS_SIGNAL));
    assert!(!third.has_flags(frame_flags::HAS_GAPS));
    assert_all_close(&third, 0.11);
}

// Out-of-order arrivals are reordered by the jitter buffer.
#[test]
fn out_of_order_packets_are_reordered() {
    let mut fixture = fixture();

    let base_ts = 10_000;
    // timestamps follow the seqnums so that 3,4,5,6 is a gapless stream
    for seqnum in [5u16, 3, 4, 6] {
        let ts = base_ts + (seqnum as u32 - 3) * 200;
        let packet = rtp_packet(&fixture, seqnum, ts, 200, 0.11);
        fixture.send_writer.write_packet(packet).unwrap();
    }

    wait_inbound(&fixture.session, 4);

    // all four packets arrived before reading started, so the reorder
    // buffer restores the full sequence 3, 4, 5, 6
    for _ in 0..4 {
        let frame = read_frame(&mut fixture.session, 200);
        assert!(frame.has_flags(frame_flags::HAS_SIGNAL));
        assert!(!frame.has_flags(frame_flags::HAS_GAPS));
        assert!(!frame.has_flags(frame_flags::HAS_DROPS));
        assert_all_close(&frame, 0.11);
    }
}

// Sender-side packet accounting: everything queued is eventually sent.
#[test]
fn udp_send_metrics_converge() {
    let fixture = fixture();
    let port = fixture.send_writer.port().clone();

    const COUNT: usize = 1000;
    let mut writer = fixture.send_writer.clone();
    for seqnum in 0..COUNT as u16 {
        let packet = rtp_packet(&fixture, seqnum, seqnum as u32 * 10, 10, 0.5);
        writer.write_packet(packet).unwrap();

        // in-flight work never exceeds what was submitted
        let sent = port.num_sent_packets() as usize;
        let pending = port.num_pending_packets();
        assert!(sent + pending <= seqnum as usize + 1);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while port.num_pending_packets() > 0 {
        assert!(Instant::now() < deadline, "outbound queue failed to drain");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(port.num_sent_packets(), COUNT as u64);

    drop(fixture.net);
}
