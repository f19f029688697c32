//! Packets and packet queues.
//!
//! A [`Packet`] carries the raw wire bytes of one datagram plus parsed views:
//! an RTP view (set once the header is parsed) and a UDP view (set by the
//! receiving port). Packets are pool-bounded and `Arc`-shared between the
//! ingress queue, the session pipeline and FEC recovery.

mod delayed_reader;
mod sorted_queue;
mod units;

pub use delayed_reader::DelayedReader;
pub use sorted_queue::{QueueReader, QueueWriter, SharedQueue, SortedQueue};
pub use units::{
    seqnum_diff, seqnum_lt, stream_timestamp_diff, stream_timestamp_lt, Seqnum, StreamTimestamp,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::pool::{BufferPool, ObjectPool, PoolSlot, PooledBuffer};
use crate::sync::{HasMpscNode, MpscNode, MpscQueue};

/// Packet flag bits.
pub mod flags {
    /// Packet contains a parsed RTP view.
    pub const RTP: u32 = 1 << 0;
    /// Packet was received from or will be sent to a UDP port.
    pub const UDP: u32 = 1 << 1;
    /// Packet carries audio payload.
    pub const AUDIO: u32 = 1 << 2;
    /// Packet carries FEC repair payload.
    pub const REPAIR: u32 = 1 << 3;
    /// Packet belongs to the control (RTCP) stream.
    pub const CONTROL: u32 = 1 << 4;
}

/// Packet read mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Remove the packet from the reader.
    Fetch,
    /// Look at the next packet without consuming it.
    Peek,
}

/// Parsed RTP view of a packet.
///
/// Immutable after parsing except for `duration` (populated lazily from the
/// payload size) and `capture_timestamp` (injected from out-of-band reports).
#[derive(Debug)]
pub struct Rtp {
    /// RTP SSRC.
    pub source_id: u32,
    /// RTP sequence number.
    pub seqnum: Seqnum,
    /// RTP timestamp of the first sample in the payload.
    pub stream_timestamp: StreamTimestamp,
    /// RTP payload type.
    pub payload_type: u8,
    /// RTP marker bit.
    pub marker: bool,
    /// Payload sub-slice of the packet buffer.
    pub payload: Bytes,
    duration: AtomicU32,
    capture_timestamp: AtomicI64,
}

impl Rtp {
    pub fn new(
        source_id: u32,
        seqnum: Seqnum,
        stream_timestamp: StreamTimestamp,
        payload_type: u8,
        marker: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            source_id,
            seqnum,
            stream_timestamp,
            payload_type,
            marker,
            payload,
            duration: AtomicU32::new(0),
            capture_timestamp: AtomicI64::new(0),
        }
    }

    /// Payload duration in samples per channel; zero until populated.
    pub fn duration(&self) -> StreamTimestamp {
        self.duration.load(Ordering::Relaxed)
    }

    pub fn set_duration(&self, duration: StreamTimestamp) {
        self.duration.store(duration, Ordering::Relaxed);
    }

    /// Unix-epoch nanoseconds when the first payload sample was captured,
    /// or zero if unknown.
    pub fn capture_timestamp(&self) -> i64 {
        self.capture_timestamp.load(Ordering::Relaxed)
    }

    pub fn set_capture_timestamp(&self, cts: i64) {
        self.capture_timestamp.store(cts, Ordering::Relaxed);
    }

    /// Stream timestamp one past the last sample of the payload.
    pub fn end_timestamp(&self) -> StreamTimestamp {
        self.stream_timestamp.wrapping_add(self.duration())
    }
}

/// UDP view of a packet.
#[derive(Debug, Clone)]
pub struct Udp {
    /// Address the datagram came from.
    pub src_addr: SocketAddr,
    /// Address the datagram was received on or will be sent to.
    pub dst_addr: SocketAddr,
    /// Monotonic ns when the datagram was received (zero for outbound).
    pub receive_timestamp: i64,
}

/// One wire datagram plus its parsed views.
pub struct Packet {
    node: MpscNode,
    flags: AtomicU32,
    buffer: Bytes,
    rtp: OnceLock<Rtp>,
    udp: OnceLock<Udp>,
    _packet_slot: Option<PoolSlot>,
    _buffer_slot: Option<PoolSlot>,
}

/// Shared packet reference.
pub type PacketPtr = Arc<Packet>;

impl Packet {
    fn new(
        buffer: Bytes,
        packet_slot: Option<PoolSlot>,
        buffer_slot: Option<PoolSlot>,
    ) -> Self {
        Self {
            node: MpscNode::new(),
            flags: AtomicU32::new(0),
            buffer,
            rtp: OnceLock::new(),
            udp: OnceLock::new(),
            _packet_slot: packet_slot,
            _buffer_slot: buffer_slot,
        }
    }

    /// Raw wire bytes of the whole datagram.
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn add_flags(&self, flags: u32) {
        self.flags.fetch_or(flags, Ordering::Relaxed);
    }

    /// Checks that all of the given flag bits are set.
    pub fn has_flags(&self, flags: u32) -> bool {
        self.flags() & flags == flags
    }

    pub fn rtp(&self) -> Option<&Rtp> {
        self.rtp.get()
    }

    /// Attaches the parsed RTP view. May be done only once.
    pub fn set_rtp(&self, rtp: Rtp) {
        if self.rtp.set(rtp).is_err() {
            panic!("packet: rtp view already attached");
        }
        self.add_flags(flags::RTP);
    }

    pub fn udp(&self) -> Option<&Udp> {
        self.udp.get()
    }

    /// Attaches the UDP view. May be done only once.
    pub fn set_udp(&self, udp: Udp) {
        if self.udp.set(udp).is_err() {
            panic!("packet: udp view already attached");
        }
        self.add_flags(flags::UDP);
    }
}

impl HasMpscNode for Packet {
    fn mpsc_node(&self) -> &MpscNode {
        &self.node
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("flags", &self.flags())
            .field("len", &self.buffer.len())
            .field("rtp", &self.rtp.get())
            .finish()
    }
}

/// Produces pool-bounded packets and packet buffers.
#[derive(Clone)]
pub struct PacketFactory {
    packet_pool: ObjectPool,
    buffer_pool: BufferPool,
}

impl PacketFactory {
    /// Creates a factory with `capacity` packets and equally many buffers of
    /// `buffer_size` bytes.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            packet_pool: ObjectPool::new(capacity),
            buffer_pool: BufferPool::new(buffer_size, capacity),
        }
    }

    /// Maximum datagram size the factory can hold.
    pub fn buffer_size(&self) -> usize {
        self.buffer_pool.buffer_size()
    }

    /// Draws an empty wire buffer from the pool.
    pub fn new_buffer(&self) -> Result<PooledBuffer> {
        self.buffer_pool.allocate().ok_or(Error::NoMem)
    }

    /// Builds a packet around a buffer previously drawn from this factory.
    pub fn new_packet(&self, buffer: PooledBuffer) -> Result<PacketPtr> {
        let packet_slot = self.packet_pool.acquire().ok_or(Error::NoMem)?;
        let (bytes, buffer_slot) = buffer.freeze();
        Ok(Arc::new(Packet::new(
            bytes,
            Some(packet_slot),
            Some(buffer_slot),
        )))
    }

    /// Builds a packet around externally produced bytes (tests, FEC repair).
    pub fn new_packet_from_bytes(&self, bytes: Bytes) -> Result<PacketPtr> {
        let packet_slot = self.packet_pool.acquire().ok_or(Error::NoMem)?;
        Ok(Arc::new(Packet::new(bytes, Some(packet_slot), None)))
    }
}

/// Source of packets.
pub trait PacketReader {
    /// Returns the next packet, or `Err(Drain)` when nothing is available.
    fn read_packet(&mut self, mode: ReadMode) -> Result<PacketPtr>;
}

/// Sink of packets.
pub trait PacketWriter: Send {
    fn write_packet(&mut self, packet: PacketPtr) -> Result<()>;
}

/// Thread-safe handoff queue between the network loop and a session.
///
/// Any number of writers may push; a single consumer drains. This is the
/// decoupling point between the I/O threads and the pipeline threads.
pub struct ConcurrentQueue {
    queue: MpscQueue<Packet>,
    len: AtomicUsize,
}

impl ConcurrentQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: MpscQueue::new(),
            len: AtomicUsize::new(0),
        })
    }

    /// Pushes a packet; callable from any thread.
    pub fn push(&self, packet: PacketPtr) {
        self.queue.push(packet);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops the next packet; single consumer only.
    pub fn pop(&self) -> Option<PacketPtr> {
        let packet = self.queue.pop()?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Approximate number of queued packets.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a cloneable writer handle feeding this queue.
    pub fn writer(self: &Arc<Self>) -> ConcurrentQueueWriter {
        ConcurrentQueueWriter {
            queue: Arc::clone(self),
        }
    }
}

/// Writer handle for a [`ConcurrentQueue`].
#[derive(Clone)]
pub struct ConcurrentQueueWriter {
    queue: Arc<ConcurrentQueue>,
}

impl PacketWriter for ConcurrentQueueWriter {
    fn write_packet(&mut self, packet: PacketPtr) -> Result<()> {
        self.queue.push(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(factory: &PacketFactory, seqnum: Seqnum) -> PacketPtr {
        let mut buffer = factory.new_buffer().unwrap();
        buffer.extend_from_slice(&[0u8; 4]);
        let packet = factory.new_packet(buffer).unwrap();
        packet.set_rtp(Rtp::new(1, seqnum, 0, 10, false, packet.buffer().clone()));
        packet
    }

    #[test]
    fn factory_bounds_packets() {
        let factory = PacketFactory::new(64, 2);
        let a = make_packet(&factory, 0);
        let _b = make_packet(&factory, 1);
        assert!(matches!(factory.new_buffer(), Err(Error::NoMem)));
        drop(a);
        assert!(factory.new_buffer().is_ok());
    }

    #[test]
    fn flags_accumulate() {
        let factory = PacketFactory::new(64, 1);
        let buffer = factory.new_buffer().unwrap();
        let packet = factory.new_packet(buffer).unwrap();
        packet.add_flags(flags::UDP);
        packet.add_flags(flags::AUDIO);
        assert!(packet.has_flags(flags::UDP | flags::AUDIO));
        assert!(!packet.has_flags(flags::RTP));
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn double_rtp_view_panics() {
        let factory = PacketFactory::new(64, 1);
        let packet = factory.new_packet(factory.new_buffer().unwrap()).unwrap();
        packet.set_rtp(Rtp::new(1, 0, 0, 10, false, Bytes::new()));
        packet.set_rtp(Rtp::new(1, 0, 0, 10, false, Bytes::new()));
    }

    #[test]
    fn concurrent_queue_passes_packets() {
        let factory = PacketFactory::new(64, 8);
        let queue = ConcurrentQueue::new();
        let mut writer = queue.writer();
        for seqnum in 0..4 {
            writer.write_packet(make_packet(&factory, seqnum)).unwrap();
        }
        assert_eq!(queue.len(), 4);
        for seqnum in 0..4 {
            let packet = queue.pop().unwrap();
            assert_eq!(packet.rtp().unwrap().seqnum, seqnum);
        }
        assert!(queue.pop().is_none());
    }
}
