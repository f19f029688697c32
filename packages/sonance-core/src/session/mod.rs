//! Per-peer sender and receiver sessions.

mod receiver;
mod sender;

pub use receiver::{
    ReceiverBackend, ReceiverCommand, ReceiverConfig, ReceiverMetrics, ReceiverSession,
};
pub use sender::{SenderBackend, SenderCommand, SenderConfig, SenderFecConfig, SenderSession};

use std::net::SocketAddr;

use crate::error::Result;
use crate::packet::{PacketPtr, PacketWriter, Udp};

/// Writer stage that stamps outbound packets with their UDP destination.
pub struct AddressedWriter {
    inner: Box<dyn PacketWriter>,
    src_addr: SocketAddr,
    dst_addr: SocketAddr,
}

impl AddressedWriter {
    pub fn new(inner: Box<dyn PacketWriter>, src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            inner,
            src_addr,
            dst_addr,
        }
    }
}

impl PacketWriter for AddressedWriter {
    fn write_packet(&mut self, packet: PacketPtr) -> Result<()> {
        packet.set_udp(Udp {
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            receive_timestamp: 0,
        });
        self.inner.write_packet(packet)
    }
}
