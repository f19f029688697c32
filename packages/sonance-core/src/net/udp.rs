//! UDP port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::UdpSocket;
use mio::Waker;
use parking_lot::Mutex;

use super::socket::{self, UdpConfig};
use super::task::NetworkTask;
use crate::error::Result;
use crate::packet::{self, Packet, PacketFactory, PacketPtr, PacketWriter, Udp};
use crate::sync::{MpscQueue, RateLimiter};
use crate::time;

const STATS_REPORT_INTERVAL: i64 = 20 * time::SECOND;

/// Outcome of draining the outbound queue on the loop thread.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum DrainOutcome {
    /// Everything pending was handed to the kernel.
    Drained,
    /// The kernel pushed back; resume when the socket is writable again.
    WouldBlock,
}

/// Bound UDP socket with inbound dispatch and an outbound queue.
///
/// Inbound datagrams become pooled packets (RTP|UDP flags, receive timestamp
/// from the monotonic clock) and go to the attached inbound writer on the
/// loop thread. Outbound packets first try a lock-free non-blocking
/// `send_to`; when the kernel pushes back they travel through the MPSC queue
/// and are drained by the loop thread.
pub struct UdpPort {
    config: UdpConfig,
    socket: UdpSocket,
    factory: PacketFactory,
    waker: Arc<Waker>,

    inbound_writer: Mutex<Option<Box<dyn PacketWriter>>>,
    outbound_queue: MpscQueue<Packet>,
    /// Head-of-line packet that hit `WouldBlock` during a drain; resent
    /// first so ordering is preserved.
    stalled: Mutex<Option<PacketPtr>>,

    pending_packets: AtomicUsize,
    want_close: AtomicBool,
    recv_started: AtomicBool,
    send_started: AtomicBool,
    multicast_joined: AtomicBool,

    /// Remove-port task parked until pending packets drain.
    pub(super) close_waiter: Mutex<Option<Arc<NetworkTask>>>,

    received_packets: AtomicU64,
    sent_packets: AtomicU64,
    sent_packets_nb: AtomicU64,
    report_limiter: RateLimiter,
}

impl UdpPort {
    pub(super) fn new(
        config: UdpConfig,
        socket: UdpSocket,
        factory: PacketFactory,
        waker: Arc<Waker>,
    ) -> Arc<Self> {
        log::debug!("[UdpPort] opened port: bind={}", config.bind_address);
        Arc::new(Self {
            config,
            socket,
            factory,
            waker,
            inbound_writer: Mutex::new(None),
            outbound_queue: MpscQueue::new(),
            stalled: Mutex::new(None),
            pending_packets: AtomicUsize::new(0),
            want_close: AtomicBool::new(false),
            recv_started: AtomicBool::new(false),
            send_started: AtomicBool::new(false),
            multicast_joined: AtomicBool::new(false),
            close_waiter: Mutex::new(None),
            received_packets: AtomicU64::new(0),
            sent_packets: AtomicU64::new(0),
            sent_packets_nb: AtomicU64::new(0),
            report_limiter: RateLimiter::new(STATS_REPORT_INTERVAL),
        })
    }

    /// Actual bound address.
    pub fn bind_address(&self) -> SocketAddr {
        self.config.bind_address
    }

    /// Number of packets accepted for sending but not yet handed to the
    /// kernel.
    pub fn num_pending_packets(&self) -> usize {
        self.pending_packets.load(Ordering::SeqCst)
    }

    /// Total datagrams sent so far.
    pub fn num_sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    /// Total datagrams received so far.
    pub fn num_received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    /// Enables sending and returns a writer usable from any thread.
    pub(super) fn start_send(self: &Arc<Self>) -> UdpWriter {
        self.send_started.store(true, Ordering::Release);
        UdpWriter {
            port: Arc::clone(self),
        }
    }

    /// Enables receiving; packets go to `writer` on the loop thread.
    pub(super) fn start_recv(&self, writer: Box<dyn PacketWriter>) -> Result<()> {
        if let Some(interface) = self.config.multicast_interface {
            if !self.multicast_joined.load(Ordering::Acquire) {
                socket::udp_join_multicast(
                    &self.socket,
                    &self.config.bind_address,
                    interface,
                )?;
                self.multicast_joined.store(true, Ordering::Release);
                log::debug!("[UdpPort] joined multicast group");
            }
        }

        *self.inbound_writer.lock() = Some(writer);
        self.recv_started.store(true, Ordering::Release);
        Ok(())
    }

    /// Sends one packet. Callable from any thread.
    ///
    /// Packets must carry a UDP view with the destination address.
    pub fn write_packet(&self, packet: &PacketPtr) -> Result<()> {
        let dst_addr = match packet.udp() {
            Some(udp) => udp.dst_addr,
            None => panic!("udp port: unexpected packet without udp view"),
        };
        if packet.buffer().is_empty() {
            panic!("udp port: unexpected packet without buffer");
        }
        if !self.send_started.load(Ordering::Acquire) {
            panic!("udp port: attempt to send before start_send()");
        }
        if self.want_close.load(Ordering::Acquire) {
            panic!("udp port: attempt to use closed sender");
        }

        let had_pending = self.pending_packets.fetch_add(1, Ordering::SeqCst) > 0;
        if !had_pending && self.config.enable_non_blocking {
            match self.socket.send_to(packet.buffer(), dst_addr) {
                Ok(_) => {
                    self.pending_packets.fetch_sub(1, Ordering::SeqCst);
                    self.sent_packets.fetch_add(1, Ordering::Relaxed);
                    self.sent_packets_nb.fetch_add(1, Ordering::Relaxed);
                    self.report_stats();
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    log::error!("[UdpPort] can't send packet: dst={dst_addr} err={err}");
                    // fall through to the queue; the loop retries or drops
                }
            }
        }

        self.outbound_queue.push(Arc::clone(packet));
        if self.waker.wake().is_err() {
            log::error!("[UdpPort] can't wake up event loop");
        }

        self.report_stats();
        Ok(())
    }

    /// Receives all available datagrams (loop thread).
    pub(super) fn handle_readable(&self) {
        if !self.recv_started.load(Ordering::Acquire) {
            // datagrams stay in the kernel buffer until receiving starts
            return;
        }
        loop {
            let mut buffer = match self.factory.new_buffer() {
                Ok(buffer) => buffer,
                Err(_) => {
                    log::error!("[UdpPort] can't allocate buffer, dropping datagram");
                    // consume the datagram into a scratch buffer so the
                    // edge-triggered poller does not stall
                    let mut scratch = [0u8; 2048];
                    let _ = self.socket.recv_from(&mut scratch);
                    return;
                }
            };
            buffer.resize(self.factory.buffer_size(), 0);

            let (nread, src_addr) = match self.socket.recv_from(&mut buffer[..]) {
                Ok((nread, src_addr)) => (nread, src_addr),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::error!("[UdpPort] network error: err={err}");
                    return;
                }
            };

            if nread == 0 {
                log::trace!("[UdpPort] empty packet: src={src_addr}");
                continue;
            }

            buffer.truncate(nread);

            self.received_packets.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "[UdpPort] received packet: num={} src={} dst={} nread={}",
                self.received_packets.load(Ordering::Relaxed),
                src_addr,
                self.config.bind_address,
                nread
            );

            let packet = match self.factory.new_packet(buffer) {
                Ok(packet) => packet,
                Err(_) => {
                    log::error!("[UdpPort] can't allocate packet");
                    continue;
                }
            };

            packet.add_flags(packet::flags::UDP);
            packet.set_udp(Udp {
                src_addr,
                dst_addr: self.config.bind_address,
                receive_timestamp: time::monotonic_ns(),
            });

            let mut writer = self.inbound_writer.lock();
            if let Some(writer) = writer.as_mut() {
                if let Err(err) = writer.write_packet(packet) {
                    log::error!(
                        "[UdpPort] can't write packet to inbound writer: status={}",
                        err.code()
                    );
                }
            }
        }
    }

    /// Drains the outbound queue (loop thread).
    pub(super) fn drain_outbound(&self) -> DrainOutcome {
        loop {
            let packet = match self.stalled.lock().take() {
                Some(packet) => packet,
                None => match self.outbound_queue.try_pop() {
                    Some(packet) => packet,
                    None => return DrainOutcome::Drained,
                },
            };

            let dst_addr = packet.udp().expect("checked on write").dst_addr;

            match self.socket.send_to(packet.buffer(), dst_addr) {
                Ok(_) => {
                    self.pending_packets.fetch_sub(1, Ordering::SeqCst);
                    self.sent_packets.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    *self.stalled.lock() = Some(packet);
                    return DrainOutcome::WouldBlock;
                }
                Err(err) => {
                    log::error!(
                        "[UdpPort] can't send packet: dst={dst_addr} err={err}"
                    );
                    self.pending_packets.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// True when there is queued outbound work for the loop to push.
    pub(super) fn has_outbound_backlog(&self) -> bool {
        self.pending_packets.load(Ordering::SeqCst) > 0
    }

    /// Initiates closing; returns true when the port can be released
    /// immediately (no packets in flight).
    pub(super) fn begin_close(&self) -> bool {
        self.want_close.store(true, Ordering::SeqCst);

        if self.multicast_joined.swap(false, Ordering::AcqRel) {
            if let Some(interface) = self.config.multicast_interface {
                let _ = socket::udp_leave_multicast(
                    &self.socket,
                    &self.config.bind_address,
                    interface,
                );
                log::debug!("[UdpPort] left multicast group");
            }
        }

        self.recv_started.store(false, Ordering::Release);
        self.inbound_writer.lock().take();

        self.pending_packets.load(Ordering::SeqCst) == 0
    }

    pub(super) fn wants_close(&self) -> bool {
        self.want_close.load(Ordering::SeqCst)
    }

    fn report_stats(&self) {
        if !self.report_limiter.allow() {
            return;
        }

        let sent = self.sent_packets.load(Ordering::Relaxed);
        let sent_nb = self.sent_packets_nb.load(Ordering::Relaxed);
        log::debug!(
            "[UdpPort] recv={} send={} send_nb={}",
            self.received_packets.load(Ordering::Relaxed),
            sent,
            sent_nb,
        );
    }
}

impl Drop for UdpPort {
    fn drop(&mut self) {
        log::debug!("[UdpPort] closed port: bind={}", self.config.bind_address);
    }
}

/// Cloneable outbound packet writer for a UDP port.
///
/// Obtained from a successful `StartUdpSend` task; does not block the
/// caller.
#[derive(Clone)]
pub struct UdpWriter {
    port: Arc<UdpPort>,
}

impl UdpWriter {
    /// The port this writer feeds.
    pub fn port(&self) -> &Arc<UdpPort> {
        &self.port
    }
}

impl PacketWriter for UdpWriter {
    fn write_packet(&mut self, packet: PacketPtr) -> Result<()> {
        self.port.write_packet(&packet)
    }
}

impl std::fmt::Debug for UdpPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPort")
            .field("bind", &self.config.bind_address)
            .field("pending", &self.num_pending_packets())
            .finish()
    }
}
