//! TCP connection port.
//!
//! The connection is driven by a state machine; every operation and poll
//! event is a transition, and only the transitions listed below are legal
//! (anything else is a programmer error and panics):
//!
//! ```text
//! Closed -> Opening -> Opened
//! Opened -> Connecting            (client: connect / server: accept)
//! Connecting -> Established | Refused
//! Established -> Broken           (I/O error)
//! any active state -> Terminating (async_terminate)
//! Terminating -> Terminated
//! any state -> Closing -> Closed  (close)
//! ```
//!
//! Most switches happen on the network loop thread, but a limited set is
//! allowed from other threads, so switching is done with atomic CAS. The
//! `was_established` and `was_failed` bits latch: once failed, always
//! failed, and the eventual socket teardown uses RST instead of FIN.
//!
//! `try_read`/`try_write` are callable from any thread; an internal I/O
//! mutex serializes them against each other and against socket teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::socket;
use crate::error::{Error, Result};
use crate::sync::RateLimiter;
use crate::time;

const STATS_REPORT_INTERVAL: i64 = 60 * time::SECOND;

// connection FSM states
const STATE_CLOSED: u8 = 0;
const STATE_OPENING: u8 = 1;
const STATE_OPENED: u8 = 2;
const STATE_CONNECTING: u8 = 3;
const STATE_REFUSED: u8 = 4;
const STATE_ESTABLISHED: u8 = 5;
const STATE_BROKEN: u8 = 6;
const STATE_TERMINATING: u8 = 7;
const STATE_TERMINATED: u8 = 8;
const STATE_CLOSING: u8 = 9;

// per-direction I/O status
const IO_NOT_AVAILABLE: u8 = 0;
const IO_AVAILABLE: u8 = 1;
const IO_IN_PROGRESS: u8 = 2;

/// How a connection is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Graceful FIN shutdown.
    Normal,
    /// RST reset; marks the connection failed.
    Failure,
}

/// Which peer initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpConnectionType {
    Client,
    Server,
}

/// Socket options shared by client and server configurations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TcpConnectionConfig {
    /// Disable Nagle's algorithm.
    pub disable_nagle: bool,
}

impl Default for TcpConnectionConfig {
    fn default() -> Self {
        Self {
            disable_nagle: true,
        }
    }
}

/// Client connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpClientConfig {
    /// Local address to bind before connecting; `None` for ephemeral.
    pub local_address: Option<SocketAddr>,
    /// Remote peer to connect to.
    pub remote_address: SocketAddr,
    /// Socket options.
    pub socket: TcpConnectionConfig,
}

/// Connection event callbacks.
///
/// Invoked on the network loop thread; implementations must not block. Each
/// underlying readable/writable edge produces at most one notification; the
/// status is re-armed by `try_read`/`try_write`.
pub trait ConnHandler: Send + Sync {
    fn on_refused(&self, _conn: &TcpConnectionPort) {}
    fn on_established(&self, _conn: &TcpConnectionPort) {}
    fn on_writable(&self, _conn: &TcpConnectionPort) {}
    fn on_readable(&self, _conn: &TcpConnectionPort) {}
    fn on_terminated(&self, _conn: &TcpConnectionPort) {}
    fn on_close_completed(&self, _conn: &TcpConnectionPort) {}
}

struct IoState {
    stream: Option<TcpStream>,
    got_stream_end: bool,
}

#[derive(Default)]
struct IoStats {
    rd_events: AtomicU64,
    wr_events: AtomicU64,
    rd_calls: AtomicU64,
    wr_calls: AtomicU64,
    rd_wouldblock: AtomicU64,
    wr_wouldblock: AtomicU64,
    rd_bytes: AtomicU64,
    wr_bytes: AtomicU64,
}

/// One TCP connection owned by a network loop.
pub struct TcpConnectionPort {
    kind: TcpConnectionType,

    state: AtomicU8,
    was_established: AtomicBool,
    was_failed: AtomicBool,

    writable_status: AtomicU8,
    readable_status: AtomicU8,

    io: Mutex<IoState>,

    local_address: Mutex<Option<SocketAddr>>,
    remote_address: Mutex<Option<SocketAddr>>,

    handler: Mutex<Option<Arc<dyn ConnHandler>>>,
    /// Posts the terminate continuation to the owning loop.
    terminator: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,

    stats: IoStats,
    report_limiter: RateLimiter,
}

impl TcpConnectionPort {
    pub(super) fn new(kind: TcpConnectionType) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: AtomicU8::new(STATE_CLOSED),
            was_established: AtomicBool::new(false),
            was_failed: AtomicBool::new(false),
            writable_status: AtomicU8::new(IO_NOT_AVAILABLE),
            readable_status: AtomicU8::new(IO_NOT_AVAILABLE),
            io: Mutex::new(IoState {
                stream: None,
                got_stream_end: false,
            }),
            local_address: Mutex::new(None),
            remote_address: Mutex::new(None),
            handler: Mutex::new(None),
            terminator: Mutex::new(None),
            stats: IoStats::default(),
            report_limiter: RateLimiter::new(STATS_REPORT_INTERVAL),
        })
    }

    pub fn connection_type(&self) -> TcpConnectionType {
        self.kind
    }

    /// Opens the connection object (loop thread).
    pub(super) fn open(&self, terminator: Box<dyn Fn() + Send + Sync>) {
        let state = self.current_state();
        if state != STATE_CLOSED {
            panic!(
                "tcp conn: unexpected connection state {} in open()",
                state_name(state)
            );
        }

        self.switch_and_report_state(STATE_OPENING);
        *self.terminator.lock() = Some(terminator);
        self.switch_and_report_state(STATE_OPENED);
    }

    /// Establishes the connection from an accepted socket (loop thread).
    pub(super) fn accept(
        &self,
        stream: TcpStream,
        server_address: SocketAddr,
        remote_address: SocketAddr,
        config: &TcpConnectionConfig,
    ) -> Result<()> {
        assert_eq!(self.kind, TcpConnectionType::Server);

        let state = self.current_state();
        if state != STATE_OPENED {
            panic!(
                "tcp conn: unexpected connection state {} in accept()",
                state_name(state)
            );
        }

        self.switch_and_report_state(STATE_CONNECTING);

        *self.local_address.lock() = Some(server_address);
        *self.remote_address.lock() = Some(remote_address);

        socket::tcp_setup(&stream, config.disable_nagle)?;
        self.io.lock().stream = Some(stream);

        log::debug!("[TcpConn] accepted connection: remote={remote_address}");

        self.switch_and_report_state(STATE_ESTABLISHED);

        Ok(())
    }

    /// Starts an asynchronous connect with an already created socket
    /// (loop thread). Completion arrives via poll events.
    pub(super) fn connect(
        &self,
        stream: TcpStream,
        config: &TcpClientConfig,
    ) -> Result<()> {
        assert_eq!(self.kind, TcpConnectionType::Client);

        let state = self.current_state();
        if state != STATE_OPENED {
            panic!(
                "tcp conn: unexpected connection state {} in connect()",
                state_name(state)
            );
        }

        self.switch_and_report_state(STATE_CONNECTING);

        *self.local_address.lock() = stream.local_addr().ok().or(config.local_address);
        *self.remote_address.lock() = Some(config.remote_address);

        socket::tcp_setup(&stream, config.socket.disable_nagle)?;
        self.io.lock().stream = Some(stream);

        log::debug!(
            "[TcpConn] initiated asynchronous connect: remote={}",
            config.remote_address
        );

        Ok(())
    }

    /// Attaches the event handler and reports the current state to it
    /// (loop thread).
    pub(super) fn attach_handler(&self, handler: Arc<dyn ConnHandler>) {
        let state = self.current_state();
        self.check_usable(state);

        {
            let mut slot = self.handler.lock();
            if slot.is_some() {
                panic!("tcp conn: already have handler");
            }
            *slot = Some(handler);
        }

        self.report_state(state);
    }

    /// Local peer address. Callable from any thread.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.check_usable(self.current_state());
        *self.local_address.lock()
    }

    /// Remote peer address. Callable from any thread.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.check_usable(self.current_state());
        *self.remote_address.lock()
    }

    /// True if the connection failed at any point. Latched.
    pub fn is_failed(&self) -> bool {
        self.check_usable(self.current_state());
        self.was_failed.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        let state = self.current_state();
        self.check_usable(state);
        if state != STATE_ESTABLISHED && state != STATE_BROKEN {
            return false;
        }
        self.writable_status.load(Ordering::Acquire) != IO_NOT_AVAILABLE
    }

    pub fn is_readable(&self) -> bool {
        let state = self.current_state();
        self.check_usable(state);
        if state != STATE_ESTABLISHED && state != STATE_BROKEN {
            return false;
        }
        self.readable_status.load(Ordering::Acquire) != IO_NOT_AVAILABLE
    }

    /// Non-blocking write. Callable from any thread.
    ///
    /// After an error, all subsequent writes return `Failure`.
    pub fn try_write(&self, buf: &[u8]) -> Result<usize> {
        let io = self.io.lock();

        let state = self.current_state();
        self.check_usable_for_io(state);

        if state != STATE_ESTABLISHED {
            return Err(Error::Failure);
        }

        let stream = match io.stream.as_ref() {
            Some(stream) => stream,
            None => return Err(Error::Failure),
        };

        self.writable_status.store(IO_IN_PROGRESS, Ordering::Release);

        let result = socket::tcp_try_send(stream, buf);

        let next = if result.is_ok() {
            IO_AVAILABLE
        } else {
            IO_NOT_AVAILABLE
        };
        let _ = self.writable_status.compare_exchange(
            IO_IN_PROGRESS,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        self.stats.wr_calls.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(n) => {
                self.stats.wr_bytes.fetch_add(*n as u64, Ordering::Relaxed);
            }
            Err(Error::WouldBlock) => {
                self.stats.wr_wouldblock.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.maybe_switch_state(STATE_ESTABLISHED, STATE_BROKEN);
            }
        }

        drop(io);
        self.report_io_stats();

        result
    }

    /// Non-blocking read. Callable from any thread.
    ///
    /// After the peer's graceful shutdown, reads return `StreamEnd` while
    /// writes keep working; after an error, reads return `Failure`.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut io = self.io.lock();

        let state = self.current_state();
        self.check_usable_for_io(state);

        if state != STATE_ESTABLISHED {
            return Err(Error::Failure);
        }

        if io.got_stream_end {
            return Err(Error::StreamEnd);
        }

        let stream = match io.stream.as_ref() {
            Some(stream) => stream,
            None => return Err(Error::Failure),
        };

        self.readable_status.store(IO_IN_PROGRESS, Ordering::Release);

        let result = socket::tcp_try_recv(stream, buf);

        let next = if result.is_ok() {
            IO_AVAILABLE
        } else {
            IO_NOT_AVAILABLE
        };
        let _ = self.readable_status.compare_exchange(
            IO_IN_PROGRESS,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        self.stats.rd_calls.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(n) => {
                self.stats.rd_bytes.fetch_add(*n as u64, Ordering::Relaxed);
            }
            Err(Error::WouldBlock) => {
                self.stats.rd_wouldblock.fetch_add(1, Ordering::Relaxed);
            }
            Err(Error::StreamEnd) => {
                io.got_stream_end = true;
            }
            Err(_) => {
                self.maybe_switch_state(STATE_ESTABLISHED, STATE_BROKEN);
            }
        }

        drop(io);
        self.report_io_stats();

        result
    }

    /// Initiates asynchronous shutdown. Callable from any thread.
    ///
    /// The owner is notified via `ConnHandler::on_terminated` after the OS
    /// socket is torn down on the loop thread. Must not be called twice.
    pub fn async_terminate(&self, mode: TerminationMode) {
        loop {
            let state = self.current_state();

            if state == STATE_TERMINATING {
                panic!("tcp conn: can't call async_terminate() twice");
            }

            self.check_usable(state);

            if self.maybe_switch_state(state, STATE_TERMINATING) {
                break;
            }
        }

        log::debug!("[TcpConn] initiating asynchronous terminate: mode={mode:?}");

        if mode == TerminationMode::Failure {
            self.was_failed.store(true, Ordering::Release);
        }

        let terminator = self.terminator.lock();
        match terminator.as_ref() {
            Some(terminator) => terminator(),
            None => panic!("tcp conn: terminate before open()"),
        }
    }

    /// Finishes termination on the loop thread: stops polling, tears the
    /// socket down with FIN or RST, and reports `on_terminated`.
    pub(super) fn terminate_on_loop(&self) {
        debug_assert_eq!(self.current_state(), STATE_TERMINATING);

        let stream = self.io.lock().stream.take();

        if let Some(stream) = stream {
            let graceful = self.was_established.load(Ordering::Acquire)
                && !self.was_failed.load(Ordering::Acquire);

            if graceful {
                log::debug!("[TcpConn] performing graceful shutdown");
                if socket::tcp_shutdown_write(&stream).is_err() {
                    self.was_failed.store(true, Ordering::Release);
                    let _ = socket::tcp_arm_reset(&stream);
                }
            } else {
                log::debug!("[TcpConn] closing socket with reset");
                let _ = socket::tcp_arm_reset(&stream);
            }
            // dropping the stream closes the descriptor and removes it from
            // the poller
            drop(stream);
        }

        self.switch_and_report_state(STATE_TERMINATED);
        self.handler.lock().take();
    }

    /// Final close step before the port is released (loop thread).
    pub(super) fn close_on_loop(&self) {
        let state = self.current_state();
        if state != STATE_OPENING && state != STATE_OPENED && state != STATE_TERMINATED {
            panic!(
                "tcp conn: unexpected connection state {} in close()",
                state_name(state)
            );
        }

        self.terminator.lock().take();

        self.switch_and_report_state(STATE_CLOSING);
        self.switch_and_report_state(STATE_CLOSED);

        log::debug!("[TcpConn] closed connection");
    }

    /// True once the FSM reached its terminal states for removal.
    pub(super) fn is_terminated(&self) -> bool {
        self.current_state() == STATE_TERMINATED
    }

    pub(super) fn is_terminating(&self) -> bool {
        self.current_state() == STATE_TERMINATING
    }

    pub(super) fn needs_terminate(&self) -> bool {
        matches!(
            self.current_state(),
            STATE_CONNECTING | STATE_REFUSED | STATE_ESTABLISHED | STATE_BROKEN
        )
    }

    /// Loop-side terminate used during port removal; unlike
    /// [`async_terminate`](Self::async_terminate) it tolerates any state.
    pub(super) fn force_terminate(&self) {
        loop {
            let state = self.current_state();
            if state == STATE_TERMINATING || state == STATE_TERMINATED {
                return;
            }
            if self.maybe_switch_state(state, STATE_TERMINATING) {
                return;
            }
        }
    }

    /// Dispatches one poll event (loop thread).
    pub(super) fn handle_event(
        &self,
        readable: bool,
        writable: bool,
        is_error: bool,
        read_closed: bool,
    ) {
        let state = self.current_state();

        if state == STATE_CONNECTING {
            if is_error {
                log::debug!("[TcpConn] poll failed during asynchronous connect");
                self.switch_and_report_state(STATE_REFUSED);
                return;
            }

            if writable {
                let outcome = {
                    let io = self.io.lock();
                    io.stream.as_ref().map(socket::finish_connect)
                };
                match outcome {
                    Some(Ok(())) => {
                        log::debug!("[TcpConn] asynchronous connect succeeded");
                        self.switch_and_report_state(STATE_ESTABLISHED);
                    }
                    Some(Err(Error::WouldBlock)) => {}
                    _ => {
                        log::debug!("[TcpConn] asynchronous connect failed");
                        self.switch_and_report_state(STATE_REFUSED);
                    }
                }
            }
            return;
        }

        if state == STATE_ESTABLISHED {
            if is_error {
                log::debug!("[TcpConn] poll failed");
                self.switch_and_report_state(STATE_BROKEN);
                self.set_and_report_readable();
                self.set_and_report_writable();
                return;
            }

            if writable {
                self.set_and_report_writable();
            }
            if readable || read_closed {
                self.set_and_report_readable();
            }
            return;
        }

        log::trace!(
            "[TcpConn] ignoring poll event in state {}",
            state_name(state)
        );
    }

    fn set_and_report_writable(&self) {
        self.stats.wr_events.fetch_add(1, Ordering::Relaxed);
        self.writable_status.store(IO_AVAILABLE, Ordering::Release);

        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_writable(self);
        }
    }

    fn set_and_report_readable(&self) {
        self.stats.rd_events.fetch_add(1, Ordering::Relaxed);
        self.readable_status.store(IO_AVAILABLE, Ordering::Release);

        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_readable(self);
        }
    }

    fn current_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn switch_and_report_state(&self, new_state: u8) {
        if new_state == STATE_TERMINATED {
            // report first so the user may still access the connection in
            // the termination callback
            self.report_state(STATE_TERMINATED);

            if !self.maybe_switch_state(STATE_TERMINATING, STATE_TERMINATED) {
                panic!(
                    "tcp conn: unexpected connection state {} when terminating",
                    state_name(self.current_state())
                );
            }
            return;
        }

        loop {
            let old_state = self.current_state();
            if old_state == new_state {
                return;
            }
            if self.maybe_switch_state(old_state, new_state) {
                break;
            }
        }

        self.report_state(new_state);
    }

    fn maybe_switch_state(&self, expected: u8, desired: u8) -> bool {
        // latch even if the switch is dropped below
        if desired == STATE_ESTABLISHED {
            self.was_established.store(true, Ordering::Release);
        } else if desired == STATE_REFUSED || desired == STATE_BROKEN {
            self.was_failed.store(true, Ordering::Release);
        }

        // after termination begins only terminate/close transitions apply;
        // everything else is silently dropped
        if (expected == STATE_TERMINATING
            && desired != STATE_TERMINATED
            && desired != STATE_CLOSING)
            || (expected == STATE_TERMINATED && desired != STATE_CLOSING)
        {
            return true;
        }

        if self
            .state
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        log::debug!(
            "[TcpConn] switched connection state: {} -> {}",
            state_name(expected),
            state_name(desired)
        );

        true
    }

    fn report_state(&self, state: u8) {
        let handler = self.handler.lock().clone();
        let handler = match handler {
            Some(handler) => handler,
            None => return,
        };

        match state {
            STATE_REFUSED => handler.on_refused(self),
            STATE_ESTABLISHED => handler.on_established(self),
            STATE_TERMINATED => handler.on_terminated(self),
            _ => {}
        }
    }

    fn check_usable(&self, state: u8) {
        match state {
            STATE_OPENING | STATE_OPENED => {
                panic!("tcp conn: attempt to use connection before accept() or connect()")
            }
            STATE_CONNECTING
            | STATE_REFUSED
            | STATE_ESTABLISHED
            | STATE_BROKEN
            | STATE_TERMINATING => {}
            STATE_TERMINATED => {
                panic!("tcp conn: attempt to use connection after termination")
            }
            _ => panic!("tcp conn: attempt to use connection after close"),
        }
    }

    fn check_usable_for_io(&self, state: u8) {
        match state {
            STATE_REFUSED | STATE_ESTABLISHED | STATE_BROKEN => {}
            _ => panic!(
                "tcp conn: attempt to do io before connection is established \
                 or after termination"
            ),
        }
    }

    fn report_io_stats(&self) {
        if !self.report_limiter.allow() {
            return;
        }

        log::debug!(
            "[TcpConn] (r/w) events={}/{} calls={}/{} wb={}/{} bytes={}K/{}K",
            self.stats.rd_events.load(Ordering::Relaxed),
            self.stats.wr_events.load(Ordering::Relaxed),
            self.stats.rd_calls.load(Ordering::Relaxed),
            self.stats.wr_calls.load(Ordering::Relaxed),
            self.stats.rd_wouldblock.load(Ordering::Relaxed),
            self.stats.wr_wouldblock.load(Ordering::Relaxed),
            self.stats.rd_bytes.load(Ordering::Relaxed) / 1024,
            self.stats.wr_bytes.load(Ordering::Relaxed) / 1024,
        );
    }
}

fn state_name(state: u8) -> &'static str {
    match state {
        STATE_CLOSED => "closed",
        STATE_OPENING => "opening",
        STATE_OPENED => "opened",
        STATE_CONNECTING => "connecting",
        STATE_REFUSED => "refused",
        STATE_ESTABLISHED => "established",
        STATE_BROKEN => "broken",
        STATE_TERMINATING => "terminating",
        STATE_TERMINATED => "terminated",
        STATE_CLOSING => "closing",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    /// Builds an accepted mio stream pair without a poller.
    fn stream_pair() -> (TcpStream, std::net::TcpStream, SocketAddr, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(server_addr).unwrap();
        let (accepted, remote_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (
            TcpStream::from_std(accepted),
            peer,
            server_addr,
            remote_addr,
        )
    }

    fn accepted_port() -> (Arc<TcpConnectionPort>, std::net::TcpStream) {
        let (stream, peer, server_addr, remote_addr) = stream_pair();
        let conn = TcpConnectionPort::new(TcpConnectionType::Server);
        conn.open(Box::new(|| {}));
        conn.accept(
            stream,
            server_addr,
            remote_addr,
            &TcpConnectionConfig::default(),
        )
        .unwrap();
        (conn, peer)
    }

    #[test]
    fn accept_establishes_connection() {
        let (conn, _peer) = accepted_port();
        assert!(!conn.is_failed());
        assert!(conn.local_address().is_some());
        assert!(conn.remote_address().is_some());
    }

    #[test]
    fn write_and_read_round_trip() {
        let (conn, mut peer) = accepted_port();

        assert_eq!(conn.try_write(b"ping").unwrap(), 4);

        peer.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 4];
        std::io::Read::read_exact(&mut peer, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        // wait for the data to arrive through loopback
        let mut out = [0u8; 4];
        let mut got = 0;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while got < 4 && std::time::Instant::now() < deadline {
            match conn.try_read(&mut out[got..]) {
                Ok(n) => got += n,
                Err(Error::WouldBlock) => std::thread::yield_now(),
                Err(err) => panic!("unexpected read error: {err:?}"),
            }
        }
        assert_eq!(&out, b"pong");
    }

    #[test]
    fn peer_shutdown_yields_stream_end_then_writes_still_work() {
        let (conn, peer) = accepted_port();

        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let mut buf = [0u8; 16];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match conn.try_read(&mut buf) {
                Err(Error::StreamEnd) => break,
                Err(Error::WouldBlock) if std::time::Instant::now() < deadline => {
                    std::thread::yield_now()
                }
                other => panic!("expected StreamEnd, got {other:?}"),
            }
        }
        // latched
        assert!(matches!(conn.try_read(&mut buf), Err(Error::StreamEnd)));
        // write direction remains open
        assert!(conn.try_write(b"still here").is_ok());
        assert!(!conn.is_failed());
    }

    #[test]
    fn graceful_terminate_keeps_was_failed_clear() {
        let (conn, _peer) = accepted_port();

        let terminated = Arc::new(AtomicUsize::new(0));
        struct Handler(Arc<AtomicUsize>);
        impl ConnHandler for Handler {
            fn on_terminated(&self, _conn: &TcpConnectionPort) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        conn.attach_handler(Arc::new(Handler(terminated.clone())));

        conn.async_terminate(TerminationMode::Normal);
        conn.terminate_on_loop();

        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert!(conn.is_terminated());
        assert!(!conn.was_failed.load(Ordering::SeqCst));

        conn.close_on_loop();
        assert_eq!(conn.current_state(), STATE_CLOSED);
    }

    #[test]
    fn failure_terminate_latches_was_failed() {
        let (conn, _peer) = accepted_port();
        conn.async_terminate(TerminationMode::Failure);
        conn.terminate_on_loop();
        assert!(conn.was_failed.load(Ordering::SeqCst));
        conn.close_on_loop();
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn double_terminate_panics() {
        let (conn, _peer) = accepted_port();
        conn.async_terminate(TerminationMode::Normal);
        conn.async_terminate(TerminationMode::Normal);
    }

    #[test]
    fn readable_edge_notifies_once() {
        let (conn, mut peer) = accepted_port();

        let notified = Arc::new(AtomicUsize::new(0));
        struct Handler(Arc<AtomicUsize>);
        impl ConnHandler for Handler {
            fn on_readable(&self, _conn: &TcpConnectionPort) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        conn.attach_handler(Arc::new(Handler(notified.clone())));

        peer.write_all(b"x").unwrap();
        conn.handle_event(true, false, false, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(conn.is_readable());

        // draining to WouldBlock re-arms the edge
        let mut buf = [0u8; 8];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match conn.try_read(&mut buf) {
                Ok(_) => continue,
                Err(Error::WouldBlock) => break,
                Err(err) if std::time::Instant::now() < deadline => {
                    panic!("unexpected: {err:?}")
                }
                Err(err) => panic!("unexpected: {err:?}"),
            }
        }
        assert!(!conn.is_readable());
    }
}
