//! Network loop tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::socket::UdpConfig;
use super::tcp_conn::{TcpClientConfig, TcpConnectionPort};
use super::tcp_server::{ConnAcceptor, TcpServerConfig};
use super::udp::UdpWriter;
use crate::packet::PacketWriter;
use crate::sync::{HasMpscNode, MpscNode, Semaphore};

pub(super) const STATE_INITIALIZED: u8 = 0;
pub(super) const STATE_PENDING: u8 = 1;
pub(super) const STATE_CLOSING_PORT: u8 = 2;
pub(super) const STATE_FINISHING: u8 = 3;
pub(super) const STATE_FINISHED: u8 = 4;

/// Opaque handle of a port owned by a network loop.
///
/// Handles are arena indices plus a generation, so a stale handle for a
/// removed port is detected instead of addressing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle {
    pub(super) index: u32,
    pub(super) generation: u32,
}

pub(super) type TaskCompleter = Box<dyn FnOnce(&NetworkTask) + Send>;

pub(super) enum TaskKind {
    AddUdpPort {
        config: UdpConfig,
        handle: Option<PortHandle>,
    },
    StartUdpSend {
        handle: PortHandle,
        writer: Option<UdpWriter>,
    },
    StartUdpRecv {
        handle: PortHandle,
        writer: Option<Box<dyn PacketWriter>>,
    },
    AddTcpServer {
        config: TcpServerConfig,
        acceptor: Option<Box<dyn ConnAcceptor>>,
        handle: Option<PortHandle>,
    },
    AddTcpClient {
        config: TcpClientConfig,
        handler: Option<Arc<dyn super::tcp_conn::ConnHandler>>,
        handle: Option<PortHandle>,
        conn: Option<Arc<TcpConnectionPort>>,
    },
    RemovePort {
        handle: PortHandle,
    },
    ResolveEndpoint {
        host: String,
        port: u16,
        result: Option<Option<SocketAddr>>,
    },
    /// Internal: finish an `async_terminate()` on the loop thread.
    TerminateConn {
        handle: PortHandle,
    },
}

/// Unit of work executed on the network loop thread.
///
/// Constructed with one of the `new_*` functions, submitted via
/// `NetworkLoop::schedule` or `schedule_and_wait`, and must be kept alive
/// until its completion callback has run (or the wait returned).
pub struct NetworkTask {
    node: MpscNode,
    pub(super) state: AtomicU8,
    pub(super) success: AtomicBool,
    pub(super) kind: Mutex<TaskKind>,
    pub(super) completer: Mutex<Option<TaskCompleter>>,
    pub(super) sem: Mutex<Option<Arc<Semaphore>>>,
}

impl NetworkTask {
    fn new(kind: TaskKind) -> Arc<Self> {
        Arc::new(Self {
            node: MpscNode::new(),
            state: AtomicU8::new(STATE_INITIALIZED),
            success: AtomicBool::new(false),
            kind: Mutex::new(kind),
            completer: Mutex::new(None),
            sem: Mutex::new(None),
        })
    }

    /// Add a UDP datagram sender/receiver port bound per `config`.
    pub fn new_add_udp_port(config: UdpConfig) -> Arc<Self> {
        Self::new(TaskKind::AddUdpPort {
            config,
            handle: None,
        })
    }

    /// Start sending on a UDP port; on success the task carries an outbound
    /// packet writer usable from any thread.
    pub fn new_start_udp_send(handle: PortHandle) -> Arc<Self> {
        Self::new(TaskKind::StartUdpSend {
            handle,
            writer: None,
        })
    }

    /// Start receiving on a UDP port; received packets go to `writer` on the
    /// loop thread, which must not block.
    pub fn new_start_udp_recv(handle: PortHandle, writer: Box<dyn PacketWriter>) -> Arc<Self> {
        Self::new(TaskKind::StartUdpRecv {
            handle,
            writer: Some(writer),
        })
    }

    /// Add a TCP server port; `acceptor` produces a handler for every
    /// accepted connection.
    pub fn new_add_tcp_server(
        config: TcpServerConfig,
        acceptor: Box<dyn ConnAcceptor>,
    ) -> Arc<Self> {
        Self::new(TaskKind::AddTcpServer {
            config,
            acceptor: Some(acceptor),
            handle: None,
        })
    }

    /// Add a TCP client port connecting to the configured remote address.
    pub fn new_add_tcp_client(
        config: TcpClientConfig,
        handler: Arc<dyn super::tcp_conn::ConnHandler>,
    ) -> Arc<Self> {
        Self::new(TaskKind::AddTcpClient {
            config,
            handler: Some(handler),
            handle: None,
            conn: None,
        })
    }

    /// Remove a port, closing it asynchronously first.
    pub fn new_remove_port(handle: PortHandle) -> Arc<Self> {
        Self::new(TaskKind::RemovePort { handle })
    }

    /// Resolve a hostname to a socket address.
    pub fn new_resolve_endpoint(host: impl Into<String>, port: u16) -> Arc<Self> {
        Self::new(TaskKind::ResolveEndpoint {
            host: host.into(),
            port,
            result: None,
        })
    }

    pub(super) fn new_terminate_conn(handle: PortHandle) -> Arc<Self> {
        Self::new(TaskKind::TerminateConn { handle })
    }

    /// True once the task finished and succeeded.
    pub fn success(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FINISHED
            && self.success.load(Ordering::Acquire)
    }

    /// True once the task finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FINISHED
    }

    /// Actual bound address of the created UDP port. Valid only after
    /// `success()`; the loop writes it back into the task's config.
    pub fn udp_bind_address(&self) -> Option<SocketAddr> {
        match &*self.kind.lock() {
            TaskKind::AddUdpPort { config, .. } => Some(config.bind_address),
            _ => None,
        }
    }

    /// Actual bound address of the created TCP server. Valid only after
    /// `success()`.
    pub fn server_bind_address(&self) -> Option<SocketAddr> {
        match &*self.kind.lock() {
            TaskKind::AddTcpServer { config, .. } => Some(config.bind_address),
            _ => None,
        }
    }

    /// Handle of the created port. Valid only after `success()`.
    pub fn port_handle(&self) -> Option<PortHandle> {
        match &*self.kind.lock() {
            TaskKind::AddUdpPort { handle, .. } => *handle,
            TaskKind::AddTcpServer { handle, .. } => *handle,
            TaskKind::AddTcpClient { handle, .. } => *handle,
            _ => None,
        }
    }

    /// Writer for outbound packets. Valid only after a successful
    /// `StartUdpSend`.
    pub fn take_outbound_writer(&self) -> Option<UdpWriter> {
        match &mut *self.kind.lock() {
            TaskKind::StartUdpSend { writer, .. } => writer.take(),
            _ => None,
        }
    }

    /// Connection created by a successful `AddTcpClient`.
    pub fn connection(&self) -> Option<Arc<TcpConnectionPort>> {
        match &*self.kind.lock() {
            TaskKind::AddTcpClient { conn, .. } => conn.clone(),
            _ => None,
        }
    }

    /// Resolved address. Valid only after a successful `ResolveEndpoint`.
    pub fn resolved_address(&self) -> Option<SocketAddr> {
        match &*self.kind.lock() {
            TaskKind::ResolveEndpoint { result, .. } => (*result).flatten(),
            _ => None,
        }
    }
}

impl HasMpscNode for NetworkTask {
    fn mpsc_node(&self) -> &MpscNode {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_task_is_not_finished() {
        let task = NetworkTask::new_add_udp_port(UdpConfig::default());
        assert!(!task.is_finished());
        assert!(!task.success());
        assert!(task.port_handle().is_none());
    }
}
