//! TCP server port.

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpListener;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::tcp_conn::{ConnHandler, TcpConnectionConfig, TcpConnectionPort};
use super::PortHandle;

/// Server port parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Address to bind; a zero port selects a random free port.
    pub bind_address: SocketAddr,
    /// Maximum length of the pending-connection queue.
    pub backlog_limit: usize,
    /// Socket options applied to accepted connections.
    pub socket: TcpConnectionConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:0".parse().expect("valid literal"),
            backlog_limit: 128,
            socket: TcpConnectionConfig::default(),
        }
    }
}

/// Produces a handler for every connection accepted by a server port.
pub trait ConnAcceptor: Send {
    /// Called on the loop thread when a connection is accepted; the returned
    /// handler receives the connection's events.
    fn add_connection(&mut self, conn: &Arc<TcpConnectionPort>) -> Arc<dyn ConnHandler>;

    /// Called after an accepted connection finished termination, right
    /// before it is closed and released.
    fn remove_connection(&mut self, _conn: &Arc<TcpConnectionPort>) {}
}

/// Listening socket accepting into connection ports.
///
/// The server owns the handles of its accepted connections; removing the
/// server first terminates and closes all of them. Accept dispatching runs
/// in the network loop, which holds the listener registered with its poller.
pub struct TcpServerPort {
    config: TcpServerConfig,
    bind_address: SocketAddr,
    pub(super) listener: Mutex<Option<TcpListener>>,
    pub(super) acceptor: Mutex<Box<dyn ConnAcceptor>>,
    /// Handles of accepted connections still owned by the loop arena.
    pub(super) connections: Mutex<Vec<(PortHandle, Arc<TcpConnectionPort>)>>,
}

impl TcpServerPort {
    pub(super) fn new(
        config: TcpServerConfig,
        bind_address: SocketAddr,
        listener: TcpListener,
        acceptor: Box<dyn ConnAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bind_address,
            listener: Mutex::new(Some(listener)),
            acceptor: Mutex::new(acceptor),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Actual bound address.
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub(super) fn socket_config(&self) -> TcpConnectionConfig {
        self.config.socket
    }

    pub(super) fn num_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub(super) fn track_connection(
        &self,
        handle: PortHandle,
        conn: Arc<TcpConnectionPort>,
    ) {
        self.connections.lock().push((handle, conn));
    }

    pub(super) fn untrack_connection(&self, handle: PortHandle) {
        self.connections.lock().retain(|(h, _)| *h != handle);
    }
}
