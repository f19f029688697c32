//! Non-blocking socket creation and I/O wrappers.
//!
//! Socket setup goes through `socket2` so that options (reuse-address,
//! linger, Nagle) can be applied before binding; I/O goes through the `mio`
//! socket types registered with the loop poller. All operations are
//! non-blocking and report `WouldBlock`, `StreamEnd` and `Failure` through
//! the crate-wide error type.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{Error, Result};

/// Per-port UDP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Address to bind to; a zero port selects a random free port.
    pub bind_address: SocketAddr,
    /// IPv4 interface used to join the multicast group of a multicast bind
    /// address; `None` disables the join.
    pub multicast_interface: Option<Ipv4Addr>,
    /// Allow multiple sockets to bind the same address.
    pub enable_reuseaddr: bool,
    /// Try a lock-free non-blocking send before queueing outbound packets.
    pub enable_non_blocking: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:0".parse().expect("valid literal"),
            multicast_interface: None,
            enable_reuseaddr: false,
            enable_non_blocking: true,
        }
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn map_io(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Error::WouldBlock
    } else {
        Error::Failure
    }
}

/// Creates and binds a non-blocking UDP socket, returning it together with
/// the actual bound address.
pub fn udp_bind(config: &UdpConfig) -> Result<(UdpSocket, SocketAddr)> {
    let socket = Socket::new(
        domain_for(&config.bind_address),
        Type::DGRAM,
        Some(Protocol::UDP),
    )
    .map_err(|_| Error::Failure)?;

    socket.set_nonblocking(true).map_err(|_| Error::Failure)?;

    let is_multicast = config.bind_address.ip().is_multicast();
    if (config.enable_reuseaddr || is_multicast) && config.bind_address.port() > 0 {
        socket.set_reuse_address(true).map_err(|_| Error::Failure)?;
    }

    socket.set_broadcast(true).map_err(|_| Error::Failure)?;

    socket
        .bind(&config.bind_address.into())
        .map_err(|_| Error::Failure)?;

    let bound = socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .ok_or(Error::Failure)?;

    let socket = UdpSocket::from_std(socket.into());
    Ok((socket, bound))
}

/// Joins the multicast group of a multicast bind address.
pub fn udp_join_multicast(
    socket: &UdpSocket,
    group: &SocketAddr,
    interface: Ipv4Addr,
) -> Result<()> {
    match group.ip() {
        std::net::IpAddr::V4(group) if group.is_multicast() => socket
            .join_multicast_v4(&group, &interface)
            .map_err(|_| Error::Failure),
        _ => Err(Error::BadArgument),
    }
}

/// Leaves a previously joined multicast group.
pub fn udp_leave_multicast(
    socket: &UdpSocket,
    group: &SocketAddr,
    interface: Ipv4Addr,
) -> Result<()> {
    match group.ip() {
        std::net::IpAddr::V4(group) if group.is_multicast() => socket
            .leave_multicast_v4(&group, &interface)
            .map_err(|_| Error::Failure),
        _ => Err(Error::BadArgument),
    }
}

/// Creates a non-blocking listening TCP socket.
pub fn tcp_listen(
    bind_address: SocketAddr,
    backlog: usize,
) -> Result<(TcpListener, SocketAddr)> {
    let socket = Socket::new(
        domain_for(&bind_address),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(|_| Error::Failure)?;

    socket.set_nonblocking(true).map_err(|_| Error::Failure)?;
    socket.set_reuse_address(true).map_err(|_| Error::Failure)?;
    socket
        .bind(&bind_address.into())
        .map_err(|_| Error::Failure)?;
    socket
        .listen(backlog.min(i32::MAX as usize) as i32)
        .map_err(|_| Error::Failure)?;

    let bound = socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .ok_or(Error::Failure)?;

    let listener = TcpListener::from_std(socket.into());
    Ok((listener, bound))
}

/// Initiates a non-blocking connect; completion is signalled by the poller
/// reporting the socket writable (check with [`finish_connect`]).
pub fn tcp_begin_connect(
    local_address: Option<SocketAddr>,
    remote_address: SocketAddr,
) -> Result<TcpStream> {
    let socket = Socket::new(
        domain_for(&remote_address),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(|_| Error::Failure)?;

    socket.set_nonblocking(true).map_err(|_| Error::Failure)?;

    if let Some(local) = local_address {
        socket.bind(&local.into()).map_err(|_| Error::Failure)?;
    }

    match socket.connect(&remote_address.into()) {
        Ok(()) => {}
        Err(err)
            if err.raw_os_error() == Some(EINPROGRESS)
                || err.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(_) => return Err(Error::Failure),
    }

    Ok(TcpStream::from_std(socket.into()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const EINPROGRESS: i32 = 36;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
const EINPROGRESS: i32 = -1;

/// Checks the outcome of an asynchronous connect once the socket reported
/// writable. `Ok(())` means established, `Failure` means refused.
pub fn finish_connect(stream: &TcpStream) -> Result<()> {
    match stream.take_error() {
        Ok(Some(_)) | Err(_) => return Err(Error::Failure),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Err(Error::WouldBlock),
        Err(_) => Err(Error::Failure),
    }
}

/// Disables Nagle's algorithm when requested.
pub fn tcp_setup(stream: &TcpStream, disable_nagle: bool) -> Result<()> {
    if disable_nagle {
        stream.set_nodelay(true).map_err(|_| Error::Failure)?;
    }
    Ok(())
}

/// Non-blocking write; returns the byte count or `WouldBlock`/`Failure`.
pub fn tcp_try_send(stream: &TcpStream, buf: &[u8]) -> Result<usize> {
    loop {
        match (&mut &*stream).write(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(map_io(err)),
        }
    }
}

/// Non-blocking read; returns the byte count, `WouldBlock`, `StreamEnd`
/// after the peer's graceful shutdown, or `Failure`.
pub fn tcp_try_recv(stream: &TcpStream, buf: &mut [u8]) -> Result<usize> {
    loop {
        match (&mut &*stream).read(buf) {
            Ok(0) if !buf.is_empty() => return Err(Error::StreamEnd),
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(map_io(err)),
        }
    }
}

/// Sends FIN, leaving the read direction open.
pub fn tcp_shutdown_write(stream: &TcpStream) -> Result<()> {
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(|_| Error::Failure)
}

/// Arranges for the close of the stream to send RST instead of FIN.
pub fn tcp_arm_reset(stream: &TcpStream) -> Result<()> {
    SockRef::from(stream)
        .set_linger(Some(Duration::from_secs(0)))
        .map_err(|_| Error::Failure)
}
