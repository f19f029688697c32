//! Network event loop.
//!
//! One owned thread runs a `mio` poller multiplexing every port of the loop.
//! Each iteration first drains the pending-task queue, then dispatches I/O
//! readiness events to the ports. Other threads talk to the loop exclusively
//! through [`NetworkTask`]s pushed onto a lock-free MPSC queue followed by a
//! waker kick.
//!
//! The loop exclusively owns its ports. They live in an arena of generation
//! counted slots; the public [`PortHandle`] is an opaque index, so tasks
//! carry handles rather than references. Removal is a staged close: ports
//! with in-flight work (UDP sends, TCP termination) park the remove task and
//! finish it once the port has wound down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use mio::{Events, Interest, Poll, Token, Waker};

use super::resolver;
use super::socket;
use super::task::{
    NetworkTask, PortHandle, TaskKind, STATE_CLOSING_PORT, STATE_FINISHED, STATE_FINISHING,
    STATE_PENDING,
};
use super::tcp_conn::{TcpConnectionPort, TcpConnectionType};
use super::tcp_server::TcpServerPort;
use super::udp::{DrainOutcome, UdpPort};
use crate::error::{Error, Result};
use crate::packet::PacketFactory;
use crate::sync::{MpscQueue, Semaphore};

const WAKER_TOKEN: Token = Token(0);

pub(super) struct LoopShared {
    tasks: MpscQueue<NetworkTask>,
    waker: Arc<Waker>,
    num_open_ports: AtomicUsize,
    stop: AtomicBool,
}

#[derive(Clone)]
enum Port {
    Udp(Arc<UdpPort>),
    TcpServer(Arc<TcpServerPort>),
    TcpConn {
        conn: Arc<TcpConnectionPort>,
        /// Owning server port for accepted connections.
        server: Option<PortHandle>,
    },
}

struct Slot {
    generation: u32,
    port: Option<Port>,
}

/// Network event loop thread: owns UDP and TCP ports and executes submitted
/// network tasks.
pub struct NetworkLoop {
    shared: Arc<LoopShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NetworkLoop {
    /// Creates the loop and starts its thread.
    pub fn new(factory: PacketFactory) -> Result<Self> {
        let poll = Poll::new().map_err(|_| Error::Failure)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(|_| Error::Failure)?);

        let shared = Arc::new(LoopShared {
            tasks: MpscQueue::new(),
            waker,
            num_open_ports: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let mut state = LoopThread {
            shared: Arc::clone(&shared),
            poll,
            slots: Vec::new(),
            free: Vec::new(),
            factory,
        };

        let thread = thread::Builder::new()
            .name("sonance-net".into())
            .spawn(move || state.run())
            .map_err(|_| Error::Failure)?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Number of currently open ports (server-side connections excluded).
    pub fn num_ports(&self) -> usize {
        self.shared.num_open_ports.load(Ordering::SeqCst)
    }

    /// Enqueues a task; the completer is invoked on the loop thread after
    /// the task finishes and must not block.
    pub fn schedule(
        &self,
        task: Arc<NetworkTask>,
        completer: impl FnOnce(&NetworkTask) + Send + 'static,
    ) {
        *task.completer.lock() = Some(Box::new(completer));
        self.submit(task);
    }

    /// Enqueues a task and blocks until it finishes; returns its success
    /// bit. Must not be called from a task completer.
    pub fn schedule_and_wait(&self, task: Arc<NetworkTask>) -> bool {
        let sem = Arc::new(Semaphore::new());
        *task.sem.lock() = Some(Arc::clone(&sem));

        self.submit(Arc::clone(&task));

        sem.wait();

        task.success()
    }

    fn submit(&self, task: Arc<NetworkTask>) {
        if self.shared.stop.load(Ordering::SeqCst) {
            panic!("network loop: attempt to use loop after stop");
        }
        task.state.store(STATE_PENDING, Ordering::Release);
        self.shared.tasks.push(task);
        if self.shared.waker.wake().is_err() {
            log::error!("[NetLoop] can't wake up event loop");
        }
    }
}

impl Drop for NetworkLoop {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct LoopThread {
    shared: Arc<LoopShared>,
    poll: Poll,
    slots: Vec<Slot>,
    free: Vec<u32>,
    factory: PacketFactory,
}

impl LoopThread {
    fn run(&mut self) {
        log::debug!("[NetLoop] starting event loop");

        let mut events = Events::with_capacity(256);

        loop {
            self.process_pending_tasks();

            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }

            self.drain_udp_backlogs();

            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[NetLoop] poll failed: {err}");
                break;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(
                    event.token(),
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                    event.is_read_closed(),
                );
            }
        }

        self.close_all_ports();

        log::debug!("[NetLoop] finishing event loop");
    }

    fn process_pending_tasks(&mut self) {
        // try_pop may miss a task while its push is mid-flight; the pending
        // wake from that push brings the loop back here
        while let Some(task) = self.shared.tasks.try_pop() {
            self.handle_task(task);
        }
    }

    fn drain_udp_backlogs(&mut self) {
        let mut finished = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(Port::Udp(port)) = &slot.port {
                if port.has_outbound_backlog()
                    && port.drain_outbound() == DrainOutcome::WouldBlock
                {
                    continue;
                }
                if port.wants_close() && port.num_pending_packets() == 0 {
                    finished.push(index as u32);
                }
            }
        }
        for index in finished {
            self.finish_udp_close(index);
        }
    }

    fn dispatch(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        is_error: bool,
        read_closed: bool,
    ) {
        let index = (token.0 - 1) as u32;
        let port = match self.slot_port(index) {
            Some(port) => port,
            // sporadic events for removed ports happen
            None => return,
        };

        match port {
            Port::Udp(port) => {
                if readable {
                    port.handle_readable();
                }
                if writable {
                    let _ = port.drain_outbound();
                }
                if port.wants_close() && port.num_pending_packets() == 0 {
                    self.finish_udp_close(index);
                }
            }
            Port::TcpServer(server) => {
                let handle = self.handle_at(index);
                self.accept_connections(handle, server);
            }
            Port::TcpConn { conn, .. } => {
                conn.handle_event(readable, writable, is_error, read_closed);
            }
        }
    }

    // ---- arena ----

    fn alloc_slot(&mut self) -> u32 {
        if let Some(index) = self.free.pop() {
            index
        } else {
            self.slots.push(Slot {
                generation: 0,
                port: None,
            });
            (self.slots.len() - 1) as u32
        }
    }

    fn free_slot(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.port = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
        }
    }

    fn handle_at(&self, index: u32) -> PortHandle {
        PortHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn token_at(index: u32) -> Token {
        Token(index as usize + 1)
    }

    fn slot_port(&self, index: u32) -> Option<Port> {
        self.slots.get(index as usize)?.port.clone()
    }

    fn lookup(&self, handle: PortHandle) -> Option<Port> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.port.clone()
    }

    fn conn_terminator(&self, handle: PortHandle) -> Box<dyn Fn() + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Box::new(move || {
            shared.tasks.push(NetworkTask::new_terminate_conn(handle));
            if shared.waker.wake().is_err() {
                log::error!("[NetLoop] can't wake up event loop for terminate");
            }
        })
    }

    // ---- task execution ----

    fn handle_task(&mut self, task: Arc<NetworkTask>) {
        let success = {
            let mut kind = task.kind.lock();
            match &mut *kind {
                TaskKind::AddUdpPort { config, handle } => {
                    match self.task_add_udp_port(config) {
                        Ok(new_handle) => {
                            *handle = Some(new_handle);
                            true
                        }
                        Err(err) => {
                            log::error!(
                                "[NetLoop] can't add udp port: status={}",
                                err.code()
                            );
                            false
                        }
                    }
                }
                TaskKind::StartUdpSend { handle, writer } => {
                    match self.lookup(*handle) {
                        Some(Port::Udp(port)) => {
                            *writer = Some(port.start_send());
                            true
                        }
                        _ => false,
                    }
                }
                TaskKind::StartUdpRecv { handle, writer } => match self.lookup(*handle) {
                    Some(Port::Udp(port)) => match writer.take() {
                        Some(inbound) => port.start_recv(inbound).is_ok(),
                        None => false,
                    },
                    _ => false,
                },
                TaskKind::AddTcpServer {
                    config,
                    acceptor,
                    handle,
                } => match self.task_add_tcp_server(config, acceptor.take()) {
                    Ok(new_handle) => {
                        *handle = Some(new_handle);
                        true
                    }
                    Err(err) => {
                        log::error!(
                            "[NetLoop] can't add tcp server: status={}",
                            err.code()
                        );
                        false
                    }
                },
                TaskKind::AddTcpClient {
                    config,
                    handler,
                    handle,
                    conn,
                } => match self.task_add_tcp_client(config, handler.take()) {
                    Ok((new_handle, new_conn)) => {
                        *handle = Some(new_handle);
                        *conn = Some(new_conn);
                        true
                    }
                    Err(err) => {
                        log::error!(
                            "[NetLoop] can't add tcp client: status={}",
                            err.code()
                        );
                        false
                    }
                },
                TaskKind::RemovePort { handle } => {
                    let handle = *handle;
                    drop(kind);
                    return self.task_remove_port(task, handle);
                }
                TaskKind::ResolveEndpoint { host, port, result } => match result {
                    Some(resolved) => resolved.is_some(),
                    None => {
                        let host = host.clone();
                        let port = *port;
                        drop(kind);
                        self.task_resolve(task, host, port);
                        return;
                    }
                },
                TaskKind::TerminateConn { handle } => {
                    let handle = *handle;
                    drop(kind);
                    self.task_terminate_conn(handle);
                    Self::finish_task(&task, true);
                    return;
                }
            }
        };

        Self::finish_task(&task, success);
    }

    fn finish_task(task: &Arc<NetworkTask>, success: bool) {
        task.state.store(STATE_FINISHING, Ordering::Release);
        task.success.store(success, Ordering::Release);
        task.state.store(STATE_FINISHED, Ordering::Release);

        // mirror the pipeline completion contract: after the completer
        // returns or the semaphore is posted, the task is never touched
        let completer = task.completer.lock().take();
        if let Some(completer) = completer {
            completer(task.as_ref());
        }
        if let Some(sem) = task.sem.lock().take() {
            sem.post();
        }
    }

    fn task_add_udp_port(&mut self, config: &mut socket::UdpConfig) -> Result<PortHandle> {
        let (mut udp_socket, bound) = socket::udp_bind(config)?;
        config.bind_address = bound;

        let index = self.alloc_slot();
        let token = Self::token_at(index);

        if self
            .poll
            .registry()
            .register(
                &mut udp_socket,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_err()
        {
            self.free_slot(index);
            return Err(Error::Failure);
        }

        let port = UdpPort::new(
            config.clone(),
            udp_socket,
            self.factory.clone(),
            Arc::clone(&self.shared.waker),
        );

        self.slots[index as usize].port = Some(Port::Udp(port));
        self.shared.num_open_ports.fetch_add(1, Ordering::SeqCst);

        Ok(self.handle_at(index))
    }

    fn task_add_tcp_server(
        &mut self,
        config: &mut super::tcp_server::TcpServerConfig,
        acceptor: Option<Box<dyn super::tcp_server::ConnAcceptor>>,
    ) -> Result<PortHandle> {
        let acceptor = acceptor.ok_or(Error::BadArgument)?;

        let (mut listener, bound) = socket::tcp_listen(config.bind_address, config.backlog_limit)?;
        config.bind_address = bound;

        let index = self.alloc_slot();
        let token = Self::token_at(index);

        if self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .is_err()
        {
            self.free_slot(index);
            return Err(Error::Failure);
        }

        let server = TcpServerPort::new(config.clone(), bound, listener, acceptor);

        self.slots[index as usize].port = Some(Port::TcpServer(server));
        self.shared.num_open_ports.fetch_add(1, Ordering::SeqCst);

        log::debug!("[NetLoop] added tcp server: bind={bound}");

        Ok(self.handle_at(index))
    }

    fn task_add_tcp_client(
        &mut self,
        config: &super::tcp_conn::TcpClientConfig,
        handler: Option<Arc<dyn super::tcp_conn::ConnHandler>>,
    ) -> Result<(PortHandle, Arc<TcpConnectionPort>)> {
        let handler = handler.ok_or(Error::BadArgument)?;

        let mut stream =
            socket::tcp_begin_connect(config.local_address, config.remote_address)?;

        let index = self.alloc_slot();
        let token = Self::token_at(index);

        if self
            .poll
            .registry()
            .register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_err()
        {
            self.free_slot(index);
            return Err(Error::Failure);
        }

        let handle = self.handle_at(index);
        let conn = TcpConnectionPort::new(TcpConnectionType::Client);
        conn.open(self.conn_terminator(handle));

        if let Err(err) = conn.connect(stream, config) {
            self.free_slot(index);
            return Err(err);
        }

        conn.attach_handler(handler);

        self.slots[index as usize].port = Some(Port::TcpConn {
            conn: Arc::clone(&conn),
            server: None,
        });
        self.shared.num_open_ports.fetch_add(1, Ordering::SeqCst);

        Ok((handle, conn))
    }

    fn accept_connections(&mut self, server_handle: PortHandle, server: Arc<TcpServerPort>) {
        loop {
            let accepted = {
                let listener = server.listener.lock();
                match listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };

            let (mut stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::error!("[NetLoop] accept failed: {err}");
                    return;
                }
            };

            let index = self.alloc_slot();
            let token = Self::token_at(index);

            if self
                .poll
                .registry()
                .register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                )
                .is_err()
            {
                log::error!("[NetLoop] can't register accepted connection");
                self.free_slot(index);
                continue;
            }

            let handle = self.handle_at(index);
            let conn = TcpConnectionPort::new(TcpConnectionType::Server);
            conn.open(self.conn_terminator(handle));

            if conn
                .accept(
                    stream,
                    server.bind_address(),
                    remote_addr,
                    &server.socket_config(),
                )
                .is_err()
            {
                log::error!("[NetLoop] can't set up accepted connection");
                self.free_slot(index);
                continue;
            }

            let handler = server.acceptor.lock().add_connection(&conn);
            conn.attach_handler(handler);

            server.track_connection(handle, Arc::clone(&conn));
            self.slots[index as usize].port = Some(Port::TcpConn {
                conn,
                server: Some(server_handle),
            });
        }
    }

    fn task_remove_port(&mut self, task: Arc<NetworkTask>, handle: PortHandle) {
        match self.lookup(handle) {
            Some(Port::Udp(port)) => {
                if port.begin_close() {
                    self.release_port(handle.index);
                    Self::finish_task(&task, true);
                } else {
                    log::debug!("[UdpPort] initiating asynchronous close");
                    task.state.store(STATE_CLOSING_PORT, Ordering::Release);
                    *port.close_waiter.lock() = Some(task);
                }
            }
            Some(Port::TcpServer(server)) => {
                self.close_server(handle, &server);
                Self::finish_task(&task, true);
            }
            Some(Port::TcpConn { conn, server }) => {
                self.close_connection(handle, &conn);
                if let Some(server_handle) = server {
                    if let Some(Port::TcpServer(server)) = self.lookup(server_handle) {
                        server.untrack_connection(handle);
                    }
                }
                Self::finish_task(&task, true);
            }
            None => Self::finish_task(&task, false),
        }
    }

    fn task_terminate_conn(&mut self, handle: PortHandle) {
        let (conn, server) = match self.lookup(handle) {
            Some(Port::TcpConn { conn, server }) => (conn, server),
            _ => return,
        };

        conn.terminate_on_loop();

        // server-side connections are closed and released automatically
        // after termination; client connections wait for RemovePort
        if let Some(server_handle) = server {
            if let Some(Port::TcpServer(server)) = self.lookup(server_handle) {
                server.acceptor.lock().remove_connection(&conn);
                server.untrack_connection(handle);
            }
            conn.close_on_loop();
            self.free_slot(handle.index);
        }
    }

    fn task_resolve(&mut self, task: Arc<NetworkTask>, host: String, port: u16) {
        let shared = Arc::clone(&self.shared);
        let loop_task = Arc::clone(&task);

        resolver::resolve_async(host, port, move |address| {
            if let TaskKind::ResolveEndpoint { result, .. } = &mut *loop_task.kind.lock() {
                *result = Some(address);
            }
            shared.tasks.push(Arc::clone(&loop_task));
            if shared.waker.wake().is_err() {
                log::error!("[NetLoop] can't wake up event loop for resolve");
            }
        });
    }

    fn finish_udp_close(&mut self, index: u32) {
        let port = match self.slot_port(index) {
            Some(Port::Udp(port)) => port,
            _ => return,
        };

        let waiter = port.close_waiter.lock().take();
        self.release_port(index);

        if let Some(task) = waiter {
            Self::finish_task(&task, true);
        }
    }

    fn release_port(&mut self, index: u32) {
        if self.slots.get(index as usize).and_then(|s| s.port.as_ref()).is_some() {
            self.free_slot(index);
            self.shared.num_open_ports.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn close_server(&mut self, handle: PortHandle, server: &Arc<TcpServerPort>) {
        log::debug!(
            "[NetLoop] closing tcp server: bind={} conns={}",
            server.bind_address(),
            server.num_connections()
        );

        let connections: Vec<_> = server.connections.lock().drain(..).collect();
        for (conn_handle, conn) in connections {
            server.acceptor.lock().remove_connection(&conn);
            self.close_connection(conn_handle, &conn);
        }

        server.listener.lock().take();
        self.release_port(handle.index);
    }

    fn close_connection(&mut self, handle: PortHandle, conn: &Arc<TcpConnectionPort>) {
        if conn.needs_terminate() {
            conn.force_terminate();
        }
        if conn.is_terminating() {
            conn.terminate_on_loop();
        }
        conn.close_on_loop();
        self.free_slot(handle.index);
        // only top-level ports count; accepted connections never
        // incremented the counter
        if matches!(conn.connection_type(), TcpConnectionType::Client) {
            self.shared.num_open_ports.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn close_all_ports(&mut self) {
        // fail any remaining queued tasks first
        while let Some(task) = self.shared.tasks.pop() {
            Self::finish_task(&task, false);
        }

        for index in 0..self.slots.len() as u32 {
            let port = match self.slot_port(index) {
                Some(port) => port,
                None => continue,
            };
            let handle = self.handle_at(index);
            match port {
                Port::Udp(port) => {
                    port.begin_close();
                    let waiter = port.close_waiter.lock().take();
                    self.release_port(index);
                    if let Some(task) = waiter {
                        Self::finish_task(&task, true);
                    }
                }
                Port::TcpServer(server) => self.close_server(handle, &server),
                Port::TcpConn { conn, server } => {
                    if server.is_none() {
                        self.close_connection(handle, &conn);
                    }
                    // server-side connections are handled by their server
                }
            }
        }
    }
}
