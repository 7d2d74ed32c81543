//! iSCSI server
//!
//! Owns the listening socket and one receive thread per accepted connection.
//! Configure it with [`IscsiServer::builder`].

use crate::config::{validate_target_name, OfferedParameters, DEFAULT_BIND_ADDR};
use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{process_buffer, Flow};
use crate::error::{IscsiError, ScsiResult};
use crate::logging::{LogEntry, LogSubscriber, ServerLog};
use crate::registry::ConnectionRegistry;
use crate::session::{SessionParameters, TsihAllocator};
use crate::target::IscsiTarget;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Pending connection queue length of the listening socket
pub const LISTEN_BACKLOG: i32 = 1000;

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// State shared by the acceptor and every connection thread
pub struct ServerContext {
    pub(crate) targets: Vec<Arc<IscsiTarget>>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) tsih: TsihAllocator,
    pub(crate) offered: OfferedParameters,
    pub(crate) log: ServerLog,
    /// Every accepted connection still running, logged in or not
    live: Mutex<Vec<Arc<Connection>>>,
}

impl ServerContext {
    pub(crate) fn new(
        targets: Vec<Arc<IscsiTarget>>,
        offered: OfferedParameters,
        log: ServerLog,
    ) -> Self {
        ServerContext {
            targets,
            registry: ConnectionRegistry::new(),
            tsih: TsihAllocator::default(),
            offered,
            log,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Session parameters a new connection starts from
    pub(crate) fn session_defaults(&self) -> SessionParameters {
        SessionParameters {
            command_queue_size: self.offered.command_queue_size,
            ..Default::default()
        }
    }

    fn live(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// iSCSI target server
pub struct IscsiServer {
    bind_addr: SocketAddr,
    context: Arc<ServerContext>,
    stopping: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl IscsiServer {
    /// Create a new builder for configuring the server
    pub fn builder() -> IscsiServerBuilder {
        IscsiServerBuilder::new()
    }

    /// Bind the listener and start accepting connections in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub fn start(&self) -> ScsiResult<SocketAddr> {
        let mut acceptor = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner);
        if acceptor.is_some() {
            return Err(IscsiError::Config("server already started".to_string()));
        }

        let listener = bind_listener(self.bind_addr)?;
        let local_addr = listener.local_addr()?;
        self.context.log.info(format_args!("Starting Server on {}", local_addr));
        for target in &self.context.targets {
            self.context.log.info(format_args!("Serving target {}", target.name()));
        }

        let context = self.context.clone();
        let stopping = self.stopping.clone();
        let handle = thread::Builder::new()
            .name("iscsi-acceptor".to_string())
            .spawn(move || accept_loop(listener, context, stopping))?;

        *acceptor = Some(handle);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        Ok(local_addr)
    }

    /// Start the server if needed and block until it is stopped
    pub fn run(&self) -> ScsiResult<()> {
        if self.local_addr().is_none() {
            self.start()?;
        }
        let handle = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| IscsiError::Session("acceptor thread panicked".to_string()))?;
        }
        Ok(())
    }

    /// Stop accepting and close every connection
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.context.log.info(format_args!("Stopping Server"));

        let connections: Vec<Arc<Connection>> = self.context.live().clone();
        for connection in connections {
            connection.close();
        }

        // Wake the acceptor blocked in accept()
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(wake_address(addr));
        }
        let handle = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepted connections whose receive loop is still running
    pub fn connection_count(&self) -> usize {
        self.context.live().len()
    }

    /// Connections that completed login and are in the registry
    pub fn logged_in_connection_count(&self) -> usize {
        self.context.registry.connection_count()
    }

    pub fn targets(&self) -> &[Arc<IscsiTarget>] {
        &self.context.targets
    }
}

impl Drop for IscsiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder for configuring an iSCSI server
pub struct IscsiServerBuilder {
    bind_addr: Option<String>,
    targets: Vec<IscsiTarget>,
    offered: OfferedParameters,
    log_subscriber: Option<Arc<LogSubscriber>>,
}

impl IscsiServerBuilder {
    fn new() -> Self {
        Self {
            bind_addr: None,
            targets: Vec::new(),
            offered: OfferedParameters::default(),
            log_subscriber: None,
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Add a target. Targets are listed by discovery in the order added.
    ///
    /// Target names must be in IQN, EUI or NAA format, e.g.
    /// `iqn.2025-12.local:storage.disk1`.
    pub fn target(mut self, target: IscsiTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Session parameters offered during login negotiation
    pub fn offered_parameters(mut self, offered: OfferedParameters) -> Self {
        self.offered = offered;
        self
    }

    /// Receive every log entry the server produces
    pub fn on_log_entry<F>(mut self, subscriber: F) -> Self
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.log_subscriber = Some(Arc::new(subscriber));
        self
    }

    /// Build the server
    pub fn build(self) -> ScsiResult<IscsiServer> {
        let bind_addr = self
            .bind_addr
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr
            .to_socket_addrs()
            .map_err(|e| IscsiError::Config(format!("invalid bind address {}: {}", bind_addr, e)))?
            .next()
            .ok_or_else(|| IscsiError::Config(format!("{} resolves to no address", bind_addr)))?;

        for (i, target) in self.targets.iter().enumerate() {
            validate_target_name(target.name())?;
            if self.targets[..i]
                .iter()
                .any(|other| other.matches_name(target.name()))
            {
                return Err(IscsiError::Config(format!(
                    "duplicate target name {}",
                    target.name()
                )));
            }
        }

        let targets = self.targets.into_iter().map(Arc::new).collect();
        let context = ServerContext::new(targets, self.offered, ServerLog::new(self.log_subscriber));

        Ok(IscsiServer {
            bind_addr,
            context: Arc::new(context),
            stopping: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
        })
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Address to connect to in order to wake a listener bound to `addr`
fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}

fn accept_loop(listener: TcpListener, context: Arc<ServerContext>, stopping: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                context
                    .log
                    .debug(format_args!("Failed to accept connection: {}", e));
                continue;
            }
        };

        let connection = match Connection::new(stream) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                context
                    .log
                    .debug(format_args!("Failed to set up accepted connection: {}", e));
                continue;
            }
        };
        context.log.info(format_args!(
            "New connection has been accepted: {}",
            connection.peer()
        ));
        context.live().push(connection.clone());

        let thread_context = context.clone();
        let thread_connection = connection.clone();
        let spawned = thread::Builder::new()
            .name(format!("iscsi-conn-{}", connection.peer()))
            .spawn(move || run_connection(thread_context, thread_connection));
        if let Err(e) = spawned {
            context
                .log
                .error(format_args!("Failed to start connection thread: {}", e));
            connection.close();
            context.live().retain(|c| !Arc::ptr_eq(c, &connection));
        }
    }
    context.log.debug(format_args!("Acceptor stopped"));
}

/// Receive loop of one connection
fn run_connection(context: Arc<ServerContext>, connection: Arc<Connection>) {
    let mut state = ConnectionState::new(connection.clone(), context.session_defaults());
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        match connection.read(&mut buf) {
            Ok(0) => {
                context.log.debug(format_args!(
                    "[{}] The initiator has closed the connection",
                    state.identifier()
                ));
                break;
            }
            Ok(n) => {
                state.buffer.extend_from_slice(&buf[..n]);
                if process_buffer(&context, &mut state) == Flow::Close {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let e = IscsiError::from(e);
                if e.is_disconnect() || connection.is_closed() {
                    context
                        .log
                        .debug(format_args!("[{}] Connection lost: {}", state.identifier(), e));
                } else {
                    context
                        .log
                        .error(format_args!("[{}] Receive failed: {}", state.identifier(), e));
                }
                break;
            }
        }
    }

    connection.running_commands().wait_until_zero();
    connection.close();
    if context.registry.remove(&connection) {
        context.log.debug(format_args!(
            "[{}] Connection removed from the registry",
            state.identifier()
        ));
    }
    context.live().retain(|c| !Arc::ptr_eq(c, &connection));
    context
        .log
        .info(format_args!("[{}] Connection closed", state.identifier()));
}
