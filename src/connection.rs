//! Per-connection state
//!
//! [`Connection`] is the shareable handle of one TCP connection: the socket,
//! the closed flag and the in-flight SCSI command counter. The registry and
//! other connections of the same session hold it to close or drain the
//! connection. [`ConnectionState`] is everything else about the connection and
//! is owned by its receive thread alone.

use crate::session::{IsidDisplay, Session, SessionParameters};
use crate::target::IscsiTarget;
use crate::transfer::TransferTable;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Counts SCSI commands that were handed to the backend and not yet finished
#[derive(Debug, Default)]
pub struct RunningCommands {
    count: Mutex<usize>,
    drained: Condvar,
}

impl RunningCommands {
    pub fn add(&self, n: usize) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += n;
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every running command has finished
    pub fn wait_until_zero(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _drained = self
            .drained
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Shared handle to one accepted TCP connection
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    closed: AtomicBool,
    running_commands: RunningCommands,
}

impl Connection {
    /// Wrap an accepted socket, disabling Nagle's algorithm
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Connection {
            peer: stream.peer_addr()?,
            local: stream.local_addr()?,
            stream,
            closed: AtomicBool::new(false),
            running_commands: RunningCommands::default(),
        })
    }

    /// Initiator endpoint
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Portal address the initiator connected to
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn running_commands(&self) -> &RunningCommands {
        &self.running_commands
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Write one whole PDU
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        (&self.stream).write_all(bytes)
    }

    /// Close the socket. Safe to call more than once and while the receive
    /// thread is blocked reading.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // The peer may already have gone away
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connection-scoped negotiated parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Connection ID, recorded when full feature phase is reached
    pub cid: u16,
    /// StatSN to stamp on the next response
    pub stat_sn: u32,
    /// Largest data segment the initiator accepts (our send limit)
    pub initiator_max_recv_data_segment_length: u32,
    /// Largest data segment this target accepts
    pub target_max_recv_data_segment_length: u32,
    pub initiator_name: String,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            cid: 0,
            stat_sn: 0,
            initiator_max_recv_data_segment_length: 8192,
            target_max_recv_data_segment_length: 8192,
            initiator_name: String::new(),
        }
    }
}

/// Login progress of a connection that has not reached full feature phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginProgress {
    /// First Login Request has been seen
    pub started: bool,
    /// Target already declared its MaxRecvDataSegmentLength
    pub declared_limits: bool,
}

/// Login phase of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    PreLogin,
    FullFeaturePhase,
}

/// State owned by the connection's receive thread
pub struct ConnectionState {
    pub connection: Arc<Connection>,
    /// Received bytes not yet forming a whole PDU
    pub buffer: Vec<u8>,
    pub phase: Phase,
    pub login: LoginProgress,
    pub params: ConnectionParameters,
    /// Session this connection belongs to; a fresh unregistered one until a
    /// login joins an existing session
    pub session: Arc<Session>,
    /// Target resolved during login (normal sessions)
    pub target: Option<Arc<IscsiTarget>>,
    pub transfers: TransferTable,
}

impl ConnectionState {
    pub fn new(connection: Arc<Connection>, session_defaults: SessionParameters) -> Self {
        ConnectionState {
            connection,
            buffer: Vec::new(),
            phase: Phase::PreLogin,
            login: LoginProgress::default(),
            params: ConnectionParameters::default(),
            session: Arc::new(Session::new(session_defaults)),
            target: None,
            transfers: TransferTable::default(),
        }
    }

    /// Identifier used in log lines
    pub fn identifier(&self) -> String {
        let (isid, tsih) = self.session.identity();
        if tsih == 0 {
            format!("{}", self.connection.peer())
        } else {
            format!(
                "ISID={},TSIH={},CID={}",
                IsidDisplay(&isid),
                tsih,
                self.params.cid
            )
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_running_commands_wait() {
        let running = Arc::new(RunningCommands::default());
        running.add(2);
        assert_eq!(running.count(), 2);

        let worker = {
            let running = running.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                running.decrement();
                thread::sleep(Duration::from_millis(20));
                running.decrement();
            })
        };

        running.wait_until_zero();
        assert_eq!(running.count(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_with_nothing_running_returns() {
        RunningCommands::default().wait_until_zero();
    }

    #[test]
    fn test_close_is_idempotent_and_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let connection = Arc::new(Connection::new(server_side).unwrap());
        let reader = {
            let connection = connection.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                connection.read(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(20));
        connection.close();
        connection.close();
        assert!(connection.is_closed());

        let read = reader.join().unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(connection.send(b"late").is_err());
    }
}
