//! Pipelined connection to a single cache server
//!
//! A connection walks `Disconnected -> Connecting -> Handshaking -> Ready`
//! and falls back through `Draining` to `Disconnected` on any failure.
//! Commands wait in `pending` until the connection is ready, are then framed
//! into the write buffer and tracked in `in_flight` until the response with
//! the same opaque arrives. Responses must arrive in write order.
//!
//! The connection never blocks: the dispatcher awaits [`Connection::wait`]
//! and then calls [`Connection::flush`], [`Connection::ingest`] and
//! [`Connection::sweep`], collecting the resulting [`ConnEvent`]s.
use super::ServerId;
use crate::config::Credentials;
use crate::error::{MemringError, MemringResult};
use crate::protocol::{Command, FrameCodec, Magic, Opcode, Response};
use crate::protocol::codec::Frame;
use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Reads are issued in chunks of this size
const READ_CHUNK: usize = 16 * 1024;

/// Stop framing pending commands once this many bytes wait to be written
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// Reads per ingest call before yielding back to the loop
const MAX_READS_PER_TICK: usize = 16;

/// Identifier handed out for every submitted command
pub type CommandId = u64;

/// Caller side of a command's completion
pub type Completion = oneshot::Sender<MemringResult<Response>>;

/// A submitted command travelling through the dispatcher
#[derive(Debug)]
pub struct QueuedCommand {
    pub id: CommandId,
    pub command: Command,
    /// Time allowed per attempt
    pub budget: Duration,
    pub deadline: Instant,
    pub retries: u32,
    completion: Completion,
}

impl QueuedCommand {
    pub fn new(id: CommandId, command: Command, budget: Duration, completion: Completion) -> Self {
        Self {
            id,
            command,
            budget,
            deadline: Instant::now() + budget,
            retries: 0,
            completion,
        }
    }

    /// Start a new attempt with a fresh deadline
    pub fn next_attempt(&mut self, now: Instant) {
        self.retries += 1;
        self.deadline = now + self.budget;
    }

    /// The caller dropped its handle
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    /// Deliver the result; returns false if nobody is listening
    pub fn complete(self, result: MemringResult<Response>) -> bool {
        self.completion.send(result).is_ok()
    }

    fn timeout_error(&self) -> MemringError {
        MemringError::timeout(self.command.describe(), self.budget)
    }
}

/// Settings shared by every connection of a pool
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Limit for connect plus handshake
    pub connect_timeout: Duration,
    pub credentials: Option<Credentials>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Draining,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Handshaking => "Handshaking",
            ConnectionState::Ready => "Ready",
            ConnectionState::Draining => "Draining",
        };
        f.write_str(name)
    }
}

/// I/O statistics of a connection, accumulated across reconnects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connects: u64,
    pub drains: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// Outcome reported to the dispatcher
#[derive(Debug)]
pub enum ConnEvent {
    /// Handshake finished; the server can be marked up
    Ready(ServerId),
    Completed(ServerId, QueuedCommand, Response),
    Failed(ServerId, QueuedCommand, MemringError),
    /// The connection went back to `Disconnected`
    Closed {
        server: ServerId,
        reason: String,
        mark_down: bool,
    },
}

/// What woke the event loop up for a connection
#[derive(Debug)]
pub enum Wakeup {
    Connected(ServerId, io::Result<TcpStream>),
    Ready(ServerId, io::Result<()>),
}

#[derive(Debug)]
enum Slot {
    Handshake,
    Command(QueuedCommand),
    /// Cancelled after being written; the response is dropped
    Cancelled { opcode: Opcode, deadline: Instant },
}

#[derive(Debug)]
struct InFlight {
    opaque: u32,
    slot: Slot,
    /// STAT name/value pairs received so far
    stats: Vec<(String, String)>,
}

impl InFlight {
    fn opcode(&self) -> Opcode {
        match &self.slot {
            Slot::Handshake => Opcode::SaslAuth,
            Slot::Command(queued) => queued.command.opcode,
            Slot::Cancelled { opcode, .. } => *opcode,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match &self.slot {
            Slot::Handshake => None,
            Slot::Command(queued) => Some(queued.deadline),
            Slot::Cancelled { deadline, .. } => Some(*deadline),
        }
    }
}

pub struct Connection {
    server: ServerId,
    address: String,
    options: ConnectionOptions,
    state: ConnectionState,
    stream: Option<TcpStream>,
    connect: Option<BoxFuture<'static, io::Result<TcpStream>>>,
    connect_deadline: Option<Instant>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pending: VecDeque<QueuedCommand>,
    in_flight: VecDeque<InFlight>,
    next_opaque: u32,
    stats: ConnectionStats,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .field("write_buf", &self.write_buf.len())
            .finish()
    }
}

impl Connection {
    pub fn new(server: ServerId, address: String, options: ConnectionOptions) -> Self {
        Self {
            server,
            address,
            options,
            state: ConnectionState::Disconnected,
            stream: None,
            connect: None,
            connect_deadline: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            next_opaque: 0,
            stats: ConnectionStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// In-flight commands whose caller still waits for a response
    pub fn live_in_flight(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|entry| matches!(entry.slot, Slot::Command(_)))
            .count()
    }

    /// Nothing left that a graceful shutdown has to wait for
    pub fn is_idle(&self) -> bool {
        self.live_in_flight() == 0 && self.write_buf.is_empty()
    }

    fn wants_write(&self) -> bool {
        !self.write_buf.is_empty() || (self.is_ready() && !self.pending.is_empty())
    }

    /// Start connecting if the connection is down
    pub fn connect(&mut self, now: Instant) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        let address = self.address.clone();
        let limit = self.options.connect_timeout;
        self.connect = Some(Box::pin(async move {
            match tokio::time::timeout(limit, TcpStream::connect(address.as_str())).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        }));
        self.connect_deadline = Some(now + limit);
        self.state = ConnectionState::Connecting;
        debug!("Connecting to {}", self.address);
    }

    /// Future resolving when this connection needs attention
    pub fn wait(&mut self) -> Option<BoxFuture<'_, Wakeup>> {
        let server = self.server;
        if self.connect.is_some() {
            let connect = self.connect.as_mut()?;
            return Some(Box::pin(async move { Wakeup::Connected(server, connect.await) }));
        }

        let mut interest = Interest::READABLE;
        if self.wants_write() {
            interest = interest | Interest::WRITABLE;
        }
        let stream = self.stream.as_ref()?;
        Some(Box::pin(async move {
            Wakeup::Ready(server, stream.ready(interest).await.map(|_| ()))
        }))
    }

    /// Handle the outcome of the connect future
    pub fn on_connected(&mut self, result: io::Result<TcpStream>, events: &mut Vec<ConnEvent>) {
        self.connect = None;
        if self.state != ConnectionState::Connecting {
            return;
        }
        match result {
            Ok(stream) => {
                if let Err(e) = configure_stream(&stream) {
                    warn!("Failed to configure stream to {}: {}", self.address, e);
                }
                self.stream = Some(stream);
                self.stats.connects += 1;
                self.start_handshake(events);
            }
            Err(e) => self.drain_with(MemringError::io(self.address.clone(), &e), true, events),
        }
    }

    fn start_handshake(&mut self, events: &mut Vec<ConnEvent>) {
        let opaque = self.allocate_opaque();
        let frame = match &self.options.credentials {
            Some(credentials) => {
                let mut frame = Frame::request(Opcode::SaslAuth.as_u8(), opaque);
                frame.key = Bytes::from_static(b"PLAIN");
                frame.value = Bytes::from(format!(
                    "\0{}\0{}",
                    credentials.username, credentials.password
                ));
                frame
            }
            None => Frame::request(Opcode::Noop.as_u8(), opaque),
        };

        if let Err(e) = FrameCodec::encode_into(&mut self.write_buf, &frame) {
            let reason = format!("cannot encode handshake: {}", e);
            self.drain(&reason, true, events);
            return;
        }
        self.stats.frames_sent += 1;
        self.in_flight.push_back(InFlight {
            opaque,
            slot: Slot::Handshake,
            stats: Vec::new(),
        });
        self.state = ConnectionState::Handshaking;
        debug!("Handshaking with {}", self.address);
    }

    fn allocate_opaque(&mut self) -> u32 {
        self.next_opaque = self.next_opaque.wrapping_add(1);
        self.next_opaque
    }

    pub fn enqueue(&mut self, command: QueuedCommand) {
        self.pending.push_back(command);
    }

    /// Remove every command not yet written
    pub fn take_pending(&mut self) -> Vec<QueuedCommand> {
        self.pending.drain(..).collect()
    }

    /// Detach a command from this connection; written commands leave a tombstone
    pub fn cancel(&mut self, id: CommandId) -> Option<QueuedCommand> {
        if let Some(idx) = self.pending.iter().position(|queued| queued.id == id) {
            return self.pending.remove(idx);
        }

        let entry = self
            .in_flight
            .iter_mut()
            .find(|entry| matches!(&entry.slot, Slot::Command(queued) if queued.id == id))?;
        let tombstone = Slot::Cancelled {
            opcode: entry.opcode(),
            deadline: entry.deadline().unwrap_or_else(Instant::now),
        };
        match std::mem::replace(&mut entry.slot, tombstone) {
            Slot::Command(queued) => Some(queued),
            _ => None,
        }
    }

    /// Frame pending commands into the write buffer
    fn fill_write_buf(&mut self, events: &mut Vec<ConnEvent>) {
        if !self.is_ready() {
            return;
        }
        while self.write_buf.len() < WRITE_HIGH_WATER {
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            let opaque = self.allocate_opaque();
            let frame = queued.command.to_frame(opaque);
            if let Err(e) = FrameCodec::encode_into(&mut self.write_buf, &frame) {
                let error = MemringError::invalid_command(e.to_string());
                events.push(ConnEvent::Failed(self.server, queued, error));
                continue;
            }
            self.stats.frames_sent += 1;
            self.in_flight.push_back(InFlight {
                opaque,
                slot: Slot::Command(queued),
                stats: Vec::new(),
            });
        }
    }

    /// Write as much buffered data as the socket accepts
    pub fn flush(&mut self, events: &mut Vec<ConnEvent>) {
        loop {
            self.fill_write_buf(events);
            if self.write_buf.is_empty() {
                return;
            }
            let Some(stream) = self.stream.as_ref() else {
                return;
            };
            match stream.try_write(&self.write_buf) {
                Ok(0) => {
                    self.drain("connection closed while writing", true, events);
                    return;
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                    self.stats.bytes_written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.drain_with(MemringError::io(self.address.clone(), &e), true, events);
                    return;
                }
            }
        }
    }

    /// Read whatever the socket has and complete matching commands
    pub fn ingest(&mut self, events: &mut Vec<ConnEvent>) {
        for _ in 0..MAX_READS_PER_TICK {
            let Some(stream) = self.stream.as_ref() else {
                return;
            };
            self.read_buf.reserve(READ_CHUNK);
            match stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    self.drain("connection closed by server", true, events);
                    return;
                }
                Ok(n) => {
                    self.stats.bytes_read += n as u64;
                    if !self.process_read_buf(events) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.drain_with(MemringError::io(self.address.clone(), &e), true, events);
                    return;
                }
            }
        }
    }

    /// Feed raw bytes as if they had been read from the socket
    pub fn ingest_bytes(&mut self, data: &[u8], events: &mut Vec<ConnEvent>) {
        self.stats.bytes_read += data.len() as u64;
        self.read_buf.extend_from_slice(data);
        self.process_read_buf(events);
    }

    /// Decode complete frames; returns false once the connection was drained
    fn process_read_buf(&mut self, events: &mut Vec<ConnEvent>) -> bool {
        loop {
            match FrameCodec::decode_buf(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.stats.frames_received += 1;
                    if !self.on_frame(frame, events) {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    self.drain_with(MemringError::protocol(e.to_string()), true, events);
                    return false;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, events: &mut Vec<ConnEvent>) -> bool {
        if frame.magic != Magic::Response {
            let error = MemringError::protocol("request frame from server");
            self.drain_with(error, true, events);
            return false;
        }
        let expected = match self.in_flight.front_mut() {
            Some(entry) => entry,
            None => {
                let error = MemringError::protocol(format!(
                    "unsolicited response opaque {}",
                    frame.opaque
                ));
                self.drain_with(error, true, events);
                return false;
            }
        };
        if expected.opaque != frame.opaque {
            let error = MemringError::protocol(format!(
                "expected opaque {}, got {}",
                expected.opaque, frame.opaque
            ));
            self.drain_with(error, true, events);
            return false;
        }

        // STAT replies stream one frame per entry, ended by an empty key
        let status_ok = frame.vbucket_or_status == 0;
        if expected.opcode().is_multi_response() && status_ok && !frame.key.is_empty() {
            expected.stats.push((
                String::from_utf8_lossy(&frame.key).into_owned(),
                String::from_utf8_lossy(&frame.value).into_owned(),
            ));
            return true;
        }

        let Some(entry) = self.in_flight.pop_front() else {
            return true;
        };
        match entry.slot {
            Slot::Handshake => {
                let response = Response::from_frame(frame);
                if response.is_success() {
                    self.state = ConnectionState::Ready;
                    self.connect_deadline = None;
                    debug!("Connection to {} is ready", self.address);
                    events.push(ConnEvent::Ready(self.server));
                } else {
                    let reason = format!("handshake rejected: {}", response.status);
                    self.drain(&reason, true, events);
                    return false;
                }
            }
            Slot::Command(queued) => {
                let mut response = Response::from_frame(frame);
                response.stats = entry.stats;
                events.push(ConnEvent::Completed(self.server, queued, response));
            }
            Slot::Cancelled { .. } => {
                debug!(
                    "Dropped response for cancelled command on {}",
                    self.address
                );
            }
        }
        true
    }

    /// Expire overdue connects and commands
    pub fn sweep(&mut self, now: Instant, events: &mut Vec<ConnEvent>) {
        if let Some(deadline) = self.connect_deadline {
            let opening = matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Handshaking
            );
            if opening && deadline <= now {
                let reason = format!(
                    "{} did not finish within {:?}",
                    self.state, self.options.connect_timeout
                );
                self.drain(&reason, true, events);
                return;
            }
        }

        let mut idx = 0;
        while idx < self.pending.len() {
            if self.pending[idx].deadline > now {
                idx += 1;
                continue;
            }
            if let Some(queued) = self.pending.remove(idx) {
                let error = queued.timeout_error();
                events.push(ConnEvent::Failed(self.server, queued, error));
            }
        }

        let mut expired = false;
        let mut idx = 0;
        while idx < self.in_flight.len() {
            if self.in_flight[idx].deadline().map_or(true, |deadline| deadline > now) {
                idx += 1;
                continue;
            }
            expired = true;
            if let Some(entry) = self.in_flight.remove(idx) {
                if let Slot::Command(queued) = entry.slot {
                    let error = queued.timeout_error();
                    events.push(ConnEvent::Failed(self.server, queued, error));
                }
            }
        }

        // responses for the expired commands may still arrive and would break FIFO matching
        if expired {
            self.drain("command timed out", false, events);
        }
    }

    /// Earliest deadline the dispatcher has to wake up for
    pub fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.iter().map(|queued| queued.deadline);
        let in_flight = self.in_flight.iter().filter_map(InFlight::deadline);
        pending
            .chain(in_flight)
            .chain(self.connect_deadline)
            .min()
    }

    /// Fail everything queued on this connection and return to `Disconnected`
    pub fn drain(&mut self, reason: &str, mark_down: bool, events: &mut Vec<ConnEvent>) {
        let cause = MemringError::connection(self.address.clone(), reason);
        self.drain_with(cause, mark_down, events);
    }

    /// Drain after `cause`
    ///
    /// A protocol error is charged to the command at the front of the
    /// in-flight queue, the one whose reply was bad. Every other command
    /// fails with a connection error.
    fn drain_with(&mut self, cause: MemringError, mark_down: bool, events: &mut Vec<ConnEvent>) {
        self.state = ConnectionState::Draining;
        if mark_down {
            cause.log(&format!("Draining connection to {}", self.address));
        } else {
            debug!("Draining connection to {}: {}", self.address, cause);
        }

        let reason = match &cause {
            MemringError::Connection { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let mut front = match cause {
            MemringError::Protocol(_) => Some(cause),
            _ => None,
        };

        for (idx, entry) in self.in_flight.drain(..).enumerate() {
            if let Slot::Command(queued) = entry.slot {
                let error = if idx == 0 { front.take() } else { None }
                    .unwrap_or_else(|| MemringError::connection(self.address.clone(), &reason));
                events.push(ConnEvent::Failed(self.server, queued, error));
            }
        }
        for queued in self.pending.drain(..) {
            let error = MemringError::connection(self.address.clone(), &reason);
            events.push(ConnEvent::Failed(self.server, queued, error));
        }

        self.read_buf.clear();
        self.write_buf.clear();
        self.stream = None;
        self.connect = None;
        self.connect_deadline = None;
        self.stats.drains += 1;
        self.state = ConnectionState::Disconnected;
        events.push(ConnEvent::Closed {
            server: self.server,
            reason,
            mark_down,
        });
    }
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}
