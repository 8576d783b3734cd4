use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use stp_frame::{encode_frame, Frame, FrameDecoder, FrameError, Status};
use stp_transport::ScopeStream;
use tracing::{debug, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, ScopeError};
use crate::events::{Event, EventSink};
use crate::pending::PendingTable;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);
const EVENTS_CAPACITY: usize = 64;
/// Stop moving queued frames into the write buffer past this many bytes.
const WRITE_HIGH_WATER: usize = 256 * 1024;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Ready,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// True once the connection can no longer carry calls.
    pub fn is_terminal(self) -> bool {
        self >= Self::Closing
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// State shared between callers and the reactor thread.
pub(crate) struct Shared {
    state: AtomicU8,
    outbound: Mutex<VecDeque<Bytes>>,
    pub(crate) pending: PendingTable,
    waker: Waker,
    close_requested: AtomicBool,
    max_frame_size: usize,
    peer: Option<SocketAddr>,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move the state forward to `next`; moving backwards is a no-op.
    pub(crate) fn advance(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state.fetch_max(next as u8, Ordering::AcqRel);
        ConnectionState::from_u8(previous.max(next as u8))
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Encode `frame` onto the send queue and wake the reactor.
    pub(crate) fn enqueue(&self, frame: &Frame) -> Result<()> {
        if frame.envelope_size() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: frame.envelope_size(),
                max: self.max_frame_size,
            }
            .into());
        }
        if self.state().is_terminal() {
            return Err(ScopeError::Disconnected(format!(
                "connection is {}",
                self.state()
            )));
        }

        let mut buf = BytesMut::with_capacity(frame.wire_size());
        encode_frame(frame, &mut buf)?;
        self.outbound.lock().push_back(buf.freeze());
        self.waker.wake()?;
        Ok(())
    }

    /// Ask the reactor to shut the connection down.
    pub(crate) fn request_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.waker.wake() {
                debug!(error = %err, "failed to wake reactor for close");
            }
        }
    }

    fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }
}

/// Start the reactor thread for an established stream.
pub(crate) fn spawn_reactor(
    stream: ScopeStream,
    config: &RuntimeConfig,
    events: EventSink,
) -> Result<(Arc<Shared>, JoinHandle<()>)> {
    let std_stream = stream.into_std();
    std_stream.set_nonblocking(true)?;
    let peer = std_stream.peer_addr().ok();
    let mut socket = TcpStream::from_std(std_stream);

    let poll = Poll::new()?;
    poll.registry()
        .register(&mut socket, SOCKET, Interest::READABLE)?;
    let waker = Waker::new(poll.registry(), WAKER)?;

    let shared = Arc::new(Shared {
        state: AtomicU8::new(ConnectionState::Connecting as u8),
        outbound: Mutex::new(VecDeque::new()),
        pending: PendingTable::new(config.max_pending_calls),
        waker,
        close_requested: AtomicBool::new(false),
        max_frame_size: config.frame.max_frame_size,
        peer,
    });

    let reactor = Reactor {
        poll,
        socket,
        shared: Arc::clone(&shared),
        decoder: FrameDecoder::new(config.frame.max_frame_size),
        write_buf: BytesMut::new(),
        write_interest: false,
        read_buf: vec![0u8; config.read_chunk_size.max(512)],
        events,
    };

    let handle = thread::Builder::new()
        .name("stp-reactor".to_string())
        .spawn(move || reactor.run())?;
    Ok((shared, handle))
}

/// Owns the socket. Reads and decodes inbound frames, routes responses to
/// pending calls and events to the dispatcher, and drains the send queue.
struct Reactor {
    poll: Poll,
    socket: TcpStream,
    shared: Arc<Shared>,
    decoder: FrameDecoder,
    write_buf: BytesMut,
    write_interest: bool,
    read_buf: Vec<u8>,
    events: EventSink,
}

impl Reactor {
    fn run(mut self) {
        debug!(peer = ?self.shared.peer, "reactor started");
        let reason = match self.event_loop() {
            Ok(reason) => reason,
            Err(err) => err.to_string(),
        };
        self.teardown(&reason);
    }

    /// Runs until the connection ends; returns why.
    fn event_loop(&mut self) -> Result<String> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if self.shared.close_requested() {
                return Ok("connection closed locally".to_string());
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            for event in events.iter() {
                if event.token() != SOCKET {
                    continue;
                }
                if event.is_readable() || event.is_read_closed() {
                    if let Some(reason) = self.read_available()? {
                        return Ok(reason);
                    }
                }
                if event.is_error() {
                    let err = self
                        .socket
                        .take_error()?
                        .unwrap_or_else(|| std::io::Error::other("socket error"));
                    return Err(err.into());
                }
            }

            if self.shared.close_requested() {
                return Ok("connection closed locally".to_string());
            }

            self.pump_outbound()?;
            self.update_interest()?;
        }
    }

    /// Read until the socket would block. `Some(reason)` on EOF.
    fn read_available(&mut self) -> Result<Option<String>> {
        loop {
            match self.socket.read(&mut self.read_buf) {
                Ok(0) => return Ok(Some("peer closed the connection".to_string())),
                Ok(n) => {
                    trace!(bytes = n, "socket read");
                    self.decoder.feed(&self.read_buf[..n]);
                    self.decode_frames()?;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn decode_frames(&mut self) -> Result<()> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.route(frame),
                Ok(None) => return Ok(()),
                Err(err) if !err.is_fatal() => {
                    warn!(error = %err, "dropping undecodable frame");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn route(&self, frame: Frame) {
        match frame.status {
            Status::Ok | Status::Error => match self.shared.pending.complete(frame) {
                Ok(elapsed) => {
                    trace!(elapsed_us = elapsed.as_micros() as u64, "response correlated");
                }
                Err(frame) => {
                    warn!(
                        service = %frame.service,
                        command_id = frame.command_id,
                        tag = frame.tag,
                        status = %frame.status,
                        "dropping response with no pending call"
                    );
                }
            },
            Status::Event => {
                trace!(service = %frame.service, id = frame.command_id, "event received");
                self.events.deliver(Event::from(frame));
            }
            Status::Command => {
                warn!(
                    service = %frame.service,
                    command_id = frame.command_id,
                    "browser sent a command frame; dropping"
                );
            }
        }
    }

    /// Move queued frames to the socket until the queue is empty or the
    /// socket stops accepting bytes.
    fn pump_outbound(&mut self) -> Result<()> {
        loop {
            let more_queued = {
                let mut queue = self.shared.outbound.lock();
                take_outbound(&mut queue, &mut self.write_buf, WRITE_HIGH_WATER)
            };
            self.flush()?;
            if !more_queued || !self.write_buf.is_empty() {
                return Ok(());
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => {
                    return Err(ScopeError::Disconnected(
                        "socket accepted zero bytes".to_string(),
                    ))
                }
                Ok(n) => {
                    trace!(bytes = n, "socket write");
                    self.write_buf.advance(n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Ask for WRITABLE only while bytes are waiting to go out.
    fn update_interest(&mut self) -> Result<()> {
        let want_write = !self.write_buf.is_empty();
        if want_write == self.write_interest {
            return Ok(());
        }
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll
            .registry()
            .reregister(&mut self.socket, SOCKET, interest)?;
        self.write_interest = want_write;
        Ok(())
    }

    fn teardown(&mut self, reason: &str) {
        self.shared.advance(ConnectionState::Closing);
        if let Err(err) = self.poll.registry().deregister(&mut self.socket) {
            trace!(error = %err, "deregister failed during teardown");
        }
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            if err.kind() != ErrorKind::NotConnected {
                debug!(error = %err, "socket shutdown failed");
            }
        }

        let unsent = {
            let mut queue = self.shared.outbound.lock();
            let count = queue.len();
            queue.clear();
            count
        };
        let failed = self.shared.pending.fail_all(reason);
        self.shared.advance(ConnectionState::Closed);
        info!(reason, failed_calls = failed, unsent_frames = unsent, "connection closed");
    }
}

/// Append queued frames to `write_buf` while it holds fewer than
/// `high_water` bytes. Frames are never split. Returns true if frames
/// remain queued.
fn take_outbound(
    queue: &mut VecDeque<Bytes>,
    write_buf: &mut BytesMut,
    high_water: usize,
) -> bool {
    while write_buf.len() < high_water {
        match queue.pop_front() {
            Some(bytes) => write_buf.extend_from_slice(&bytes),
            None => return false,
        }
    }
    !queue.is_empty()
}
