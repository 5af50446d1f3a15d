//! Client connections
//!
//! A [`Connection`] is owned by the I/O thread, which alone reads from and
//! writes to its socket. Everyone else addresses it through a cloneable
//! [`ConnectionHandle`] that appends framed messages to the shared outbound
//! buffer and asks the I/O thread to flush.

use log::warn;
use mio::net::TcpStream;
use shared::framing::{FrameReader, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
use shared::{Message, MessageSink, ProtocolError};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type ConnectionId = usize;

/// Called with the connection id whenever it has fresh outbound bytes
pub type FlushHook = Arc<dyn Fn(ConnectionId) + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    addr: SocketAddr,
    // one writer at a time; the I/O thread takes the same lock to flush
    outbound: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    flush: FlushHook,
    /// Largest body the peer's reader accepts
    max_frame_len: usize,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, addr: SocketAddr, flush: FlushHook) -> Self {
        Self {
            id,
            addr,
            outbound: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            flush,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.lock().map(|buf| buf.len()).unwrap_or(0)
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// Decodes and clears everything buffered for the peer
    pub(crate) fn take_sent(&self) -> Vec<Message> {
        let bytes = std::mem::take(&mut *self.outbound.lock().unwrap());
        let mut reader = FrameReader::new(usize::MAX);
        reader.extend(&bytes);
        let mut sent = Vec::new();
        while let Some(body) = reader.next_frame().unwrap() {
            sent.push(Message::from_frame_body(&body).unwrap());
        }
        sent
    }
}

impl MessageSink for ConnectionHandle {
    fn post_message(&self, message: Message) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }

        // an oversized frame would make the peer drop the whole connection
        let frame = message.to_frame()?;
        let len = frame.len() - HEADER_LEN;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        {
            let mut outbound = self
                .outbound
                .lock()
                .map_err(|_| ProtocolError::Closed)?;
            outbound.extend_from_slice(&frame);
        }
        (self.flush)(self.id);
        Ok(())
    }
}

/// Messages decoded from one readable event
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub messages: Vec<Message>,
    /// The peer closed its end
    pub eof: bool,
    /// Set when the connection must be closed after `messages` are handled
    pub error: Option<ProtocolError>,
}

pub struct Connection {
    stream: TcpStream,
    handle: ConnectionHandle,
    reader: FrameReader,
    /// Whether WRITABLE interest is currently registered
    pub awaiting_writable: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, handle: ConnectionHandle, max_frame_len: usize) -> Self {
        Self {
            stream,
            handle,
            reader: FrameReader::new(max_frame_len),
            awaiting_writable: false,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drains the socket and decodes every complete frame.
    ///
    /// A frame that fails to decode is logged and skipped. An oversized frame
    /// or socket error is reported in [`ReadOutcome::error`] alongside the
    /// messages that arrived before it.
    pub fn read_messages(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let mut buffer = [0u8; 4096];

        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => self.reader.extend(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome.error = Some(e.into());
                    break;
                }
            }
        }

        loop {
            match self.reader.next_frame() {
                Ok(Some(body)) => match Message::from_frame_body(&body) {
                    Ok(message) => outcome.messages.push(message),
                    Err(e) => warn!(
                        "Dropping undecodable message from {}: {}",
                        self.handle.addr, e
                    ),
                },
                Ok(None) => break,
                Err(e) => {
                    outcome.error.get_or_insert(e);
                    break;
                }
            }
        }

        outcome
    }

    /// Writes as much of the outbound buffer as the socket takes. Returns
    /// true once the buffer is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        let mut outbound = self
            .handle
            .outbound
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "outbound buffer poisoned"))?;

        while !outbound.is_empty() {
            match self.stream.write(&outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
