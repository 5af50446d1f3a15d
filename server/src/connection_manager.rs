//! I/O thread: accepts connections, reads and writes their sockets
//!
//! The manager owns every [`Connection`] and the [`SelectLoop`] watching them.
//! Decoded traffic is handed to a [`ConnectionEvents`] implementation, which
//! for the real server just enqueues it on the dispatch queue. `Ping` and
//! `Logoff` are handled right here without a trip through the queue.
//!
//! Other threads reach the I/O thread through [`IoHandle`]: posting to a
//! [`ConnectionHandle`] records a flush request and wakes the multiplexer.

use crate::connection::{Connection, ConnectionHandle, ConnectionId, FlushHook};
use crate::select_loop::{MioMultiplexer, ReadyEvent, SelectError, SelectLoop};
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Interest, Registry, Token, Waker};
use shared::{Message, MessageSink};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const EVENT_CAPACITY: usize = 1024;

/// Receives decoded traffic from the I/O thread
pub trait ConnectionEvents: Send {
    fn message_received(&mut self, connection: &ConnectionHandle, message: Message);

    /// The connection is gone; nothing more will be read from or written to it
    fn connection_closed(&mut self, connection: &ConnectionHandle);
}

struct IoSignal {
    pending_flushes: Mutex<Vec<ConnectionId>>,
    shutdown: AtomicBool,
    waker: Waker,
}

impl IoSignal {
    fn request_flush(&self, id: ConnectionId) {
        if let Ok(mut pending) = self.pending_flushes.lock() {
            pending.push(id);
        }
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake I/O thread: {}", e);
        }
    }

    fn take_flushes(&self) -> Vec<ConnectionId> {
        self.pending_flushes
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Lets other threads stop the I/O thread
#[derive(Clone)]
pub struct IoHandle {
    signal: Arc<IoSignal>,
}

impl IoHandle {
    pub fn shutdown(&self) {
        self.signal.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.signal.waker.wake() {
            warn!("Failed to wake I/O thread for shutdown: {}", e);
        }
    }
}

pub struct ConnectionManager<E> {
    select_loop: SelectLoop<MioMultiplexer>,
    registry: Registry,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    signal: Arc<IoSignal>,
    events: E,
    max_frame_len: usize,
}

impl<E: ConnectionEvents> ConnectionManager<E> {
    /// Binds the listening socket. `on_failure` runs on the I/O thread if the
    /// readiness loop gives up.
    pub fn bind<F>(
        addr: SocketAddr,
        select_timeout: Duration,
        max_frame_len: usize,
        events: E,
        on_failure: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(SelectError) + Send + 'static,
    {
        let multiplexer = MioMultiplexer::new(EVENT_CAPACITY)?;
        let registry = multiplexer.registry().try_clone()?;

        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        registry.register(&mut listener, LISTENER, Interest::READABLE)?;

        let signal = Arc::new(IoSignal {
            pending_flushes: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            waker: Waker::new(&registry, WAKER)?,
        });

        info!("Listening on {}", local_addr);

        Ok(Self {
            select_loop: SelectLoop::new(multiplexer, select_timeout, on_failure),
            registry,
            listener,
            local_addr,
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION,
            signal,
            events,
            max_frame_len,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn io_handle(&self) -> IoHandle {
        IoHandle {
            signal: Arc::clone(&self.signal),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs until shut down through an [`IoHandle`] or until the readiness
    /// loop errors. Every remaining connection is closed on the way out.
    pub fn run(mut self) -> E {
        info!("I/O thread running");
        while !self.signal.is_shutdown() && self.select_loop.is_running() {
            self.tick();
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(connection) = self.connections.get_mut(&id) {
                // best effort so queued failures and responses reach the peer
                let _ = connection.flush();
            }
            self.close(id);
        }
        info!("I/O thread exited");
        self.events
    }

    /// One pass over whatever is ready
    pub fn tick(&mut self) {
        let ready: Vec<ReadyEvent> = self.select_loop.poll().collect();
        for event in ready {
            match event.token {
                LISTENER => self.accept_connections(),
                WAKER => self.flush_requested(),
                Token(id) => self.connection_ready(id, event),
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let id = self.next_id;
                    self.next_id += 1;

                    if let Err(e) = self
                        .registry
                        .register(&mut stream, Token(id), Interest::READABLE)
                    {
                        error!("Failed to register connection from {}: {}", addr, e);
                        continue;
                    }

                    let signal = Arc::clone(&self.signal);
                    let hook: FlushHook = Arc::new(move |id| signal.request_flush(id));
                    let handle = ConnectionHandle::new(id, addr, hook)
                        .with_max_frame_len(self.max_frame_len);
                    self.connections
                        .insert(id, Connection::new(stream, handle, self.max_frame_len));
                    info!("Accepted connection {} from {}", id, addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Failure accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    fn flush_requested(&mut self) {
        let mut ids = self.signal.take_flushes();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            self.flush(id);
        }
    }

    fn connection_ready(&mut self, id: ConnectionId, event: ReadyEvent) {
        if event.readable || event.closed {
            self.read(id);
        }
        if event.writable && self.connections.contains_key(&id) {
            self.flush(id);
        }
    }

    fn read(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id) else {
            debug!("Readiness for unknown connection {}", id);
            return;
        };

        let outcome = connection.read_messages();
        let handle = connection.handle().clone();
        for message in outcome.messages {
            match message {
                Message::Ping { timestamp } => {
                    if let Err(e) = handle.post_message(Message::Pong { timestamp }) {
                        debug!("Dropping pong for connection {}: {}", id, e);
                    }
                }
                Message::Logoff => {
                    info!("Connection {} logged off", id);
                    self.close(id);
                    return;
                }
                message => self.events.message_received(&handle, message),
            }
        }

        if let Some(e) = outcome.error {
            warn!("Closing connection {} ({}): {}", id, handle.addr(), e);
            self.close(id);
        } else if outcome.eof {
            self.close(id);
        }
    }

    fn flush(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };

        match connection.flush() {
            Ok(done) => {
                if done == connection.awaiting_writable {
                    let interest = if done {
                        Interest::READABLE
                    } else {
                        Interest::READABLE.add(Interest::WRITABLE)
                    };
                    if let Err(e) =
                        self.registry
                            .reregister(connection.stream_mut(), Token(id), interest)
                    {
                        warn!("Failed to update interest for connection {}: {}", id, e);
                    }
                    connection.awaiting_writable = !done;
                }
            }
            Err(e) => {
                warn!("Failure writing to connection {}: {}", id, e);
                self.close(id);
            }
        }
    }

    fn close(&mut self, id: ConnectionId) {
        let Some(mut connection) = self.connections.remove(&id) else {
            return;
        };

        connection.handle().mark_closed();
        if let Err(e) = self.registry.deregister(connection.stream_mut()) {
            debug!("Failed to deregister connection {}: {}", id, e);
        }
        info!(
            "Connection {} from {} closed",
            id,
            connection.handle().addr()
        );
        self.events.connection_closed(connection.handle());
    }
}
