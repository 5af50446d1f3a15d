//! Readiness loop over the OS multiplexer
//!
//! [`SelectLoop::poll`] blocks in the multiplexer for at most the configured
//! timeout and hands back the ready set as a single-pass iterator: every event
//! pulled from it is evicted from the underlying set, so a later pass never
//! sees it again.
//!
//! Ordinary I/O failures while polling are logged and shrugged off. Anything
//! else counts as a multiplexer malfunction; after
//! [`MAX_CONSECUTIVE_FAILURES`] of those in a row the loop stops polling for
//! good and hands the last error to its failure handler rather than spinning.

use log::{error, warn};
use mio::{Events, Poll, Registry, Token};
use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use thiserror::Error;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 20;

/// One connection (or other registered source) with pending I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the socket errored
    pub closed: bool,
}

impl ReadyEvent {
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            readable: true,
            writable: false,
            closed: false,
        }
    }

    fn merge(&mut self, other: &ReadyEvent) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.closed |= other.closed;
    }
}

/// Sources currently reported ready, one entry per token
#[derive(Debug, Default)]
pub struct ReadySet {
    events: VecDeque<ReadyEvent>,
}

impl ReadySet {
    pub fn insert(&mut self, event: ReadyEvent) {
        match self.events.iter_mut().find(|e| e.token == event.token) {
            Some(existing) => existing.merge(&event),
            None => self.events.push_back(event),
        }
    }

    pub fn pop(&mut self) -> Option<ReadyEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SelectError {
    /// Recoverable; does not count toward escalation
    #[error("i/o failure selecting: {0}")]
    Io(#[from] io::Error),

    #[error("multiplexer malfunction: {0}")]
    Malfunction(String),
}

/// The OS readiness primitive behind a [`SelectLoop`]
pub trait Multiplexer {
    /// Waits up to `timeout` and adds newly ready sources to the ready set.
    /// Returns the number of events the primitive reported.
    fn select(&mut self, timeout: Option<Duration>) -> Result<usize, SelectError>;

    fn ready_set(&mut self) -> &mut ReadySet;
}

/// [`Multiplexer`] backed by epoll/kqueue through mio
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    ready: ReadySet,
}

impl MioMultiplexer {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
            ready: ReadySet::default(),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }
}

impl Multiplexer for MioMultiplexer {
    fn select(&mut self, timeout: Option<Duration>) -> Result<usize, SelectError> {
        self.poll
            .poll(&mut self.events, timeout)
            .map_err(classify_poll_error)?;

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            self.ready.insert(ReadyEvent {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_error(),
            });
        }
        Ok(count)
    }

    fn ready_set(&mut self) -> &mut ReadySet {
        &mut self.ready
    }
}

/// An interrupted or timed out wait is routine. Any other error from the
/// wait itself (bad descriptor, invalid argument) means the multiplexer is
/// broken.
fn classify_poll_error(err: io::Error) -> SelectError {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            SelectError::Io(err)
        }
        _ => SelectError::Malfunction(err.to_string()),
    }
}

pub type FailureHandler = Box<dyn FnOnce(SelectError) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Terminal. Whoever owns the failure handler decides whether to build a
    /// fresh loop.
    Errored,
}

pub struct SelectLoop<M> {
    multiplexer: M,
    select_timeout: Duration,
    failure_handler: Option<FailureHandler>,
    consecutive_failures: u32,
    state: LoopState,
}

impl<M: Multiplexer> SelectLoop<M> {
    pub fn new<F>(multiplexer: M, select_timeout: Duration, failure_handler: F) -> Self
    where
        F: FnOnce(SelectError) + Send + 'static,
    {
        Self {
            multiplexer,
            select_timeout,
            failure_handler: Some(Box::new(failure_handler)),
            consecutive_failures: 0,
            state: LoopState::Running,
        }
    }

    /// Waits for readiness and returns the ready events. Empty on timeout,
    /// on any failure, and forever once the loop has errored.
    pub fn poll(&mut self) -> ReadyEvents<'_> {
        if self.state == LoopState::Errored {
            return ReadyEvents { set: None };
        }

        let timeout = self.select_timeout;
        let multiplexer = &mut self.multiplexer;
        let result = catch_unwind(AssertUnwindSafe(|| multiplexer.select(Some(timeout))))
            .unwrap_or_else(|panic| Err(SelectError::Malfunction(panic_message(panic))));

        match result {
            Ok(count) => {
                self.consecutive_failures = 0;
                let ready = self.multiplexer.ready_set();
                if count == 0 && !ready.is_empty() {
                    warn!(
                        "select() returned no selected sockets, but there are {} in the ready set",
                        ready.len()
                    );
                }
                ReadyEvents { set: Some(ready) }
            }
            Err(SelectError::Io(err)) => {
                warn!("Failure selecting: {}", err);
                self.consecutive_failures = 0;
                ReadyEvents { set: None }
            }
            Err(err) => {
                warn!("Failure selecting: {}", err);
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    self.escalate(err);
                }
                ReadyEvents { set: None }
            }
        }
    }

    fn escalate(&mut self, err: SelectError) {
        error!(
            "Select loop failed {} consecutive times, shutting it down: {}",
            self.consecutive_failures, err
        );
        self.state = LoopState::Errored;
        if let Some(handler) = self.failure_handler.take() {
            handler(err);
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LoopState::Running
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn multiplexer(&self) -> &M {
        &self.multiplexer
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in multiplexer".to_string()
    }
}

/// Single-pass view of the ready set; advancing evicts the event
pub struct ReadyEvents<'a> {
    set: Option<&'a mut ReadySet>,
}

impl Iterator for ReadyEvents<'_> {
    type Item = ReadyEvent;

    fn next(&mut self) -> Option<ReadyEvent> {
        self.set.as_mut()?.pop()
    }
}
