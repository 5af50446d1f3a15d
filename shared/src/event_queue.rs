//! Single-consumer event dispatch queue
//!
//! Network contexts decode traffic and enqueue deferred actions; exactly one
//! [`EventDispatcher`] executes them, strictly in arrival order, against a
//! context it owns outright. Application state therefore never needs a lock
//! as long as it is only touched from queued actions.

use crate::error::QueueClosed;
use log::{info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A deferred invocation delivery or object mutation
pub type Action<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Creates a queue whose actions run against `context`
pub fn event_queue<C>(context: C) -> (EventQueue<C>, EventDispatcher<C>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        EventQueue {
            sender: Arc::new(Mutex::new(Some(sender))),
        },
        EventDispatcher {
            receiver,
            context,
            executed: 0,
        },
    )
}

/// Producer handle. Cheap to clone and usable from any thread; enqueuing
/// never blocks.
pub struct EventQueue<C> {
    // None once shutdown began; dropping the sender lets the consumer drain
    // what is already queued and then stop.
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Action<C>>>>>,
}

impl<C> Clone for EventQueue<C> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<C> EventQueue<C> {
    pub fn enqueue<F>(&self, action: F) -> Result<(), QueueClosed>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let guard = self.sender.lock().map_err(|_| QueueClosed)?;
        match guard.as_ref() {
            Some(sender) => sender.send(Box::new(action)).map_err(|_| QueueClosed),
            None => Err(QueueClosed),
        }
    }

    /// Stops accepting actions. Everything enqueued before this call still
    /// runs before the dispatcher exits.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            if guard.take().is_some() {
                info!("Dispatch queue shutting down");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |s| s.is_closed()),
            Err(_) => true,
        }
    }
}

/// The queue's one consumer
pub struct EventDispatcher<C> {
    receiver: mpsc::UnboundedReceiver<Action<C>>,
    context: C,
    executed: u64,
}

impl<C> EventDispatcher<C> {
    /// Executes actions until the queue is shut down and drained, then hands
    /// the context back.
    pub async fn run(mut self) -> C {
        info!("Dispatch queue running");
        while let Some(action) = self.receiver.recv().await {
            self.execute(action);
        }
        info!("Dispatch queue exited after {} events", self.executed);
        self.context
    }

    /// Same as [`run`](Self::run) for a dedicated OS thread. Must not be
    /// called from within an async runtime.
    pub fn run_blocking(mut self) -> C {
        info!("Dispatch queue running");
        while let Some(action) = self.receiver.blocking_recv() {
            self.execute(action);
        }
        info!("Dispatch queue exited after {} events", self.executed);
        self.context
    }

    /// Executes whatever is queued right now without waiting for more
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(action) = self.receiver.try_recv() {
            self.execute(action);
            count += 1;
        }
        count
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn execute(&mut self, action: Action<C>) {
        self.executed += 1;
        let context = &mut self.context;
        // one failing action must not take the rest of the queue with it
        if catch_unwind(AssertUnwindSafe(move || action(context))).is_err() {
            warn!("Failure dispatching event #{}", self.executed);
        }
    }
}
