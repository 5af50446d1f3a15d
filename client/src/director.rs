//! Client-side invocation director
//!
//! The director marshals outgoing requests and keeps the correlation table:
//! every listener argument is swapped for a [`ListenerRef`] token and parked
//! under that token until the server answers. Each response removes its entry
//! before the listener runs, so a listener fires at most once even if the
//! same response arrives twice. A response the listener cannot accept (an
//! unknown method id or malformed arguments) fails it, so every listener
//! sees exactly one outcome. When the session ends every parked listener
//! is told so and the table is emptied.

use log::{debug, warn};
use shared::service::{ListenerDescriptor, REQUEST_FAILED};
use shared::{
    Args, InvocationError, InvocationRequest, InvocationResponse, ListenerRef, Message,
    MessageSink, MethodId, ObjectId, RequestId, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Receives the response to one request on behalf of a typed listener
pub trait ResponseDispatcher: Send {
    /// Response namespace this dispatcher understands
    fn listener_type(&self) -> &'static ListenerDescriptor;

    /// Delivers a response other than `request_failed`. Arguments are
    /// checked before the listener is called; on an error the director
    /// fails the listener instead.
    fn dispatch_response(&mut self, method_id: MethodId, args: Args) -> Result<(), InvocationError>;

    fn request_failed(&mut self, cause: String);
}

/// One argument of an outgoing request
pub enum Arg {
    Value(Value),
    Listener(Box<dyn ResponseDispatcher>),
}

macro_rules! value_arg {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}

value_arg!(Value, bool, i32, i64, f64, String, &str, Vec<u8>);

impl Arg {
    pub fn listener<D: ResponseDispatcher + 'static>(dispatcher: D) -> Self {
        Arg::Listener(Box::new(dispatcher))
    }
}

struct CorrelationTable {
    pending: HashMap<ListenerRef, Box<dyn ResponseDispatcher>>,
    next_request_id: RequestId,
    closed: bool,
}

impl CorrelationTable {
    /// Next id in wrapping order that is not still outstanding
    fn allocate(&mut self, caller_oid: ObjectId) -> ListenerRef {
        loop {
            let token = ListenerRef {
                caller_oid,
                request_id: self.next_request_id,
            };
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if !self.pending.contains_key(&token) {
                return token;
            }
        }
    }
}

pub struct InvocationDirector {
    client_oid: ObjectId,
    sink: Arc<dyn MessageSink>,
    table: Mutex<CorrelationTable>,
}

impl InvocationDirector {
    pub fn new(client_oid: ObjectId, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            client_oid,
            sink,
            table: Mutex::new(CorrelationTable {
                pending: HashMap::new(),
                next_request_id: 1,
                closed: false,
            }),
        }
    }

    pub fn client_oid(&self) -> ObjectId {
        self.client_oid
    }

    fn table(&self) -> MutexGuard<'_, CorrelationTable> {
        // a listener panicking under the lock must not wedge the director
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends a request to `target_oid`. Listener arguments are registered
    /// before the request leaves; if it cannot be sent they are unregistered
    /// again and the error is returned instead of being delivered to them.
    pub fn invoke(
        &self,
        target_oid: ObjectId,
        method_id: MethodId,
        args: Vec<Arg>,
    ) -> Result<(), InvocationError> {
        let mut values = Vec::with_capacity(args.len());
        let mut registered = Vec::new();
        {
            let mut table = self.table();
            if table.closed {
                return Err(InvocationError::SessionClosed);
            }
            for arg in args {
                match arg {
                    Arg::Value(value) => values.push(value),
                    Arg::Listener(listener) => {
                        let token = table.allocate(self.client_oid);
                        table.pending.insert(token, listener);
                        registered.push(token);
                        values.push(Value::Listener(token));
                    }
                }
            }
        }

        let request = InvocationRequest {
            target_oid,
            method_id,
            args: values,
        };
        if let Err(e) = self.sink.post_message(Message::Invocation(request)) {
            let mut table = self.table();
            for token in &registered {
                table.pending.remove(token);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Hands a response to the listener parked under its token
    pub fn dispatch_response(&self, response: InvocationResponse) {
        let token = response.token();
        let listener = self.table().pending.remove(&token);

        let Some(mut listener) = listener else {
            debug!(
                "Dropping response {} for unknown request {}:{}",
                response.method_id, token.caller_oid, token.request_id
            );
            return;
        };

        let listener_type = listener.listener_type();
        if listener_type.method_name(response.method_id).is_none() {
            warn!(
                "Unknown response {} for {} listener (request {})",
                response.method_id, listener_type.name, token.request_id
            );
            listener.request_failed(format!("m.unknown_response_{}", response.method_id));
            return;
        }

        if response.method_id == REQUEST_FAILED {
            let args = Args::new(response.args);
            let cause = args
                .get::<String>(0)
                .unwrap_or_else(|_| "m.internal_error".to_string());
            listener.request_failed(cause);
            return;
        }

        if let Err(e) = listener.dispatch_response(response.method_id, Args::new(response.args)) {
            warn!(
                "Failure dispatching {} response {}: {}",
                listener_type.name, response.method_id, e
            );
            listener.request_failed(e.to_string());
        }
    }

    /// Fails every outstanding listener and refuses further requests
    pub fn session_ended(&self) {
        let pending = {
            let mut table = self.table();
            table.closed = true;
            std::mem::take(&mut table.pending)
        };

        if !pending.is_empty() {
            debug!("Session ended with {} requests outstanding", pending.len());
        }
        let cause = InvocationError::SessionClosed.to_string();
        for (_, mut listener) in pending {
            listener.request_failed(cause.clone());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.table().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed
    }
}
