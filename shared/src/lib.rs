//! Protocol definitions and runtime pieces used by both the client and the
//! server: the wire envelope and its framing, argument values, service
//! descriptors, and the single-consumer event dispatch queue.

pub mod chat;
pub mod error;
pub mod event_queue;
pub mod framing;
pub mod protocol;
pub mod service;
pub mod value;

pub use error::{InvocationError, ProtocolError, QueueClosed};
pub use event_queue::{event_queue, EventDispatcher, EventQueue};
pub use protocol::{
    InvocationRequest, InvocationResponse, ListenerRef, Message, MessageSink, MethodId, ObjectEvent,
    ObjectId, RequestId, ServiceBinding, PROTOCOL_VERSION,
};
pub use value::{Args, FromValue, Value};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_generation() {
        let timestamp1 = timestamp_millis();
        std::thread::sleep(Duration::from_millis(2));
        let timestamp2 = timestamp_millis();

        assert!(timestamp2 > timestamp1);
    }
}
