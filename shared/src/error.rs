//! Error types shared by both ends of the invocation protocol

use crate::protocol::{MethodId, ObjectId};
use thiserror::Error;

/// Failures turning bytes into envelopes and back
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of a single invocation. These are reported back to the caller's
/// session and never abort the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("no invocation target registered at oid {0}")]
    NoSuchTarget(ObjectId),

    #[error("requested to dispatch unknown method {method_id} on oid {target_oid}")]
    UnknownMethod {
        target_oid: ObjectId,
        method_id: MethodId,
    },

    #[error("bad argument {index}: {reason}")]
    BadArguments { index: usize, reason: String },

    /// Raised by a provider; the string is a message key for the caller.
    #[error("{0}")]
    Failed(String),

    #[error("session closed")]
    SessionClosed,

    #[error("transport failure: {0}")]
    Transport(String),
}

impl InvocationError {
    pub fn bad_arity(expected: usize, got: usize) -> Self {
        InvocationError::BadArguments {
            index: got.min(expected),
            reason: format!("expected {} arguments, got {}", expected, got),
        }
    }
}

impl From<ProtocolError> for InvocationError {
    fn from(err: ProtocolError) -> Self {
        InvocationError::Transport(err.to_string())
    }
}

/// Returned to producers enqueuing after the dispatch queue began shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispatch queue closed")]
pub struct QueueClosed;
