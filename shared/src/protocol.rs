//! Wire envelope exchanged between clients and the server
//!
//! Every frame on a connection carries exactly one [`Message`]. Invocation
//! requests and responses are generic `(target, method, args)` tuples; the
//! typed service layer on either side turns them back into method calls.

use crate::error::ProtocolError;
use crate::framing;
use crate::value::Value;
use serde::{Deserialize, Serialize};

pub type ObjectId = i32;
pub type MethodId = u8;
pub type RequestId = u32;

/// Bumped whenever the envelope changes shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Correlation token standing in for a callback on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerRef {
    pub caller_oid: ObjectId,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub target_oid: ObjectId,
    pub method_id: MethodId,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub caller_oid: ObjectId,
    pub request_id: RequestId,
    pub method_id: MethodId,
    pub args: Vec<Value>,
}

impl InvocationResponse {
    pub fn token(&self) -> ListenerRef {
        ListenerRef {
            caller_oid: self.caller_oid,
            request_id: self.request_id,
        }
    }
}

/// Distributed object mutations. They share the connection, and therefore the
/// ordering domain, with invocation traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectEvent {
    AttributeChanged {
        target_oid: ObjectId,
        name: String,
        value: Value,
    },
    MessageEvent {
        target_oid: ObjectId,
        name: String,
        args: Vec<Value>,
    },
}

impl ObjectEvent {
    pub fn target_oid(&self) -> ObjectId {
        match self {
            ObjectEvent::AttributeChanged { target_oid, .. } => *target_oid,
            ObjectEvent::MessageEvent { target_oid, .. } => *target_oid,
        }
    }
}

/// Tells a freshly logged on client which oid answers for each service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub service: String,
    pub oid: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Upstream
    Logon {
        version: u32,
        username: String,
    },
    Invocation(InvocationRequest),
    Ping {
        timestamp: u64,
    },
    Logoff,

    // Downstream
    Bootstrap {
        client_oid: ObjectId,
        services: Vec<ServiceBinding>,
    },
    InvocationResponse(InvocationResponse),
    Event(ObjectEvent),
    Pong {
        timestamp: u64,
    },
    Failure {
        reason: String,
    },
}

impl Message {
    /// Serializes the message and wraps it in a length-prefixed frame
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = bincode::serialize(self).map_err(ProtocolError::Encode)?;
        Ok(framing::frame(&body))
    }

    /// Decodes the body of one frame (without its length prefix)
    pub fn from_frame_body(body: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(body).map_err(ProtocolError::Decode)
    }
}

/// Anything a message can be handed to for delivery over a connection
pub trait MessageSink: Send + Sync {
    fn post_message(&self, message: Message) -> Result<(), ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameReader;

    #[test]
    fn test_invocation_request_through_frame() {
        let message = Message::Invocation(InvocationRequest {
            target_oid: 5,
            method_id: 1,
            args: vec![
                "hi".into(),
                "there".into(),
                Value::Listener(ListenerRef {
                    caller_oid: 12,
                    request_id: 1,
                }),
            ],
        });

        let frame = message.to_frame().unwrap();
        let mut reader = FrameReader::new(framing::DEFAULT_MAX_FRAME_LEN);
        reader.extend(&frame);
        let body = reader.next_frame().unwrap().unwrap();

        match Message::from_frame_body(&body).unwrap() {
            Message::Invocation(req) => {
                assert_eq!(req.target_oid, 5);
                assert_eq!(req.method_id, 1);
                assert_eq!(req.args.len(), 3);
                assert_eq!(
                    req.args[2],
                    Value::Listener(ListenerRef {
                        caller_oid: 12,
                        request_id: 1
                    })
                );
            }
            other => panic!("Wrong message type after decoding: {:?}", other),
        }
    }

    #[test]
    fn test_response_token() {
        let response = InvocationResponse {
            caller_oid: 4,
            request_id: 77,
            method_id: 2,
            args: vec![Value::Long(1500)],
        };
        assert_eq!(
            response.token(),
            ListenerRef {
                caller_oid: 4,
                request_id: 77
            }
        );
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let result = Message::from_frame_body(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_event_target() {
        let event = ObjectEvent::MessageEvent {
            target_oid: 9,
            name: "chat".to_string(),
            args: vec![],
        };
        assert_eq!(event.target_oid(), 9);
    }
}
