//! Chat service definition: method ids and listener interfaces shared by the
//! client marshaller and the server dispatcher.

use crate::protocol::MethodId;
use crate::service::{InvocationListener, ListenerDescriptor, ServiceDescriptor};

pub const TELL: MethodId = 1;
pub const BROADCAST: MethodId = 2;
pub const AWAY: MethodId = 3;

pub const CHAT_SERVICE: ServiceDescriptor =
    ServiceDescriptor::new("chat", &[("tell", TELL), ("broadcast", BROADCAST), ("away", AWAY)]);

pub const TELL_SUCCEEDED: MethodId = 1;
pub const TELL_SUCCEEDED_IDLE: MethodId = 2;

pub const TELL_LISTENER: ListenerDescriptor = ListenerDescriptor::new(
    "TellListener",
    &[
        ("tell_succeeded", TELL_SUCCEEDED),
        ("tell_succeeded_idle", TELL_SUCCEEDED_IDLE),
    ],
);

/// Name of the message event a chat line arrives as on a client object.
/// Args: `[speaker, message]`.
pub const CHAT_MESSAGE: &str = "chat";

/// Failure key when a tell names a user with no session
pub const USER_NOT_ONLINE: &str = "m.user_not_online";

/// Failure key when a line would not fit in one frame
pub const MESSAGE_TOO_LONG: &str = "m.message_too_long";

/// Attribute on a client object holding its away message; empty when back
pub const AWAY_MESSAGE: &str = "away_message";

/// Outcomes of a `tell` request. Exactly one of these (or `request_failed`)
/// is delivered per call.
pub trait TellListener: InvocationListener {
    fn tell_succeeded(&mut self);

    /// The recipient is marked away and has been for `idle_millis`
    fn tell_succeeded_idle(&mut self, idle_millis: i64);
}
