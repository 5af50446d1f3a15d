//! Chat service: dispatcher, listener proxy, and the session-backed provider

use crate::invocation::{Caller, DispatchTable, ListenerProxy};
use crate::session_manager::SessionManager;
use log::info;
use shared::chat::{
    AWAY, AWAY_MESSAGE, BROADCAST, CHAT_MESSAGE, CHAT_SERVICE, MESSAGE_TOO_LONG, TELL,
    TELL_LISTENER, TELL_SUCCEEDED, TELL_SUCCEEDED_IDLE, USER_NOT_ONLINE,
};
use shared::service::{ConfirmListener, InvocationListener, CONFIRM_LISTENER};
use shared::{InvocationError, Message, MessageSink, ObjectEvent, ProtocolError, Value};
use std::sync::{Arc, RwLock};

/// Server-side implementation of the chat service
pub trait ChatProvider: Send + Sync {
    fn tell(
        &self,
        caller: &Caller,
        target: String,
        message: String,
        listener: TellListenerProxy,
    ) -> Result<(), InvocationError>;

    fn broadcast(
        &self,
        caller: &Caller,
        message: String,
        listener: ListenerProxy,
    ) -> Result<(), InvocationError>;

    fn away(&self, caller: &Caller, message: String) -> Result<(), InvocationError>;
}

/// Marshals `TellListener` outcomes back to the caller
pub struct TellListenerProxy(ListenerProxy);

impl TellListenerProxy {
    pub fn new(proxy: ListenerProxy) -> Self {
        Self(proxy.typed(&TELL_LISTENER))
    }
}

impl InvocationListener for TellListenerProxy {
    fn request_failed(&mut self, cause: String) {
        self.0.request_failed(cause);
    }
}

impl shared::chat::TellListener for TellListenerProxy {
    fn tell_succeeded(&mut self) {
        self.0.respond(TELL_SUCCEEDED, vec![]);
    }

    fn tell_succeeded_idle(&mut self, idle_millis: i64) {
        self.0.respond(TELL_SUCCEEDED_IDLE, vec![Value::Long(idle_millis)]);
    }
}

/// Builds the request table routing chat method ids to `provider`
pub fn chat_dispatcher<P: ChatProvider + 'static>(provider: Arc<P>) -> DispatchTable {
    let tell = Arc::clone(&provider);
    let broadcast = Arc::clone(&provider);
    let away = provider;

    DispatchTable::new(&CHAT_SERVICE)
        .with(TELL, move |caller, args| {
            args.expect_len(3)?;
            let listener = TellListenerProxy::new(args.listener(2)?);
            tell.tell(caller, args.get(0)?, args.get(1)?, listener)
        })
        .with(BROADCAST, move |caller, args| {
            args.expect_len(2)?;
            let listener = args.listener(1)?.typed(&CONFIRM_LISTENER);
            broadcast.broadcast(caller, args.get(0)?, listener)
        })
        .with(AWAY, move |caller, args| {
            args.expect_len(1)?;
            away.away(caller, args.get(0)?)
        })
}

/// Chat provider that delivers lines straight to the recipients' sessions
pub struct ChatManager {
    sessions: Arc<RwLock<SessionManager>>,
}

impl ChatManager {
    pub fn new(sessions: Arc<RwLock<SessionManager>>) -> Self {
        Self { sessions }
    }

    fn chat_event(target_oid: shared::ObjectId, speaker: &str, message: &str) -> Message {
        Message::Event(ObjectEvent::MessageEvent {
            target_oid,
            name: CHAT_MESSAGE.to_string(),
            args: vec![speaker.into(), message.into()],
        })
    }
}

fn poisoned<T>(_: T) -> InvocationError {
    InvocationError::Failed("m.internal_error".to_string())
}

fn relay_failed(err: ProtocolError) -> InvocationError {
    match err {
        ProtocolError::FrameTooLarge { .. } => InvocationError::Failed(MESSAGE_TOO_LONG.to_string()),
        err => err.into(),
    }
}

impl ChatProvider for ChatManager {
    fn tell(
        &self,
        caller: &Caller,
        target: String,
        message: String,
        mut listener: TellListenerProxy,
    ) -> Result<(), InvocationError> {
        use shared::chat::TellListener;

        // responding goes back through the session table, so release it first
        let (target_oid, connection, idle) = {
            let sessions = self.sessions.read().map_err(poisoned)?;
            let session = sessions
                .find_by_username(&target)
                .and_then(|oid| sessions.get(oid))
                .ok_or_else(|| InvocationError::Failed(USER_NOT_ONLINE.to_string()))?;
            (session.client_oid, session.connection.clone(), session.away_for())
        };

        connection
            .post_message(Self::chat_event(target_oid, &caller.username, &message))
            .map_err(relay_failed)?;

        match idle {
            Some(idle) => listener.tell_succeeded_idle(idle.as_millis() as i64),
            None => listener.tell_succeeded(),
        }
        Ok(())
    }

    fn broadcast(
        &self,
        caller: &Caller,
        message: String,
        mut listener: ListenerProxy,
    ) -> Result<(), InvocationError> {
        let recipients = self.sessions.read().map_err(poisoned)?.connections();
        info!(
            "Broadcast from {} to {} sessions",
            caller.username,
            recipients.len()
        );

        for (oid, connection) in recipients {
            match connection.post_message(Self::chat_event(oid, &caller.username, &message)) {
                // same size for every recipient, so nobody got it
                Err(err @ ProtocolError::FrameTooLarge { .. }) => return Err(relay_failed(err)),
                // a recipient disconnecting mid-broadcast is not the caller's problem
                Err(_) | Ok(()) => {}
            }
        }
        listener.request_processed();
        Ok(())
    }

    fn away(&self, caller: &Caller, message: String) -> Result<(), InvocationError> {
        let connection = {
            let mut sessions = self.sessions.write().map_err(poisoned)?;
            match sessions.get_mut(caller.client_oid) {
                Some(session) => {
                    session.set_away(message.clone());
                    session.connection.clone()
                }
                None => return Ok(()),
            }
        };

        let event = Message::Event(ObjectEvent::AttributeChanged {
            target_oid: caller.client_oid,
            name: AWAY_MESSAGE.to_string(),
            value: Value::Str(message),
        });
        connection.post_message(event).map_err(relay_failed)
    }
}
