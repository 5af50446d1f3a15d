//! Typed client for the chat service

use crate::director::{Arg, InvocationDirector, ResponseDispatcher};
use shared::chat::{
    TellListener, AWAY, BROADCAST, CHAT_SERVICE, TELL, TELL_LISTENER, TELL_SUCCEEDED,
    TELL_SUCCEEDED_IDLE,
};
use shared::service::{
    ConfirmListener, InvocationListener, ListenerDescriptor, CONFIRM_LISTENER, REQUEST_PROCESSED,
};
use shared::{Args, InvocationError, MethodId, ObjectId};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Marshals chat calls to the service object at `oid`
#[derive(Clone)]
pub struct ChatMarshaller {
    director: Arc<InvocationDirector>,
    oid: ObjectId,
}

impl ChatMarshaller {
    pub fn new(director: Arc<InvocationDirector>, oid: ObjectId) -> Self {
        Self { director, oid }
    }

    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    pub fn service_name() -> &'static str {
        CHAT_SERVICE.name
    }

    /// Sends a private line to `target`
    pub fn tell<L: TellListener + 'static>(
        &self,
        target: &str,
        message: &str,
        listener: L,
    ) -> Result<(), InvocationError> {
        self.director.invoke(
            self.oid,
            TELL,
            vec![
                target.into(),
                message.into(),
                Arg::listener(TellMarshaller(listener)),
            ],
        )
    }

    /// Sends a line to every logged on user
    pub fn broadcast<L: ConfirmListener + 'static>(
        &self,
        message: &str,
        listener: L,
    ) -> Result<(), InvocationError> {
        self.director.invoke(
            self.oid,
            BROADCAST,
            vec![message.into(), Arg::listener(ConfirmMarshaller(listener))],
        )
    }

    /// Sets the away message; empty clears it
    pub fn away(&self, message: &str) -> Result<(), InvocationError> {
        self.director.invoke(self.oid, AWAY, vec![message.into()])
    }
}

/// Turns `TellListener` responses back into calls on the listener
pub struct TellMarshaller<L>(pub L);

impl<L: TellListener> ResponseDispatcher for TellMarshaller<L> {
    fn listener_type(&self) -> &'static ListenerDescriptor {
        &TELL_LISTENER
    }

    fn dispatch_response(&mut self, method_id: MethodId, args: Args) -> Result<(), InvocationError> {
        match method_id {
            TELL_SUCCEEDED => {
                self.0.tell_succeeded();
                Ok(())
            }
            TELL_SUCCEEDED_IDLE => {
                args.expect_len(1)?;
                self.0.tell_succeeded_idle(args.get(0)?);
                Ok(())
            }
            _ => Err(InvocationError::Failed(format!("m.unhandled_response_{}", method_id))),
        }
    }

    fn request_failed(&mut self, cause: String) {
        self.0.request_failed(cause);
    }
}

pub struct ConfirmMarshaller<L>(pub L);

impl<L: ConfirmListener> ResponseDispatcher for ConfirmMarshaller<L> {
    fn listener_type(&self) -> &'static ListenerDescriptor {
        &CONFIRM_LISTENER
    }

    fn dispatch_response(&mut self, method_id: MethodId, _args: Args) -> Result<(), InvocationError> {
        match method_id {
            REQUEST_PROCESSED => {
                self.0.request_processed();
                Ok(())
            }
            _ => Err(InvocationError::Failed(format!("m.unhandled_response_{}", method_id))),
        }
    }

    fn request_failed(&mut self, cause: String) {
        self.0.request_failed(cause);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TellOutcome {
    Succeeded,
    SucceededIdle(i64),
    Failed(String),
}

/// `TellListener` that forwards its outcome to a oneshot channel
pub struct TellReply(Option<oneshot::Sender<TellOutcome>>);

impl TellReply {
    pub fn channel() -> (Self, oneshot::Receiver<TellOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    fn send(&mut self, outcome: TellOutcome) {
        if let Some(tx) = self.0.take() {
            // receiver gone means the caller stopped waiting
            let _ = tx.send(outcome);
        }
    }
}

impl InvocationListener for TellReply {
    fn request_failed(&mut self, cause: String) {
        self.send(TellOutcome::Failed(cause));
    }
}

impl TellListener for TellReply {
    fn tell_succeeded(&mut self) {
        self.send(TellOutcome::Succeeded);
    }

    fn tell_succeeded_idle(&mut self, idle_millis: i64) {
        self.send(TellOutcome::SucceededIdle(idle_millis));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Processed,
    Failed(String),
}

/// `ConfirmListener` that forwards its outcome to a oneshot channel
pub struct ConfirmReply(Option<oneshot::Sender<ConfirmOutcome>>);

impl ConfirmReply {
    pub fn channel() -> (Self, oneshot::Receiver<ConfirmOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    fn send(&mut self, outcome: ConfirmOutcome) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl InvocationListener for ConfirmReply {
    fn request_failed(&mut self, cause: String) {
        self.send(ConfirmOutcome::Failed(cause));
    }
}

impl ConfirmListener for ConfirmReply {
    fn request_processed(&mut self) {
        self.send(ConfirmOutcome::Processed);
    }
}
