//! Client connection over TCP
//!
//! After logon the connection is split in two tasks. The writer task is the
//! only thing that writes to the socket; everyone else posts messages to it
//! through a channel. The reader task decodes frames and enqueues responses
//! and object events on the client's dispatch queue, so they are handled in
//! arrival order and never concurrently.

use crate::chat::ChatMarshaller;
use crate::director::InvocationDirector;
use crate::mirror::ObjectMirror;
use log::{debug, info, warn};
use shared::chat::CHAT_SERVICE;
use shared::framing::{FrameReader, DEFAULT_MAX_FRAME_LEN};
use shared::{
    event_queue, timestamp_millis, EventQueue, Message, MessageSink, ObjectEvent, ObjectId,
    ProtocolError, ServiceBinding, Value, PROTOCOL_VERSION,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("logon refused: {0}")]
    Refused(String),

    #[error("connection closed before logon completed")]
    Closed,
}

/// Posts messages to the connection's writer task
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSink for ChannelSink {
    fn post_message(&self, message: Message) -> Result<(), ProtocolError> {
        self.tx.send(message).map_err(|_| ProtocolError::Closed)
    }
}

/// Called with (target oid, event name, arguments) for each message event
pub type MessageHandler = Box<dyn FnMut(ObjectId, &str, &[Value]) + Send>;

/// State owned by the client's dispatch queue
pub struct ClientContext {
    pub director: Arc<InvocationDirector>,
    pub objects: ObjectMirror,
    message_handlers: Vec<MessageHandler>,
}

impl ClientContext {
    pub fn new(director: Arc<InvocationDirector>) -> Self {
        Self {
            director,
            objects: ObjectMirror::new(),
            message_handlers: Vec::new(),
        }
    }

    pub fn add_message_handler(&mut self, handler: MessageHandler) {
        self.message_handlers.push(handler);
    }

    pub fn apply_event(&mut self, event: ObjectEvent) {
        self.objects.apply(&event);
        if let ObjectEvent::MessageEvent {
            target_oid,
            name,
            args,
        } = &event
        {
            for handler in &mut self.message_handlers {
                handler(*target_oid, name, args);
            }
        }
    }
}

pub struct Client {
    client_oid: ObjectId,
    services: Vec<ServiceBinding>,
    director: Arc<InvocationDirector>,
    sink: ChannelSink,
    queue: EventQueue<ClientContext>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<ClientContext>,
}

impl Client {
    /// Connects, logs on as `username` and waits for the bootstrap
    pub async fn connect(addr: &str, username: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let logon = Message::Logon {
            version: PROTOCOL_VERSION,
            username: username.to_string(),
        };
        write_half.write_all(&logon.to_frame()?).await?;

        let mut frames = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
        let (client_oid, services) = loop {
            match next_message(&mut read_half, &mut frames).await? {
                Some(Message::Bootstrap {
                    client_oid,
                    services,
                }) => break (client_oid, services),
                Some(Message::Failure { reason }) => return Err(ClientError::Refused(reason)),
                Some(other) => debug!("Ignoring {:?} before bootstrap", other),
                None => return Err(ClientError::Closed),
            }
        };
        info!("Logged on to {} as {} (oid {})", addr, username, client_oid);

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink { tx };
        let director = Arc::new(InvocationDirector::new(client_oid, Arc::new(sink.clone())));

        let (queue, dispatcher) = event_queue(ClientContext::new(Arc::clone(&director)));
        let dispatcher = tokio::spawn(dispatcher.run());
        let writer = tokio::spawn(write_loop(write_half, rx));
        let reader = tokio::spawn(read_loop(read_half, frames, queue.clone()));

        Ok(Self {
            client_oid,
            services,
            director,
            sink,
            queue,
            reader,
            writer,
            dispatcher,
        })
    }

    pub fn client_oid(&self) -> ObjectId {
        self.client_oid
    }

    pub fn services(&self) -> &[ServiceBinding] {
        &self.services
    }

    pub fn service_oid(&self, service: &str) -> Option<ObjectId> {
        self.services
            .iter()
            .find(|binding| binding.service == service)
            .map(|binding| binding.oid)
    }

    pub fn director(&self) -> Arc<InvocationDirector> {
        Arc::clone(&self.director)
    }

    /// Chat marshaller bound to the server's chat service, if it has one
    pub fn chat(&self) -> Option<ChatMarshaller> {
        self.service_oid(CHAT_SERVICE.name)
            .map(|oid| ChatMarshaller::new(self.director(), oid))
    }

    /// Dispatch queue shared with the connection's reader
    pub fn queue(&self) -> EventQueue<ClientContext> {
        self.queue.clone()
    }

    /// Registers a handler for message events, run on the dispatch queue
    pub fn on_message<F>(&self, handler: F) -> Result<(), ClientError>
    where
        F: FnMut(ObjectId, &str, &[Value]) + Send + 'static,
    {
        let handler: MessageHandler = Box::new(handler);
        self.queue
            .enqueue(move |ctx| ctx.add_message_handler(handler))
            .map_err(|_| ClientError::Closed)
    }

    /// Round trip time is logged when the pong arrives
    pub fn ping(&self) -> Result<(), ProtocolError> {
        self.sink.post_message(Message::Ping {
            timestamp: timestamp_millis(),
        })
    }

    /// Logs off and waits for the server to close the connection. Whatever
    /// is still outstanding fails with a closed session.
    pub async fn disconnect(self) -> ClientContext {
        if let Err(e) = self.sink.post_message(Message::Logoff) {
            debug!("Logoff not sent: {}", e);
        }
        if let Err(e) = self.reader.await {
            warn!("Reader task failed: {}", e);
        }

        self.queue.shutdown();
        let context = match self.dispatcher.await {
            Ok(context) => context,
            Err(e) => {
                warn!("Dispatch task failed: {}", e);
                ClientContext::new(self.director)
            }
        };
        self.writer.abort();
        info!("Disconnected");
        context
    }
}

/// Reads until one whole message is decoded. `None` on a clean EOF.
async fn next_message<R: AsyncRead + Unpin>(
    stream: &mut R,
    frames: &mut FrameReader,
) -> Result<Option<Message>, ProtocolError> {
    let mut buffer = [0u8; 4096];
    loop {
        while let Some(body) = frames.next_frame()? {
            match Message::from_frame_body(&body) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!("Dropping undecodable message: {}", e),
            }
        }

        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        frames.extend(&buffer[..n]);
    }
}

async fn write_loop(mut stream: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.write_all(&frame).await {
            warn!("Failure writing to server: {}", e);
            break;
        }
    }
    let _ = stream.shutdown().await;
}

async fn read_loop(
    mut stream: OwnedReadHalf,
    mut frames: FrameReader,
    queue: EventQueue<ClientContext>,
) {
    loop {
        let message = match next_message(&mut stream, &mut frames).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection to server failed: {}", e);
                break;
            }
        };

        let enqueued = match message {
            Message::InvocationResponse(response) => {
                queue.enqueue(move |ctx| ctx.director.dispatch_response(response))
            }
            Message::Event(event) => queue.enqueue(move |ctx| ctx.apply_event(event)),
            Message::Pong { timestamp } => {
                info!(
                    "Pong: round trip {} ms",
                    timestamp_millis().saturating_sub(timestamp)
                );
                Ok(())
            }
            Message::Failure { reason } => {
                warn!("Server reported failure: {}", reason);
                Ok(())
            }
            other => {
                warn!("Unexpected message from server: {:?}", other);
                Ok(())
            }
        };
        if enqueued.is_err() {
            debug!("Dispatch queue closed, stopping reader");
            return;
        }
    }

    if queue.enqueue(|ctx| ctx.director.session_ended()).is_err() {
        debug!("Dispatch queue closed before session teardown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_channel_sink_reports_closed_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink { tx };

        assert!(sink.post_message(Message::Logoff).is_ok());
        drop(rx);
        assert!(matches!(
            sink.post_message(Message::Logoff),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn test_message_events_reach_handlers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let director = Arc::new(InvocationDirector::new(1000, Arc::new(ChannelSink { tx })));
        let mut ctx = ClientContext::new(director);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.add_message_handler(Box::new(move |oid, name, args| {
            sink.lock().unwrap().push((oid, name.to_string(), args.len()));
        }));

        ctx.apply_event(ObjectEvent::MessageEvent {
            target_oid: 1000,
            name: "chat".into(),
            args: vec!["alice".into(), "hi".into()],
        });
        ctx.apply_event(ObjectEvent::AttributeChanged {
            target_oid: 1000,
            name: "away".into(),
            value: Value::Bool(true),
        });

        assert_eq!(*seen.lock().unwrap(), vec![(1000, "chat".to_string(), 2)]);
        assert_eq!(ctx.objects.attribute(1000, "away"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_next_message_across_chunks() {
        let frame = Message::Pong { timestamp: 9 }.to_frame().unwrap();
        let (head, tail) = frame.split_at(3);
        let mut stream = tokio_test::io::Builder::new().read(head).read(tail).build();
        let mut frames = FrameReader::new(DEFAULT_MAX_FRAME_LEN);

        let message = next_message(&mut stream, &mut frames).await.unwrap();
        assert_eq!(message, Some(Message::Pong { timestamp: 9 }));
        assert_eq!(next_message(&mut stream, &mut frames).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connect_refused_logon() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await;
            let failure = Message::Failure {
                reason: "Server full".into(),
            };
            socket.write_all(&failure.to_frame().unwrap()).await.unwrap();
            // hold the socket until the client hangs up
            let _ = socket.read(&mut buf).await;
        });

        let result = Client::connect(&addr, "alice").await;
        assert!(matches!(result, Err(ClientError::Refused(reason)) if reason == "Server full"));
    }
}
