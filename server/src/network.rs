//! Server runtime: wires the I/O thread to the dispatch queue
//!
//! All session and invocation state lives in a [`ServerContext`] owned by the
//! dispatch queue's consumer. The I/O thread only ever enqueues actions
//! against it, so requests and teardowns from one connection run in the order
//! they were read.

use crate::chat::{chat_dispatcher, ChatManager};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::connection_manager::{ConnectionEvents, ConnectionManager};
use crate::invocation::{Caller, DispatchChain, InvocationManager, ResponseSink};
use crate::session_manager::SessionManager;
use log::{debug, error, info, warn};
use shared::framing::DEFAULT_MAX_FRAME_LEN;
use shared::{
    event_queue, EventDispatcher, EventQueue, InvocationRequest, InvocationResponse, Message,
    MessageSink, ObjectId, Value, PROTOCOL_VERSION,
};
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on one wait in the readiness loop
    pub select_timeout: Duration,
    pub max_clients: usize,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            select_timeout: Duration::from_millis(100),
            max_clients: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address to bind")
            })
    }
}

/// Routes responses to the connection of the session that made the request
pub struct SessionResponseSink {
    sessions: Arc<RwLock<SessionManager>>,
}

impl ResponseSink for SessionResponseSink {
    fn post_response(&self, response: InvocationResponse) {
        let connection = match self.sessions.read() {
            Ok(sessions) => sessions
                .get(response.caller_oid)
                .map(|session| session.connection.clone()),
            Err(_) => None,
        };

        match connection {
            Some(connection) => {
                let caller_oid = response.caller_oid;
                if let Err(e) = connection.post_message(Message::InvocationResponse(response)) {
                    debug!("Dropping response for {}: {}", caller_oid, e);
                }
            }
            None => debug!(
                "Dropping response {}:{} for ended session",
                response.caller_oid, response.request_id
            ),
        }
    }
}

/// Everything the dispatch queue's consumer owns
pub struct ServerContext {
    pub invmgr: InvocationManager,
    pub sessions: Arc<RwLock<SessionManager>>,
}

impl ServerContext {
    /// Creates the context with the chat service registered
    pub fn new(max_clients: usize) -> Self {
        let sessions = Arc::new(RwLock::new(SessionManager::new(max_clients)));
        let sink = Arc::new(SessionResponseSink {
            sessions: Arc::clone(&sessions),
        });
        let mut invmgr = InvocationManager::new(sink);

        let chat = Arc::new(ChatManager::new(Arc::clone(&sessions)));
        let chat_oid = invmgr.register(DispatchChain::new(chat_dispatcher(chat)));
        info!("Chat service registered at {}", chat_oid);

        Self { invmgr, sessions }
    }

    pub fn session_started(&mut self, connection: ConnectionHandle, version: u32, username: String) {
        if version != PROTOCOL_VERSION {
            warn!(
                "Rejecting {} from {}: protocol version {} (expected {})",
                username,
                connection.addr(),
                version,
                PROTOCOL_VERSION
            );
            Self::refuse(&connection, "Protocol version mismatch");
            return;
        }

        let client_oid = match self.sessions.write() {
            Ok(mut sessions) => sessions.add_session(username.clone(), connection.clone()),
            Err(_) => {
                error!("Session table poisoned, refusing {}", username);
                Self::refuse(&connection, "Server error");
                return;
            }
        };

        match client_oid {
            Ok(client_oid) => {
                let bootstrap = Message::Bootstrap {
                    client_oid,
                    services: self.invmgr.bindings(),
                };
                if let Err(e) = connection.post_message(bootstrap) {
                    warn!("Failed to bootstrap session {}: {}", client_oid, e);
                }
            }
            Err(refused) => {
                info!("Refusing {} from {}: {}", username, connection.addr(), refused);
                Self::refuse(&connection, &refused.to_string());
            }
        }
    }

    fn refuse(connection: &ConnectionHandle, reason: &str) {
        let failure = Message::Failure {
            reason: reason.to_string(),
        };
        if let Err(e) = connection.post_message(failure) {
            debug!("Failed to refuse {}: {}", connection.addr(), e);
        }
    }

    pub fn session_ended(&mut self, connection_id: ConnectionId) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove_by_connection(connection_id);
        }
    }

    pub fn handle_request(&mut self, connection_id: ConnectionId, request: InvocationRequest) {
        let caller = match self.caller_for(connection_id) {
            Some(caller) => caller,
            None => {
                warn!(
                    "Dropping invocation {}:{} from connection {} without a session",
                    request.target_oid, request.method_id, connection_id
                );
                return;
            }
        };

        // listener tokens must name the caller, or responses would reach
        // some other client
        let forged = request.args.iter().any(|arg| {
            matches!(arg, Value::Listener(listener) if listener.caller_oid != caller.client_oid)
        });
        if forged {
            warn!(
                "Dropping invocation {}:{} from {} with a foreign listener",
                request.target_oid, request.method_id, caller.username
            );
            return;
        }

        // failures are already reported to the caller's listener
        let _ = self.invmgr.dispatch_request(&caller, request);
    }

    fn caller_for(&self, connection_id: ConnectionId) -> Option<Caller> {
        let sessions = self.sessions.read().ok()?;
        let client_oid: ObjectId = sessions.find_by_connection(connection_id)?;
        let session = sessions.get(client_oid)?;
        Some(Caller {
            client_oid,
            username: session.username.clone(),
        })
    }
}

/// Hands decoded traffic from the I/O thread to the dispatch queue
pub struct QueueEvents {
    queue: EventQueue<ServerContext>,
}

impl QueueEvents {
    pub fn new(queue: EventQueue<ServerContext>) -> Self {
        Self { queue }
    }
}

impl ConnectionEvents for QueueEvents {
    fn message_received(&mut self, connection: &ConnectionHandle, message: Message) {
        let addr = connection.addr();
        let result = match message {
            Message::Logon { version, username } => {
                let connection = connection.clone();
                self.queue
                    .enqueue(move |ctx| ctx.session_started(connection, version, username))
            }
            Message::Invocation(request) => {
                let id = connection.id();
                self.queue.enqueue(move |ctx| ctx.handle_request(id, request))
            }
            other => {
                warn!("Unexpected message from {}: {:?}", addr, other);
                Ok(())
            }
        };

        if result.is_err() {
            warn!("Dispatch queue closed, dropping message from {}", addr);
        }
    }

    fn connection_closed(&mut self, connection: &ConnectionHandle) {
        let id = connection.id();
        if self.queue.enqueue(move |ctx| ctx.session_ended(id)).is_err() {
            debug!("Dispatch queue closed before teardown of connection {}", id);
        }
    }
}

/// The invocation server
pub struct Server {
    manager: ConnectionManager<QueueEvents>,
    queue: EventQueue<ServerContext>,
    dispatcher: EventDispatcher<ServerContext>,
    failures: mpsc::UnboundedReceiver<String>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let (queue, dispatcher) = event_queue(ServerContext::new(config.max_clients));
        let (failure_tx, failures) = mpsc::unbounded_channel();

        let manager = ConnectionManager::bind(
            config.socket_addr()?,
            config.select_timeout,
            config.max_frame_len,
            QueueEvents::new(queue.clone()),
            move |err| {
                let _ = failure_tx.send(err.to_string());
            },
        )?;

        Ok(Self {
            manager,
            queue,
            dispatcher,
            failures,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.manager.local_addr()
    }

    /// Runs until ctrl-c or until the readiness loop gives up
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down");
        })
        .await
    }

    /// Runs until `stop` completes or the readiness loop gives up, then stops
    /// the I/O thread and drains the dispatch queue.
    pub async fn run_until<F>(self, stop: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Future<Output = ()>,
    {
        let Server {
            manager,
            queue,
            dispatcher,
            mut failures,
        } = self;

        let io = manager.io_handle();
        let io_thread = thread::Builder::new()
            .name("io".to_string())
            .spawn(move || manager.run())?;
        let dispatch_task = tokio::spawn(dispatcher.run());

        tokio::select! {
            _ = stop => {}
            Some(reason) = failures.recv() => {
                error!("Readiness loop failed, shutting down: {}", reason);
            }
        }

        io.shutdown();
        // join off the runtime; the I/O thread may take one select timeout
        tokio::task::spawn_blocking(move || io_thread.join())
            .await?
            .map_err(|_| "I/O thread panicked")?;

        queue.shutdown();
        let context = dispatch_task.await?;
        info!(
            "Server stopped with {} sessions open",
            context.sessions.read().map(|s| s.len()).unwrap_or(0)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::chat::TELL;
    use shared::ListenerRef;
    use std::sync::atomic::AtomicUsize;

    fn handle(id: ConnectionId) -> (ConnectionHandle, Arc<AtomicUsize>) {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        let handle = ConnectionHandle::new(
            id,
            "127.0.0.1:7000".parse().unwrap(),
            Arc::new(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        (handle, flushes)
    }

    fn oid_of(ctx: &ServerContext, name: &str) -> ObjectId {
        ctx.sessions.read().unwrap().find_by_username(name).unwrap()
    }

    #[test]
    fn test_logon_bootstraps_session() {
        let mut ctx = ServerContext::new(4);
        let (conn, _) = handle(2);

        ctx.session_started(conn.clone(), PROTOCOL_VERSION, "alice".into());

        assert_eq!(ctx.sessions.read().unwrap().len(), 1);
        assert!(conn.pending_outbound() > 0);
        assert_eq!(ctx.invmgr.bindings()[0].service, "chat");
    }

    #[test]
    fn test_version_mismatch_refused() {
        let mut ctx = ServerContext::new(4);
        let (conn, _) = handle(2);

        ctx.session_started(conn.clone(), PROTOCOL_VERSION + 1, "alice".into());

        assert!(ctx.sessions.read().unwrap().is_empty());
        assert!(conn.pending_outbound() > 0);
    }

    #[test]
    fn test_full_server_refuses_logon() {
        let mut ctx = ServerContext::new(1);
        let (first, _) = handle(2);
        let (second, _) = handle(3);

        ctx.session_started(first, PROTOCOL_VERSION, "alice".into());
        ctx.session_started(second.clone(), PROTOCOL_VERSION, "bob".into());

        assert_eq!(ctx.sessions.read().unwrap().len(), 1);
        assert_eq!(
            second.take_sent(),
            vec![Message::Failure {
                reason: "Server full".into()
            }]
        );
    }

    #[test]
    fn test_duplicate_username_refused() {
        let mut ctx = ServerContext::new(4);
        let (first, _) = handle(2);
        let (second, _) = handle(3);

        ctx.session_started(first, PROTOCOL_VERSION, "alice".into());
        ctx.session_started(second.clone(), PROTOCOL_VERSION, "alice".into());

        assert_eq!(ctx.sessions.read().unwrap().len(), 1);
        assert_eq!(
            second.take_sent(),
            vec![Message::Failure {
                reason: "Username in use".into()
            }]
        );
    }

    #[test]
    fn test_second_logon_on_connection_refused() {
        let mut ctx = ServerContext::new(4);
        let (conn, _) = handle(2);

        ctx.session_started(conn.clone(), PROTOCOL_VERSION, "alice".into());
        assert!(matches!(conn.take_sent()[..], [Message::Bootstrap { .. }]));

        ctx.session_started(conn.clone(), PROTOCOL_VERSION, "bob".into());
        assert_eq!(ctx.sessions.read().unwrap().len(), 1);
        assert_eq!(
            conn.take_sent(),
            vec![Message::Failure {
                reason: "Already logged on".into()
            }]
        );
    }

    #[test]
    fn test_request_answered_on_callers_connection() {
        let mut ctx = ServerContext::new(4);
        let (alice, _) = handle(2);
        let (bob, _) = handle(3);
        ctx.session_started(alice.clone(), PROTOCOL_VERSION, "alice".into());
        ctx.session_started(bob.clone(), PROTOCOL_VERSION, "bob".into());
        let before = (alice.pending_outbound(), bob.pending_outbound());

        let chat_oid = ctx.invmgr.bindings()[0].oid;
        ctx.handle_request(
            2,
            InvocationRequest {
                target_oid: chat_oid,
                method_id: TELL,
                args: vec![
                    "bob".into(),
                    "hello".into(),
                    Value::Listener(ListenerRef {
                        caller_oid: oid_of(&ctx, "alice"),
                        request_id: 1,
                    }),
                ],
            },
        );

        // bob got the chat line, alice got tell_succeeded
        assert!(alice.pending_outbound() > before.0);
        assert!(bob.pending_outbound() > before.1);
    }

    #[test]
    fn test_forged_listener_dropped() {
        let mut ctx = ServerContext::new(4);
        let (alice, _) = handle(2);
        let (bob, _) = handle(3);
        ctx.session_started(alice, PROTOCOL_VERSION, "alice".into());
        ctx.session_started(bob.clone(), PROTOCOL_VERSION, "bob".into());
        let before = bob.pending_outbound();

        let chat_oid = ctx.invmgr.bindings()[0].oid;
        ctx.handle_request(
            2,
            InvocationRequest {
                target_oid: chat_oid,
                method_id: TELL,
                args: vec![
                    "bob".into(),
                    "spoofed".into(),
                    Value::Listener(ListenerRef {
                        caller_oid: oid_of(&ctx, "bob"),
                        request_id: 1,
                    }),
                ],
            },
        );

        assert_eq!(bob.pending_outbound(), before);
    }

    #[test]
    fn test_response_after_session_end_dropped() {
        let mut ctx = ServerContext::new(4);
        let (alice, flushes) = handle(2);
        ctx.session_started(alice.clone(), PROTOCOL_VERSION, "alice".into());
        let alice_oid = oid_of(&ctx, "alice");
        ctx.session_ended(2);
        let before = flushes.load(std::sync::atomic::Ordering::SeqCst);

        let sink = SessionResponseSink {
            sessions: Arc::clone(&ctx.sessions),
        };
        sink.post_response(InvocationResponse {
            caller_oid: alice_oid,
            request_id: 1,
            method_id: 1,
            args: vec![],
        });

        assert_eq!(flushes.load(std::sync::atomic::Ordering::SeqCst), before);
    }

    #[test]
    fn test_request_without_session_ignored() {
        let mut ctx = ServerContext::new(4);
        let chat_oid = ctx.invmgr.bindings()[0].oid;
        ctx.handle_request(
            9,
            InvocationRequest {
                target_oid: chat_oid,
                method_id: TELL,
                args: vec![],
            },
        );
        assert!(ctx.sessions.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_stops_on_request() {
        let config = ServerConfig {
            port: 0,
            select_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let result = server
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;
        tokio_test::assert_ok!(result);
    }
}
