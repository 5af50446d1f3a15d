//! # Invocation Server Library
//!
//! Server side of the invocation middleware: accepts client connections,
//! decodes their requests and routes each one to the provider registered at
//! the target object id. Responses travel back over the same connection,
//! addressed by the correlation token the client put in the request.
//!
//! ## Architecture
//!
//! ### I/O Thread
//! A single OS thread runs the readiness loop over mio. It accepts sockets,
//! reads and frames bytes, answers pings and writes outbound buffers. It
//! never runs service code.
//!
//! ### Dispatch Queue
//! Everything else (logons, invocations, teardowns) becomes an action on the
//! shared event queue. Its single consumer owns the session table and the
//! invocation registry, so service providers run one at a time and in the
//! order their requests arrived.
//!
//! ### Failure Escalation
//! The readiness loop tolerates ordinary I/O errors. A broken multiplexer is
//! retried a bounded number of times and then reported to the runtime, which
//! shuts the server down instead of spinning.
//!
//! ## Module Organization
//!
//! - `select_loop`: readiness loop, ready set and failure counting
//! - `connection`: per-client socket state and the handle used to write to it
//! - `connection_manager`: the I/O thread
//! - `session_manager`: logged on clients and their object ids
//! - `invocation`: dispatch tables, listener proxies and the target registry
//! - `chat`: the chat service provider
//! - `network`: configuration and the server runtime

pub mod chat;
pub mod connection;
pub mod connection_manager;
pub mod invocation;
pub mod network;
pub mod select_loop;
pub mod session_manager;

pub use network::{Server, ServerConfig, ServerContext};
