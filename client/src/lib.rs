//! # Invocation Client Library
//!
//! Client side of the invocation middleware. Calls on remote services are
//! made through typed marshallers that hand generic requests to the
//! [`InvocationDirector`](director::InvocationDirector). Callback arguments
//! never cross the wire: the director parks each listener in its correlation
//! table and sends a token in its place.
//!
//! ## Module Organization
//!
//! - `director`: request marshalling and the correlation table
//! - `chat`: marshaller and response dispatchers for the chat service
//! - `mirror`: local copies of distributed object attributes
//! - `network`: the TCP connection, its reader and writer tasks, and the
//!   client's dispatch queue
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::chat::TellReply;
//! use client::Client;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect("127.0.0.1:8080", "alice").await?;
//! if let Some(chat) = client.chat() {
//!     let (reply, outcome) = TellReply::channel();
//!     chat.tell("bob", "hello", reply)?;
//!     println!("{:?}", outcome.await?);
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod director;
pub mod mirror;
pub mod network;

pub use director::{Arg, InvocationDirector, ResponseDispatcher};
pub use network::{Client, ClientContext, ClientError};
