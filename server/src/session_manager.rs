//! Client session tracking for the invocation server
//!
//! This module handles the server-side bookkeeping of logged on clients:
//! - Session lifecycle (logon, logoff, connection loss)
//! - Client object id assignment; responses are addressed to these ids
//! - Capacity enforcement
//! - Lookup by object id, connection and username
//!
//! Once a session is removed its client oid no longer resolves, so any
//! response still in flight for it is dropped instead of delivered.

use crate::connection::{ConnectionHandle, ConnectionId};
use log::info;
use shared::ObjectId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Client object ids start here; lower oids belong to invocation services.
pub const FIRST_CLIENT_OID: ObjectId = 1000;

/// Why a logon was turned away. The display text is sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LogonRefused {
    #[error("Server full")]
    ServerFull,

    #[error("Already logged on")]
    AlreadyLoggedOn,

    #[error("Username in use")]
    UsernameInUse,
}

/// A logged on client
#[derive(Debug)]
pub struct Session {
    /// Object id of the client object; the caller oid of its requests
    pub client_oid: ObjectId,
    pub username: String,
    /// Where responses and events for this client are written
    pub connection: ConnectionHandle,
    /// Away message and when it was set
    pub away: Option<(String, Instant)>,
}

impl Session {
    pub fn new(client_oid: ObjectId, username: String, connection: ConnectionHandle) -> Self {
        Self {
            client_oid,
            username,
            connection,
            away: None,
        }
    }

    /// An empty message clears the away state
    pub fn set_away(&mut self, message: String) {
        if message.is_empty() {
            self.away = None;
        } else {
            self.away = Some((message, Instant::now()));
        }
    }

    /// How long the client has been away, if it is
    pub fn away_for(&self) -> Option<Duration> {
        self.away.as_ref().map(|(_, since)| since.elapsed())
    }
}

/// Manages all sessions on the server
///
/// Client oids are handed out sequentially and never reused while the server
/// runs, so a stale oid can never resolve to a newer session.
pub struct SessionManager {
    sessions: HashMap<ObjectId, Session>,
    by_connection: HashMap<ConnectionId, ObjectId>,
    next_client_oid: ObjectId,
    max_clients: usize,
}

impl SessionManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_connection: HashMap::new(),
            next_client_oid: FIRST_CLIENT_OID,
            max_clients,
        }
    }

    /// Starts a session for `connection`. Usernames are unique among live
    /// sessions, so a tell always has exactly one recipient.
    pub fn add_session(
        &mut self,
        username: String,
        connection: ConnectionHandle,
    ) -> Result<ObjectId, LogonRefused> {
        if self.by_connection.contains_key(&connection.id()) {
            return Err(LogonRefused::AlreadyLoggedOn);
        }
        if self.find_by_username(&username).is_some() {
            return Err(LogonRefused::UsernameInUse);
        }
        if self.sessions.len() >= self.max_clients {
            return Err(LogonRefused::ServerFull);
        }

        let client_oid = self.next_client_oid;
        self.next_client_oid += 1;

        info!(
            "Session {} started for {} from {}",
            client_oid,
            username,
            connection.addr()
        );
        self.by_connection.insert(connection.id(), client_oid);
        self.sessions
            .insert(client_oid, Session::new(client_oid, username, connection));

        Ok(client_oid)
    }

    pub fn remove_session(&mut self, client_oid: ObjectId) -> Option<Session> {
        let session = self.sessions.remove(&client_oid)?;
        self.by_connection.remove(&session.connection.id());
        info!("Session {} ({}) ended", client_oid, session.username);
        Some(session)
    }

    pub fn remove_by_connection(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let client_oid = self.by_connection.get(&connection_id).copied()?;
        self.remove_session(client_oid)
    }

    pub fn get(&self, client_oid: ObjectId) -> Option<&Session> {
        self.sessions.get(&client_oid)
    }

    pub fn get_mut(&mut self, client_oid: ObjectId) -> Option<&mut Session> {
        self.sessions.get_mut(&client_oid)
    }

    pub fn find_by_connection(&self, connection_id: ConnectionId) -> Option<ObjectId> {
        self.by_connection.get(&connection_id).copied()
    }

    pub fn find_by_username(&self, username: &str) -> Option<ObjectId> {
        self.sessions
            .values()
            .find(|s| s.username == username)
            .map(|s| s.client_oid)
    }

    /// Connection handles of every session, for broadcasts
    pub fn connections(&self) -> Vec<(ObjectId, ConnectionHandle)> {
        self.sessions
            .values()
            .map(|s| (s.client_oid, s.connection.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
