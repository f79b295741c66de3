//! # Session Registry
//!
//! Tracks every currently connected WebSocket session and fans out state
//! change notifications to all of them.
//!
//! ## Ownership:
//! The registry holds only mailbox addresses (`Recipient`), never the
//! sessions themselves. A session actor registers itself when the connection
//! starts and unregisters when it stops; a broken connection is also pruned
//! lazily when a broadcast to it fails.
//!
//! ## Broadcast discipline:
//! Delivery iterates a stable snapshot of the registered recipients taken up
//! front, collects the ids whose mailbox has closed, and removes those only
//! after the loop finishes. One dead session never affects delivery to the
//! others.

use crate::session::protocol::WebSocketMessage;
use actix::prelude::*;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Actor message wrapping a protocol message bound for one session's socket.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Outbound(pub WebSocketMessage);

/// Registry of live sessions, shared by every connection handler and the
/// model lifecycle manager.
///
/// Uses a std `RwLock` so that the frequent read paths (broadcast snapshot,
/// session count) never block each other.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Recipient<Outbound>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Add a session. Registering the same id again replaces the previous
    /// address, which makes the call idempotent per connection.
    pub fn register(&self, session_id: &str, recipient: Recipient<Outbound>) {
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session_id.to_string(), recipient);
        debug!(session_id = %session_id, total = sessions.len(), "Session registered");
    }

    /// Remove a session. Safe to call more than once; removing an id that is
    /// already gone is a no-op.
    pub fn unregister(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        let removed = sessions.remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, total = sessions.len(), "Session unregistered");
        }
        removed
    }

    /// Deliver `message` to every registered session, best effort.
    ///
    /// A session whose mailbox has closed (client went away) is unregistered
    /// as a side effect. A session whose mailbox is merely full stays
    /// registered; it is alive, just slow, and will catch up via the next
    /// status message.
    pub fn broadcast(&self, message: WebSocketMessage) {
        let targets: Vec<(String, Recipient<Outbound>)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .map(|(id, recipient)| (id.clone(), recipient.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (session_id, recipient) in targets {
            match recipient.try_send(Outbound(message.clone())) {
                Ok(()) => {}
                Err(SendError::Full(_)) => {
                    warn!(session_id = %session_id, "Session mailbox full, dropping broadcast");
                }
                Err(SendError::Closed(_)) => {
                    dead.push(session_id);
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().unwrap();
            for session_id in dead {
                sessions.remove(&session_id);
                warn!(session_id = %session_id, "Removed dead session during broadcast");
            }
        }
    }

    /// Number of currently connected sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
