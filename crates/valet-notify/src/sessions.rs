//! Live session registry: client_id ↔ user_id maps plus per-session send
//! channels. Sends are unbounded and never block the caller; a session
//! whose receiver is gone is pruned on the next send attempt.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Default)]
struct Inner {
    /// client_id -> outbound channel
    senders: HashMap<String, UnboundedSender<serde_json::Value>>,
    /// user_id -> client_ids
    users: HashMap<String, HashSet<String>>,
    /// client_id -> user_id
    owners: HashMap<String, String>,
}

/// Tracks which clients are connected for which user.
#[derive(Default)]
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and get the receiving end of its outbound
    /// channel. Reconnecting with the same client_id replaces the old
    /// channel.
    pub fn connect(&self, client_id: &str, user_id: &str) -> UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous_user) = inner.owners.insert(client_id.into(), user_id.into())
            && let Some(clients) = inner.users.get_mut(&previous_user)
        {
            clients.remove(client_id);
        }
        inner.senders.insert(client_id.into(), tx);
        inner
            .users
            .entry(user_id.into())
            .or_default()
            .insert(client_id.into());
        tracing::info!("🔗 Session connected: {client_id} (user {user_id})");
        rx
    }

    pub fn disconnect(&self, client_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.senders.remove(client_id);
        if let Some(user_id) = inner.owners.remove(client_id)
            && let Some(clients) = inner.users.get_mut(&user_id)
        {
            clients.remove(client_id);
            if clients.is_empty() {
                inner.users.remove(&user_id);
            }
        }
        tracing::info!("🔌 Session disconnected: {client_id}");
    }

    /// Send to one session. Returns false if the session is unknown or its
    /// receiver has gone away.
    pub fn send_to_session(&self, client_id: &str, payload: serde_json::Value) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.senders.get(client_id) {
            Some(tx) if tx.send(payload).is_ok() => true,
            Some(_) => {
                // Receiver dropped without a clean disconnect
                inner.senders.remove(client_id);
                false
            }
            None => false,
        }
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .users
            .get(user_id)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fan out to every live session of a user. Returns how many sessions
    /// accepted the payload.
    pub fn broadcast_to_user(&self, user_id: &str, payload: &serde_json::Value) -> usize {
        let clients = self.sessions_for_user(user_id);
        clients
            .iter()
            .filter(|client_id| self.send_to_session(client_id, payload.clone()))
            .count()
    }

    pub fn session_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_reaches_all_user_sessions() {
        let sessions = SessionManager::new();
        let mut rx_a = sessions.connect("client-a", "u1");
        let mut rx_b = sessions.connect("client-b", "u1");
        sessions.connect("client-c", "u2");

        let sent = sessions.broadcast_to_user("u1", &json!({"hello": true}));
        assert_eq!(sent, 2);
        assert_eq!(rx_a.try_recv().unwrap(), json!({"hello": true}));
        assert_eq!(rx_b.try_recv().unwrap(), json!({"hello": true}));
    }

    #[test]
    fn disconnect_removes_session() {
        let sessions = SessionManager::new();
        let _rx = sessions.connect("client-a", "u1");
        sessions.disconnect("client-a");
        assert!(sessions.sessions_for_user("u1").is_empty());
        assert!(!sessions.send_to_session("client-a", json!({})));
        assert_eq!(sessions.session_count(), 0);
    }

    #[test]
    fn dead_receiver_is_pruned_not_fatal() {
        let sessions = SessionManager::new();
        let rx = sessions.connect("client-a", "u1");
        drop(rx);
        assert!(!sessions.send_to_session("client-a", json!({})));
        // Second attempt sees the pruned entry
        assert!(!sessions.send_to_session("client-a", json!({})));
    }

    #[test]
    fn reconnect_replaces_channel_and_owner() {
        let sessions = SessionManager::new();
        let old_rx = sessions.connect("client-a", "u1");
        drop(old_rx);
        let mut new_rx = sessions.connect("client-a", "u2");

        assert!(sessions.sessions_for_user("u1").is_empty());
        assert_eq!(sessions.broadcast_to_user("u2", &json!({"n": 1})), 1);
        assert_eq!(new_rx.try_recv().unwrap(), json!({"n": 1}));
    }
}
