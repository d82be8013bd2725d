// =============================================================================
// WebSocket connection registry
// =============================================================================
//
// Maps `client_id -> connection handle`. Each connection owns a bounded
// outbound queue drained by its writer task; per-client message order is
// the order of send calls. A full queue means the client cannot keep up
// and the connection is closed rather than allowed to buffer without
// bound. A duplicate `client_id` evicts the previous connection.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound queue depth per client.
const SEND_QUEUE_CAP: usize = 64;
/// A client silent for longer than this is dropped by the cleanup sweep.
pub const INACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-client bookkeeping, exposed on the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: String,
    #[serde(skip)]
    pub connected_instant: Instant,
    #[serde(skip)]
    pub last_ping: Option<Instant>,
}

struct ClientHandle {
    sender: mpsc::Sender<Message>,
    info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub messages_sent: u64,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, ClientHandle>>,
    stats: RwLock<ConnectionStats>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns the queue receiver for the writer
    /// task. An existing connection under the same id is evicted.
    pub fn register(&self, client_id: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAP);

        let mut clients = self.clients.write();
        if clients.remove(client_id).is_some() {
            warn!(client_id, "duplicate client id, evicting previous connection");
        }
        clients.insert(
            client_id.to_string(),
            ClientHandle {
                sender: tx,
                info: ClientInfo {
                    client_id: client_id.to_string(),
                    connected_at: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
                    connected_instant: Instant::now(),
                    last_ping: None,
                },
            },
        );

        let mut stats = self.stats.write();
        stats.total_connections += 1;
        stats.active_connections = clients.len();
        info!(client_id, active = clients.len(), "websocket client registered");
        rx
    }

    pub fn unregister(&self, client_id: &str) -> bool {
        let mut clients = self.clients.write();
        let removed = clients.remove(client_id).is_some();
        self.stats.write().active_connections = clients.len();
        if removed {
            info!(client_id, remaining = clients.len(), "websocket client removed");
        }
        removed
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    /// Queue a JSON message for one client. A full or closed queue drops
    /// the connection and returns `false`.
    pub fn send_json<T: Serialize>(&self, client_id: &str, message: &T) -> bool {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                warn!(client_id, error = %e, "failed to serialise outbound message");
                return false;
            }
        };

        let sender = {
            let clients = self.clients.read();
            match clients.get(client_id) {
                Some(handle) => handle.sender.clone(),
                None => return false,
            }
        };

        match sender.try_send(Message::Text(payload.into())) {
            Ok(()) => {
                self.stats.write().messages_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "send queue full, closing slow client");
                self.unregister(client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id, "send queue closed, removing client");
                self.unregister(client_id);
                false
            }
        }
    }

    /// Send to every client except those in `exclude`; returns the number
    /// of successful sends.
    pub fn broadcast<T: Serialize>(&self, message: &T, exclude: &[&str]) -> usize {
        let ids: Vec<String> = self.clients.read().keys().cloned().collect();
        ids.iter()
            .filter(|id| !exclude.contains(&id.as_str()))
            .filter(|id| self.send_json(id, message))
            .count()
    }

    pub fn touch_ping(&self, client_id: &str) {
        if let Some(handle) = self.clients.write().get_mut(client_id) {
            handle.info.last_ping = Some(Instant::now());
        }
    }

    /// Drop clients silent for longer than `timeout`; returns the removed
    /// ids so the caller can clear their subscriptions.
    pub fn cleanup_inactive(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = {
            let clients = self.clients.read();
            clients
                .values()
                .filter(|handle| {
                    let last_active = handle
                        .info
                        .last_ping
                        .unwrap_or(handle.info.connected_instant);
                    now.duration_since(last_active) > timeout
                })
                .map(|handle| handle.info.client_id.clone())
                .collect()
        };

        for client_id in &stale {
            self.unregister(client_id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up inactive websocket clients");
        }
        stale
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .values()
            .map(|handle| handle.info.clone())
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.read().clone();
        stats.active_connections = self.count();
        stats
    }
}
