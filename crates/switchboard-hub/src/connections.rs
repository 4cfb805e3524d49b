use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::wire::Frame;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    /// Connected but has not sent `join` or `adminJoin` yet.
    Unbound,
    Agent,
    Controller,
}

#[derive(Clone)]
struct ClientEntry {
    role: ClientRole,
    remote: Option<String>,
    sender: mpsc::Sender<Frame>,
    closed: Arc<Notify>,
    last_seen: Instant,
}

/// Handle returned to the transport session that owns a connection.
pub struct Registration {
    pub conn_id: String,
    /// Fires when the registry drops the connection (backpressure, stale reaper).
    pub closed: Arc<Notify>,
}

/// Live connections keyed by connection id. The connection id is the opaque
/// transport handle stored on agent records.
pub struct Connections {
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, ClientEntry>>,
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}

impl Connections {
    pub fn new() -> Self {
        Self {
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn register(&self, sender: mpsc::Sender<Frame>, remote: Option<String>) -> Registration {
        let conn_id = self.next_conn_id();
        let closed = Arc::new(Notify::new());
        self.clients.write().await.insert(
            conn_id.clone(),
            ClientEntry {
                role: ClientRole::Unbound,
                remote: remote.clone(),
                sender,
                closed: closed.clone(),
                last_seen: Instant::now(),
            },
        );
        info!(
            event = "client_connected",
            conn_id = %conn_id,
            remote = remote.as_deref().unwrap_or_default()
        );
        Registration { conn_id, closed }
    }

    /// Registers a connection backed by an in-process channel.
    pub async fn attach(&self, capacity: usize) -> (String, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let registration = self.register(tx, None).await;
        (registration.conn_id, rx)
    }

    /// Removes the connection and wakes its session. Returns false if it was already gone.
    pub async fn unregister(&self, conn_id: &str, reason: &str) -> bool {
        let removed = self.clients.write().await.remove(conn_id);
        match removed {
            Some(entry) => {
                entry.closed.notify_one();
                info!(
                    event = "client_disconnected",
                    conn_id = conn_id,
                    role = ?entry.role,
                    reason = reason
                );
                true
            }
            None => false,
        }
    }

    pub async fn set_role(&self, conn_id: &str, role: ClientRole) {
        if let Some(entry) = self.clients.write().await.get_mut(conn_id) {
            entry.role = role;
        }
    }

    pub async fn role(&self, conn_id: &str) -> Option<ClientRole> {
        self.clients.read().await.get(conn_id).map(|entry| entry.role)
    }

    pub async fn remote(&self, conn_id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(conn_id)
            .and_then(|entry| entry.remote.clone())
    }

    pub async fn is_live(&self, conn_id: &str) -> bool {
        self.clients.read().await.contains_key(conn_id)
    }

    pub async fn touch(&self, conn_id: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(conn_id) {
            entry.last_seen = Instant::now();
        }
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queues `frame` for one connection. A closed or full queue drops the connection.
    pub async fn send_to(&self, conn_id: &str, frame: Frame) -> bool {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(conn_id).map(|entry| entry.sender.clone())
        };
        let Some(sender) = sender else {
            return false;
        };

        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(conn_id, "send_closed").await;
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_backpressure", conn_id = %conn_id);
                self.unregister(conn_id, "slow_consumer").await;
                false
            }
        }
    }

    pub async fn broadcast_to_controllers(&self, frame: Frame) {
        let controllers = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, entry)| entry.role == ClientRole::Controller)
                .map(|(conn_id, entry)| (conn_id.clone(), entry.sender.clone()))
                .collect::<Vec<_>>()
        };
        let mut slow = Vec::new();

        for (conn_id, sender) in controllers {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(conn_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "slow_consumer", conn_id = %conn_id);
                    slow.push(conn_id);
                }
            }
        }

        for conn_id in slow {
            self.unregister(&conn_id, "slow_consumer").await;
        }
    }

    pub async fn stale_connections(&self, stale_after: Duration) -> Vec<String> {
        let now = Instant::now();
        self.clients
            .read()
            .await
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > stale_after)
            .map(|(conn_id, _)| conn_id.clone())
            .collect()
    }
}
