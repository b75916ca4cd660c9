//! Connection state and the connection registry.
//!
//! The registry tracks membership for broadcast only. It never owns a socket:
//! each connection's writer task does, fed through a bounded channel, so a
//! send from the registry never blocks on network I/O. A viewer whose queue
//! is full is treated like a dead one.

use crate::error::{GatewayError, Result};
use axum::extract::ws::{Message, Utf8Bytes};
use chrono::Utc;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque connection identity, used as the registry key.
pub type ConnectionId = Uuid;

/// Outbound queue depth per connection.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Lifecycle of one viewer connection.
///
/// `Connecting -> Upgraded -> Synced -> Streaming -> Closed`. Any state may
/// jump straight to `Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Upgraded = 1,
    Synced = 2,
    Streaming = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Upgraded,
            2 => Self::Synced,
            3 => Self::Streaming,
            _ => Self::Closed,
        }
    }
}

/// State for a single connected viewer.
pub struct ClientState {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Outbound queue drained by the connection's writer task.
    tx: mpsc::Sender<Message>,
    state: AtomicU8,
    closed: watch::Sender<bool>,
    /// Timestamp when the connection was accepted (ms).
    pub connected_at: i64,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closed: watch::channel(false).0,
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Queue a message for this connection.
    ///
    /// Never waits. Fails once the connection is closed, its writer task has
    /// gone away or its queue is full.
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::SendFailed(self.id));
        }
        self.tx.try_send(msg).map_err(|e| {
            if let mpsc::error::TrySendError::Full(_) = e {
                warn!("Client {} outbound queue full", self.id);
            }
            GatewayError::SendFailed(self.id)
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless the connection is already closed.
    pub fn set_state(&self, next: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != ConnectionState::Closed as u8).then_some(next as u8)
            });
    }

    /// Mark the connection closed and wake its reader and writer.
    /// Returns `true` only for the call that performed the close.
    pub fn close(&self) -> bool {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let first = !self.closed.send_replace(true);
        if first {
            debug!("Client {} closed", self.id);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the payload was queued for.
    pub delivered: usize,
    /// Connections whose send failed and were removed during this pass.
    pub removed: Vec<ConnectionId>,
}

/// Set of currently open viewer connections.
///
/// Registration, deregistration and broadcast share one mutex. A broadcast
/// pass holds it for the whole iteration, so each pass sees a fixed
/// membership and removes a dead connection at most once. Sends only enqueue,
/// so the lock is never held across I/O.
pub struct ConnectionRegistry {
    clients: Mutex<HashMap<ConnectionId, Arc<ClientState>>>,
    fanout_attached: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            fanout_attached: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ClientState>>> {
        // Entries stay consistent even if a holder panicked mid-pass.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. Returns `false` if it was already registered.
    pub fn register(&self, client: Arc<ClientState>) -> bool {
        let id = client.id;
        let (added, count) = {
            let mut clients = self.lock();
            let added = clients.insert(id, client).is_none();
            (added, clients.len())
        };
        gauge!("checkbox_ws_active_connections").set(count as f64);
        if added {
            info!("Client {} registered. Active clients: {}", id, count);
        }
        added
    }

    /// Remove a connection. Does not close it.
    pub fn deregister(&self, client_id: &ConnectionId) -> Option<Arc<ClientState>> {
        let (removed, count) = {
            let mut clients = self.lock();
            let removed = clients.remove(client_id);
            (removed, clients.len())
        };
        gauge!("checkbox_ws_active_connections").set(count as f64);
        match &removed {
            Some(_) => info!("Client {} unregistered. Remaining clients: {}", client_id, count),
            None => debug!("Client {} was already removed", client_id),
        }
        removed
    }

    pub fn get(&self, client_id: &ConnectionId) -> Option<Arc<ClientState>> {
        self.lock().get(client_id).cloned()
    }

    /// Current live count.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `payload` as a text frame to every registered connection.
    ///
    /// A failed send never stops the pass. Failed connections are removed and
    /// closed.
    pub fn broadcast(&self, payload: &str) -> BroadcastReport {
        // Pre-build the frame once; clones share the buffer
        let frame = Utf8Bytes::from(payload.to_string());

        let (delivered, dead, remaining) = {
            let mut clients = self.lock();
            let mut delivered = 0;
            let mut failed = Vec::new();

            for (id, client) in clients.iter() {
                match client.send(Message::Text(frame.clone())) {
                    Ok(()) => delivered += 1,
                    Err(_) => failed.push(*id),
                }
            }

            let dead: Vec<Arc<ClientState>> =
                failed.iter().filter_map(|id| clients.remove(id)).collect();
            (delivered, dead, clients.len())
        };

        for client in &dead {
            warn!(
                "Error sending message to client {}. Closing and removing.",
                client.id
            );
            client.close();
        }

        counter!("checkbox_ws_messages_total", "direction" => "sent").increment(delivered as u64);
        if !dead.is_empty() {
            counter!("checkbox_broadcast_send_failures_total").increment(dead.len() as u64);
            gauge!("checkbox_ws_active_connections").set(remaining as f64);
        }

        BroadcastReport {
            delivered,
            removed: dead.iter().map(|c| c.id).collect(),
        }
    }

    /// Claim the single fanout slot. Returns `false` if already claimed.
    pub fn claim_fanout(&self) -> bool {
        !self.fanout_attached.swap(true, Ordering::AcqRel)
    }

    /// Release the fanout slot after the loop has stopped.
    pub fn release_fanout(&self) {
        self.fanout_attached.store(false, Ordering::Release);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
