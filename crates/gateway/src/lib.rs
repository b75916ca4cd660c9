//! Gateway service for live synchronization of a shared checkbox grid.
//!
//! This service:
//! - Accepts WebSocket connections from viewers
//! - Sends each new viewer a full grid snapshot, then every later update
//! - Applies cell writes from the HTTP API to the cell store
//! - Publishes each write on the update channel and fans it back out
//!
//! ## Architecture
//!
//! ```text
//! PATCH /api/v1/checkbox
//!         ↓
//! SyncService::write_cell ──→ CellStore (Redis SETBIT)
//!         ↓
//! UpdateChannel (Redis pub/sub: checkbox_updates)
//!         ↓
//! FanoutLoop (single subscription)
//!         ↓
//! ConnectionRegistry::broadcast
//!         ↓
//! WebSocket viewers
//! ```
//!
//! ## Ordering
//!
//! - A viewer is registered before its snapshot is read, so no write that
//!   completes after registration can be missed
//! - The snapshot is always the first frame; racing updates queue behind it
//! - Updates reach every viewer in the order the channel delivers them

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod sync;
pub mod ws_server;

pub use client::{BroadcastReport, ClientState, ConnectionId, ConnectionRegistry, ConnectionState};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use fanout::FanoutLoop;
pub use sync::{SyncConfig, SyncService};
pub use ws_server::{create_router, AppState};
