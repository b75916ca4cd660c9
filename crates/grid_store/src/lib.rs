//! Cell storage and update fan-in for the checkbox grid.
//!
//! This crate owns the two shared resources the live-sync gateway is built on:
//! - [`CellStore`]: one bit per `(row, column)` cell, keyed `states:(r,c)`
//! - [`UpdateChannel`]: a best-effort topic carrying `(r,c):bool` update events
//!
//! Both come with a Redis backend for production and an in-memory backend used
//! by tests and local runs.
//!
//! # Example
//!
//! ```ignore
//! use grid_store::{CellStore, Coord, RedisCellStore};
//!
//! let store = RedisCellStore::connect("redis://localhost:6379").await?;
//! store.initialize(20, 20).await?;
//! store.set(Coord::new(1, 2), true).await?;
//! assert!(store.get(Coord::new(1, 2)).await?);
//! ```

pub mod cell;
pub mod channel;
pub mod error;
pub mod memory;
pub mod store;

pub use cell::{Coord, GridSnapshot, UpdateEvent, STATE_KEY_PATTERN, STATE_KEY_PREFIX, UPDATES_TOPIC};
pub use channel::{EventStream, RedisUpdateChannel, UpdateChannel};
pub use error::{Error, Result};
pub use memory::{MemoryCellStore, MemoryUpdateChannel};
pub use store::{CellStore, RedisCellStore};
