//! In-memory backends.
//!
//! Same contracts as the Redis backends, used for tests and for running the
//! gateway without a Redis server.

use crate::cell::{Coord, GridSnapshot, UpdateEvent};
use crate::channel::{EventStream, UpdateChannel};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::store::CellStore;

/// Default per-topic buffer for [`MemoryUpdateChannel`].
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Lock-free cell store on a DashMap.
#[derive(Debug, Clone, Default)]
pub struct MemoryCellStore {
    cells: Arc<DashMap<Coord, bool>>,
}

impl MemoryCellStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CellStore for MemoryCellStore {
    async fn get(&self, coord: Coord) -> Result<bool> {
        Ok(self.cells.get(&coord).map(|v| *v).unwrap_or(false))
    }

    async fn set(&self, coord: Coord, value: bool) -> Result<()> {
        self.cells.insert(coord, value);
        Ok(())
    }

    async fn snapshot(&self) -> Result<GridSnapshot> {
        Ok(self.cells.iter().map(|e| (*e.key(), *e.value())).collect())
    }

    async fn initialize(&self, rows: u32, cols: u32) -> Result<()> {
        for row in 0..=rows {
            for col in 0..=cols {
                self.cells.insert(Coord::new(row, col), false);
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<usize> {
        let removed = self.cells.len();
        self.cells.clear();
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Topic broadcast on `tokio::sync::broadcast`, one sender per topic.
///
/// A subscriber that falls more than the topic capacity behind skips the
/// missed events.
#[derive(Debug, Clone)]
pub struct MemoryUpdateChannel {
    topics: Arc<DashMap<String, broadcast::Sender<UpdateEvent>>>,
    capacity: usize,
}

impl MemoryUpdateChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<UpdateEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryUpdateChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateChannel for MemoryUpdateChannel {
    async fn publish(&self, topic: &str, event: &UpdateEvent) -> Result<()> {
        match self.sender(topic).send(*event) {
            Ok(receivers) => debug!("Published {} to '{}' ({} receivers)", event, topic, receivers),
            Err(_) => debug!("No subscribers on '{}', dropped {}", topic, event),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream> {
        let rx = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => return Some((Ok(event), rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on '{}' lagged, skipped {} events", topic, skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
