//! Cell store: one bit per grid cell.

use crate::cell::{Coord, GridSnapshot, STATE_KEY_PATTERN};
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Key-addressed single-bit storage for grid cells.
///
/// Implementations provide per-key atomicity; callers never need a lock
/// around a single `get` or `set`.
#[async_trait]
pub trait CellStore: Send + Sync + 'static {
    /// Current value of a cell. Never-written cells read as `false`.
    async fn get(&self, coord: Coord) -> Result<bool>;

    /// Atomically overwrite a single cell.
    async fn set(&self, coord: Coord, value: bool) -> Result<()>;

    /// Every initialized cell in the grid namespace.
    ///
    /// May observe writes that land during the scan; every returned entry was
    /// valid at some point while it ran.
    async fn snapshot(&self) -> Result<GridSnapshot>;

    /// Set every cell in `[0..=rows] x [0..=cols]` to `false`.
    /// Safe to re-run on a populated store.
    async fn initialize(&self, rows: u32, cols: u32) -> Result<()>;

    /// Remove every cell. Returns the number of cells removed.
    async fn clear(&self) -> Result<usize>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// Redis-backed cell store using `SETBIT`/`GETBIT` at offset 0.
#[derive(Clone)]
pub struct RedisCellStore {
    conn: MultiplexedConnection,
}

impl RedisCellStore {
    /// Connect to Redis and keep one multiplexed connection for all commands.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    async fn grid_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(STATE_KEY_PATTERN).await?;
        Ok(keys)
    }
}

#[async_trait]
impl CellStore for RedisCellStore {
    async fn get(&self, coord: Coord) -> Result<bool> {
        let mut conn = self.conn.clone();
        let bit: u8 = conn.getbit(coord.store_key(), 0).await?;
        Ok(bit == 1)
    }

    async fn set(&self, coord: Coord, value: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.setbit::<_, ()>(coord.store_key(), 0, value).await?;
        debug!("Set {} = {}", coord, value);
        Ok(())
    }

    async fn snapshot(&self) -> Result<GridSnapshot> {
        let keys = self.grid_keys().await?;
        if keys.is_empty() {
            return Ok(GridSnapshot::new());
        }
        let mut conn = self.conn.clone();

        // GETBIT on a non-string key fails the whole pipeline with WRONGTYPE
        let mut types = redis::pipe();
        for key in &keys {
            types.cmd("TYPE").arg(key);
        }
        let kinds: Vec<String> = types.query_async(&mut conn).await?;
        let keys = bitmap_keys(keys, kinds);
        if keys.is_empty() {
            return Ok(GridSnapshot::new());
        }

        // One round trip for all bits instead of a GETBIT per key
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.getbit(key, 0);
        }
        let bits: Vec<u8> = pipe.query_async(&mut conn).await?;

        let mut snapshot = GridSnapshot::new();
        for (key, bit) in keys.iter().zip(bits) {
            match Coord::from_store_key(key) {
                Ok(coord) => snapshot.insert(coord, bit == 1),
                Err(e) => warn!("Skipping foreign key in grid namespace: {}", e),
            }
        }

        debug!("Snapshot read {} cells", snapshot.len());
        Ok(snapshot)
    }

    async fn initialize(&self, rows: u32, cols: u32) -> Result<()> {
        let mut conn = self.conn.clone();

        // One pipeline per row keeps each batch bounded on large grids
        for row in 0..=rows {
            let mut pipe = redis::pipe();
            for col in 0..=cols {
                pipe.setbit(Coord::new(row, col).store_key(), 0, false).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }

        info!("Initialized {} x {} grid states to 0", rows, cols);
        Ok(())
    }

    async fn clear(&self) -> Result<usize> {
        let keys = self.grid_keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let removed: usize = conn.del(&keys).await?;
        info!("Cleared {} grid cells", removed);
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Keep only keys whose Redis type can hold a cell bit.
///
/// Keys deleted between `KEYS` and `TYPE` report `none` and are dropped too.
fn bitmap_keys(keys: Vec<String>, kinds: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .zip(kinds)
        .filter_map(|(key, kind)| match kind.as_str() {
            "string" => Some(key),
            "none" => None,
            other => {
                warn!("Skipping {} key in grid namespace: {}", other, key);
                None
            }
        })
        .collect()
}
