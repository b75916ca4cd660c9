//! Synchronization service: cell writes and per-connection sessions.
//!
//! A write lands in the cell store before its event is published, so any
//! event a viewer sees describes state that is already durable. A new
//! connection is registered before its snapshot is taken. Events racing the
//! snapshot queue behind it and are re-applied harmlessly, since events are
//! idempotent overwrites.

use crate::client::{
    ClientState, ConnectionId, ConnectionRegistry, ConnectionState, CLIENT_CHANNEL_BUFFER_SIZE,
};
use crate::error::{GatewayError, Result};
use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use grid_store::{CellStore, Coord, GridSnapshot, UpdateChannel, UpdateEvent, UPDATES_TOPIC};
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long a closing connection's writer gets to flush before it is aborted.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive period used when none (or zero) is configured.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the synchronization service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Topic update events are published to.
    pub topic: String,
    /// Interval between keepalive pings on idle connections.
    pub ping_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topic: UPDATES_TOPIC.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Orchestrates the cell store, update channel and connection registry.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn CellStore>,
    channel: Arc<dyn UpdateChannel>,
    registry: Arc<ConnectionRegistry>,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn CellStore>,
        channel: Arc<dyn UpdateChannel>,
        registry: Arc<ConnectionRegistry>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            channel,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CellStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Write one cell, then notify viewers.
    ///
    /// A store failure is returned and nothing is published. A publish
    /// failure is logged only: the write stands and viewers stay stale until
    /// the next write to that cell or a reconnect.
    pub async fn write_cell(&self, row: i64, column: i64, value: bool) -> Result<UpdateEvent> {
        let coord = Coord::try_from_signed(row, column).inspect_err(|_| {
            counter!("checkbox_writes_total", "outcome" => "invalid").increment(1);
        })?;

        if let Err(e) = self.store.set(coord, value).await {
            counter!("checkbox_writes_total", "outcome" => "store_error").increment(1);
            return Err(e.into());
        }

        let event = UpdateEvent::new(coord, value);
        if let Err(e) = self.channel.publish(&self.config.topic, &event).await {
            warn!("Write {} applied but viewers were not notified: {}", event, e);
            counter!("checkbox_publish_failures_total").increment(1);
        }

        counter!("checkbox_writes_total", "outcome" => "ok").increment(1);
        debug!("Cell {} set to {}", coord, value);
        Ok(event)
    }

    /// Full point-in-time grid state.
    pub async fn snapshot(&self) -> Result<GridSnapshot> {
        Ok(self.store.snapshot().await?)
    }

    /// Run one viewer connection from upgrade to close.
    ///
    /// Registers the connection, sends the snapshot as the first frame, then
    /// streams broadcasts until the peer disconnects, an I/O error occurs or
    /// the connection is closed from the server side. The connection is
    /// deregistered exactly once on the way out.
    pub async fn on_connect<Tx, Rx, TxErr, RxErr>(&self, mut sink: Tx, mut stream: Rx)
    where
        Tx: Sink<Message, Error = TxErr> + Send + Unpin + 'static,
        TxErr: fmt::Display + Send + 'static,
        Rx: Stream<Item = std::result::Result<Message, RxErr>> + Send + Unpin,
        RxErr: fmt::Display,
    {
        let mut ping_interval = keepalive(self.config.ping_interval);

        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);
        let client = Arc::new(ClientState::new(tx));
        let client_id = client.id;
        client.set_state(ConnectionState::Upgraded);

        self.registry.register(client.clone());
        counter!("checkbox_ws_connections_total").increment(1);
        info!("Client {} connected", client_id);

        // Broadcasts arriving from here on queue in `rx` behind the snapshot
        if let Err(e) = self.send_snapshot(client_id, &mut sink).await {
            warn!("Failed to send initial state to client {}: {}", client_id, e);
            self.release(&client);
            let _ = sink.close().await;
            counter!("checkbox_ws_disconnections_total").increment(1);
            return;
        }
        client.set_state(ConnectionState::Synced);
        client.set_state(ConnectionState::Streaming);

        let writer = client.clone();
        let mut send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer.closed() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                debug!("Write to client {} failed: {}", writer.id, e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            writer.close();
            let _ = sink.close().await;
        });

        // Receive loop: only detects disconnects and errors
        loop {
            tokio::select! {
                biased;

                _ = client.closed() => {
                    debug!("Client {} closed from server side", client_id);
                    break;
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client {} disconnected", client_id);
                            break;
                        }
                        Some(Ok(Message::Text(text))) => {
                            counter!("checkbox_ws_messages_total", "direction" => "received").increment(1);
                            debug!("Received message from client {}: {}", client_id, text.as_str());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Error reading from client {}: {}", client_id, e);
                            break;
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if client.send(Message::Ping(Bytes::new())).is_err() {
                        break;
                    }
                }
            }
        }

        self.release(&client);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
            .await
            .is_err()
        {
            send_task.abort();
        }

        counter!("checkbox_ws_disconnections_total").increment(1);
        info!("Client {} session ended", client_id);
    }

    async fn send_snapshot<Tx, TxErr>(&self, client_id: ConnectionId, sink: &mut Tx) -> Result<()>
    where
        Tx: Sink<Message, Error = TxErr> + Unpin,
        TxErr: fmt::Display,
    {
        let snapshot = self.store.snapshot().await?;
        let json = serde_json::to_string(&snapshot)?;
        sink.send(Message::Text(json.into())).await.map_err(|e| {
            debug!("Snapshot write to client {} failed: {}", client_id, e);
            GatewayError::SendFailed(client_id)
        })?;
        debug!("Sent {} cells to client {}", snapshot.len(), client_id);
        Ok(())
    }

    /// Deregister and close. Safe to call more than once.
    fn release(&self, client: &ClientState) {
        self.registry.deregister(&client.id);
        client.close();
    }
}

/// Ping ticker whose first tick is one period out.
fn keepalive(period: Duration) -> Interval {
    let period = if period.is_zero() {
        warn!(
            "Zero ping interval configured, using {}s",
            DEFAULT_PING_INTERVAL.as_secs()
        );
        DEFAULT_PING_INTERVAL
    } else {
        period
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use futures::FutureExt;
    use grid_store::{EventStream, MemoryCellStore, MemoryUpdateChannel};
    use std::convert::Infallible;
    use tokio::sync::Notify;

    struct UnavailableStore;

    #[async_trait]
    impl CellStore for UnavailableStore {
        async fn get(&self, _: Coord) -> grid_store::Result<bool> {
            Err(unavailable())
        }
        async fn set(&self, _: Coord, _: bool) -> grid_store::Result<()> {
            Err(unavailable())
        }
        async fn snapshot(&self) -> grid_store::Result<GridSnapshot> {
            Err(unavailable())
        }
        async fn initialize(&self, _: u32, _: u32) -> grid_store::Result<()> {
            Err(unavailable())
        }
        async fn clear(&self) -> grid_store::Result<usize> {
            Err(unavailable())
        }
        async fn ping(&self) -> grid_store::Result<()> {
            Err(unavailable())
        }
    }

    fn unavailable() -> grid_store::Error {
        redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into()
    }

    struct BrokenPublisher(MemoryUpdateChannel);

    #[async_trait]
    impl UpdateChannel for BrokenPublisher {
        async fn publish(&self, _: &str, _: &UpdateEvent) -> grid_store::Result<()> {
            Err(grid_store::Error::PublishFailed("broker down".into()))
        }
        async fn subscribe(&self, topic: &str) -> grid_store::Result<EventStream> {
            self.0.subscribe(topic).await
        }
    }

    /// Store whose snapshot blocks until released.
    struct GatedStore {
        inner: MemoryCellStore,
        gate: Notify,
    }

    #[async_trait]
    impl CellStore for GatedStore {
        async fn get(&self, c: Coord) -> grid_store::Result<bool> {
            self.inner.get(c).await
        }
        async fn set(&self, c: Coord, v: bool) -> grid_store::Result<()> {
            self.inner.set(c, v).await
        }
        async fn snapshot(&self) -> grid_store::Result<GridSnapshot> {
            self.gate.notified().await;
            self.inner.snapshot().await
        }
        async fn initialize(&self, r: u32, c: u32) -> grid_store::Result<()> {
            self.inner.initialize(r, c).await
        }
        async fn clear(&self) -> grid_store::Result<usize> {
            self.inner.clear().await
        }
        async fn ping(&self) -> grid_store::Result<()> {
            Ok(())
        }
    }

    fn service_with(store: Arc<dyn CellStore>, channel: Arc<dyn UpdateChannel>) -> SyncService {
        SyncService::new(
            store,
            channel,
            Arc::new(ConnectionRegistry::new()),
            SyncConfig {
                ping_interval: Duration::from_secs(3600),
                ..SyncConfig::default()
            },
        )
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    async fn wait_for_size(registry: &ConnectionRegistry, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.size() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry size never reached target");
    }

    #[tokio::test]
    async fn test_write_updates_store_then_publishes() {
        let store = MemoryCellStore::new();
        let channel = MemoryUpdateChannel::new();
        let service = service_with(Arc::new(store.clone()), Arc::new(channel.clone()));
        let mut feed = channel.subscribe(UPDATES_TOPIC).await.unwrap();

        service.write_cell(1, 2, true).await.unwrap();

        assert!(store.get(Coord::new(1, 2)).await.unwrap());
        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.to_string(), "(1,2):true");
    }

    #[tokio::test]
    async fn test_sequential_writes_observed_in_order() {
        let channel = MemoryUpdateChannel::new();
        let service = service_with(Arc::new(MemoryCellStore::new()), Arc::new(channel.clone()));
        let mut feed = channel.subscribe(UPDATES_TOPIC).await.unwrap();

        service.write_cell(5, 5, true).await.unwrap();
        service.write_cell(5, 5, false).await.unwrap();

        assert!(feed.next().await.unwrap().unwrap().value);
        assert!(!feed.next().await.unwrap().unwrap().value);
    }

    #[tokio::test]
    async fn test_negative_coordinate_rejected_before_store() {
        let store = MemoryCellStore::new();
        let channel = MemoryUpdateChannel::new();
        let service = service_with(Arc::new(store.clone()), Arc::new(channel.clone()));
        let mut feed = channel.subscribe(UPDATES_TOPIC).await.unwrap();

        let err = service.write_cell(-1, 2, true).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Store(grid_store::Error::InvalidCoordinate { row: -1, column: 2 })
        ));
        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(feed.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_skips_publish() {
        let channel = MemoryUpdateChannel::new();
        let service = service_with(Arc::new(UnavailableStore), Arc::new(channel.clone()));
        let mut feed = channel.subscribe(UPDATES_TOPIC).await.unwrap();

        let err = service.write_cell(0, 0, true).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Store(grid_store::Error::StoreUnavailable(_))
        ));
        assert!(feed.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_still_applies_write() {
        let store = MemoryCellStore::new();
        let channel = BrokenPublisher(MemoryUpdateChannel::new());
        let service = service_with(Arc::new(store.clone()), Arc::new(channel));

        let event = service.write_cell(3, 4, true).await.unwrap();
        assert_eq!(event, UpdateEvent::new(Coord::new(3, 4), true));
        assert!(store.get(Coord::new(3, 4)).await.unwrap());
    }

    #[tokio::test]
    async fn test_new_connection_gets_snapshot_then_events() {
        let store = MemoryCellStore::new();
        store.set(Coord::new(0, 0), true).await.unwrap();
        let service = service_with(Arc::new(store), Arc::new(MemoryUpdateChannel::new()));
        let registry = service.registry().clone();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();
        let session = tokio::spawn({
            let service = service.clone();
            async move { service.on_connect(out_tx, in_rx).await }
        });

        let snapshot: GridSnapshot =
            serde_json::from_str(&text(out_rx.next().await.unwrap())).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(Coord::new(0, 0)), Some(true));
        assert_eq!(registry.size(), 1);

        registry.broadcast("(1,2):true");
        let event: UpdateEvent = text(out_rx.next().await.unwrap()).parse().unwrap();
        assert_eq!(event, UpdateEvent::new(Coord::new(1, 2), true));

        // Peer goes away
        drop(in_tx);
        session.await.unwrap();
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_precedes_events_racing_it() {
        let store = Arc::new(GatedStore {
            inner: MemoryCellStore::new(),
            gate: Notify::new(),
        });
        store.inner.set(Coord::new(9, 9), true).await.unwrap();
        let service = service_with(store.clone(), Arc::new(MemoryUpdateChannel::new()));
        let registry = service.registry().clone();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();
        let session = tokio::spawn({
            let service = service.clone();
            async move { service.on_connect(out_tx, in_rx).await }
        });

        // Registered but still waiting on its snapshot
        wait_for_size(&registry, 1).await;
        assert_eq!(registry.broadcast("(9,9):false").delivered, 1);
        store.gate.notify_one();

        let first = text(out_rx.next().await.unwrap());
        assert!(serde_json::from_str::<GridSnapshot>(&first).is_ok());
        assert_eq!(text(out_rx.next().await.unwrap()), "(9,9):false");

        drop(in_tx);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_snapshot_send_discards_connection() {
        let service = service_with(
            Arc::new(MemoryCellStore::new()),
            Arc::new(MemoryUpdateChannel::new()),
        );

        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        drop(out_rx);
        let (_in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();

        tokio::time::timeout(Duration::from_secs(5), service.on_connect(out_tx, in_rx))
            .await
            .expect("session should end after failed snapshot send");
        assert_eq!(service.registry().size(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_store_discards_connection() {
        let service = service_with(Arc::new(UnavailableStore), Arc::new(MemoryUpdateChannel::new()));

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();

        tokio::time::timeout(Duration::from_secs(5), service.on_connect(out_tx, in_rx))
            .await
            .unwrap();
        assert_eq!(service.registry().size(), 0);
        // No baseline was sent, only the sink was closed
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let service = service_with(
            Arc::new(MemoryCellStore::new()),
            Arc::new(MemoryUpdateChannel::new()),
        );
        let registry = service.registry().clone();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, std::io::Error>>();
        let session = tokio::spawn({
            let service = service.clone();
            async move { service.on_connect(out_tx, in_rx).await }
        });

        out_rx.next().await.unwrap();
        in_tx
            .unbounded_send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
            .unwrap();

        session.await.unwrap();
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn test_client_text_is_ignored() {
        let service = service_with(
            Arc::new(MemoryCellStore::new()),
            Arc::new(MemoryUpdateChannel::new()),
        );
        let registry = service.registry().clone();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();
        let session = tokio::spawn({
            let service = service.clone();
            async move { service.on_connect(out_tx, in_rx).await }
        });

        out_rx.next().await.unwrap();
        in_tx
            .unbounded_send(Ok(Message::Text("(0,0):true".into())))
            .unwrap();
        registry.broadcast("(0,1):true");
        assert_eq!(text(out_rx.next().await.unwrap()), "(0,1):true");
        assert_eq!(registry.size(), 1);

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        session.await.unwrap();
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn test_dead_writer_ends_session() {
        let service = service_with(
            Arc::new(MemoryCellStore::new()),
            Arc::new(MemoryUpdateChannel::new()),
        );
        let registry = service.registry().clone();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();
        let session = tokio::spawn({
            let service = service.clone();
            async move { service.on_connect(out_tx, in_rx).await }
        });

        out_rx.next().await.unwrap();
        wait_for_size(&registry, 1).await;

        // Transport gone: the next queued frame fails in the writer
        drop(out_rx);
        registry.broadcast("(0,2):true");

        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session should end once its writer fails")
            .unwrap();
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn test_zero_ping_interval_does_not_leak_connection() {
        let service = SyncService::new(
            Arc::new(MemoryCellStore::new()),
            Arc::new(MemoryUpdateChannel::new()),
            Arc::new(ConnectionRegistry::new()),
            SyncConfig {
                ping_interval: Duration::ZERO,
                ..SyncConfig::default()
            },
        );
        let registry = service.registry().clone();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, Infallible>>();
        let session = tokio::spawn({
            let service = service.clone();
            async move { service.on_connect(out_tx, in_rx).await }
        });

        out_rx.next().await.unwrap();
        assert_eq!(registry.size(), 1);

        drop(in_tx);
        session.await.expect("session must not panic");
        assert_eq!(registry.size(), 0);
    }
}
