//! Fanout loop: update channel → every registered connection.
//!
//! Holds the single subscription of this process and rebroadcasts each event
//! verbatim. Events are delivered in the order the channel yields them.

use crate::client::ConnectionRegistry;
use crate::error::{GatewayError, Result};
use futures::StreamExt;
use grid_store::{EventStream, UpdateChannel, UpdateEvent};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Forwards update events from one topic to the connection registry.
pub struct FanoutLoop {
    channel: Arc<dyn UpdateChannel>,
    registry: Arc<ConnectionRegistry>,
    topic: String,
}

impl FanoutLoop {
    pub fn new(
        channel: Arc<dyn UpdateChannel>,
        registry: Arc<ConnectionRegistry>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            registry,
            topic: topic.into(),
        }
    }

    /// Subscribe and start forwarding on a background task.
    ///
    /// Returns once the subscription is live, so events published after this
    /// returns are guaranteed to be seen. Fails if another loop is already
    /// attached to the same registry.
    pub async fn spawn(self, shutdown_rx: mpsc::Receiver<()>) -> Result<JoinHandle<Result<()>>> {
        if !self.registry.claim_fanout() {
            return Err(GatewayError::FanoutAlreadyRunning(self.topic));
        }

        info!("Starting fanout loop, subscribing to '{}'", self.topic);
        let feed = match self.channel.subscribe(&self.topic).await {
            Ok(feed) => feed,
            Err(e) => {
                self.registry.release_fanout();
                return Err(e.into());
            }
        };

        Ok(tokio::spawn(async move { self.run(feed, shutdown_rx).await }))
    }

    async fn run(self, mut feed: EventStream, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("Fanout loop running");

        let outcome = loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Fanout loop received shutdown signal");
                    break Ok(());
                }

                next = feed.next() => {
                    match next {
                        Some(Ok(event)) => self.dispatch(&event),
                        Some(Err(e)) => {
                            warn!("Skipping undeliverable update: {}", e);
                            counter!("checkbox_fanout_errors_total").increment(1);
                        }
                        None => {
                            warn!("Subscription to '{}' ended unexpectedly", self.topic);
                            break Err(grid_store::Error::SubscriptionClosed(self.topic.clone()).into());
                        }
                    }
                }
            }
        };

        self.registry.release_fanout();
        info!("Fanout loop stopped");
        outcome
    }

    fn dispatch(&self, event: &UpdateEvent) {
        let payload = event.to_string();
        let report = self.registry.broadcast(&payload);
        counter!("checkbox_fanout_events_total").increment(1);
        debug!(
            "Broadcast {} to {} clients ({} removed)",
            payload,
            report.delivered,
            report.removed.len()
        );
    }
}
