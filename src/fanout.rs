//! Subscription index and live event fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::event::Event;
use crate::filter::Subscription;
use crate::frame::RelayFrame;
use crate::msg::{FanoutMsg, Outbound};
use crate::storage::EventStore;

/// Deadline for draining one filter's historical query.
const REPLAY_TIMEOUT: Duration = Duration::from_secs(15);

/// Active subscriptions keyed by connection.
///
/// Writes are serialized behind the write lock; fan-out tasks read
/// concurrently. Within a connection, subscription ids are unique:
/// re-registering an id overwrites its predecessor.
#[derive(Clone, Default)]
pub struct SubscriptionIndex {
    inner: Arc<RwLock<HashMap<Uuid, Vec<Subscription>>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, conn_id: Uuid, sub_id: &str) -> bool {
        let index = self.inner.read().await;
        index
            .get(&conn_id)
            .is_some_and(|subs| subs.iter().any(|s| s.id == sub_id))
    }

    /// Register a subscription, replacing any prior one with the same id.
    pub async fn add(&self, conn_id: Uuid, subscription: Subscription) {
        let mut index = self.inner.write().await;
        let subs = index.entry(conn_id).or_default();
        match subs.iter_mut().find(|s| s.id == subscription.id) {
            Some(existing) => *existing = subscription,
            None => subs.push(subscription),
        }
    }

    /// Remove a single subscription; unknown ids are a no-op.
    pub async fn end_subscription(&self, conn_id: Uuid, sub_id: &str) {
        let mut index = self.inner.write().await;
        if let Some(subs) = index.get_mut(&conn_id) {
            subs.retain(|s| s.id != sub_id);
        }
    }

    /// Remove every subscription held by a connection.
    pub async fn end_connection(&self, conn_id: Uuid) {
        let mut index = self.inner.write().await;
        index.remove(&conn_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Owns the subscription index; serves historical replays and dispatches
/// live events to matching subscriptions.
pub struct FilterManager {
    recv: mpsc::Receiver<FanoutMsg>,
    to_hub: mpsc::Sender<Outbound>,
    store: Arc<dyn EventStore>,
    index: SubscriptionIndex,
    stopping: watch::Receiver<bool>,
}

impl FilterManager {
    pub fn new(
        recv: mpsc::Receiver<FanoutMsg>,
        to_hub: mpsc::Sender<Outbound>,
        store: Arc<dyn EventStore>,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            recv,
            to_hub,
            store,
            index: SubscriptionIndex::new(),
            stopping,
        }
    }

    /// Handle to the index, used by tests and diagnostics.
    pub fn index(&self) -> SubscriptionIndex {
        self.index.clone()
    }

    /// Consume envelopes until the ingester closes the channel. Fan-out
    /// runs on detached tasks; historical replays run inline so a REQ's
    /// EOSE orders after its stored events.
    pub async fn run(mut self) {
        info!("filter manager started");
        let mut fanouts: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                envelope = self.recv.recv() => match envelope {
                    Some(FanoutMsg::Event { event }) => {
                        if *self.stopping.borrow() {
                            warn!("not dispatching event, filter manager is stopping");
                            continue;
                        }
                        let index = self.index.clone();
                        let to_hub = self.to_hub.clone();
                        let stopping = self.stopping.clone();
                        fanouts.spawn(async move {
                            fan_out(index, to_hub, event, stopping).await;
                        });
                    }
                    Some(FanoutMsg::Subscribe { conn_id, subscription }) => {
                        self.serve_subscription(conn_id, subscription).await;
                    }
                    Some(FanoutMsg::Close { conn_id, sub_id }) => {
                        if self.index.contains(conn_id, &sub_id).await {
                            self.index.end_subscription(conn_id, &sub_id).await;
                            debug!(%conn_id, sub_id, "subscription closed");
                        }
                    }
                    Some(FanoutMsg::Disconnect { conn_id }) => {
                        self.index.end_connection(conn_id).await;
                        debug!(%conn_id, "connection state purged");
                    }
                    None => {
                        if !*self.stopping.borrow() {
                            error!("receive channel from ingester unexpectedly closed");
                        }
                        break;
                    }
                },
                Some(_) = fanouts.join_next(), if !fanouts.is_empty() => {}
            }
        }
        while fanouts.join_next().await.is_some() {}
        info!("filter manager stopped");
    }

    /// Replay stored events for each filter, close with EOSE, then register
    /// the subscription for live matches.
    async fn serve_subscription(&self, conn_id: Uuid, subscription: Subscription) {
        for filter in &subscription.filters {
            let mut rx = match self.store.query(filter).await {
                Ok(rx) => rx,
                Err(err) => {
                    error!(%conn_id, error = %err, "failed to query storage for events");
                    continue;
                }
            };
            let deadline = Instant::now() + REPLAY_TIMEOUT;
            loop {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(event)) => {
                        let out =
                            Outbound::new(conn_id, RelayFrame::event(&subscription.id, event));
                        if self.to_hub.send(out).await.is_err() {
                            warn!(%conn_id, "connection hub is gone, aborting replay");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(%conn_id, sub_id = %subscription.id, "timeout reading all events queried for this filter");
                        break;
                    }
                }
            }
        }
        let eose = Outbound::new(conn_id, RelayFrame::eose(&subscription.id));
        if self.to_hub.send(eose).await.is_err() {
            warn!(%conn_id, "connection hub is gone, dropping EOSE");
            return;
        }
        debug!(%conn_id, sub_id = %subscription.id, "registering subscription");
        self.index.add(conn_id, subscription).await;
    }
}

/// Deliver one event to every connection with a matching subscription, at
/// most once per connection: the first subscription whose any filter
/// matches wins.
async fn fan_out(
    index: SubscriptionIndex,
    to_hub: mpsc::Sender<Outbound>,
    event: Event,
    stopping: watch::Receiver<bool>,
) {
    if *stopping.borrow() {
        warn!("unable to dispatch event, filter manager is stopping");
        return;
    }
    let index = index.inner.read().await;
    for (conn_id, subs) in index.iter() {
        if let Some(sub) = subs.iter().find(|s| s.matches(&event)) {
            let out = Outbound::new(*conn_id, RelayFrame::event(sub.id.clone(), event.clone()));
            if to_hub.send(out).await.is_err() {
                warn!("connection hub is gone, aborting fan-out");
                return;
            }
        }
    }
}
