//! Wires the components together and owns the relay lifecycle.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::Config;
use crate::fanout::{FilterManager, SubscriptionIndex};
use crate::ingester::Ingester;
use crate::storage::{self, StorageBackend, StoreRequest};
use crate::ws::ConnectionHub;

/// Capacity of the channels between components.
const CHANNEL_CAPACITY: usize = 128;

/// A fully wired relay, bound but not yet serving.
pub struct Relay {
    local_addr: SocketAddr,
    hub: ConnectionHub,
    ingester: Ingester,
    manager: FilterManager,
    backend: StorageBackend,
    index: SubscriptionIndex,
    stopping: watch::Sender<bool>,
    /// Keeps the storage request channel open past the ingester's exit;
    /// storage must not close while the filter manager can still query it.
    store_guard: mpsc::Sender<StoreRequest>,
}

impl Relay {
    /// Connect storage, build the channel graph and bind the listener.
    ///
    /// Channel ownership is unidirectional: each component keeps its
    /// receive half and hands send halves to its upstream peers, so
    /// shutdown can ripple through by closing sources before sinks.
    pub async fn bind(cfg: &Config) -> Result<Self> {
        let store = storage::connect(&cfg.storage).await?;
        let (stopping_tx, stopping_rx) = watch::channel(false);
        let (to_ingester, ingester_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ingester_to_hub, from_ingester) = mpsc::channel(CHANNEL_CAPACITY);
        let (fanout_to_hub, from_fanout) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_fanout, fanout_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_store, store_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let store_guard = to_store.clone();

        let backend = StorageBackend::new(store.clone(), store_rx);
        let ingester = Ingester::new(
            ingester_rx,
            ingester_to_hub,
            to_fanout,
            to_store,
            store.clone(),
            cfg.reject_future_seconds(),
            stopping_rx.clone(),
        );
        let manager = FilterManager::new(fanout_rx, fanout_to_hub, store, stopping_rx.clone());
        let index = manager.index();
        let hub = ConnectionHub::bind(
            &cfg.bind_addr(),
            to_ingester,
            from_ingester,
            from_fanout,
            stopping_rx,
        )
        .await?;
        Ok(Self {
            local_addr: hub.local_addr(),
            hub,
            ingester,
            manager,
            backend,
            index,
            stopping: stopping_tx,
            store_guard,
        })
    }

    /// Address the hub is bound to (useful with port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the live subscription index.
    pub fn subscription_index(&self) -> SubscriptionIndex {
        self.index.clone()
    }

    /// Serve until `shutdown` resolves, then unwind sources before sinks:
    /// the hub stops accepting and its read tasks exit, releasing the
    /// ingester's inbound channel; the ingester drains, then the filter
    /// manager, then storage; the hub's write tasks and server close last,
    /// once the router has seen both of its source channels close.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let Relay {
            hub,
            ingester,
            manager,
            backend,
            stopping,
            store_guard,
            ..
        } = self;
        let backend_task = tokio::spawn(backend.run());
        let manager_task = tokio::spawn(manager.run());
        let ingester_task = tokio::spawn(ingester.run());
        let hub_task = tokio::spawn(hub.run());

        shutdown.await;
        info!("beginning shutdown sequence...");
        let _ = stopping.send(true);
        ingester_task.await?;
        manager_task.await?;
        drop(store_guard);
        backend_task.await?;
        hub_task.await?;
        info!("shutdown completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn test_config(addr: &str) -> Config {
        let raw = format!(
            "[http]\nhost = \"{}\"\nport = {}\n[storage]\nuri = \"memory://test\"\n",
            addr.split(':').next().unwrap(),
            addr.split(':').nth(1).unwrap(),
        );
        let mut cfg: Config = toml::from_str(&raw).unwrap();
        cfg.log.level = "info".into();
        cfg
    }

    #[tokio::test]
    async fn serves_and_shuts_down_cleanly() {
        let cfg = test_config("127.0.0.1:0");
        let relay = Relay::bind(&cfg).await.unwrap();
        let addr = relay.local_addr();
        let index = relay.subscription_index();
        let (stop_tx, stop_rx) = oneshot::channel();
        let server = tokio::spawn(relay.run(async {
            let _ = stop_rx.await;
        }));

        let url = format!("ws://{addr}/");
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(Message::Text(
            serde_json::json!(["REQ", "s", {"limit": 0}]).to_string(),
        ))
        .await
        .unwrap();
        let mut saw_eose = false;
        while let Some(msg) = timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            if let Message::Text(text) = msg.unwrap() {
                if text.contains("EOSE") {
                    saw_eose = true;
                    break;
                }
            }
        }
        assert!(saw_eose);
        assert_eq!(index.connection_count().await, 1);

        // disconnecting must purge the index within a bounded time
        ws.close(None).await.unwrap();
        drop(ws);
        let mut purged = false;
        for _ in 0..20 {
            if index.connection_count().await == 0 {
                purged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(purged);

        stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_fails_on_bad_storage_uri() {
        let mut cfg = test_config("127.0.0.1:0");
        cfg.storage.uri = "redis://nope".into();
        assert!(Relay::bind(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn bind_fails_on_taken_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = test_config(&addr.to_string());
        assert!(Relay::bind(&cfg).await.is_err());
    }
}
