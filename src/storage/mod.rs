//! Pluggable event storage behind a URI-selected backend.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config;
use crate::error::StoreError;
use crate::event::Event;
use crate::filter::Filter;

/// Capacity of the channels streaming query results.
pub(crate) const QUERY_CHANNEL_CAPACITY: usize = 128;

/// Durable (or transient) event set.
///
/// `query` streams matches newest-first with ties broken by id; the
/// producer stops on its own when the receiver is dropped. A filter
/// `limit` of zero yields no events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert an event; fails with [`StoreError::Duplicate`] when the id is
    /// already present.
    async fn save(&self, event: &Event) -> Result<(), StoreError>;

    /// Remove an event by id; a missing id is not an error.
    async fn delete(&self, event_id: &str) -> Result<(), StoreError>;

    /// Stream events matching `filter`.
    async fn query(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, StoreError>;

    /// Release underlying resources.
    async fn close(&self);
}

/// Open the backend selected by `storage.uri`.
pub async fn connect(cfg: &config::Storage) -> Result<Arc<dyn EventStore>, StoreError> {
    let (scheme, rest) = cfg
        .uri
        .split_once("://")
        .ok_or_else(|| StoreError::Backend(format!("invalid storage uri: {}", cfg.uri)))?;
    match scheme {
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        "sqlite" => Ok(Arc::new(sqlite::SqliteStore::connect(rest).await?)),
        other => Err(StoreError::Backend(format!(
            "unsupported storage backend: {other}"
        ))),
    }
}

/// A write request with its acknowledgement channel.
#[derive(Debug)]
pub enum StoreRequest {
    Save {
        event: Event,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Delete {
        event_id: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Write-path actor: the only component that mutates the store.
///
/// Runs until its request channel closes (every sender dropped), then
/// closes the store.
pub struct StorageBackend {
    store: Arc<dyn EventStore>,
    recv: mpsc::Receiver<StoreRequest>,
}

impl StorageBackend {
    pub fn new(store: Arc<dyn EventStore>, recv: mpsc::Receiver<StoreRequest>) -> Self {
        Self { store, recv }
    }

    /// Serve save/delete requests; acknowledgements whose requester has
    /// gone away are dropped silently.
    pub async fn run(mut self) {
        info!("storage backend started");
        while let Some(req) = self.recv.recv().await {
            match req {
                StoreRequest::Save { event, reply } => {
                    let res = self.store.save(&event).await;
                    match &res {
                        Ok(()) => debug!(event_id = %event.id, "event stored"),
                        Err(StoreError::Duplicate) => {
                            debug!(event_id = %event.id, "duplicate event")
                        }
                        Err(e) => error!(event_id = %event.id, error = %e, "failed to store event"),
                    }
                    let _ = reply.send(res);
                }
                StoreRequest::Delete { event_id, reply } => {
                    let res = self.store.delete(&event_id).await;
                    if let Err(e) = &res {
                        error!(%event_id, error = %e, "failed to delete event");
                    }
                    let _ = reply.send(res);
                }
            }
        }
        self.store.close().await;
        info!("storage backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_util::signed_event;

    #[tokio::test]
    async fn connect_by_scheme() {
        let cfg = config::Storage {
            uri: "memory://events".into(),
            skip_tls_verify: false,
        };
        assert!(connect(&cfg).await.is_ok());

        let cfg = config::Storage {
            uri: "sqlite://:memory:".into(),
            skip_tls_verify: false,
        };
        assert!(connect(&cfg).await.is_ok());
    }

    #[tokio::test]
    async fn connect_rejects_bad_uris() {
        for uri in ["", "memory", "redis://x", "://x"] {
            let cfg = config::Storage {
                uri: uri.into(),
                skip_tls_verify: false,
            };
            assert!(connect(&cfg).await.is_err(), "accepted {uri:?}");
        }
    }

    #[tokio::test]
    async fn backend_acknowledges_saves_and_deletes() {
        let store: Arc<dyn EventStore> = Arc::new(memory::MemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(StorageBackend::new(store.clone(), rx).run());

        let ev = signed_event(1, 1, vec![], "");
        let (reply, ack) = oneshot::channel();
        tx.send(StoreRequest::Save {
            event: ev.clone(),
            reply,
        })
        .await
        .unwrap();
        ack.await.unwrap().unwrap();

        // duplicate save is reported as such
        let (reply, ack) = oneshot::channel();
        tx.send(StoreRequest::Save {
            event: ev.clone(),
            reply,
        })
        .await
        .unwrap();
        assert!(matches!(ack.await.unwrap(), Err(StoreError::Duplicate)));

        let (reply, ack) = oneshot::channel();
        tx.send(StoreRequest::Delete {
            event_id: ev.id.clone(),
            reply,
        })
        .await
        .unwrap();
        ack.await.unwrap().unwrap();

        // actor exits once the last sender is gone
        drop(tx);
        handle.await.unwrap();
    }
}
