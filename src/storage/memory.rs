//! Transient in-memory store for tests and development.

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::error::StoreError;
use crate::event::Event;
use crate::filter::Filter;

use super::{EventStore, QUERY_CHANNEL_CAPACITY};

/// Events in a slice kept sorted newest-first (ties by id) so queries can
/// stream in order without re-sorting.
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort order: descending `created_at`, ascending id.
fn sorts_before(a: &Event, b: &Event) -> bool {
    a.created_at > b.created_at || (a.created_at == b.created_at && a.id < b.id)
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.id == event.id) {
            return Err(StoreError::Duplicate);
        }
        let idx = events.partition_point(|e| sorts_before(e, event));
        events.insert(idx, event.clone());
        Ok(())
    }

    async fn delete(&self, event_id: &str) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        events.retain(|e| e.id != event_id);
        Ok(())
    }

    async fn query(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, StoreError> {
        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        let limit = filter.limit.map(|l| l as usize);
        if limit == Some(0) {
            return Ok(rx);
        }
        // snapshot under the read lock, stream without it
        let matches: Vec<Event> = {
            let events = self.events.read().await;
            let iter = events.iter().filter(|e| filter.matches(e)).cloned();
            match limit {
                Some(l) => iter.take(l).collect(),
                None => iter.collect(),
            }
        };
        tokio::spawn(async move {
            for ev in matches {
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) {}
}
