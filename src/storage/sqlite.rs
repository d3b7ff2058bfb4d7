//! Persistent relational store backed by SQLite.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::StoreError;
use crate::event::{Event, Tag};
use crate::filter::Filter;

use super::{EventStore, QUERY_CHANNEL_CAPACITY};

/// SQLite-backed store. Tags are kept as a JSON column; queries narrow
/// candidate rows in SQL and re-check the full filter before streaming.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) the database at `dsn`, which is the
    /// remainder of a `sqlite://<dsn>` storage URI, e.g. `relay.db` or
    /// `:memory:`.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{dsn}"))
            .map_err(StoreError::from)?
            .create_if_missing(true);
        // an in-memory database exists per connection, so keep exactly one
        let max_connections = if dsn == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                tags TEXT NOT NULL,
                content TEXT NOT NULL,
                sig TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events (pubkey)",
            "CREATE INDEX IF NOT EXISTS idx_events_kind ON events (kind)",
            "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at)",
        ] {
            sqlx::query(idx).execute(&pool).await?;
        }
        info!(dsn, "connected to sqlite storage");
        Ok(Self { pool })
    }
}

fn row_to_event(row: SqliteRow) -> Result<Event, StoreError> {
    let tags_json: String = row.get("tags");
    let tags: Vec<Tag> = serde_json::from_str(&tags_json)
        .map_err(|e| StoreError::Backend(format!("corrupt tags column: {e}")))?;
    Ok(Event {
        id: row.get("id"),
        pubkey: row.get("pubkey"),
        created_at: row.get::<i64, _>("created_at") as u64,
        kind: row.get::<i64, _>("kind") as u32,
        tags,
        content: row.get("content"),
        sig: row.get("sig"),
    })
}

/// True when a populated any-of predicate is empty and so can match nothing.
fn has_empty_predicate(filter: &Filter) -> bool {
    filter.ids.as_deref() == Some(&[])
        || filter.authors.as_deref() == Some(&[])
        || filter.kinds.as_deref() == Some(&[])
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        let tags_json = serde_json::to_string(&event.tags)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at as i64)
        .bind(event.kind as i64)
        .bind(tags_json)
        .bind(&event.content)
        .bind(&event.sig)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, StoreError> {
        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        let limit = filter.limit.map(|l| l as usize);
        if limit == Some(0) || has_empty_predicate(filter) {
            return Ok(rx);
        }

        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events WHERE 1 = 1",
        );
        if let Some(ids) = filter.ids.as_deref() {
            qb.push(" AND id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(authors) = filter.authors.as_deref() {
            qb.push(" AND pubkey IN (");
            let mut sep = qb.separated(", ");
            for author in authors {
                sep.push_bind(author.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(kinds) = filter.kinds.as_deref() {
            qb.push(" AND kind IN (");
            let mut sep = qb.separated(", ");
            for kind in kinds {
                sep.push_bind(*kind as i64);
            }
            sep.push_unseparated(")");
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ");
            qb.push_bind(since as i64);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ");
            qb.push_bind(until as i64);
        }
        qb.push(" ORDER BY created_at DESC, id ASC");
        // tag predicates are checked after the fetch, so the SQL limit is
        // only safe when there are none
        if filter.tags.is_empty() {
            if let Some(l) = limit {
                qb.push(" LIMIT ");
                qb.push_bind(l as i64);
            }
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let filter = filter.clone();
        tokio::spawn(async move {
            let mut sent = 0usize;
            for row in rows {
                let ev = match row_to_event(row) {
                    Ok(ev) => ev,
                    Err(_) => continue,
                };
                if !filter.matches(&ev) {
                    continue;
                }
                if tx.send(ev).await.is_err() {
                    break;
                }
                sent += 1;
                if limit.is_some_and(|l| sent >= l) {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_util::{signed_event, signed_event_with_key};

    async fn open() -> SqliteStore {
        SqliteStore::connect(":memory:").await.unwrap()
    }

    async fn drain(mut rx: mpsc::Receiver<Event>) -> Vec<Event> {
        let mut out = vec![];
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn save_query_round_trip() {
        let store = open().await;
        let ev = signed_event(1, 7, vec![Tag(vec!["t".into(), "essay".into()])], "body");
        store.save(&ev).await.unwrap();
        let filter = Filter {
            authors: Some(vec![ev.pubkey.clone()]),
            kinds: Some(vec![1]),
            ..Default::default()
        };
        let got = drain(store.query(&filter).await.unwrap()).await;
        assert_eq!(got, vec![ev]);
    }

    #[tokio::test]
    async fn duplicate_save_rejected() {
        let store = open().await;
        let ev = signed_event(1, 1, vec![], "");
        store.save(&ev).await.unwrap();
        assert!(matches!(store.save(&ev).await, Err(StoreError::Duplicate)));
    }

    #[tokio::test]
    async fn delete_removes_and_is_idempotent() {
        let store = open().await;
        let ev = signed_event(1, 1, vec![], "");
        store.save(&ev).await.unwrap();
        store.delete(&ev.id).await.unwrap();
        store.delete(&ev.id).await.unwrap();
        let got = drain(store.query(&Filter::default()).await.unwrap()).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn ordering_and_limit() {
        let store = open().await;
        for t in [10u64, 30, 20] {
            store.save(&signed_event(1, t, vec![], "x")).await.unwrap();
        }
        let filter = Filter {
            limit: Some(2),
            ..Default::default()
        };
        let got = drain(store.query(&filter).await.unwrap()).await;
        let times: Vec<u64> = got.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![30, 20]);
    }

    #[tokio::test]
    async fn tag_filter_with_limit_is_exact() {
        let store = open().await;
        // newer events without the tag must not eat into the limit
        store
            .save(&signed_event(1, 1, vec![Tag(vec!["t".into(), "a".into()])], "1"))
            .await
            .unwrap();
        store
            .save(&signed_event(1, 2, vec![], "2"))
            .await
            .unwrap();
        store
            .save(&signed_event(1, 3, vec![], "3"))
            .await
            .unwrap();
        let mut filter = Filter {
            limit: Some(1),
            ..Default::default()
        };
        filter.tags.insert("t".into(), vec!["a".into()]);
        let got = drain(store.query(&filter).await.unwrap()).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].created_at, 1);
    }

    #[tokio::test]
    async fn since_until_window() {
        let store = open().await;
        for t in 1..=5u64 {
            store.save(&signed_event(1, t, vec![], "x")).await.unwrap();
        }
        let filter = Filter {
            since: Some(2),
            until: Some(4),
            ..Default::default()
        };
        let got = drain(store.query(&filter).await.unwrap()).await;
        let times: Vec<u64> = got.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn authors_are_any_of() {
        let store = open().await;
        let a = signed_event_with_key(1, 1, 1, vec![], "a");
        let b = signed_event_with_key(2, 1, 2, vec![], "b");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        let filter = Filter {
            authors: Some(vec![a.pubkey.clone(), b.pubkey.clone()]),
            ..Default::default()
        };
        let got = drain(store.query(&filter).await.unwrap()).await;
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn limit_zero_yields_nothing() {
        let store = open().await;
        store.save(&signed_event(1, 1, vec![], "")).await.unwrap();
        let filter = Filter {
            limit: Some(0),
            ..Default::default()
        };
        let got = drain(store.query(&filter).await.unwrap()).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn empty_predicate_matches_nothing() {
        let store = open().await;
        store.save(&signed_event(1, 1, vec![], "")).await.unwrap();
        let filter = Filter {
            kinds: Some(vec![]),
            ..Default::default()
        };
        let got = drain(store.query(&filter).await.unwrap()).await;
        assert!(got.is_empty());
    }
}
