use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::info;

/// Key-value store for strategy runtime snapshots. Keys follow the
/// `pms:{kind}:{id}` keyspace; values are the JSON runtime minus
/// non-serialisable handles. Entries carry a TTL so crashed strategies do not
/// accumulate forever.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

pub fn twap_key(id: &str) -> String {
    format!("pms:twap:{id}")
}

pub fn twap_basket_key(id: &str) -> String {
    format!("pms:twapb:{id}")
}

pub fn trail_stop_key(id: &str) -> String {
    format!("pms:trailstop:{id}")
}

impl SnapshotStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open snapshot db")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategy_snapshots (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                sub_account TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_strategy_snapshots_kind
             ON strategy_snapshots(kind, updated_at DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn put(
        &self,
        key: &str,
        kind: &str,
        sub_account: &str,
        value: &Value,
        ttl_hours: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + ttl_hours * 3600;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_snapshots (key, kind, sub_account, value, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
            params![key, kind, sub_account, value.to_string(), now, expires_at],
        )?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT value FROM strategy_snapshots WHERE key = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM strategy_snapshots WHERE key = ?1",
            params![key],
        )?;
        Ok(())
    }

    /// All live entries of one kind, oldest first.
    pub async fn list_kind(&self, kind: &str) -> Result<Vec<(String, Value)>> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT key, value FROM strategy_snapshots
             WHERE kind = ?1 AND expires_at > ?2
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map(params![kind, now], |row| {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((key, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            out.push((key, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM strategy_snapshots WHERE expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            info!(removed, "swept expired strategy snapshots");
        }
        Ok(removed)
    }
}

/// Call-site write throttle: at most one persist per interval, with terminal
/// writes always allowed via [`PersistThrottle::force`].
#[derive(Debug)]
pub struct PersistThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl PersistThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn should_persist(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Reset so the next terminal write always goes through.
    pub fn force(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let key = twap_key("abc");
        store
            .put(&key, "twap", "acct", &json!({"filledLots": 3}), 12)
            .await
            .unwrap();

        let value = store.get(&key).await.unwrap().unwrap();
        assert_eq!(value["filledLots"], 3);

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_overwrites() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let key = trail_stop_key("t1");
        store
            .put(&key, "trail_stop", "acct", &json!({"extremePrice": 100.0}), 24)
            .await
            .unwrap();
        store
            .put(&key, "trail_stop", "acct", &json!({"extremePrice": 105.0}), 24)
            .await
            .unwrap();

        let value = store.get(&key).await.unwrap().unwrap();
        assert_eq!(value["extremePrice"], 105.0);
        assert_eq!(store.list_kind("trail_stop").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_kind_filters_by_kind() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store
            .put(&twap_key("a"), "twap", "acct", &json!({}), 12)
            .await
            .unwrap();
        store
            .put(&twap_basket_key("b"), "twap_basket", "acct", &json!({}), 12)
            .await
            .unwrap();

        assert_eq!(store.list_kind("twap").await.unwrap().len(), 1);
        assert_eq!(store.list_kind("twap_basket").await.unwrap().len(), 1);
        assert_eq!(store.list_kind("trail_stop").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_swept() {
        let store = SnapshotStore::open_in_memory().unwrap();
        // Negative TTL: already expired.
        store
            .put(&twap_key("old"), "twap", "acct", &json!({}), -1)
            .await
            .unwrap();

        assert!(store.list_kind("twap").await.unwrap().is_empty());
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
    }

    #[test]
    fn throttle_limits_write_rate() {
        let mut throttle = PersistThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_persist());
        assert!(!throttle.should_persist());
        throttle.force();
        assert!(throttle.should_persist());
    }
}
