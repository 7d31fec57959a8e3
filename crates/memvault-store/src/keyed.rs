//! Keyed whole-object persistence.
//!
//! One namespace per persisted type. Writes replace the whole object
//! and carry a `version`; a store never lets a lower version clobber a
//! higher one, so concurrent writers converge on the newest record.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Current payload schema version, stamped into every persisted record.
pub const SCHEMA_VERSION: u64 = 1;

/// Upgrade a persisted payload to the current schema.
///
/// The migration table is tiny on purpose: version 0 records predate
/// the `schema_version` field and are structurally identical to
/// version 1.
pub fn migrate_payload(mut value: serde_json::Value) -> Result<serde_json::Value> {
    let version = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    match version {
        SCHEMA_VERSION => Ok(value),
        0 => {
            let Some(object) = value.as_object_mut() else {
                return Err(Error::Storage("persisted payload is not an object".to_string()));
            };
            object.insert(
                "schema_version".to_string(),
                serde_json::json!(SCHEMA_VERSION),
            );
            Ok(value)
        }
        other => Err(Error::UnsupportedSchema(other)),
    }
}

/// The four persistence namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Index snapshot sidecars, keyed by user id
    Indices,
    /// Raw vectors, keyed by `user:vector_id` (optional)
    Vectors,
    /// Knowledge graphs, keyed by user id
    Graphs,
    /// Memory→graph provenance rows, keyed by `user:memory_id`
    MemoryMappings,
}

impl Namespace {
    fn table(self) -> &'static str {
        match self {
            Self::Indices => "indices",
            Self::Vectors => "vectors",
            Self::Graphs => "graphs",
            Self::MemoryMappings => "memory_mappings",
        }
    }

    /// All namespaces, for migrations.
    pub const ALL: [Namespace; 4] = [
        Self::Indices,
        Self::Vectors,
        Self::Graphs,
        Self::MemoryMappings,
    ];
}

/// A stored record: whole-object payload plus bookkeeping.
#[derive(Debug, Clone)]
pub struct KeyedRecord {
    /// The whole persisted object
    pub payload: serde_json::Value,
    /// Writer-supplied monotonic version
    pub version: u64,
    /// When the record was last replaced
    pub updated_at: DateTime<Utc>,
}

/// Durable keyed storage with one namespace per persisted type.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Replace the record at `key` if `version` is not lower than the
    /// stored one. A stale write is silently dropped.
    async fn put(
        &self,
        ns: Namespace,
        key: &str,
        payload: serde_json::Value,
        version: u64,
    ) -> Result<()>;

    /// Point lookup.
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<KeyedRecord>>;

    /// Delete a record. Returns true if one existed.
    async fn delete(&self, ns: Namespace, key: &str) -> Result<bool>;

    /// List keys in a namespace with the given prefix.
    async fn list_keys(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>>;
}

// ── SQLite implementation ───────────────────────────────────────

/// SQLite-backed keyed store.
#[derive(Clone)]
pub struct SqliteKeyedStore {
    pool: SqlitePool,
}

impl SqliteKeyedStore {
    /// Open (or create) a keyed store at the given path.
    pub async fn from_path(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage(format!("mkdir: {e}")))?;
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("Keyed store initialized at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store (for tests).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        debug!("In-memory keyed store initialized");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        for ns in Namespace::ALL {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key        TEXT PRIMARY KEY,
                    payload    TEXT NOT NULL,
                    version    INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                )",
                ns.table()
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<KeyedRecord> {
        let payload_str: String = row.try_get("payload")?;
        let updated_str: String = row.try_get("updated_at")?;
        Ok(KeyedRecord {
            payload: serde_json::from_str(&payload_str)?,
            version: row.try_get::<i64, _>("version")? as u64,
            updated_at: DateTime::parse_from_rfc3339(&updated_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl KeyedStore for SqliteKeyedStore {
    async fn put(
        &self,
        ns: Namespace,
        key: &str,
        payload: serde_json::Value,
        version: u64,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} (key, payload, version, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                version = excluded.version,
                updated_at = excluded.updated_at
             WHERE excluded.version >= {table}.version",
            table = ns.table()
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(serde_json::to_string(&payload)?)
            .bind(version as i64)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<KeyedRecord>> {
        let sql = format!(
            "SELECT payload, version, updated_at FROM {} WHERE key = ?1",
            ns.table()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", ns.table());
        let result = sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_keys(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT key FROM {} WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            ns.table()
        );
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(&sql)
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }
}

// ── In-memory implementation ────────────────────────────────────

/// In-memory keyed store (tests, ephemeral sessions).
#[derive(Default)]
pub struct MemoryKeyedStore {
    records: RwLock<HashMap<(Namespace, String), KeyedRecord>>,
}

impl MemoryKeyedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn put(
        &self,
        ns: Namespace,
        key: &str,
        payload: serde_json::Value,
        version: u64,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let entry_key = (ns, key.to_string());
        if let Some(existing) = records.get(&entry_key) {
            if existing.version > version {
                return Ok(());
            }
        }
        records.insert(
            entry_key,
            KeyedRecord {
                payload,
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<KeyedRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&(ns, key.to_string())).cloned())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records.remove(&(ns, key.to_string())).is_some())
    }

    async fn list_keys(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut keys: Vec<String> = records
            .keys()
            .filter(|(n, k)| *n == ns && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn stores() -> Vec<Box<dyn KeyedStore>> {
        vec![
            Box::new(SqliteKeyedStore::in_memory().await.unwrap()),
            Box::new(MemoryKeyedStore::new()),
        ]
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        for store in stores().await {
            store
                .put(Namespace::Graphs, "u1", json!({"entities": []}), 1)
                .await
                .unwrap();
            let rec = store.get(Namespace::Graphs, "u1").await.unwrap().unwrap();
            assert_eq!(rec.version, 1);
            assert_eq!(rec.payload["entities"], json!([]));
        }
    }

    #[tokio::test]
    async fn test_stale_write_is_dropped() {
        for store in stores().await {
            store
                .put(Namespace::Indices, "u1", json!({"v": "new"}), 5)
                .await
                .unwrap();
            store
                .put(Namespace::Indices, "u1", json!({"v": "old"}), 3)
                .await
                .unwrap();
            let rec = store.get(Namespace::Indices, "u1").await.unwrap().unwrap();
            assert_eq!(rec.version, 5);
            assert_eq!(rec.payload["v"], "new");
        }
    }

    #[tokio::test]
    async fn test_equal_version_replaces() {
        for store in stores().await {
            store
                .put(Namespace::Graphs, "u1", json!({"v": 1}), 2)
                .await
                .unwrap();
            store
                .put(Namespace::Graphs, "u1", json!({"v": 2}), 2)
                .await
                .unwrap();
            let rec = store.get(Namespace::Graphs, "u1").await.unwrap().unwrap();
            assert_eq!(rec.payload["v"], 2);
        }
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        for store in stores().await {
            store
                .put(Namespace::Graphs, "u1", json!({"kind": "graph"}), 1)
                .await
                .unwrap();
            assert!(store.get(Namespace::Indices, "u1").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_list_keys_prefix() {
        for store in stores().await {
            for key in ["u1:m1", "u1:m2", "u2:m1"] {
                store
                    .put(Namespace::MemoryMappings, key, json!({}), 1)
                    .await
                    .unwrap();
            }
            let keys = store
                .list_keys(Namespace::MemoryMappings, "u1:")
                .await
                .unwrap();
            assert_eq!(keys, vec!["u1:m1".to_string(), "u1:m2".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_delete() {
        for store in stores().await {
            store
                .put(Namespace::Vectors, "u1:1", json!({}), 1)
                .await
                .unwrap();
            assert!(store.delete(Namespace::Vectors, "u1:1").await.unwrap());
            assert!(!store.delete(Namespace::Vectors, "u1:1").await.unwrap());
            assert!(store.get(Namespace::Vectors, "u1:1").await.unwrap().is_none());
        }
    }

    #[test]
    fn test_migrate_payload_versions() {
        // current version passes through
        let v1 = json!({"schema_version": 1, "data": true});
        assert_eq!(migrate_payload(v1.clone()).unwrap(), v1);

        // version 0 (missing field) is stamped
        let v0 = json!({"data": true});
        let migrated = migrate_payload(v0).unwrap();
        assert_eq!(migrated["schema_version"], 1);

        // future versions are rejected
        let v9 = json!({"schema_version": 9});
        assert!(matches!(
            migrate_payload(v9),
            Err(Error::UnsupportedSchema(9))
        ));
    }
}
