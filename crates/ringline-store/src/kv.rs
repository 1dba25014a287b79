//! Bucketed key/value store on SQLite.
//!
//! The signaling path stores small JSON-encoded records (user profiles,
//! waiting-caller and missed-call lists) under `(bucket, key)` pairs. One
//! [`KvStore`] wraps one database file; the server opens several of them
//! and closes them in a fixed order at shutdown.
//!
//! Access is synchronous under an internal mutex. Every operation is a
//! single small statement, so holding the lock across a call is cheap
//! even from async contexts.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

pub struct KvStore {
    name: String,
    conn: Mutex<Option<Connection>>,
}

impl KvStore {
    /// Open (or create) a store at an explicit path.
    pub fn open_at(name: &str, path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                 name TEXT PRIMARY KEY
             );
             CREATE TABLE IF NOT EXISTS kv (
                 bucket TEXT NOT NULL,
                 key    TEXT NOT NULL,
                 value  TEXT NOT NULL,
                 PRIMARY KEY (bucket, key)
             );",
        )?;

        tracing::info!(store = %name, path = %path.display(), "opened kv store");

        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a bucket. Idempotent; `get`/`put` against an unregistered
    /// bucket fail with [`StoreError::UnknownBucket`].
    pub fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let guard = self.conn.lock().expect("kv mutex poisoned");
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
            params![bucket],
        )?;
        Ok(())
    }

    /// Fetch and decode the value under `(bucket, key)`.
    pub fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<T, StoreError> {
        let guard = self.conn.lock().expect("kv mutex poisoned");
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        self.check_bucket(conn, bucket)?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::KeyNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Store `value` under `(bucket, key)`, overwriting any previous value.
    ///
    /// With `skip_confirm == false` the write is read back and compared;
    /// a mismatch surfaces as [`StoreError::ConfirmFailed`].
    pub fn put<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
        skip_confirm: bool,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;

        let guard = self.conn.lock().expect("kv mutex poisoned");
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        self.check_bucket(conn, bucket)?;

        conn.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, json],
        )?;

        if !skip_confirm {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                    |row| row.get(0),
                )
                .optional()?;
            if stored.as_deref() != Some(json.as_str()) {
                return Err(StoreError::ConfirmFailed {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Remove `(bucket, key)`. Removing an absent key is not an error.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let guard = self.conn.lock().expect("kv mutex poisoned");
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        self.check_bucket(conn, bucket)?;
        conn.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(())
    }

    /// Close the underlying database. Later operations fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().expect("kv mutex poisoned");
        if let Some(conn) = guard.take() {
            tracing::info!(store = %self.name, "closing kv store");
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        }
        Ok(())
    }

    fn check_bucket(&self, conn: &Connection, bucket: &str) -> Result<(), StoreError> {
        let known: Option<String> = conn
            .query_row(
                "SELECT name FROM buckets WHERE name = ?1",
                params![bucket],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StoreError::UnknownBucket(bucket.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: i64,
        s: String,
    }

    fn open_temp() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open_at("test", &dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = open_temp();
        store.create_bucket("b").unwrap();

        let rec = Rec {
            n: 7,
            s: "x".into(),
        };
        store.put("b", "k", &rec, true).unwrap();
        let got: Rec = store.get("b", "k").unwrap();
        assert_eq!(got, rec);
    }

    #[test]
    fn test_key_not_found_sentinel() {
        let (_dir, store) = open_temp();
        store.create_bucket("b").unwrap();

        let err = store.get::<Rec>("b", "missing").unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[test]
    fn test_unknown_bucket() {
        let (_dir, store) = open_temp();
        let err = store.get::<Rec>("nope", "k").unwrap_err();
        assert!(matches!(err, StoreError::UnknownBucket(_)));
    }

    #[test]
    fn test_create_bucket_idempotent() {
        let (_dir, store) = open_temp();
        store.create_bucket("b").unwrap();
        store.create_bucket("b").unwrap();
    }

    #[test]
    fn test_put_confirms_by_default() {
        let (_dir, store) = open_temp();
        store.create_bucket("b").unwrap();
        store
            .put("b", "k", &Rec { n: 1, s: "a".into() }, false)
            .unwrap();
    }

    #[test]
    fn test_overwrite_and_delete() {
        let (_dir, store) = open_temp();
        store.create_bucket("b").unwrap();

        store.put("b", "k", &1i64, true).unwrap();
        store.put("b", "k", &2i64, true).unwrap();
        assert_eq!(store.get::<i64>("b", "k").unwrap(), 2);

        store.delete("b", "k").unwrap();
        assert!(store.get::<i64>("b", "k").unwrap_err().is_key_not_found());
        // deleting again is fine
        store.delete("b", "k").unwrap();
    }

    #[test]
    fn test_closed_store_rejects_ops() {
        let (_dir, store) = open_temp();
        store.create_bucket("b").unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.get::<i64>("b", "k").unwrap_err(),
            StoreError::Closed
        ));
        // double close is a no-op
        store.close().unwrap();
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db");
        {
            let store = KvStore::open_at("p", &path).unwrap();
            store.create_bucket("b").unwrap();
            store.put("b", "k", &"v".to_string(), true).unwrap();
            store.close().unwrap();
        }
        let store = KvStore::open_at("p", &path).unwrap();
        assert_eq!(store.get::<String>("b", "k").unwrap(), "v");
    }
}
