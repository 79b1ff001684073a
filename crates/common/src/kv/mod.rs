//! Abstract ordered key-value engine backing all persistent state.
//!
//! Every bucket shares one [`KvStore`] through hierarchical [`Namespace`]
//! prefixes, so writes in one bucket's namespace are isolated from another's
//! at the store level.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, TableDefinition};

const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv store error: {0}")]
    Default(#[from] anyhow::Error),
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;
    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError>;
    /// Write a batch of entries. Atomic when the engine supports it.
    async fn put_batch(&self, entries: Vec<(String, Bytes)>) -> Result<(), KvError>;
    /// Delete a key. Deleting an absent key is a no-op.
    async fn del(&self, key: &str) -> Result<(), KvError>;
}

/// In-memory store for tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryKv {
    data: parking_lot::Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn put_batch(&self, entries: Vec<(String, Bytes)>) -> Result<(), KvError> {
        let mut data = self.data.lock();
        for (key, value) in entries {
            data.insert(key, value);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

/// Persistent store over a redb database file.
pub struct RedbKv {
    db: Arc<tokio::sync::Mutex<Database>>,
}

impl RedbKv {
    pub fn open(path: &Path) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("creating data directory: {e}"))?;
        }
        let db = Database::create(path).map_err(|e| anyhow::anyhow!("opening database: {e}"))?;
        // make sure the table exists so reads on a fresh store succeed
        {
            let txn = db
                .begin_write()
                .map_err(|e| anyhow::anyhow!("begin write: {e}"))?;
            txn.open_table(DATA_TABLE)
                .map_err(|e| anyhow::anyhow!("open table: {e}"))?;
            txn.commit().map_err(|e| anyhow::anyhow!("commit: {e}"))?;
        }
        Ok(Self {
            db: Arc::new(tokio::sync::Mutex::new(db)),
        })
    }
}

#[async_trait]
impl KvStore for RedbKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        let db = self.db.lock().await;
        let txn = db
            .begin_read()
            .map_err(|e| anyhow::anyhow!("begin read: {e}"))?;
        let table = txn
            .open_table(DATA_TABLE)
            .map_err(|e| anyhow::anyhow!("open table: {e}"))?;
        let value = table
            .get(key)
            .map_err(|e| anyhow::anyhow!("reading key: {e}"))?;
        Ok(value.map(|v| Bytes::from(v.value().to_vec())))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.put_batch(vec![(key.to_string(), value)]).await
    }

    async fn put_batch(&self, entries: Vec<(String, Bytes)>) -> Result<(), KvError> {
        let db = self.db.lock().await;
        let txn = db
            .begin_write()
            .map_err(|e| anyhow::anyhow!("begin write: {e}"))?;
        {
            let mut table = txn
                .open_table(DATA_TABLE)
                .map_err(|e| anyhow::anyhow!("open table: {e}"))?;
            for (key, value) in &entries {
                table
                    .insert(key.as_str(), value.as_ref())
                    .map_err(|e| anyhow::anyhow!("writing key: {e}"))?;
            }
        }
        txn.commit().map_err(|e| anyhow::anyhow!("commit: {e}"))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let db = self.db.lock().await;
        let txn = db
            .begin_write()
            .map_err(|e| anyhow::anyhow!("begin write: {e}"))?;
        {
            let mut table = txn
                .open_table(DATA_TABLE)
                .map_err(|e| anyhow::anyhow!("open table: {e}"))?;
            table
                .remove(key)
                .map_err(|e| anyhow::anyhow!("deleting key: {e}"))?;
        }
        txn.commit().map_err(|e| anyhow::anyhow!("commit: {e}"))?;
        Ok(())
    }
}

/// A view of a [`KvStore`] under a key prefix.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<dyn KvStore>,
    prefix: String,
}

impl Namespace {
    pub fn new(inner: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Namespace { inner, prefix }
    }

    /// A namespace nested one segment deeper.
    pub fn child(&self, segment: &str) -> Namespace {
        Namespace::new(self.inner.clone(), format!("{}{}", self.prefix, segment))
    }

    fn wrap(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KvStore for Namespace {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        self.inner.get(&self.wrap(key)).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.inner.put(&self.wrap(key), value).await
    }

    async fn put_batch(&self, entries: Vec<(String, Bytes)>) -> Result<(), KvError> {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (self.wrap(&k), v))
            .collect();
        self.inner.put_batch(entries).await
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.inner.del(&self.wrap(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_kv() {
        let kv = MemoryKv::new();
        assert!(kv.get("a").await.unwrap().is_none());
        kv.put("a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().unwrap().as_ref(), b"1");
        kv.del("a").await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());
        // deleting again is fine
        kv.del("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_redb_kv() {
        let temp = TempDir::new().unwrap();
        let kv = RedbKv::open(&temp.path().join("store.redb")).unwrap();
        kv.put_batch(vec![
            ("x".to_string(), Bytes::from_static(b"1")),
            ("y".to_string(), Bytes::from_static(b"2")),
        ])
        .await
        .unwrap();
        assert_eq!(kv.get("x").await.unwrap().unwrap().as_ref(), b"1");
        assert_eq!(kv.get("y").await.unwrap().unwrap().as_ref(), b"2");
        kv.del("x").await.unwrap();
        assert!(kv.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let a = Namespace::new(kv.clone(), "bucket/a");
        let b = Namespace::new(kv.clone(), "bucket/b");
        a.put("head", Bytes::from_static(b"a-head")).await.unwrap();
        b.put("head", Bytes::from_static(b"b-head")).await.unwrap();
        assert_eq!(a.get("head").await.unwrap().unwrap().as_ref(), b"a-head");
        assert_eq!(b.get("head").await.unwrap().unwrap().as_ref(), b"b-head");
        assert_eq!(
            kv.get("bucket/a/head").await.unwrap().unwrap().as_ref(),
            b"a-head"
        );
    }

    #[tokio::test]
    async fn test_namespace_child() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let ns = Namespace::new(kv.clone(), "bucket/a").child("blocks");
        ns.put("cid", Bytes::from_static(b"block")).await.unwrap();
        assert!(kv.get("bucket/a/blocks/cid").await.unwrap().is_some());
    }
}
