//! Content-addressed block layer.
//!
//! Blocks are immutable; a store only ever sees a given link bound to one
//! byte string, so `put` is idempotent and blocks with equal links are
//! interchangeable. A [`TieredFetcher`] composes a fast local source with a
//! remote fallback consulted on `NotFound` only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use multihash_codetable::{Code, MultihashDigest};

use crate::kv::{KvError, KvStore, Namespace};
use crate::linked_data::{Block, Link, IDENTITY_CODE, SHA2_256_CODE};

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("block not found: {0}")]
    NotFound(Link),
    #[error("consistency check failure: {link}: expected digest {expected}, got {actual}")]
    Consistency {
        link: Link,
        expected: String,
        actual: String,
    },
    #[error("unsupported multihash code: {0:#x}")]
    UnsupportedHash(u64),
    #[error("kv store error: {0}")]
    Kv(#[from] KvError),
    #[error("block i/o error: {0}")]
    Io(#[from] anyhow::Error),
}

/// Read access to blocks by link.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the block addressed by `link`. A returned block's bytes hash
    /// to the link's digest.
    async fn get(&self, link: &Link) -> Result<Block, BlockError>;
}

/// Read-write access to blocks.
#[async_trait]
pub trait Blockstore: Fetcher {
    async fn put(&self, block: &Block) -> Result<(), BlockError>;
    async fn put_batch(&self, blocks: &[Block]) -> Result<(), BlockError>;
    async fn del(&self, link: &Link) -> Result<(), BlockError>;
}

/// Recompute the digest of `bytes` with the algorithm `link` declares and
/// compare against the link's digest.
pub fn verify(link: &Link, bytes: &[u8]) -> Result<(), BlockError> {
    let actual = match link.multihash_code() {
        SHA2_256_CODE => Code::Sha2_256.digest(bytes).digest().to_vec(),
        IDENTITY_CODE => bytes.to_vec(),
        code => return Err(BlockError::UnsupportedHash(code)),
    };
    if actual != link.digest() {
        return Err(BlockError::Consistency {
            link: *link,
            expected: hex::encode(link.digest()),
            actual: hex::encode(&actual),
        });
    }
    Ok(())
}

/// Block store over a [`KvStore`] namespace, keyed by the link's string form.
#[derive(Clone)]
pub struct KvBlockstore {
    kv: Namespace,
}

impl KvBlockstore {
    pub fn new(kv: Namespace) -> Self {
        KvBlockstore { kv }
    }
}

#[async_trait]
impl Fetcher for KvBlockstore {
    async fn get(&self, link: &Link) -> Result<Block, BlockError> {
        match self.kv.get(&link.to_string()).await? {
            Some(bytes) => Ok(Block::new(*link, bytes)),
            None => Err(BlockError::NotFound(*link)),
        }
    }
}

#[async_trait]
impl Blockstore for KvBlockstore {
    async fn put(&self, block: &Block) -> Result<(), BlockError> {
        self.kv
            .put(&block.link().to_string(), block.bytes().clone())
            .await?;
        Ok(())
    }

    async fn put_batch(&self, blocks: &[Block]) -> Result<(), BlockError> {
        let entries = blocks
            .iter()
            .map(|b| (b.link().to_string(), b.bytes().clone()))
            .collect();
        self.kv.put_batch(entries).await?;
        Ok(())
    }

    async fn del(&self, link: &Link) -> Result<(), BlockError> {
        self.kv.del(&link.to_string()).await?;
        Ok(())
    }
}

/// In-memory block store.
#[derive(Default, Clone)]
pub struct MemoryBlockstore {
    blocks: Arc<parking_lot::Mutex<HashMap<Link, Bytes>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetcher for MemoryBlockstore {
    async fn get(&self, link: &Link) -> Result<Block, BlockError> {
        match self.blocks.lock().get(link) {
            Some(bytes) => Ok(Block::new(*link, bytes.clone())),
            None => Err(BlockError::NotFound(*link)),
        }
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn put(&self, block: &Block) -> Result<(), BlockError> {
        self.blocks
            .lock()
            .insert(*block.link(), block.bytes().clone());
        Ok(())
    }

    async fn put_batch(&self, blocks: &[Block]) -> Result<(), BlockError> {
        let mut map = self.blocks.lock();
        for block in blocks {
            map.insert(*block.link(), block.bytes().clone());
        }
        Ok(())
    }

    async fn del(&self, link: &Link) -> Result<(), BlockError> {
        self.blocks.lock().remove(link);
        Ok(())
    }
}

/// Fetcher composed of a primary and a fallback source.
///
/// The fallback is consulted only when the primary reports `NotFound`;
/// any other primary error short-circuits. Blocks served by the fallback
/// are optionally written through to a cache before being returned.
pub struct TieredFetcher {
    primary: Arc<dyn Fetcher>,
    fallback: Arc<dyn Fetcher>,
    cache: Option<Arc<dyn Blockstore>>,
}

impl TieredFetcher {
    pub fn new(primary: Arc<dyn Fetcher>, fallback: Arc<dyn Fetcher>) -> Self {
        TieredFetcher {
            primary,
            fallback,
            cache: None,
        }
    }

    /// Write every block served by the fallback through to `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn Blockstore>) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl Fetcher for TieredFetcher {
    async fn get(&self, link: &Link) -> Result<Block, BlockError> {
        match self.primary.get(link).await {
            Ok(block) => Ok(block),
            Err(BlockError::NotFound(_)) => {
                tracing::debug!("block {} not found locally, consulting fallback", link);
                let block = self.fallback.get(link).await?;
                if let Some(cache) = &self.cache {
                    cache.put(&block).await?;
                }
                Ok(block)
            }
            Err(err) => Err(err),
        }
    }
}
