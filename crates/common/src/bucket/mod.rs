//! Bucket facades over the CRDT engine.
//!
//! [`ClockBucket`] is the mutex-guarded core: a block store, a persisted
//! head slot, and the CRDT machinery behind `root`/`get`/`put`/`del`/
//! `entries`/`advance`. Typed views over it are pure value codecs; see
//! [`TypedBucket`].

mod network;
mod typed;

pub use network::NetworkBucket;
pub use typed::{DelegationCodec, SignerCodec, TypedBucket, ValueCodec};

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockError, Blockstore, Fetcher, TieredFetcher};
use crate::capability::CapabilityError;
use crate::clock::{self, ClockError, Operation};
use crate::crdt::{self, CrdtError};
use crate::kv::{KvError, KvStore, Namespace};
use crate::linked_data::{CodecError, Link};
use crate::shard::{self, EntryRange, Shard, ShardConfig, ShardError};

/// Key of the head slot within a bucket's namespace.
const HEAD_KEY: &str = "head";

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("not found")]
    NotFound,
    #[error("missing event: {0}")]
    MissingEvent(Link),
    #[error("kv store error: {0}")]
    Kv(#[from] KvError),
    #[error("block error: {0}")]
    Block(#[from] BlockError),
    #[error("shard error: {0}")]
    Shard(ShardError),
    #[error("clock error: {0}")]
    Clock(ClockError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<ShardError> for BucketError {
    fn from(err: ShardError) -> Self {
        match err {
            ShardError::NotFound => BucketError::NotFound,
            ShardError::Cancelled => BucketError::Cancelled,
            err => BucketError::Shard(err),
        }
    }
}

impl From<ClockError> for BucketError {
    fn from(err: ClockError) -> Self {
        match err {
            ClockError::MissingEvent(link) => BucketError::MissingEvent(link),
            ClockError::Cancelled => BucketError::Cancelled,
            err => BucketError::Clock(err),
        }
    }
}

impl From<CrdtError> for BucketError {
    fn from(err: CrdtError) -> Self {
        match err {
            CrdtError::Clock(err) => err.into(),
            CrdtError::Shard(err) => err.into(),
            CrdtError::Block(err) => err.into(),
            CrdtError::Cancelled => BucketError::Cancelled,
        }
    }
}

struct BucketState {
    head: Vec<Link>,
    /// Materialized root for `head`, filled lazily and kept current by
    /// mutations.
    root: Option<Link>,
}

/// A bucket: a block store, a persisted head, and a readers-writer lock
/// serializing mutations.
///
/// Mutations persist block additions, then the head slot, then apply block
/// removals, so an interrupted mutation leaves either the previous head
/// (with at most some unreachable blocks) or the new head with every
/// reachable block present.
pub struct ClockBucket {
    blocks: Arc<dyn Blockstore>,
    heads: Namespace,
    cfg: ShardConfig,
    state: RwLock<BucketState>,
}

impl ClockBucket {
    /// Open a bucket over `blocks` with its head slot in `heads`. A missing
    /// head slot means a fresh bucket: an empty head is persisted and the
    /// canonical empty root block seeded.
    pub async fn open(blocks: Arc<dyn Blockstore>, heads: Namespace) -> Result<Self, BucketError> {
        Self::open_with_config(blocks, heads, ShardConfig::default()).await
    }

    pub async fn open_with_config(
        blocks: Arc<dyn Blockstore>,
        heads: Namespace,
        cfg: ShardConfig,
    ) -> Result<Self, BucketError> {
        let head = match heads.get(HEAD_KEY).await? {
            Some(bytes) => clock::head::decode(&bytes)?,
            None => {
                tracing::debug!("bucket head not found, creating new bucket");
                let empty = Shard::empty_root_block()?;
                blocks.put(&empty).await?;
                heads
                    .put(HEAD_KEY, Bytes::from(clock::head::encode(&[])?))
                    .await?;
                Vec::new()
            }
        };
        tracing::debug!("loaded bucket with head of {} event(s)", head.len());
        Ok(ClockBucket {
            blocks,
            heads,
            cfg,
            state: RwLock::new(BucketState { head, root: None }),
        })
    }

    pub fn blocks(&self) -> &Arc<dyn Blockstore> {
        &self.blocks
    }

    /// The current head, in canonical order.
    pub async fn head(&self) -> Vec<Link> {
        self.state.read().await.head.clone()
    }

    /// The current materialized root link.
    pub async fn root(&self, cancel: &CancellationToken) -> Result<Link, BucketError> {
        {
            let state = self.state.read().await;
            if let Some(root) = state.root {
                return Ok(root);
            }
        }
        let mut state = self.state.write().await;
        if let Some(root) = state.root {
            return Ok(root);
        }
        let root = crdt::materialize(
            self.blocks.as_ref(),
            self.blocks.as_ref(),
            &state.head,
            &self.cfg,
            cancel,
        )
        .await?;
        state.root = Some(root);
        Ok(root)
    }

    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Link, BucketError> {
        let state = self.state.read().await;
        let root = self.root_for(&state, cancel).await?;
        Ok(shard::get(self.blocks.as_ref(), &root, key).await?)
    }

    /// All entries satisfying `range`, in ascending key order. The read
    /// hold is kept for the duration of the traversal.
    pub async fn entries(
        &self,
        range: EntryRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Link)>, BucketError> {
        let state = self.state.read().await;
        let root = self.root_for(&state, cancel).await?;
        let fetcher: Arc<dyn Fetcher> = self.blocks.clone();
        let entries = shard::entries(fetcher, root, range, cancel.clone())
            .try_collect()
            .await?;
        Ok(entries)
    }

    /// Root for a held state guard; does not fill the cache.
    async fn root_for(
        &self,
        state: &BucketState,
        cancel: &CancellationToken,
    ) -> Result<Link, BucketError> {
        match state.root {
            Some(root) => Ok(root),
            None => Ok(crdt::materialize(
                self.blocks.as_ref(),
                self.blocks.as_ref(),
                &state.head,
                &self.cfg,
                cancel,
            )
            .await?),
        }
    }

    pub async fn put(
        &self,
        key: &str,
        value: Link,
        cancel: &CancellationToken,
    ) -> Result<(), BucketError> {
        self.apply(
            Operation::Put {
                key: key.to_string(),
                value,
            },
            cancel,
        )
        .await
    }

    pub async fn del(&self, key: &str, cancel: &CancellationToken) -> Result<(), BucketError> {
        self.apply(
            Operation::Del {
                key: key.to_string(),
            },
            cancel,
        )
        .await
    }

    async fn apply(&self, op: Operation, cancel: &CancellationToken) -> Result<(), BucketError> {
        let mut state = self.state.write().await;
        if cancel.is_cancelled() {
            return Err(BucketError::Cancelled);
        }

        let base_root = match state.root {
            Some(root) => root,
            None => {
                crdt::materialize(
                    self.blocks.as_ref(),
                    self.blocks.as_ref(),
                    &state.head,
                    &self.cfg,
                    cancel,
                )
                .await?
            }
        };

        let key = op.key().to_string();
        let mutation = crdt::mutate(
            self.blocks.as_ref(),
            &state.head,
            &base_root,
            op,
            &self.cfg,
            cancel,
        )
        .await?;

        self.blocks.put_batch(&mutation.diff.additions).await?;
        // last cancellation point: past here the mutation is committed
        if cancel.is_cancelled() {
            return Err(BucketError::Cancelled);
        }
        self.heads
            .put(HEAD_KEY, Bytes::from(clock::head::encode(&mutation.head)?))
            .await?;
        for removal in &mutation.diff.removals {
            tracing::trace!("removing unlinked block {}", removal.link());
            self.blocks.del(removal.link()).await?;
        }

        tracing::debug!(
            "applied {} to bucket, head now {} event(s)",
            key,
            mutation.head.len()
        );
        state.head = mutation.head;
        state.root = Some(mutation.root);
        Ok(())
    }

    /// Advance the head with an event, fetching unknown blocks through
    /// `fetcher` (write-through to the local store) when provided.
    ///
    /// The full state for the new head is materialized locally before the
    /// head slot moves, so a committed head never references missing
    /// blocks. Idempotent: re-advancing with a known event is a no-op.
    pub async fn advance(
        &self,
        event: Link,
        fetcher: Option<Arc<dyn Fetcher>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Link>, BucketError> {
        let mut state = self.state.write().await;
        if cancel.is_cancelled() {
            return Err(BucketError::Cancelled);
        }

        let local: Arc<dyn Fetcher> = self.blocks.clone();
        let events: Arc<dyn Fetcher> = match fetcher {
            Some(overlay) => Arc::new(
                TieredFetcher::new(local, overlay).with_cache(self.blocks.clone()),
            ),
            None => local,
        };

        let head = clock::advance(events.as_ref(), &state.head, event, cancel).await?;
        if head == state.head {
            return Ok(head);
        }

        let root = crdt::materialize(
            events.as_ref(),
            self.blocks.as_ref(),
            &head,
            &self.cfg,
            cancel,
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(BucketError::Cancelled);
        }
        self.heads
            .put(HEAD_KEY, Bytes::from(clock::head::encode(&head)?))
            .await?;

        tracing::debug!("advanced head to {} event(s)", head.len());
        state.head = head.clone();
        state.root = Some(root);
        Ok(head)
    }
}

/// Open a [`ClockBucket`] under the conventional `blocks`/`shards` layout
/// of a bucket namespace.
pub async fn open_at(
    kv: Arc<dyn KvStore>,
    prefix: &str,
) -> Result<(Arc<ClockBucket>, Arc<crate::block::KvBlockstore>), BucketError> {
    let ns = Namespace::new(kv, prefix);
    let blocks = Arc::new(crate::block::KvBlockstore::new(ns.child("blocks")));
    let bucket = ClockBucket::open(blocks.clone(), ns.child("shards")).await?;
    Ok((Arc::new(bucket), blocks))
}
