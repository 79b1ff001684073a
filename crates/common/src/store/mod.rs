//! User data store: agent identity, capability grants, bucket registry.
//!
//! Everything lives in one shared [`KvStore`] under hierarchical prefixes:
//! the agent's signing key in `keys/`, imported grants in `grants/`, and
//! each bucket's shard tree, blocks and remotes under `bucket/<did>/`.
//! Buckets are constructed lazily and cached; construction is idempotent,
//! so racing constructions would produce identical content.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockError, Fetcher, KvBlockstore};
use crate::bucket::{
    open_at, BucketError, DelegationCodec, NetworkBucket, SignerCodec, TypedBucket,
};
use crate::capability::{CapabilityError, Delegation, Did};
use crate::crypto::SecretKey;
use crate::kv::{KvStore, Namespace};
use crate::linked_data::{Block, Link};
use crate::peer::{BlockSource, ClockAccess, Peer, PeerBuilder};
use crate::remote::{Remote, RemoteCodec};
use crate::shard::EntryRange;

/// Name of the agent signing key in the key bucket.
pub const DEFAULT_KEY_NAME: &str = "default";
/// Name of the remote installed into fresh buckets.
pub const DEFAULT_REMOTE_NAME: &str = "origin";
/// Peer identity of the default remote.
pub const DEFAULT_REMOTE_ID: &str = "did:key:z6MkjonsDH66hn1zkLH1j7u3NBpsF8NpbpkMFAKtXGgumsyr";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bucket not found: {0}")]
    UnknownBucket(Did),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("bucket error: {0}")]
    Bucket(#[from] BucketError),
    #[error("network error: {0}")]
    Network(#[from] anyhow::Error),
}

/// Options for opening a user store.
#[derive(Debug, Default, Clone)]
pub struct StoreOptions {
    /// Socket address for the network endpoint; ephemeral when unset.
    pub socket_addr: Option<SocketAddr>,
    /// Enable DHT discovery for dialing remotes without stored addresses.
    pub discovery: bool,
}

pub struct UserStore {
    kv: Arc<dyn KvStore>,
    agent: SecretKey,
    keys: TypedBucket<SecretKey, SignerCodec>,
    grants: TypedBucket<Delegation, DelegationCodec>,
    buckets: tokio::sync::Mutex<HashMap<Did, Arc<NetworkBucket>>>,
    peer: Peer,
}

impl UserStore {
    /// Open (or initialize) a user store over `kv`. Generates and persists
    /// the agent signing key on first use, and binds the network endpoint
    /// with it.
    pub async fn open(kv: Arc<dyn KvStore>, options: StoreOptions) -> Result<Arc<Self>, StoreError> {
        let cancel = CancellationToken::new();

        tracing::debug!("creating key bucket");
        let (key_bucket, key_blocks) = open_at(kv.clone(), "keys").await?;
        let keys = TypedBucket::new(key_bucket, key_blocks, SignerCodec);

        let agent = match keys.get(DEFAULT_KEY_NAME, &cancel).await {
            Ok(agent) => agent,
            Err(BucketError::NotFound) => {
                tracing::warn!("default signing key not found, generating a new ed25519 key");
                let agent = SecretKey::generate();
                keys.put(DEFAULT_KEY_NAME, &agent, &cancel).await?;
                agent
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!("agent ID: {}", Did::from_public_key(&agent.public()));

        tracing::debug!("creating grants bucket");
        let (grant_bucket, grant_blocks) = open_at(kv.clone(), "grants").await?;
        let grants = TypedBucket::new(grant_bucket, grant_blocks, DelegationCodec);

        let mut peer = PeerBuilder::new()
            .secret_key(agent.clone())
            .discovery(options.discovery);
        if let Some(addr) = options.socket_addr {
            peer = peer.socket_addr(addr);
        }
        let peer = peer.build().await?;

        Ok(Arc::new(UserStore {
            kv,
            agent,
            keys,
            grants,
            buckets: tokio::sync::Mutex::new(HashMap::new()),
            peer,
        }))
    }

    /// The agent's signing key.
    pub fn agent(&self) -> &SecretKey {
        &self.agent
    }

    /// The agent's DID.
    pub fn id(&self) -> Did {
        Did::from_public_key(&self.agent.public())
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The key bucket (exposed for inspection; the agent key is cached).
    pub fn keys(&self) -> &TypedBucket<SecretKey, SignerCodec> {
        &self.keys
    }

    /// Serve the clock RPC and block gateway for this store's buckets.
    pub fn listen(self: &Arc<Self>) {
        let clocks: Arc<dyn ClockAccess> = self.clone();
        let blocks: Arc<dyn BlockSource> = self.clone();
        self.peer.listen(clocks, blocks);
    }

    /// Close network state.
    pub async fn close(&self) {
        self.peer.close().await;
    }

    /// Import a bucket by its grant. All capabilities must name the same
    /// resource DID, and together they must permit mutating the clock and
    /// uploading data.
    pub async fn add_bucket(
        &self,
        proof: Delegation,
        cancel: &CancellationToken,
    ) -> Result<Did, StoreError> {
        proof.verify()?;
        let id = proof.resource()?;
        if !proof.can_mutate_clock() {
            return Err(CapabilityError::Denied(
                "missing capability to mutate merkle clock".to_string(),
            )
            .into());
        }
        if !proof.can_upload() {
            return Err(
                CapabilityError::Denied("missing capability to upload data".to_string()).into(),
            );
        }
        self.grants.put(id.as_str(), &proof, cancel).await?;
        tracing::debug!("imported bucket {id}");
        Ok(id)
    }

    /// Remove a bucket's grant and evict it from the cache. Bucket blocks
    /// are not eagerly deleted.
    pub async fn remove_bucket(
        &self,
        id: &Did,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.grants.del(id.as_str(), cancel).await?;
        self.buckets.lock().await.remove(id);
        Ok(())
    }

    /// Enumerate imported buckets and their grants.
    pub async fn buckets(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Did, Delegation)>, StoreError> {
        let entries = self.grants.entries(EntryRange::all(), cancel).await?;
        let mut buckets = Vec::with_capacity(entries.len());
        for (key, grant) in entries {
            buckets.push((Did::parse(&key)?, grant));
        }
        Ok(buckets)
    }

    /// Retrieve a bucket by DID, constructing it on first use.
    pub async fn bucket(
        &self,
        id: &Did,
        cancel: &CancellationToken,
    ) -> Result<Arc<NetworkBucket>, StoreError> {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(id) {
            return Ok(bucket.clone());
        }

        let grant = match self.grants.get(id.as_str(), cancel).await {
            Ok(grant) => grant,
            Err(BucketError::NotFound) => return Err(StoreError::UnknownBucket(id.clone())),
            Err(err) => return Err(err.into()),
        };

        let prefix = format!("bucket/{id}");
        let (bucket, _) = open_at(self.kv.clone(), &prefix).await?;

        let (remote_bucket, remote_blocks) =
            open_at(self.kv.clone(), &format!("{prefix}/remotes")).await?;
        let remotes = TypedBucket::new(remote_bucket, remote_blocks, RemoteCodec);

        // install the default remote on first construction
        match remotes.get(DEFAULT_REMOTE_NAME, cancel).await {
            Ok(_) => {}
            Err(BucketError::NotFound) => {
                let id = Did::parse(DEFAULT_REMOTE_ID)?.public_key()?;
                remotes
                    .put(DEFAULT_REMOTE_NAME, &Remote::new(id, Vec::new()), cancel)
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        let network = Arc::new(NetworkBucket::new(
            id.clone(),
            self.agent.clone(),
            grant,
            bucket,
            remotes,
            self.peer.endpoint().clone(),
        ));
        buckets.insert(id.clone(), network.clone());
        Ok(network)
    }
}

fn bucket_error(err: StoreError) -> BucketError {
    match err {
        StoreError::UnknownBucket(_) => BucketError::NotFound,
        StoreError::Capability(err) => BucketError::Capability(err),
        StoreError::Bucket(err) => err,
        StoreError::Network(err) => BucketError::Block(BlockError::Io(err)),
    }
}

#[async_trait]
impl ClockAccess for UserStore {
    async fn head(&self, id: &Did) -> Result<Vec<Link>, BucketError> {
        let bucket = self
            .bucket(id, &CancellationToken::new())
            .await
            .map_err(bucket_error)?;
        Ok(bucket.head().await)
    }

    async fn advance(
        &self,
        id: &Did,
        event: Link,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Vec<Link>, BucketError> {
        let bucket = self
            .bucket(id, &CancellationToken::new())
            .await
            .map_err(bucket_error)?;
        bucket
            .clock()
            .advance(event, Some(fetcher), &CancellationToken::new())
            .await
    }
}

#[async_trait]
impl BlockSource for UserStore {
    /// Resolve a block from any imported bucket's namespace.
    async fn block(&self, link: &Link) -> Result<Block, BlockError> {
        let buckets = self
            .buckets(&CancellationToken::new())
            .await
            .map_err(|e| BlockError::Io(anyhow::anyhow!("listing buckets: {e}")))?;
        for (id, _) in buckets {
            let blocks = KvBlockstore::new(
                Namespace::new(self.kv.clone(), format!("bucket/{id}")).child("blocks"),
            );
            match blocks.get(link).await {
                Ok(block) => return Ok(block),
                Err(BlockError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(BlockError::NotFound(*link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::kv::MemoryKv;
    use crate::linked_data::Link;

    fn grant_for(agent: &SecretKey, abilities: &[&str]) -> (Did, Delegation) {
        let owner = SecretKey::generate();
        let resource = Did::from_public_key(&owner.public());
        let capabilities = abilities
            .iter()
            .map(|can| Capability::new(resource.clone(), *can))
            .collect();
        let proof = Delegation::delegate(
            &owner,
            Did::from_public_key(&agent.public()),
            capabilities,
        )
        .unwrap();
        (resource, proof)
    }

    #[tokio::test]
    async fn test_agent_id_is_stable_across_reopen() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let first = {
            let store = UserStore::open(kv.clone(), StoreOptions::default())
                .await
                .unwrap();
            let id = store.id();
            store.close().await;
            id
        };
        let store = UserStore::open(kv, StoreOptions::default()).await.unwrap();
        assert_eq!(store.id(), first);
        store.close().await;
    }

    #[tokio::test]
    async fn test_add_and_remove_bucket() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = UserStore::open(kv, StoreOptions::default()).await.unwrap();
        let cancel = CancellationToken::new();
        let (resource, proof) = grant_for(store.agent(), &["clock/*", "space/blob/*"]);

        let id = store.add_bucket(proof, &cancel).await.unwrap();
        assert_eq!(id, resource);
        let buckets = store.buckets(&cancel).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].0, id);

        store.remove_bucket(&id, &cancel).await.unwrap();
        assert!(store.buckets(&cancel).await.unwrap().is_empty());
        assert!(matches!(
            store.bucket(&id, &cancel).await,
            Err(StoreError::UnknownBucket(_))
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_add_bucket_requires_abilities() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = UserStore::open(kv, StoreOptions::default()).await.unwrap();
        let cancel = CancellationToken::new();

        // clock ability alone is not enough
        let (_, proof) = grant_for(store.agent(), &["clock/advance"]);
        assert!(matches!(
            store.add_bucket(proof, &cancel).await,
            Err(StoreError::Capability(CapabilityError::Denied(_)))
        ));

        // upload ability alone is not enough
        let (_, proof) = grant_for(store.agent(), &["space/blob/add"]);
        assert!(matches!(
            store.add_bucket(proof, &cancel).await,
            Err(StoreError::Capability(CapabilityError::Denied(_)))
        ));

        // a wildcard grants both
        let (_, proof) = grant_for(store.agent(), &["*"]);
        store.add_bucket(proof, &cancel).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_bucket_construction_installs_default_remote() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = UserStore::open(kv, StoreOptions::default()).await.unwrap();
        let cancel = CancellationToken::new();
        let (_, proof) = grant_for(store.agent(), &["*"]);
        let id = store.add_bucket(proof, &cancel).await.unwrap();

        let bucket = store.bucket(&id, &cancel).await.unwrap();
        let origin = bucket
            .remotes()
            .get(DEFAULT_REMOTE_NAME, &cancel)
            .await
            .unwrap();
        assert_eq!(
            Did::from_public_key(&origin.id).as_str(),
            DEFAULT_REMOTE_ID
        );

        // bucket operations work through the facade
        bucket
            .put("a", Link::of_raw(b"v"), &cancel)
            .await
            .unwrap();
        assert_eq!(bucket.get("a", &cancel).await.unwrap(), Link::of_raw(b"v"));
        store.close().await;
    }
}
