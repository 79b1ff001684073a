//! Network-capable bucket facade.

use std::sync::Arc;

use iroh::Endpoint;
use tokio_util::sync::CancellationToken;

use crate::capability::{Delegation, Did};
use crate::crypto::SecretKey;
use crate::linked_data::Link;
use crate::remote::{ClockRemote, Remote, RemoteCodec};
use crate::shard::EntryRange;

use super::{BucketError, ClockBucket, TypedBucket};

/// A bucket wired to its remotes registry and the local endpoint, able to
/// construct sync drivers for named remotes.
pub struct NetworkBucket {
    id: Did,
    agent: SecretKey,
    grant: Delegation,
    bucket: Arc<ClockBucket>,
    remotes: TypedBucket<Remote, RemoteCodec>,
    endpoint: Endpoint,
}

impl NetworkBucket {
    pub fn new(
        id: Did,
        agent: SecretKey,
        grant: Delegation,
        bucket: Arc<ClockBucket>,
        remotes: TypedBucket<Remote, RemoteCodec>,
        endpoint: Endpoint,
    ) -> Self {
        NetworkBucket {
            id,
            agent,
            grant,
            bucket,
            remotes,
            endpoint,
        }
    }

    pub fn id(&self) -> &Did {
        &self.id
    }

    pub fn grant(&self) -> &Delegation {
        &self.grant
    }

    pub fn clock(&self) -> &Arc<ClockBucket> {
        &self.bucket
    }

    /// The configured remotes registry.
    pub fn remotes(&self) -> &TypedBucket<Remote, RemoteCodec> {
        &self.remotes
    }

    /// A sync driver for the named remote.
    pub async fn remote(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ClockRemote, BucketError> {
        let remote = self.remotes.get(name, cancel).await?;
        Ok(ClockRemote::new(
            self.agent.clone(),
            self.id.clone(),
            self.grant.clone(),
            self.bucket.clone(),
            remote,
            self.endpoint.clone(),
        ))
    }

    pub async fn head(&self) -> Vec<Link> {
        self.bucket.head().await
    }

    pub async fn root(&self, cancel: &CancellationToken) -> Result<Link, BucketError> {
        self.bucket.root(cancel).await
    }

    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Link, BucketError> {
        self.bucket.get(key, cancel).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: Link,
        cancel: &CancellationToken,
    ) -> Result<(), BucketError> {
        self.bucket.put(key, value, cancel).await
    }

    pub async fn del(&self, key: &str, cancel: &CancellationToken) -> Result<(), BucketError> {
        self.bucket.del(key, cancel).await
    }

    pub async fn entries(
        &self,
        range: EntryRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Link)>, BucketError> {
        self.bucket.entries(range, cancel).await
    }
}
