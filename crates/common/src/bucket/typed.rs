//! Typed views over a link-valued bucket.
//!
//! The link-valued [`ClockBucket`](super::ClockBucket) is the only
//! persistent form; a [`TypedBucket`] layers a pure [`ValueCodec`] over it.
//! Small values travel inside identity links; larger ones are stored as a
//! sidecar block the link addresses.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::block::{Blockstore, Fetcher};
use crate::capability::Delegation;
use crate::crypto::SecretKey;
use crate::linked_data::{Block, CodecError, Link, IDENTITY_CODEC};
use crate::shard::EntryRange;

use super::{BucketError, ClockBucket};

/// Pure translation between a value type and its link form.
#[async_trait]
pub trait ValueCodec<T>: Send + Sync {
    /// Encode a value into a link, plus the sidecar block to persist when
    /// the value does not travel inside the link itself.
    fn encode(&self, value: &T) -> Result<(Link, Option<Block>), BucketError>;
    async fn decode(&self, link: &Link, blocks: &dyn Fetcher) -> Result<T, BucketError>;
}

/// A bucket of `T` values realized as a codec over a link-valued bucket.
pub struct TypedBucket<T, C> {
    inner: Arc<ClockBucket>,
    values: Arc<dyn Blockstore>,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: ValueCodec<T>> TypedBucket<T, C> {
    pub fn new(inner: Arc<ClockBucket>, values: Arc<dyn Blockstore>, codec: C) -> Self {
        TypedBucket {
            inner,
            values,
            codec,
            _marker: PhantomData,
        }
    }

    pub fn clock(&self) -> &Arc<ClockBucket> {
        &self.inner
    }

    pub async fn root(&self, cancel: &CancellationToken) -> Result<Link, BucketError> {
        self.inner.root(cancel).await
    }

    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<T, BucketError> {
        let link = self.inner.get(key, cancel).await?;
        self.codec.decode(&link, self.values.as_ref()).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<(), BucketError> {
        let (link, block) = self.codec.encode(value)?;
        if let Some(block) = block {
            self.values.put(&block).await?;
        }
        self.inner.put(key, link, cancel).await
    }

    pub async fn del(&self, key: &str, cancel: &CancellationToken) -> Result<(), BucketError> {
        self.inner.del(key, cancel).await
    }

    pub async fn entries(
        &self,
        range: EntryRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, T)>, BucketError> {
        let links = self.inner.entries(range, cancel).await?;
        let mut entries = Vec::with_capacity(links.len());
        for (key, link) in links {
            let value = self.codec.decode(&link, self.values.as_ref()).await?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

/// Codec embedding an agent signing key in an identity link.
pub struct SignerCodec;

#[async_trait]
impl ValueCodec<SecretKey> for SignerCodec {
    fn encode(&self, value: &SecretKey) -> Result<(Link, Option<Block>), BucketError> {
        let link = Link::identity(IDENTITY_CODEC, &value.to_bytes())?;
        Ok((link, None))
    }

    async fn decode(&self, link: &Link, _blocks: &dyn Fetcher) -> Result<SecretKey, BucketError> {
        let payload = link
            .identity_payload()
            .ok_or_else(|| CodecError::Decode("signer link is not identity".to_string()))?;
        let bytes: [u8; 32] = payload
            .try_into()
            .map_err(|_| CodecError::Decode("signer key is not 32 bytes".to_string()))?;
        Ok(SecretKey::from(bytes))
    }
}

/// Codec storing a delegation's archive as a block addressed by its link.
pub struct DelegationCodec;

#[async_trait]
impl ValueCodec<Delegation> for DelegationCodec {
    fn encode(&self, value: &Delegation) -> Result<(Link, Option<Block>), BucketError> {
        let archive = value.archive()?;
        let link = Link::of_archive(&archive);
        Ok((link, Some(Block::new(link, Bytes::from(archive)))))
    }

    async fn decode(&self, link: &Link, blocks: &dyn Fetcher) -> Result<Delegation, BucketError> {
        let block = blocks.get(link).await?;
        Ok(Delegation::extract(block.bytes())?)
    }
}
