//! Push and pull against a configured remote.

use std::path::Path;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use fam_common::bucket::BucketError;
use fam_common::store::DEFAULT_REMOTE_NAME;

use crate::util;

pub async fn push(datadir: &Path, remote: Option<String>) -> anyhow::Result<String> {
    let name = remote.unwrap_or_else(|| DEFAULT_REMOTE_NAME.to_string());
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    let remote = match bucket.remote(&name, &cancel).await {
        Ok(remote) => remote,
        Err(BucketError::NotFound) => {
            store.close().await;
            return Err(anyhow!("remote not found: {name}"));
        }
        Err(err) => {
            store.close().await;
            return Err(err.into());
        }
    };
    remote.push(&cancel).await?;
    let root = bucket.root(&cancel).await?;
    store.close().await;
    Ok(root.to_string())
}

pub async fn pull(datadir: &Path, remote: Option<String>) -> anyhow::Result<String> {
    let name = remote.unwrap_or_else(|| DEFAULT_REMOTE_NAME.to_string());
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    let remote = match bucket.remote(&name, &cancel).await {
        Ok(remote) => remote,
        Err(BucketError::NotFound) => {
            store.close().await;
            return Err(anyhow!("remote not found: {name}"));
        }
        Err(err) => {
            store.close().await;
            return Err(err.into());
        }
    };
    remote.pull(&cancel).await?;
    let root = bucket.root(&cancel).await?;
    store.close().await;
    Ok(root.to_string())
}
