//! Key commands against the current bucket: put, del, ls.

use std::fmt::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use fam_common::linked_data::Link;
use fam_common::shard::EntryRange;

use crate::util;

pub async fn put(datadir: &Path, key: &str, value: &str) -> anyhow::Result<String> {
    if key.is_empty() {
        return Err(anyhow!("missing key"));
    }
    let value = Link::from_str(value).map_err(|e| anyhow!("invalid value: {e}"))?;
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    bucket.put(key, value, &cancel).await?;
    let root = bucket.root(&cancel).await?;
    store.close().await;
    Ok(root.to_string())
}

pub async fn del(datadir: &Path, key: &str) -> anyhow::Result<String> {
    if key.is_empty() {
        return Err(anyhow!("missing key"));
    }
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    bucket.del(key, &cancel).await?;
    let root = bucket.root(&cancel).await?;
    store.close().await;
    Ok(root.to_string())
}

#[allow(clippy::too_many_arguments)]
pub async fn ls(
    datadir: &Path,
    pfx: Option<String>,
    gt: Option<String>,
    gte: Option<String>,
    lt: Option<String>,
    lte: Option<String>,
    limit: Option<usize>,
) -> anyhow::Result<String> {
    let range = EntryRange::try_new(pfx, gt, gte, lt, lte)?;
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;

    let mut out = String::new();
    let mut count = 0;
    for (key, value) in bucket.entries(range, &cancel).await? {
        writeln!(out, "{key}\t{value}")?;
        count += 1;
        if let Some(limit) = limit {
            if count >= limit {
                break;
            }
        }
    }
    write!(out, "{count} total")?;
    store.close().await;
    Ok(out)
}
