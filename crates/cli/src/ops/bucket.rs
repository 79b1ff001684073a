//! `fam bucket` commands: import, ls, rm, share, use.

use std::fmt::Write;
use std::path::Path;

use anyhow::anyhow;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use fam_common::capability::{Capability, Delegation, Did};

use crate::util;

#[derive(Subcommand, Debug, Clone)]
pub enum BucketCommand {
    /// Import a bucket
    Import {
        /// Delegation granting access to the bucket
        grant: String,
    },
    /// Print buckets
    Ls,
    /// Remove a bucket
    #[command(alias = "remove")]
    Rm { id: String },
    /// Share the current bucket with another agent
    Share {
        /// DID of the recipient agent
        recipient: String,
    },
    /// Use a bucket
    Use { id: String },
}

pub async fn run(datadir: &Path, command: Option<BucketCommand>) -> anyhow::Result<String> {
    match command.unwrap_or(BucketCommand::Ls) {
        BucketCommand::Import { grant } => import(datadir, &grant).await,
        BucketCommand::Ls => ls(datadir).await,
        BucketCommand::Rm { id } => rm(datadir, &id).await,
        BucketCommand::Share { recipient } => share(datadir, &recipient).await,
        BucketCommand::Use { id } => use_bucket(datadir, &id).await,
    }
}

async fn import(datadir: &Path, grant: &str) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let proof = Delegation::parse(grant).map_err(|e| anyhow!("parsing grant: {e}"))?;
    let id = store.add_bucket(proof, &cancel).await?;
    if util::current_bucket(datadir).is_none() {
        util::set_current_bucket(datadir, &id)?;
    }
    store.close().await;
    Ok(id.to_string())
}

async fn ls(datadir: &Path) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let buckets = store.buckets(&cancel).await?;
    let current = util::current_bucket(datadir);
    let mut out = String::new();
    for (id, _) in &buckets {
        if current.as_ref() == Some(id) {
            writeln!(out, "* {id}")?;
        } else {
            writeln!(out, "  {id}")?;
        }
    }
    write!(out, "{} total", buckets.len())?;
    store.close().await;
    Ok(out)
}

async fn rm(datadir: &Path, id: &str) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let id = Did::parse(id).map_err(|e| anyhow!("parsing bucket DID: {e}"))?;
    store.remove_bucket(&id, &cancel).await?;
    store.close().await;
    Ok(String::new())
}

/// Re-delegate the current bucket's abilities to another agent and print
/// the resulting grant for them to import.
async fn share(datadir: &Path, recipient: &str) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let recipient =
        Did::parse(recipient).map_err(|e| anyhow!("parsing recipient DID: {e}"))?;

    let bucket = store.bucket(&current, &cancel).await?;
    let capabilities = bucket
        .grant()
        .capabilities()
        .iter()
        .map(|c| Capability::new(c.with.clone(), c.can.clone()))
        .collect();
    let grant = Delegation::delegate(store.agent(), recipient, capabilities)?;
    let formatted = grant.format()?;
    store.close().await;
    Ok(formatted)
}

async fn use_bucket(datadir: &Path, id: &str) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let buckets = store.buckets(&cancel).await?;
    if buckets.is_empty() {
        store.close().await;
        return Err(anyhow!("no buckets, use `fam bucket import`"));
    }
    let id = Did::parse(id).map_err(|_| anyhow!("parsing bucket DID: \"{id}\""))?;
    if !buckets.iter().any(|(bucket_id, _)| bucket_id == &id) {
        store.close().await;
        return Err(anyhow!("bucket not found: {id}"));
    }
    util::set_current_bucket(datadir, &id)?;
    store.close().await;
    Ok(format!("* {id}"))
}
