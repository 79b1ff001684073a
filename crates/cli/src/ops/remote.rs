//! `fam remote` commands: list, add, rm.

use std::fmt::Write;
use std::path::Path;

use anyhow::anyhow;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use fam_common::capability::Did;
use fam_common::remote::Remote;
use fam_common::shard::EntryRange;

use crate::util;

#[derive(Subcommand, Debug, Clone)]
pub enum RemoteCommand {
    /// Print configured remotes
    List,
    /// Add a remote
    Add {
        name: String,
        /// DID of the remote peer
        id: String,
        /// Address of the remote peer
        addr: String,
    },
    /// Remove a remote
    #[command(alias = "remove")]
    Rm { name: String },
}

pub async fn run(datadir: &Path, command: Option<RemoteCommand>) -> anyhow::Result<String> {
    match command.unwrap_or(RemoteCommand::List) {
        RemoteCommand::List => list(datadir).await,
        RemoteCommand::Add { name, id, addr } => add(datadir, &name, &id, &addr).await,
        RemoteCommand::Rm { name } => rm(datadir, &name).await,
    }
}

async fn list(datadir: &Path) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    let remotes = bucket.remotes().entries(EntryRange::all(), &cancel).await?;

    let mut out = String::new();
    for (name, remote) in &remotes {
        writeln!(out, "{name}")?;
        writeln!(out, "  ID:    {}", remote.did())?;
        writeln!(out, "  Addrs:")?;
        for addr in &remote.addrs {
            writeln!(out, "    {addr}")?;
        }
        writeln!(out)?;
    }
    write!(out, "{} total", remotes.len())?;
    store.close().await;
    Ok(out)
}

async fn add(datadir: &Path, name: &str, id: &str, addr: &str) -> anyhow::Result<String> {
    if name.is_empty() {
        return Err(anyhow!("missing remote name"));
    }
    let id = Did::parse(id).map_err(|e| anyhow!("parsing remote DID: {e}"))?;
    let key = id.public_key().map_err(|e| anyhow!("decoding remote key: {e}"))?;

    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    bucket
        .remotes()
        .put(name, &Remote::new(key, vec![addr.to_string()]), &cancel)
        .await?;
    store.close().await;
    Ok(String::new())
}

async fn rm(datadir: &Path, name: &str) -> anyhow::Result<String> {
    if name.is_empty() {
        return Err(anyhow!("missing remote name"));
    }
    let store = util::user_store(datadir).await?;
    let cancel = CancellationToken::new();
    let current = util::require_current(datadir)?;
    let bucket = store.bucket(&current, &cancel).await?;
    bucket.remotes().del(name, &cancel).await?;
    store.close().await;
    Ok(String::new())
}
