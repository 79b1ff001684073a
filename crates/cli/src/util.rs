//! Data directory handling and store construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};

use fam_common::capability::Did;
use fam_common::kv::{KvStore, RedbKv};
use fam_common::store::{StoreOptions, UserStore};

const CURRENT_FILE: &str = "current";

/// Resolve the data directory: explicit flag/env first, `$HOME/.fam`
/// otherwise. Creates it if absent.
pub fn ensure_data_dir(datadir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match datadir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("locating user home directory"))?
            .join(".fam"),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating data directory: {dir:?}"))?;
    Ok(dir)
}

/// Open the user store backing the data directory and start serving the
/// peer protocols (push needs our gateway reachable for the remote to
/// fetch event blocks back from us).
pub async fn user_store(datadir: &Path) -> anyhow::Result<Arc<UserStore>> {
    let kv: Arc<dyn KvStore> = Arc::new(RedbKv::open(&datadir.join("store.redb"))?);
    let store = UserStore::open(
        kv,
        StoreOptions {
            socket_addr: None,
            discovery: true,
        },
    )
    .await
    .map_err(|e| anyhow!("opening user data store: {e}"))?;
    store.listen();
    Ok(store)
}

/// The currently selected bucket, if any.
pub fn current_bucket(datadir: &Path) -> Option<Did> {
    let raw = std::fs::read_to_string(datadir.join(CURRENT_FILE)).ok()?;
    Did::parse(raw.trim()).ok()
}

pub fn set_current_bucket(datadir: &Path, id: &Did) -> anyhow::Result<()> {
    std::fs::write(datadir.join(CURRENT_FILE), id.as_str()).context("writing current bucket")
}

/// The currently selected bucket, or the error every key command prints.
pub fn require_current(datadir: &Path) -> anyhow::Result<Did> {
    current_bucket(datadir).ok_or_else(|| anyhow!("no bucket selected, use `fam bucket use <did>`"))
}
