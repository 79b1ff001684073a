pub mod bucket;
pub mod kv;
pub mod remote;
pub mod sync;

use std::path::Path;

use crate::util;

pub async fn whodis(datadir: &Path) -> anyhow::Result<String> {
    let store = util::user_store(datadir).await?;
    let id = store.id();
    store.close().await;
    Ok(id.to_string())
}
