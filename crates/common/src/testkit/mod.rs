//! Shared helpers for integration tests.

use std::sync::Arc;

use anyhow::Result;

use crate::capability::{Capability, Delegation, Did};
use crate::crypto::SecretKey;
use crate::kv::{KvStore, MemoryKv};
use crate::store::{StoreOptions, UserStore};

/// Open a user store over a fresh in-memory KV engine.
pub async fn memory_store() -> Result<Arc<UserStore>> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    Ok(UserStore::open(kv, StoreOptions::default()).await?)
}

/// Issue wildcard grants on one fresh bucket to each of the given agents.
/// Returns the bucket DID and one delegation per agent, in order.
pub fn issue_grants(agents: &[&SecretKey]) -> Result<(Did, Vec<Delegation>)> {
    let owner = SecretKey::generate();
    let resource = Did::from_public_key(&owner.public());
    let mut grants = Vec::with_capacity(agents.len());
    for agent in agents {
        grants.push(Delegation::delegate(
            &owner,
            Did::from_public_key(&agent.public()),
            vec![Capability::new(resource.clone(), "*")],
        )?);
    }
    Ok((resource, grants))
}

/// Direct socket addresses of a store's endpoint, as strings suitable for
/// a remote record.
pub fn direct_addrs(store: &UserStore) -> Vec<String> {
    store
        .peer()
        .endpoint()
        .bound_sockets()
        .into_iter()
        .map(|addr| addr.to_string())
        .collect()
}

/// Tell each store the other's direct addresses, so connections succeed
/// without waiting for discovery.
pub fn introduce(a: &UserStore, b: &UserStore) -> Result<()> {
    let addr_a = iroh::NodeAddr::from_parts(
        a.peer().id(),
        None,
        a.peer().endpoint().bound_sockets(),
    );
    let addr_b = iroh::NodeAddr::from_parts(
        b.peer().id(),
        None,
        b.peer().endpoint().bound_sockets(),
    );
    a.peer()
        .endpoint()
        .add_node_addr_with_source(addr_b, "testkit")?;
    b.peer()
        .endpoint()
        .add_node_addr_with_source(addr_a, "testkit")?;
    Ok(())
}
