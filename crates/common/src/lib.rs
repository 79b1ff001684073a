/**
 * Content-addressed block layer: stores, tiered
 *  fetchers, and hash verification.
 */
pub mod block;
/**
 * Bucket facades: the mutex-guarded clock bucket,
 *  typed codec views, and the network-capable wrapper.
 */
pub mod bucket;
/**
 * Signed capability documents (delegations) and DIDs.
 */
pub mod capability;
/**
 * Merkle clock: events, heads, and the advance
 *  algorithm.
 */
pub mod clock;
/**
 * Operation-based CRDT: deterministic replay of the
 *  event DAG into shard tree state.
 */
pub mod crdt;
/**
 * Ed25519 key material for identity and signing.
 */
pub mod crypto;
/**
 * Trustless block gateway client over HTTP or the
 *  peer channel.
 */
pub mod gateway;
/**
 * Abstract ordered key-value engine and namespacing.
 */
pub mod kv;
/**
 * Links, blocks and DAG-CBOR codec helpers.
 */
pub mod linked_data;
/**
 * Network host: endpoint, clock RPC and gateway
 *  protocols.
 */
pub mod peer;
/**
 * Remote replicas and push/pull synchronization.
 */
pub mod remote;
/**
 * Prefix-sharded persistent key → link map.
 */
pub mod shard;
/**
 * User data store: agent identity, grants, buckets.
 */
pub mod store;
/**
 * Helpers for integration tests.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::bucket::{BucketError, ClockBucket, NetworkBucket};
    pub use crate::capability::{Capability, Delegation, Did};
    pub use crate::crypto::{PublicKey, SecretKey};
    pub use crate::kv::{KvStore, MemoryKv, RedbKv};
    pub use crate::linked_data::{Block, Link};
    pub use crate::remote::Remote;
    pub use crate::shard::EntryRange;
    pub use crate::store::{StoreOptions, UserStore};
}
