//! Cryptographic primitives for fam
//!
//! - **Identity**: Ed25519 keypairs identify agents; the public key is the
//!   peer identity on the network and the principal behind an agent DID
//! - **Capability signing**: delegations and invocations carry detached
//!   Ed25519 signatures made with the agent key

mod keys;

pub use ed25519_dalek::Signature;
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
