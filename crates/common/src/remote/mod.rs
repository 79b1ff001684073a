//! Remote replicas and push/pull synchronization.
//!
//! A [`Remote`] names a network-addressable replica of a bucket; the
//! registry of remotes lives in a sub-bucket of the bucket it replicates.
//! [`ClockRemote`] drives the sync protocol against one remote: `push`
//! sends one `clock/advance` invocation per local head element, `pull`
//! asks for the remote head and advances the local clock, filling missing
//! blocks through the remote's trustless gateway. Both are idempotent and
//! safe to retry; a partial push just leaves the remote with a prefix of
//! the events.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ipld_core::ipld::Ipld;
use iroh::{Endpoint, NodeAddr, RelayUrl};
use tokio_util::sync::CancellationToken;

use crate::block::Fetcher;
use crate::bucket::{BucketError, ClockBucket, ValueCodec};
use crate::capability::{CapabilityError, Delegation, Did, CLOCK_ADVANCE, CLOCK_HEAD};
use crate::crypto::{PublicKey, SecretKey};
use crate::gateway::GatewayFetcher;
use crate::linked_data::{decode_ipld, encode_ipld, Block, CodecError, Link, IDENTITY_CODEC};
use crate::peer::{execute, Failure, Invocation, P2pChannel, ReceiptOut};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("invocation failure: {0}")]
    Invocation(Failure),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("bucket error: {0}")]
    Bucket(#[from] BucketError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("operation cancelled")]
    Cancelled,
}

/// A network-addressable replica: peer identity plus dialing hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub id: PublicKey,
    /// Socket addresses and/or a relay URL. May be empty when discovery
    /// can locate the peer.
    pub addrs: Vec<String>,
}

impl Remote {
    pub fn new(id: PublicKey, addrs: Vec<String>) -> Self {
        Remote { id, addrs }
    }

    /// The DID of the remote's peer key.
    pub fn did(&self) -> Did {
        Did::from_public_key(&self.id)
    }

    pub fn node_addr(&self) -> NodeAddr {
        let mut relay: Option<RelayUrl> = None;
        let mut direct: Vec<SocketAddr> = Vec::new();
        for addr in &self.addrs {
            if let Ok(socket) = SocketAddr::from_str(addr) {
                direct.push(socket);
            } else if let Ok(url) = RelayUrl::from_str(addr) {
                relay = Some(url);
            } else {
                tracing::warn!("ignoring unparseable remote address: {addr}");
            }
        }
        NodeAddr::from_parts(self.id.into(), relay, direct)
    }

    /// Deterministic encoding: `{addrs: [bytes], id: bytes}`.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let addrs = self
            .addrs
            .iter()
            .map(|a| Ipld::Bytes(a.as_bytes().to_vec()))
            .collect();
        let mut map = BTreeMap::new();
        map.insert("addrs".to_string(), Ipld::List(addrs));
        map.insert("id".to_string(), Ipld::Bytes(self.id.to_bytes().to_vec()));
        encode_ipld(&Ipld::Map(map))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let Ipld::Map(mut map) = decode_ipld(bytes)? else {
            return Err(CodecError::Decode("remote is not a map".to_string()));
        };
        let Some(Ipld::Bytes(id)) = map.remove("id") else {
            return Err(CodecError::Decode("remote missing id".to_string()));
        };
        let id = PublicKey::try_from(id.as_slice())
            .map_err(|e| CodecError::Decode(format!("remote id: {e}")))?;
        let Some(Ipld::List(addr_items)) = map.remove("addrs") else {
            return Err(CodecError::Decode("remote missing addrs".to_string()));
        };
        let mut addrs = Vec::with_capacity(addr_items.len());
        for item in addr_items {
            let Ipld::Bytes(bytes) = item else {
                return Err(CodecError::Decode("remote addr is not bytes".to_string()));
            };
            addrs.push(
                String::from_utf8(bytes)
                    .map_err(|e| CodecError::Decode(format!("remote addr: {e}")))?,
            );
        }
        Ok(Remote { id, addrs })
    }
}

/// Codec for remote records. Records small enough for a CID digest travel
/// in an identity link; larger ones are stored as a sidecar block.
pub struct RemoteCodec;

/// Largest payload a CID's digest can carry.
const MAX_IDENTITY_PAYLOAD: usize = 64;

#[async_trait]
impl ValueCodec<Remote> for RemoteCodec {
    fn encode(&self, value: &Remote) -> Result<(Link, Option<Block>), BucketError> {
        let bytes = value.encode()?;
        if bytes.len() <= MAX_IDENTITY_PAYLOAD {
            let link = Link::identity(IDENTITY_CODEC, &bytes)?;
            return Ok((link, None));
        }
        let link = Link::of_cbor(&bytes);
        Ok((link, Some(Block::new(link, bytes.into()))))
    }

    async fn decode(&self, link: &Link, blocks: &dyn Fetcher) -> Result<Remote, BucketError> {
        if let Some(payload) = link.identity_payload() {
            return Ok(Remote::decode(payload)?);
        }
        let block = blocks.get(link).await?;
        Ok(Remote::decode(block.bytes())?)
    }
}

/// Sync driver for one bucket against one remote.
pub struct ClockRemote {
    agent: SecretKey,
    bucket_id: Did,
    proof: Delegation,
    bucket: Arc<ClockBucket>,
    remote: Remote,
    endpoint: Endpoint,
}

impl ClockRemote {
    pub fn new(
        agent: SecretKey,
        bucket_id: Did,
        proof: Delegation,
        bucket: Arc<ClockBucket>,
        remote: Remote,
        endpoint: Endpoint,
    ) -> Self {
        ClockRemote {
            agent,
            bucket_id,
            proof,
            bucket,
            remote,
            endpoint,
        }
    }

    pub fn address(&self) -> &Remote {
        &self.remote
    }

    /// Push the local head to the remote: one `clock/advance` invocation
    /// per head element, sent as a batch. Any failure receipt fails the
    /// push.
    pub async fn push(&self, cancel: &CancellationToken) -> Result<(), RemoteError> {
        // snapshot the head under a read hold; no lock is held across the
        // network round-trip
        let head = self.bucket.head().await;
        if head.is_empty() {
            tracing::debug!("push: nothing to push");
            return Ok(());
        }

        let audience = self.remote.did();
        let mut invocations = Vec::with_capacity(head.len());
        for event in &head {
            if cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            invocations.push(Invocation::issue(
                &self.agent,
                audience.clone(),
                self.bucket_id.clone(),
                CLOCK_ADVANCE,
                Some(*event),
                &self.proof,
            )?);
        }

        tracing::debug!(
            "pushing {} event(s) to {}",
            invocations.len(),
            self.remote.id.to_hex()
        );
        let receipts = execute(&self.endpoint, self.remote.node_addr(), &invocations).await?;
        for receipt in receipts {
            if let ReceiptOut::Err(failure) = receipt.out {
                return Err(RemoteError::Invocation(failure));
            }
        }
        Ok(())
    }

    /// Pull the remote head and advance the local clock with each of its
    /// elements, filling missing blocks through the remote's gateway.
    /// Advancing is idempotent, so a repeated pull is a no-op.
    pub async fn pull(&self, cancel: &CancellationToken) -> Result<(), RemoteError> {
        let invocation = Invocation::issue(
            &self.agent,
            self.remote.did(),
            self.bucket_id.clone(),
            CLOCK_HEAD,
            None,
            &self.proof,
        )?;
        let receipts = execute(
            &self.endpoint,
            self.remote.node_addr(),
            std::slice::from_ref(&invocation),
        )
        .await?;
        let receipt = receipts.into_iter().next().expect("one receipt per invocation");
        let head = match receipt.out {
            ReceiptOut::Ok { head } => head,
            ReceiptOut::Err(failure) => return Err(RemoteError::Invocation(failure)),
        };

        tracing::debug!(
            "pulling {} event(s) from {}",
            head.len(),
            self.remote.id.to_hex()
        );
        for event in head {
            if cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            let fetcher: Arc<dyn Fetcher> = Arc::new(GatewayFetcher::new(P2pChannel::new(
                self.endpoint.clone(),
                self.remote.node_addr(),
            )));
            self.bucket.advance(event, Some(fetcher), cancel).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_codec_round_trip() {
        let remote = Remote::new(
            SecretKey::generate().public(),
            vec!["127.0.0.1:4001".to_string()],
        );
        let decoded = Remote::decode(&remote.encode().unwrap()).unwrap();
        assert_eq!(decoded, remote);
    }

    #[test]
    fn test_remote_encoding_is_deterministic() {
        let remote = Remote::new(SecretKey::generate().public(), vec![]);
        assert_eq!(remote.encode().unwrap(), remote.encode().unwrap());
    }

    #[test]
    fn test_node_addr_parses_sockets() {
        let remote = Remote::new(
            SecretKey::generate().public(),
            vec!["127.0.0.1:4001".to_string(), "garbage".to_string()],
        );
        let addr = remote.node_addr();
        assert_eq!(addr.direct_addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_codec_sidecar_and_identity() {
        use crate::block::{Blockstore, MemoryBlockstore};

        let blocks = MemoryBlockstore::new();
        let codec = RemoteCodec;

        // an address-free record fits in an identity link
        let small = Remote::new(SecretKey::generate().public(), vec![]);
        let (link, block) = codec.encode(&small).unwrap();
        assert!(block.is_none());
        assert_eq!(codec.decode(&link, &blocks).await.unwrap(), small);

        // a record with addresses spills into a sidecar block
        let large = Remote::new(
            SecretKey::generate().public(),
            vec!["203.0.113.7:4001".to_string(), "203.0.113.8:4001".to_string()],
        );
        let (link, block) = codec.encode(&large).unwrap();
        let block = block.expect("sidecar block");
        blocks.put(&block).await.unwrap();
        assert_eq!(codec.decode(&link, &blocks).await.unwrap(), large);
    }
}
