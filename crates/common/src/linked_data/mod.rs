//! Content addressing primitives.
//!
//! A [`Link`] is the universal address of a [`Block`]: a CID carrying a
//! codec and a multihash. Canonical structures (shards, events, heads)
//! are encoded as DAG-CBOR and addressed by the sha2-256 of their bytes.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use ipld_core::cid::multihash::Multihash;
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// DAG-CBOR multicodec code.
pub const DAG_CBOR_CODEC: u64 = 0x71;
/// Raw bytes multicodec code.
pub const RAW_CODEC: u64 = 0x55;
/// CAR multicodec code, used for capability archives.
pub const CAR_CODEC: u64 = 0x0202;
/// Identity multicodec code.
pub const IDENTITY_CODEC: u64 = 0x00;

/// sha2-256 multihash code.
pub const SHA2_256_CODE: u64 = 0x12;
/// Identity multihash code.
pub const IDENTITY_CODE: u64 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("CBOR encoding: {0}")]
    Encode(String),
    #[error("CBOR decoding: {0}")]
    Decode(String),
    #[error("invalid link: {0}")]
    InvalidLink(String),
}

/// Address of a block: a CID (codec + multihash).
///
/// Equality and ordering are over the canonical binary form, which is what
/// head ordering and the CRDT tie-break rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link(Cid);

impl Link {
    pub fn new(cid: Cid) -> Self {
        Link(cid)
    }

    /// Link to a DAG-CBOR block with the given bytes.
    pub fn of_cbor(bytes: &[u8]) -> Self {
        let mh = Code::Sha2_256.digest(bytes);
        Link(Cid::new_v1(DAG_CBOR_CODEC, mh))
    }

    /// Link to a raw block with the given bytes.
    pub fn of_raw(bytes: &[u8]) -> Self {
        let mh = Code::Sha2_256.digest(bytes);
        Link(Cid::new_v1(RAW_CODEC, mh))
    }

    /// Link to a capability archive with the given bytes.
    pub fn of_archive(bytes: &[u8]) -> Self {
        let mh = Code::Sha2_256.digest(bytes);
        Link(Cid::new_v1(CAR_CODEC, mh))
    }

    /// Link whose multihash is the identity function over `bytes`.
    ///
    /// The payload travels inside the link itself; no block needs to be
    /// stored for it. Payloads are capped at the 64-byte digest size CIDs
    /// carry.
    pub fn identity(codec: u64, bytes: &[u8]) -> Result<Self, CodecError> {
        let mh = Multihash::<64>::wrap(IDENTITY_CODE, bytes)
            .map_err(|e| CodecError::InvalidLink(format!("identity digest: {e}")))?;
        Ok(Link(Cid::new_v1(codec, mh)))
    }

    /// The embedded payload of an identity link, if this is one.
    pub fn identity_payload(&self) -> Option<&[u8]> {
        if self.0.hash().code() == IDENTITY_CODE {
            Some(self.0.hash().digest())
        } else {
            None
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.0
    }

    pub fn codec(&self) -> u64 {
        self.0.codec()
    }

    /// Multihash algorithm code of this link.
    pub fn multihash_code(&self) -> u64 {
        self.0.hash().code()
    }

    /// Digest bytes of this link's multihash.
    pub fn digest(&self) -> &[u8] {
        self.0.hash().digest()
    }

    /// Canonical binary form.
    pub fn binary(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, CodecError> {
        let cid =
            Cid::try_from(bytes).map_err(|e| CodecError::InvalidLink(format!("binary CID: {e}")))?;
        Ok(Link(cid))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Link {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cid = Cid::try_from(s).map_err(|e| CodecError::InvalidLink(format!("{s}: {e}")))?;
        Ok(Link(cid))
    }
}

impl From<Cid> for Link {
    fn from(cid: Cid) -> Self {
        Link(cid)
    }
}

impl From<Link> for Cid {
    fn from(link: Link) -> Self {
        link.0
    }
}

impl PartialOrd for Link {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Link {
    fn cmp(&self, other: &Self) -> Ordering {
        self.binary().cmp(&other.binary())
    }
}

// Wire serialization carries the binary CID. Canonical DAG-CBOR structures
// do not go through serde; they are built as IPLD values so links encode as
// tag 42.
impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.binary())
    }
}

impl<'de> Deserialize<'de> for Link {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        Link::from_binary(&bytes).map_err(serde::de::Error::custom)
    }
}

/// An immutable content-addressed block: `link = hash(codec, bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    link: Link,
    bytes: Bytes,
}

impl Block {
    pub fn new(link: Link, bytes: Bytes) -> Self {
        Block { link, bytes }
    }

    /// Encode an IPLD value as a DAG-CBOR block.
    pub fn encode_cbor(value: &Ipld) -> Result<Self, CodecError> {
        let bytes = encode_ipld(value)?;
        let link = Link::of_cbor(&bytes);
        Ok(Block {
            link,
            bytes: Bytes::from(bytes),
        })
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Decode the block bytes as an IPLD value.
    pub fn decode_cbor(&self) -> Result<Ipld, CodecError> {
        decode_ipld(&self.bytes)
    }
}

/// Encode an IPLD value as DAG-CBOR bytes.
pub fn encode_ipld(value: &Ipld) -> Result<Vec<u8>, CodecError> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode DAG-CBOR bytes as an IPLD value.
pub fn decode_ipld(bytes: &[u8]) -> Result<Ipld, CodecError> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
