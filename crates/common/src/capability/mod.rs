//! Capability documents.
//!
//! A [`Delegation`] is a signed document in which an issuer grants an
//! audience a set of abilities over a resource DID. Buckets are imported by
//! presenting such a grant; sync invocations carry one as their proof. The
//! archival byte form is deterministic DAG-CBOR and is content-addressed,
//! so a grant can be stored as a block.

use std::collections::BTreeMap;
use std::fmt;

use ipld_core::ipld::Ipld;
use multibase::Base;

use crate::crypto::{PublicKey, SecretKey};
use crate::linked_data::{decode_ipld, encode_ipld, CodecError, Link};

/// Ability granting everything.
pub const ABILITY_ALL: &str = "*";
/// Ability namespace for clock mutation.
pub const CLOCK_ALL: &str = "clock/*";
pub const CLOCK_ADVANCE: &str = "clock/advance";
pub const CLOCK_HEAD: &str = "clock/head";
/// Ability namespace for block upload.
pub const SPACE_ALL: &str = "space/*";
pub const SPACE_BLOB_ALL: &str = "space/blob/*";
pub const SPACE_BLOB_ADD: &str = "space/blob/add";

/// Multicodec prefix for an Ed25519 public key in a did:key.
const ED25519_DID_PREFIX: [u8; 2] = [0xed, 0x01];

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid DID: {0}")]
    InvalidDid(String),
    #[error("malformed delegation: {0}")]
    Malformed(String),
    #[error("invalid delegation signature")]
    BadSignature,
    #[error("capability denied: {0}")]
    Denied(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Decentralized identifier: the stable string form of a principal's
/// Ed25519 public key (`did:key:z...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Did(String);

impl Did {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let mut tagged = Vec::with_capacity(2 + 32);
        tagged.extend_from_slice(&ED25519_DID_PREFIX);
        tagged.extend_from_slice(&key.to_bytes());
        Did(format!(
            "did:key:{}",
            multibase::encode(Base::Base58Btc, tagged)
        ))
    }

    pub fn parse(s: &str) -> Result<Self, CapabilityError> {
        let encoded = s
            .strip_prefix("did:key:")
            .ok_or_else(|| CapabilityError::InvalidDid(format!("not a did:key: {s}")))?;
        let (_, bytes) = multibase::decode(encoded)
            .map_err(|e| CapabilityError::InvalidDid(format!("{s}: {e}")))?;
        if bytes.len() != 34 || bytes[..2] != ED25519_DID_PREFIX {
            return Err(CapabilityError::InvalidDid(format!(
                "{s}: not an ed25519 did:key"
            )));
        }
        Ok(Did(s.to_string()))
    }

    /// The public key behind this DID.
    pub fn public_key(&self) -> Result<PublicKey, CapabilityError> {
        let encoded = self
            .0
            .strip_prefix("did:key:")
            .ok_or_else(|| CapabilityError::InvalidDid(self.0.clone()))?;
        let (_, bytes) = multibase::decode(encoded)
            .map_err(|e| CapabilityError::InvalidDid(format!("{}: {e}", self.0)))?;
        PublicKey::try_from(&bytes[2..])
            .map_err(|e| CapabilityError::InvalidDid(format!("{}: {e}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single granted ability over a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub with: Did,
    pub can: String,
}

impl Capability {
    pub fn new(with: Did, can: impl Into<String>) -> Self {
        Capability {
            with,
            can: can.into(),
        }
    }

    /// Whether this capability covers `ability` on `resource`, honoring
    /// `*` and `ns/*` wildcards.
    pub fn covers(&self, resource: &Did, ability: &str) -> bool {
        if &self.with != resource {
            return false;
        }
        if self.can == ABILITY_ALL || self.can == ability {
            return true;
        }
        match self.can.strip_suffix("/*") {
            Some(ns) => ability.starts_with(ns) && ability[ns.len()..].starts_with('/'),
            None => false,
        }
    }
}

/// A signed capability document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    issuer: Did,
    audience: Did,
    capabilities: Vec<Capability>,
    signature: Vec<u8>,
}

impl Delegation {
    /// Issue a new delegation signed by `issuer`.
    pub fn delegate(
        issuer: &SecretKey,
        audience: Did,
        capabilities: Vec<Capability>,
    ) -> Result<Self, CapabilityError> {
        let issuer_did = Did::from_public_key(&issuer.public());
        let payload = payload_bytes(&issuer_did, &audience, &capabilities)?;
        let signature = issuer.sign(&payload).to_bytes().to_vec();
        Ok(Delegation {
            issuer: issuer_did,
            audience,
            capabilities,
            signature,
        })
    }

    pub fn issuer(&self) -> &Did {
        &self.issuer
    }

    pub fn audience(&self) -> &Did {
        &self.audience
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Verify the issuer's signature over the payload.
    pub fn verify(&self) -> Result<(), CapabilityError> {
        let payload = payload_bytes(&self.issuer, &self.audience, &self.capabilities)?;
        let key = self.issuer.public_key()?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| CapabilityError::BadSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(&payload, &signature)
            .map_err(|_| CapabilityError::BadSignature)
    }

    /// The single resource DID all capabilities name.
    pub fn resource(&self) -> Result<Did, CapabilityError> {
        let mut resource: Option<&Did> = None;
        for capability in &self.capabilities {
            match resource {
                None => resource = Some(&capability.with),
                Some(did) if did == &capability.with => {}
                Some(_) => {
                    return Err(CapabilityError::Denied(
                        "capabilities do not reference the same resource".to_string(),
                    ))
                }
            }
        }
        resource
            .cloned()
            .ok_or_else(|| CapabilityError::Denied("delegation grants no capabilities".to_string()))
    }

    /// Whether the granted abilities permit mutating the merkle clock.
    pub fn can_mutate_clock(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| matches!(c.can.as_str(), ABILITY_ALL | CLOCK_ALL | CLOCK_ADVANCE))
    }

    /// Whether the granted abilities permit uploading data.
    pub fn can_upload(&self) -> bool {
        self.capabilities.iter().any(|c| {
            matches!(
                c.can.as_str(),
                ABILITY_ALL | SPACE_ALL | SPACE_BLOB_ALL | SPACE_BLOB_ADD
            )
        })
    }

    /// Whether any capability covers `ability` on `resource`.
    pub fn allows(&self, resource: &Did, ability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.covers(resource, ability))
    }

    /// Deterministic archival byte form.
    pub fn archive(&self) -> Result<Vec<u8>, CapabilityError> {
        let mut map = payload_map(&self.issuer, &self.audience, &self.capabilities);
        map.insert(
            "signature".to_string(),
            Ipld::Bytes(self.signature.clone()),
        );
        Ok(encode_ipld(&Ipld::Map(map))?)
    }

    /// Decode an archive and verify its signature.
    pub fn extract(bytes: &[u8]) -> Result<Self, CapabilityError> {
        let ipld = decode_ipld(bytes)?;
        let Ipld::Map(mut map) = ipld else {
            return Err(CapabilityError::Malformed("not a map".to_string()));
        };
        let issuer = take_string(&mut map, "issuer")?;
        let audience = take_string(&mut map, "audience")?;
        let Some(Ipld::List(caps)) = map.remove("capabilities") else {
            return Err(CapabilityError::Malformed(
                "missing capabilities".to_string(),
            ));
        };
        let Some(Ipld::Bytes(signature)) = map.remove("signature") else {
            return Err(CapabilityError::Malformed("missing signature".to_string()));
        };
        let mut capabilities = Vec::with_capacity(caps.len());
        for cap in caps {
            let Ipld::Map(mut cap) = cap else {
                return Err(CapabilityError::Malformed(
                    "capability is not a map".to_string(),
                ));
            };
            let with = take_string(&mut cap, "with")?;
            let can = take_string(&mut cap, "can")?;
            capabilities.push(Capability {
                with: Did::parse(&with)?,
                can,
            });
        }
        let delegation = Delegation {
            issuer: Did::parse(&issuer)?,
            audience: Did::parse(&audience)?,
            capabilities,
            signature,
        };
        delegation.verify()?;
        Ok(delegation)
    }

    /// Content address of the archival form.
    pub fn link(&self) -> Result<Link, CapabilityError> {
        Ok(Link::of_archive(&self.archive()?))
    }

    /// Text form suitable for copy-pasting between agents.
    pub fn format(&self) -> Result<String, CapabilityError> {
        Ok(multibase::encode(Base::Base64Url, self.archive()?))
    }

    /// Parse the text form produced by [`Delegation::format`].
    pub fn parse(s: &str) -> Result<Self, CapabilityError> {
        let (_, bytes) = multibase::decode(s.trim())
            .map_err(|e| CapabilityError::Malformed(format!("decoding delegation: {e}")))?;
        Delegation::extract(&bytes)
    }
}

fn take_string(
    map: &mut BTreeMap<String, Ipld>,
    key: &str,
) -> Result<String, CapabilityError> {
    match map.remove(key) {
        Some(Ipld::String(s)) => Ok(s),
        _ => Err(CapabilityError::Malformed(format!("missing {key}"))),
    }
}

fn payload_map(
    issuer: &Did,
    audience: &Did,
    capabilities: &[Capability],
) -> BTreeMap<String, Ipld> {
    let caps = capabilities
        .iter()
        .map(|c| {
            let mut cap = BTreeMap::new();
            cap.insert("can".to_string(), Ipld::String(c.can.clone()));
            cap.insert("with".to_string(), Ipld::String(c.with.to_string()));
            Ipld::Map(cap)
        })
        .collect();
    let mut map = BTreeMap::new();
    map.insert("audience".to_string(), Ipld::String(audience.to_string()));
    map.insert("capabilities".to_string(), Ipld::List(caps));
    map.insert("issuer".to_string(), Ipld::String(issuer.to_string()));
    map
}

fn payload_bytes(
    issuer: &Did,
    audience: &Did,
    capabilities: &[Capability],
) -> Result<Vec<u8>, CapabilityError> {
    Ok(encode_ipld(&Ipld::Map(payload_map(
        issuer,
        audience,
        capabilities,
    )))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(abilities: &[&str]) -> (SecretKey, SecretKey, Delegation) {
        let owner = SecretKey::generate();
        let agent = SecretKey::generate();
        let resource = Did::from_public_key(&owner.public());
        let capabilities = abilities
            .iter()
            .map(|can| Capability::new(resource.clone(), *can))
            .collect();
        let delegation = Delegation::delegate(
            &owner,
            Did::from_public_key(&agent.public()),
            capabilities,
        )
        .unwrap();
        (owner, agent, delegation)
    }

    #[test]
    fn test_did_round_trip() {
        let key = SecretKey::generate().public();
        let did = Did::from_public_key(&key);
        assert!(did.as_str().starts_with("did:key:z"));
        let parsed = Did::parse(did.as_str()).unwrap();
        assert_eq!(parsed.public_key().unwrap(), key);
    }

    #[test]
    fn test_archive_round_trip() {
        let (_, _, delegation) = grant(&["clock/*", "space/blob/add"]);
        let archived = delegation.archive().unwrap();
        let extracted = Delegation::extract(&archived).unwrap();
        assert_eq!(extracted, delegation);
        // archive is deterministic, so the link is stable
        assert_eq!(extracted.link().unwrap(), delegation.link().unwrap());
    }

    #[test]
    fn test_format_round_trip() {
        let (_, _, delegation) = grant(&["*"]);
        let text = delegation.format().unwrap();
        assert_eq!(Delegation::parse(&text).unwrap(), delegation);
    }

    #[test]
    fn test_tampered_archive_rejected() {
        let (_, _, delegation) = grant(&["*"]);
        let mut archived = delegation.archive().unwrap();
        let n = archived.len();
        archived[n - 1] ^= 0xff;
        assert!(Delegation::extract(&archived).is_err());
    }

    #[test]
    fn test_ability_booleans() {
        let (_, _, delegation) = grant(&["clock/advance", "space/blob/add"]);
        assert!(delegation.can_mutate_clock());
        assert!(delegation.can_upload());

        let (_, _, delegation) = grant(&["clock/*"]);
        assert!(delegation.can_mutate_clock());
        assert!(!delegation.can_upload());

        let (_, _, delegation) = grant(&["*"]);
        assert!(delegation.can_mutate_clock());
        assert!(delegation.can_upload());
    }

    #[test]
    fn test_covers_wildcards() {
        let (owner, _, delegation) = grant(&["clock/*"]);
        let resource = Did::from_public_key(&owner.public());
        assert!(delegation.allows(&resource, CLOCK_ADVANCE));
        assert!(delegation.allows(&resource, CLOCK_HEAD));
        assert!(!delegation.allows(&resource, SPACE_BLOB_ADD));
        let other = Did::from_public_key(&SecretKey::generate().public());
        assert!(!delegation.allows(&other, CLOCK_ADVANCE));
    }

    #[test]
    fn test_mixed_resources_rejected() {
        let owner = SecretKey::generate();
        let other = Did::from_public_key(&SecretKey::generate().public());
        let resource = Did::from_public_key(&owner.public());
        let delegation = Delegation::delegate(
            &owner,
            other.clone(),
            vec![
                Capability::new(resource, "*"),
                Capability::new(other, "*"),
            ],
        )
        .unwrap();
        assert!(matches!(
            delegation.resource(),
            Err(CapabilityError::Denied(_))
        ));
    }
}
