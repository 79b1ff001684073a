//! Capability-invoked clock RPC.
//!
//! A replica invokes `clock/advance` and `clock/head` on a remote by
//! sending a batch of signed invocations over a bidirectional stream. Each
//! invocation carries the agent's signature and the archived delegation
//! proving the agent may act on the bucket. The server answers with one
//! receipt per invocation; failures are structured, not transport errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use ipld_core::ipld::Ipld;
use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use iroh::{Endpoint, NodeAddr};
use serde::{Deserialize, Serialize};

use crate::block::Fetcher;
use crate::bucket::BucketError;
use crate::capability::{CapabilityError, Delegation, Did, CLOCK_ADVANCE, CLOCK_HEAD};
use crate::crypto::SecretKey;
use crate::gateway::GatewayFetcher;
use crate::linked_data::{encode_ipld, CodecError, Link};

use super::{ClockAccess, P2pChannel, CLOCK_ALPN};

/// Limit on a serialized invocation batch or receipt batch.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A capability-authenticated request to run one clock ability on a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub issuer: Did,
    pub audience: Did,
    /// The bucket DID the ability is exercised on.
    pub resource: Did,
    pub ability: String,
    /// Caveat of `clock/advance`: the event to apply.
    pub event: Option<Link>,
    /// Archived delegation proving the issuer's authority.
    pub proof: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Invocation {
    /// Issue an invocation signed by `agent`.
    pub fn issue(
        agent: &SecretKey,
        audience: Did,
        resource: Did,
        ability: &str,
        event: Option<Link>,
        proof: &Delegation,
    ) -> Result<Self, CapabilityError> {
        let issuer = Did::from_public_key(&agent.public());
        let payload = payload_bytes(&issuer, &audience, &resource, ability, event.as_ref())
            .map_err(CapabilityError::Codec)?;
        let signature = agent.sign(&payload).to_bytes().to_vec();
        Ok(Invocation {
            issuer,
            audience,
            resource,
            ability: ability.to_string(),
            event,
            proof: proof.archive()?,
            signature,
        })
    }

    /// Verify the issuer's signature over the invocation payload.
    pub fn verify(&self) -> Result<(), CapabilityError> {
        let payload = payload_bytes(
            &self.issuer,
            &self.audience,
            &self.resource,
            &self.ability,
            self.event.as_ref(),
        )
        .map_err(CapabilityError::Codec)?;
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
}

fn payload_bytes(
    issuer: &Did,
    audience: &Did,
    resource: &Did,
    ability: &str,
    event: Option<&Link>,
) -> Result<Vec<u8>, CodecError> {
    let mut map = BTreeMap::new();
    map.insert("ability".to_string(), Ipld::String(ability.to_string()));
    map.insert("audience".to_string(), Ipld::String(audience.to_string()));
    if let Some(event) = event {
        map.insert("event".to_string(), Ipld::Link(*event.cid()));
    }
    map.insert("issuer".to_string(), Ipld::String(issuer.to_string()));
    map.insert("resource".to_string(), Ipld::String(resource.to_string()));
    encode_ipld(&Ipld::Map(map))
}

/// Structured failure carried in a receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub name: Option<String>,
    pub message: String,
    pub stack: Option<String>,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReceiptOut {
    Ok { head: Vec<Link> },
    Err(Failure),
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub out: ReceiptOut,
}

/// Send a batch of invocations to `addr` and await one receipt each.
pub async fn execute(
    endpoint: &Endpoint,
    addr: NodeAddr,
    invocations: &[Invocation],
) -> Result<Vec<Receipt>, anyhow::Error> {
    tracing::debug!(
        "executing {} invocation(s) against {}",
        invocations.len(),
        addr.node_id
    );
    let conn = endpoint
        .connect(addr, CLOCK_ALPN)
        .await
        .map_err(|e| anyhow!("connecting to remote: {e}"))?;
    let (mut send, mut recv) = conn
        .open_bi()
        .await
        .map_err(|e| anyhow!("opening stream: {e}"))?;

    let request = bincode::serialize(invocations)
        .map_err(|e| anyhow!("serializing invocations: {e}"))?;
    send.write_all(&request)
        .await
        .map_err(|e| anyhow!("writing invocations: {e}"))?;
    send.finish().map_err(|e| anyhow!("finishing stream: {e}"))?;

    let response = recv
        .read_to_end(MAX_MESSAGE_SIZE)
        .await
        .map_err(|e| anyhow!("reading receipts: {e}"))?;
    let receipts: Vec<Receipt> =
        bincode::deserialize(&response).map_err(|e| anyhow!("deserializing receipts: {e}"))?;
    if receipts.len() != invocations.len() {
        return Err(anyhow!(
            "expected {} receipt(s), got {}",
            invocations.len(),
            receipts.len()
        ));
    }
    Ok(receipts)
}

/// Server side of the clock RPC.
#[derive(Clone)]
pub struct ClockProtocol {
    clocks: Arc<dyn ClockAccess>,
    endpoint: Endpoint,
}

impl std::fmt::Debug for ClockProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockProtocol").finish_non_exhaustive()
    }
}

impl ClockProtocol {
    pub fn new(clocks: Arc<dyn ClockAccess>, endpoint: Endpoint) -> Self {
        ClockProtocol { clocks, endpoint }
    }

    async fn handle_connection(self, conn: Connection) -> Result<(), AcceptError> {
        let (mut send, mut recv) = conn.accept_bi().await?;
        let request = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| AcceptError::from(std::io::Error::other(e)))?;
        let invocations: Vec<Invocation> = bincode::deserialize(&request).map_err(|e| {
            let err: Box<dyn std::error::Error + Send + Sync> =
                anyhow!("deserializing invocations: {e}").into();
            AcceptError::from(err)
        })?;
        tracing::debug!("handling {} invocation(s)", invocations.len());

        let invoker = conn.remote_node_id().ok();
        let mut receipts = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let out = match self.execute_invocation(&invocation, invoker).await {
                Ok(head) => ReceiptOut::Ok { head },
                Err(failure) => {
                    tracing::debug!("invocation failed: {failure}");
                    ReceiptOut::Err(failure)
                }
            };
            receipts.push(Receipt { out });
        }

        let response = bincode::serialize(&receipts).map_err(|e| {
            let err: Box<dyn std::error::Error + Send + Sync> =
                anyhow!("serializing receipts: {e}").into();
            AcceptError::from(err)
        })?;
        send.write_all(&response)
            .await
            .map_err(|e| AcceptError::from(std::io::Error::other(e)))?;
        send.finish()
            .map_err(|e| AcceptError::from(std::io::Error::other(e)))?;
        conn.closed().await;
        Ok(())
    }

    /// Validate and run one invocation. Errors become failure receipts.
    async fn execute_invocation(
        &self,
        invocation: &Invocation,
        invoker: Option<iroh::NodeId>,
    ) -> Result<Vec<Link>, Failure> {
        invocation
            .verify()
            .map_err(|e| failure("InvalidSignature", e))?;
        let proof =
            Delegation::extract(&invocation.proof).map_err(|e| failure("InvalidProof", e))?;
        if proof.audience() != &invocation.issuer {
            return Err(failure(
                "InvalidAudience",
                "proof is not delegated to the invoker",
            ));
        }
        let resource = proof
            .resource()
            .map_err(|e| failure("InvalidProof", e))?;
        if resource != invocation.resource {
            return Err(failure(
                "CapabilityDenied",
                "proof does not name the invoked resource",
            ));
        }
        if !proof.allows(&invocation.resource, &invocation.ability) {
            return Err(failure(
                "CapabilityDenied",
                format!(
                    "proof does not grant {} on {}",
                    invocation.ability, invocation.resource
                ),
            ));
        }

        match invocation.ability.as_str() {
            CLOCK_HEAD => self
                .clocks
                .head(&invocation.resource)
                .await
                .map_err(bucket_failure),
            CLOCK_ADVANCE => {
                let Some(event) = invocation.event else {
                    return Err(failure("MalformedInvocation", "advance without an event"));
                };
                // pull any blocks we are missing back through the
                // invoker's own gateway
                let Some(invoker) = invoker else {
                    return Err(failure("MalformedInvocation", "unknown invoking peer"));
                };
                let fetcher: Arc<dyn Fetcher> = Arc::new(GatewayFetcher::new(P2pChannel::new(
                    self.endpoint.clone(),
                    NodeAddr::from(invoker),
                )));
                self.clocks
                    .advance(&invocation.resource, event, fetcher)
                    .await
                    .map_err(bucket_failure)
            }
            other => Err(failure(
                "UnknownAbility",
                format!("unknown ability: {other}"),
            )),
        }
    }
}

fn failure(name: &str, message: impl ToString) -> Failure {
    Failure {
        name: Some(name.to_string()),
        message: message.to_string(),
        stack: None,
    }
}

fn bucket_failure(err: BucketError) -> Failure {
    let name = match &err {
        BucketError::NotFound => "NotFound",
        BucketError::MissingEvent(_) => "MissingEvent",
        BucketError::Cancelled => "Cancelled",
        BucketError::Capability(_) => "CapabilityDenied",
        _ => "BucketError",
    };
    failure(name, err)
}

impl iroh::protocol::ProtocolHandler for ClockProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let this = self.clone();
        Box::pin(async move { this.handle_connection(conn).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    fn issue() -> (SecretKey, SecretKey, Delegation) {
        let owner = SecretKey::generate();
        let agent = SecretKey::generate();
        let resource = Did::from_public_key(&owner.public());
        let proof = Delegation::delegate(
            &owner,
            Did::from_public_key(&agent.public()),
            vec![Capability::new(resource, "*")],
        )
        .unwrap();
        (owner, agent, proof)
    }

    #[test]
    fn test_invocation_signature() {
        let (owner, agent, proof) = issue();
        let resource = Did::from_public_key(&owner.public());
        let audience = Did::from_public_key(&SecretKey::generate().public());
        let mut invocation = Invocation::issue(
            &agent,
            audience,
            resource,
            CLOCK_ADVANCE,
            Some(Link::of_raw(b"event")),
            &proof,
        )
        .unwrap();
        invocation.verify().unwrap();

        // tampering breaks the signature
        invocation.ability = CLOCK_HEAD.to_string();
        assert!(invocation.verify().is_err());
    }

    #[test]
    fn test_receipt_round_trip() {
        let receipt = Receipt {
            out: ReceiptOut::Err(Failure {
                name: Some("NotFound".to_string()),
                message: "no such bucket".to_string(),
                stack: None,
            }),
        };
        let bytes = bincode::serialize(&receipt).unwrap();
        let decoded: Receipt = bincode::deserialize(&bytes).unwrap();
        match decoded.out {
            ReceiptOut::Err(failure) => {
                assert_eq!(failure.name.as_deref(), Some("NotFound"));
                assert_eq!(failure.message, "no such bucket");
            }
            _ => panic!("expected failure receipt"),
        }
    }
}
