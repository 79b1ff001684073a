//! Trustless block gateway over the peer channel.
//!
//! The wire contract mirrors the HTTP gateway: a GET-shaped request for
//! `/ipfs/<cid>` with an `Accept: application/vnd.ipld.raw` header, a
//! status code, and the raw block bytes as the body. `404` means the peer
//! does not have the block. Verification happens client-side in the
//! gateway fetcher; the server just serves bytes.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use iroh::{Endpoint, NodeAddr};
use serde::{Deserialize, Serialize};

use crate::block::BlockError;
use crate::gateway::{BlockChannel, ACCEPT_RAW};
use crate::linked_data::Link;

use super::{BlockSource, GATEWAY_ALPN};

/// Limit on a serialized gateway response (one block plus framing).
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GatewayRequest {
    path: String,
    accept: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GatewayResponse {
    status: u16,
    body: Vec<u8>,
}

/// Gateway transport over an iroh connection to a single peer.
pub struct P2pChannel {
    endpoint: Endpoint,
    addr: NodeAddr,
}

impl P2pChannel {
    pub fn new(endpoint: Endpoint, addr: NodeAddr) -> Self {
        P2pChannel { endpoint, addr }
    }
}

#[async_trait]
impl BlockChannel for P2pChannel {
    async fn request(&self, path: &str, accept: &str) -> Result<(u16, Bytes), anyhow::Error> {
        tracing::debug!("fetching {} from peer {}", path, self.addr.node_id);
        let conn = self
            .endpoint
            .connect(self.addr.clone(), GATEWAY_ALPN)
            .await
            .map_err(|e| anyhow!("connecting to gateway peer: {e}"))?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| anyhow!("opening stream: {e}"))?;

        let request = GatewayRequest {
            path: path.to_string(),
            accept: accept.to_string(),
        };
        let request =
            bincode::serialize(&request).map_err(|e| anyhow!("serializing request: {e}"))?;
        send.write_all(&request)
            .await
            .map_err(|e| anyhow!("writing request: {e}"))?;
        send.finish().map_err(|e| anyhow!("finishing stream: {e}"))?;

        let response = recv
            .read_to_end(MAX_RESPONSE_SIZE)
            .await
            .map_err(|e| anyhow!("reading response: {e}"))?;
        let response: GatewayResponse =
            bincode::deserialize(&response).map_err(|e| anyhow!("deserializing response: {e}"))?;
        Ok((response.status, Bytes::from(response.body)))
    }
}

/// Server side of the block gateway.
#[derive(Clone)]
pub struct GatewayProtocol {
    blocks: Arc<dyn BlockSource>,
}

impl std::fmt::Debug for GatewayProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayProtocol").finish_non_exhaustive()
    }
}

impl GatewayProtocol {
    pub fn new(blocks: Arc<dyn BlockSource>) -> Self {
        GatewayProtocol { blocks }
    }

    async fn respond(&self, request: GatewayRequest) -> GatewayResponse {
        if !request.accept.contains(ACCEPT_RAW) {
            return GatewayResponse {
                status: 501,
                body: b"non-raw response not implemented".to_vec(),
            };
        }
        let Some(cid) = request.path.strip_prefix("/ipfs/") else {
            return GatewayResponse {
                status: 404,
                body: b"not found".to_vec(),
            };
        };
        let link = match Link::from_str(cid) {
            Ok(link) => link,
            Err(err) => {
                return GatewayResponse {
                    status: 400,
                    body: format!("invalid CID: {err}").into_bytes(),
                }
            }
        };
        match self.blocks.block(&link).await {
            Ok(block) => GatewayResponse {
                status: 200,
                body: block.bytes().to_vec(),
            },
            Err(BlockError::NotFound(_)) => GatewayResponse {
                status: 404,
                body: b"not found".to_vec(),
            },
            Err(err) => {
                tracing::error!("getting block {link}: {err}");
                GatewayResponse {
                    status: 500,
                    body: b"failed to get block".to_vec(),
                }
            }
        }
    }

    async fn handle_connection(self, conn: Connection) -> Result<(), AcceptError> {
        let (mut send, mut recv) = conn.accept_bi().await?;
        let request = recv
            .read_to_end(1024 * 1024)
            .await
            .map_err(|e| AcceptError::from(std::io::Error::other(e)))?;
        let request: GatewayRequest = bincode::deserialize(&request).map_err(|e| {
            let err: Box<dyn std::error::Error + Send + Sync> =
                anyhow!("deserializing gateway request: {e}").into();
            AcceptError::from(err)
        })?;
        tracing::debug!("gateway request for {}", request.path);

        let response = self.respond(request).await;
        let response = bincode::serialize(&response).map_err(|e| {
            let err: Box<dyn std::error::Error + Send + Sync> =
                anyhow!("serializing gateway response: {e}").into();
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
}

impl iroh::protocol::ProtocolHandler for GatewayProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let this = self.clone();
        Box::pin(async move { this.handle_connection(conn).await })
    }
}
