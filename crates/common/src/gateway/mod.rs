//! Trustless block gateway client.
//!
//! A gateway serves raw blocks at `/ipfs/<cid>`. The fetcher never trusts
//! the transport: every body is re-hashed with the algorithm the link
//! declares and compared against the link's digest before the block is
//! returned.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::block::{verify, BlockError, Fetcher};
use crate::linked_data::{Block, Link};

/// Accept header value requesting a raw block.
pub const ACCEPT_RAW: &str = "application/vnd.ipld.raw";

/// Transport used by the gateway fetcher. Carries a GET-shaped request and
/// returns the response status with the full body.
#[async_trait]
pub trait BlockChannel: Send + Sync {
    async fn request(&self, path: &str, accept: &str) -> Result<(u16, Bytes), anyhow::Error>;
}

/// Gateway transport over plain HTTP.
pub struct HttpChannel {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpChannel {
    pub fn new(endpoint: Url) -> Self {
        HttpChannel {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlockChannel for HttpChannel {
    async fn request(&self, path: &str, accept: &str) -> Result<(u16, Bytes), anyhow::Error> {
        let url = self
            .endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| anyhow::anyhow!("constructing URL: {e}"))?;
        tracing::debug!("fetching block: {}", url);
        let res = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("sending request: {e}"))?;
        let status = res.status().as_u16();
        let body = res
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("reading body: {e}"))?;
        Ok((status, body))
    }
}

/// Block fetcher over a trustless gateway channel.
pub struct GatewayFetcher<C> {
    channel: C,
}

impl<C: BlockChannel> GatewayFetcher<C> {
    pub fn new(channel: C) -> Self {
        GatewayFetcher { channel }
    }
}

#[async_trait]
impl<C: BlockChannel> Fetcher for GatewayFetcher<C> {
    async fn get(&self, link: &Link) -> Result<Block, BlockError> {
        let path = format!("/ipfs/{link}");
        let (status, body) = self.channel.request(&path, ACCEPT_RAW).await?;

        if status == 404 {
            return Err(BlockError::NotFound(*link));
        }
        if status != 200 {
            return Err(BlockError::Io(anyhow::anyhow!(
                "gateway responded with status {status} for {link}"
            )));
        }

        verify(link, &body)?;
        Ok(Block::new(*link, body))
    }
}
