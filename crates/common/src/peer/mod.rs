//! Network host: one iroh endpoint per user store.
//!
//! The endpoint is the process-global network state. A [`Peer`] optionally
//! serves two protocols over it: the capability-invoked clock RPC
//! ([`CLOCK_ALPN`]) and the trustless block gateway ([`GATEWAY_ALPN`]).

mod clock_rpc;
mod gateway_rpc;

pub use clock_rpc::{execute, ClockProtocol, Failure, Invocation, Receipt, ReceiptOut};
pub use gateway_rpc::{GatewayProtocol, P2pChannel};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeId};

use crate::block::{BlockError, Fetcher};
use crate::bucket::BucketError;
use crate::capability::Did;
use crate::crypto::SecretKey;
use crate::linked_data::{Block, Link};

// Re-export iroh types for convenience
pub use iroh::NodeAddr;

/// ALPN identifier for the clock RPC protocol
pub const CLOCK_ALPN: &[u8] = b"/fam/clock/1";
/// ALPN identifier for the trustless block gateway protocol
pub const GATEWAY_ALPN: &[u8] = b"/fam/gateway/1";

/// Clock resolution the RPC server executes invocations against.
#[async_trait]
pub trait ClockAccess: Send + Sync + 'static {
    async fn head(&self, id: &Did) -> Result<Vec<Link>, BucketError>;
    async fn advance(
        &self,
        id: &Did,
        event: Link,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Vec<Link>, BucketError>;
}

/// Local block resolution the gateway server answers from.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    async fn block(&self, link: &Link) -> Result<Block, BlockError>;
}

#[derive(Default)]
pub struct PeerBuilder {
    socket_addr: Option<SocketAddr>,
    secret_key: Option<SecretKey>,
    discovery: bool,
}

impl PeerBuilder {
    pub fn new() -> Self {
        PeerBuilder::default()
    }

    /// Socket address to expose the peer on. An ephemeral port is used if
    /// not set.
    pub fn socket_addr(mut self, socket_addr: SocketAddr) -> Self {
        self.socket_addr = Some(socket_addr);
        self
    }

    /// Identity of the peer. A fresh key is generated if not set.
    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    /// Enable mainline DHT discovery. Off by default; tests introduce
    /// peers by direct address instead.
    pub fn discovery(mut self, discovery: bool) -> Self {
        self.discovery = discovery;
        self
    }

    pub async fn build(self) -> Result<Peer, anyhow::Error> {
        let socket_addr = self
            .socket_addr
            .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        let secret_key = self.secret_key.unwrap_or_else(SecretKey::generate);

        let addr = SocketAddrV4::new(
            socket_addr
                .ip()
                .to_string()
                .parse::<Ipv4Addr>()
                .map_err(|e| anyhow::anyhow!("parsing bind address: {e}"))?,
            socket_addr.port(),
        );

        let mut builder = Endpoint::builder()
            .secret_key(secret_key.0.clone())
            .bind_addr_v4(addr);
        if self.discovery {
            let dht = DhtDiscovery::builder()
                .secret_key(secret_key.0.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("building discovery: {e}"))?;
            builder = builder.discovery(dht);
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| anyhow::anyhow!("binding endpoint: {e}"))?;

        tracing::debug!("peer endpoint bound as {}", endpoint.node_id());
        Ok(Peer {
            endpoint,
            router: parking_lot::Mutex::new(None),
        })
    }
}

/// The network half of a user store: an endpoint plus, once listening, a
/// router serving the clock RPC and block gateway.
pub struct Peer {
    endpoint: Endpoint,
    router: parking_lot::Mutex<Option<Router>>,
}

impl Peer {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    /// Serve the clock RPC and block gateway over the endpoint. Idempotent.
    pub fn listen(&self, clocks: Arc<dyn ClockAccess>, blocks: Arc<dyn BlockSource>) {
        let mut router = self.router.lock();
        if router.is_some() {
            return;
        }
        let spawned = Router::builder(self.endpoint.clone())
            .accept(
                CLOCK_ALPN,
                ClockProtocol::new(clocks, self.endpoint.clone()),
            )
            .accept(GATEWAY_ALPN, GatewayProtocol::new(blocks))
            .spawn();
        tracing::debug!("peer {} listening", self.endpoint.node_id());
        *router = Some(spawned);
    }

    /// Close the endpoint and stop serving.
    pub async fn close(&self) {
        let router = self.router.lock().take();
        if let Some(router) = router {
            if let Err(err) = router.shutdown().await {
                tracing::warn!("router shutdown: {err}");
            }
        }
        self.endpoint.close().await;
    }
}
