//! Internode RPC connection cache and its membership reconciler.
//!
//! The cache holds one lazily-connected gRPC client per peer broker and is
//! kept in lock-step with the consensus configuration: a reconciliation
//! pass removes clients for departed brokers and (re)creates clients for
//! added or re-addressed ones. Each pass driven by a configuration batch
//! carries the offset it reflects and the cache refuses to regress it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sluice_core::config::RpcTlsConfig;
use sluice_core::types::{Broker, NodeId, Offset};
use thiserror::Error;
use tokio::sync::RwLock;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, trace};

use crate::rpc::proto::controller_service_client::ControllerServiceClient;

/// Errors raised when a peer client cannot be produced.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer is not present in the cache.
    #[error("unknown peer node {0}")]
    UnknownNode(NodeId),

    /// The peer address does not form a valid URI.
    #[error("invalid endpoint uri: {0}")]
    InvalidUri(String),

    /// TLS material could not be loaded.
    #[error("tls material: {0}")]
    Tls(#[from] std::io::Error),

    /// Transport-level connection failure.
    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Membership diff handed to the reconciler.
#[derive(Debug, Clone, Default)]
pub struct ChangedNodes {
    /// Brokers in the new configuration but not in the members table.
    pub added: Vec<Broker>,
    /// Brokers in both whose record differs.
    pub updated: Vec<Broker>,
    /// Ids in the members table but not in the new configuration.
    pub removed: Vec<NodeId>,
}

impl ChangedNodes {
    /// True when the diff carries no work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct PeerEntry {
    addr: SocketAddr,
    channel: Option<Channel>,
}

/// Cache of controller-protocol clients keyed by peer node id.
pub struct ConnectionCache {
    self_id: NodeId,
    tls: RpcTlsConfig,
    peers: RwLock<HashMap<NodeId, PeerEntry>>,
    last_update_offset: AtomicU64,
}

impl ConnectionCache {
    /// Creates an empty cache for the given local node.
    #[must_use]
    pub fn new(self_id: NodeId, tls: RpcTlsConfig) -> Self {
        Self {
            self_id,
            tls,
            peers: RwLock::new(HashMap::new()),
            last_update_offset: AtomicU64::new(0),
        }
    }

    /// Offset of the last configuration reflected by the cache.
    #[must_use]
    pub fn last_update_offset(&self) -> Offset {
        self.last_update_offset.load(Ordering::Acquire)
    }

    /// Advances the reflected offset without reconciling, used at startup
    /// when the cache is warmed directly from the current configuration.
    pub fn advance_update_offset(&self, offset: Offset) {
        self.last_update_offset.fetch_max(offset, Ordering::AcqRel);
    }

    /// Registers or re-addresses a peer, dropping any cached channel when
    /// the address changed.
    pub async fn add_or_replace(&self, id: NodeId, addr: SocketAddr) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&id) {
            Some(entry) if entry.addr == addr => {}
            _ => {
                trace!(node_id = id, %addr, "caching peer endpoint");
                peers.insert(id, PeerEntry { addr, channel: None });
            }
        }
    }

    /// Drops a peer and its channel.
    pub async fn remove(&self, id: NodeId) {
        if self.peers.write().await.remove(&id).is_some() {
            debug!(node_id = id, "removed peer connection");
        }
    }

    /// True when a peer entry exists.
    pub async fn contains(&self, id: NodeId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    /// Cached peer ids, ascending.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Produces a connected client for `id`, dialing lazily and caching
    /// the channel for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the peer is unknown or the dial
    /// fails.
    pub async fn client(
        &self,
        id: NodeId,
        timeout: Duration,
    ) -> Result<ControllerServiceClient<Channel>, ConnectionError> {
        let addr = {
            let peers = self.peers.read().await;
            let entry = peers.get(&id).ok_or(ConnectionError::UnknownNode(id))?;
            if let Some(channel) = &entry.channel {
                return Ok(ControllerServiceClient::new(channel.clone()));
            }
            entry.addr
        };

        let channel = dial(addr, &self.tls, timeout).await?;

        let mut peers = self.peers.write().await;
        // the peer may have been re-addressed while we were dialing; only
        // cache the channel when it still matches
        if let Some(entry) = peers.get_mut(&id) {
            if entry.addr == addr {
                entry.channel = Some(channel.clone());
            }
        }
        Ok(ControllerServiceClient::new(channel))
    }

    /// Applies a membership diff: removals first, then added and updated
    /// brokers, always ignoring self. Idempotent.
    pub async fn update_connections(&self, changed: ChangedNodes) {
        for id in changed.removed {
            if id == self.self_id {
                continue;
            }
            self.remove(id).await;
        }
        for broker in changed.added.iter().chain(changed.updated.iter()) {
            if broker.id == self.self_id {
                continue;
            }
            self.add_or_replace(broker.id, broker.rpc_address).await;
        }
        metrics::counter!("sluice_membership_connection_updates").increment(1);
    }

    /// Reconciles the cache against the diff of the configuration
    /// committed at `offset`.
    ///
    /// Returns false without touching anything when a reconciliation for a
    /// newer configuration already ran.
    pub async fn reconcile_at(&self, offset: Offset, changed: ChangedNodes) -> bool {
        if offset <= self.last_update_offset.load(Ordering::Acquire) {
            return false;
        }
        self.update_connections(changed).await;
        self.last_update_offset.fetch_max(offset, Ordering::AcqRel);
        true
    }
}

/// Dials a one-shot client outside the cache, used by the join path where
/// the seed server is not (yet) a cached peer.
///
/// # Errors
///
/// Returns [`ConnectionError`] when the dial fails within `timeout`.
pub async fn one_shot_client(
    addr: SocketAddr,
    tls: &RpcTlsConfig,
    timeout: Duration,
) -> Result<ControllerServiceClient<Channel>, ConnectionError> {
    let channel = dial(addr, tls, timeout).await?;
    Ok(ControllerServiceClient::new(channel))
}

async fn dial(
    addr: SocketAddr,
    tls: &RpcTlsConfig,
    timeout: Duration,
) -> Result<Channel, ConnectionError> {
    let scheme = if tls.enabled() { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
        .map_err(|e| ConnectionError::InvalidUri(e.to_string()))?
        .connect_timeout(timeout)
        .timeout(timeout);

    if tls.enabled() {
        endpoint = endpoint.tls_config(client_tls(tls)?)?;
    }

    Ok(endpoint.connect().await?)
}

fn client_tls(tls: &RpcTlsConfig) -> Result<ClientTlsConfig, ConnectionError> {
    let mut config = ClientTlsConfig::new();
    if let Some(ca) = &tls.ca {
        config = config.ca_certificate(Certificate::from_pem(std::fs::read(ca)?));
    }
    if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
        config = config.identity(Identity::from_pem(std::fs::read(cert)?, std::fs::read(key)?));
    }
    Ok(config)
}
