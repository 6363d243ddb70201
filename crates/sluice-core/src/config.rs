//! Membership configuration surface.
//!
//! These structs are deserialized from the node's TOML configuration file by
//! the embedding application; the membership subsystem consumes them as
//! plain values and defines no CLI surface of its own.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A seed server entry: an address to contact when joining the cluster,
/// optionally pinned to an expected node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedServer {
    /// RPC address of the seed.
    pub addr: SocketAddr,
    /// Expected node id, when known ahead of time.
    pub node_id: Option<NodeId>,
}

impl SeedServer {
    /// Creates a seed server entry without a pinned node id.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, node_id: None }
    }
}

/// TLS material for internode RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcTlsConfig {
    /// Path to the client certificate.
    pub cert: Option<PathBuf>,
    /// Path to the client private key.
    pub key: Option<PathBuf>,
    /// Path to the CA bundle used to verify peers.
    pub ca: Option<PathBuf>,
}

impl RpcTlsConfig {
    /// Returns true when TLS is configured at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.ca.is_some() || self.cert.is_some()
    }
}

/// Configuration consumed by the members manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Ordered list of seed servers to contact when joining.
    pub seed_servers: Vec<SeedServer>,
    /// Base duration for join retry jitter, in milliseconds.
    pub join_retry_timeout_ms: u64,
    /// Capacity of the node update queue.
    pub update_queue_capacity: usize,
    /// TLS material for internode RPC.
    pub rpc_tls: RpcTlsConfig,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            seed_servers: Vec::new(),
            join_retry_timeout_ms: 5_000,
            update_queue_capacity: 100,
            rpc_tls: RpcTlsConfig::default(),
        }
    }
}

impl MembershipConfig {
    /// Returns the join retry base as a [`Duration`].
    #[must_use]
    pub fn join_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.join_retry_timeout_ms)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }
}
