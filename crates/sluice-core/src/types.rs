//! Node identity, broker descriptors and consensus configuration snapshots.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cluster-assigned node identifier.
///
/// A 32-bit signed integer; [`UNASSIGNED_NODE_ID`] encodes "not yet chosen"
/// and `i32::MAX` is reserved as the id-space exhaustion marker.
pub type NodeId = i32;

/// Sentinel for a node that has not been assigned an id yet.
pub const UNASSIGNED_NODE_ID: NodeId = -1;

/// Offset into the controller log.
pub type Offset = u64;

/// Logical cluster version carried by join requests.
pub type LogicalVersion = i32;

/// Durable node identity minted at first boot.
///
/// The UUID never changes for the lifetime of a node's data directory, even
/// when the cluster reassigns its [`NodeId`]. On the wire it travels as an
/// opaque 16-byte value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUuid(Uuid);

impl NodeUuid {
    /// Mints a fresh random node UUID.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps raw 16 bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses a UUID from a wire-level byte slice.
    ///
    /// Returns `None` unless the slice is exactly 16 bytes long.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Returns the underlying 16 bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the bytes as an owned vector for wire encoding.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A named advertised endpoint for client traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Listener name (e.g. "internal", "external").
    pub name: String,
    /// Advertised host.
    pub host: String,
    /// Advertised port.
    pub port: u16,
}

impl BrokerEndpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { name: name.into(), host: host.into(), port }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.name, self.host, self.port)
    }
}

/// Broker properties negotiated at join time.
///
/// `cores` is the number of shards the broker runs; the configuration
/// update path rejects any attempt to decrease it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerProperties {
    /// Number of shards (reactor cores) on the broker.
    pub cores: u32,
}

impl Default for BrokerProperties {
    fn default() -> Self {
        Self { cores: 1 }
    }
}

/// Descriptor of a node participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    /// Cluster-assigned id, or [`UNASSIGNED_NODE_ID`] before assignment.
    pub id: NodeId,
    /// Internode RPC listener address.
    pub rpc_address: SocketAddr,
    /// Advertised client-facing listeners, ordered.
    pub kafka_advertised_listeners: Vec<BrokerEndpoint>,
    /// Optional failure-domain identifier.
    pub rack: Option<String>,
    /// Mutation-constrained properties.
    pub properties: BrokerProperties,
}

impl Broker {
    /// Creates a broker descriptor with default properties and no listeners.
    #[must_use]
    pub fn new(id: NodeId, rpc_address: SocketAddr) -> Self {
        Self {
            id,
            rpc_address,
            kafka_advertised_listeners: Vec::new(),
            rack: None,
            properties: BrokerProperties::default(),
        }
    }

    /// Sets the advertised listeners.
    #[must_use]
    pub fn with_listeners(mut self, listeners: Vec<BrokerEndpoint>) -> Self {
        self.kafka_advertised_listeners = listeners;
        self
    }

    /// Sets the core count.
    #[must_use]
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.properties.cores = cores;
        self
    }

    /// Sets the rack identifier.
    #[must_use]
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{id: {}, rpc: {}, cores: {}}}", self.id, self.rpc_address, self.properties.cores)
    }
}

/// Lifecycle state of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipState {
    /// Fully participating.
    Active,
    /// Maintenance mode requested, partitions moving away.
    Draining,
    /// Maintenance mode complete, no partition leadership held.
    Drained,
    /// Scheduled for removal, reallocation in progress.
    Decommissioning,
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Drained => "drained",
            Self::Decommissioning => "decommissioning",
        };
        f.write_str(s)
    }
}

/// A members table entry: the broker plus its lifecycle state, tagged with
/// the controller log offset at which this state became current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// The broker descriptor.
    pub broker: Broker,
    /// Current lifecycle state.
    pub state: MembershipState,
    /// Offset at which the current state became visible.
    pub update_offset: Offset,
}

/// Tombstone for a decommissioned node.
///
/// A tombstoned id is never reused and its original UUID holder is never
/// allowed to rejoin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedNodeMetadata {
    /// The broker descriptor at the time of removal.
    pub broker: Broker,
    /// Offset of the configuration that dropped the broker.
    pub removed_at_offset: Offset,
}

/// State of the consensus group configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationState {
    /// A single voter set.
    Simple,
    /// Transitional state carrying both old and new voter sets.
    Joint,
}

/// The old half of a joint configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldConfiguration {
    /// Demoted voters pending removal.
    pub learners: Vec<NodeId>,
}

/// Snapshot of the controller group's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfiguration {
    /// Brokers participating in the controller group.
    pub brokers: Vec<Broker>,
    /// Simple or joint.
    pub state: ConfigurationState,
    /// Present only while `state` is [`ConfigurationState::Joint`].
    pub old_config: Option<OldConfiguration>,
}

impl GroupConfiguration {
    /// Creates a simple configuration from a broker list.
    #[must_use]
    pub fn simple(brokers: Vec<Broker>) -> Self {
        Self { brokers, state: ConfigurationState::Simple, old_config: None }
    }

    /// Returns true when `id` participates in the configuration.
    #[must_use]
    pub fn contains_broker(&self, id: NodeId) -> bool {
        self.brokers.iter().any(|b| b.id == id)
    }

    /// Returns true when any broker listens on `addr`.
    #[must_use]
    pub fn contains_address(&self, addr: &SocketAddr) -> bool {
        self.brokers.iter().any(|b| b.rpc_address == *addr)
    }

    /// Looks up a broker by id.
    #[must_use]
    pub fn find_broker(&self, id: NodeId) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.id == id)
    }
}
