//! Trait seams to the members manager's external collaborators.
//!
//! The consensus layer, partition allocator, drain manager, feature gate
//! table and command replication path all live outside this crate; the
//! manager reaches them exclusively through these traits so tests can
//! substitute in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use sluice_core::types::{Broker, GroupConfiguration, LogicalVersion, NodeId, Offset};
use sluice_core::Errc;

use crate::command::NodeCommand;

/// The controller consensus group, addressed only at its interface.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Returns the current group configuration.
    async fn group_configuration(&self) -> GroupConfiguration;

    /// True when the local node is the elected leader.
    async fn is_elected_leader(&self) -> bool;

    /// The current leader's id, when known.
    async fn leader_id(&self) -> Option<NodeId>;

    /// Offset of the latest committed configuration.
    async fn latest_configuration_offset(&self) -> Offset;

    /// Adds brokers to the consensus group at the given revision.
    ///
    /// # Errors
    ///
    /// Returns the wire error code when the reconfiguration is rejected.
    async fn add_group_members(
        &self,
        brokers: Vec<Broker>,
        revision: u64,
    ) -> Result<(), Errc>;

    /// Replaces a member's broker record in the consensus group.
    ///
    /// # Errors
    ///
    /// Returns the wire error code when the reconfiguration is rejected.
    async fn update_group_member(&self, broker: Broker) -> Result<(), Errc>;
}

/// Replicates a node command through the controller log and waits for it
/// to be applied locally.
#[async_trait]
pub trait CommandReplicator: Send + Sync {
    /// Appends `cmd` to the controller log and waits until the local
    /// state machine has applied it, or until `timeout`.
    async fn replicate_and_wait(&self, cmd: NodeCommand, timeout: Duration) -> Errc;
}

/// The partition allocator's membership-facing surface.
#[async_trait]
pub trait PartitionAllocator: Send + Sync {
    /// Replaces the allocator's node list after a configuration change.
    async fn update_allocation_nodes(&self, brokers: Vec<Broker>);

    /// Excludes a node from future allocations and starts moving its
    /// partitions away.
    async fn decommission_node(&self, id: NodeId);

    /// Re-admits a node whose decommission was cancelled.
    async fn recommission_node(&self, id: NodeId);
}

/// Per-shard drain control, invoked when the local node enters or leaves
/// maintenance mode.
#[async_trait]
pub trait DrainManager: Send + Sync {
    /// Begins moving partition leadership away from this shard.
    async fn drain(&self);

    /// Restores normal operation on this shard.
    async fn restore(&self);
}

/// Cluster feature gates.
pub trait FeatureGates: Send + Sync {
    /// True once every node understands UUID-based id assignment.
    fn node_id_assignment_active(&self) -> bool;

    /// The latest logical version this build speaks.
    fn latest_logical_version(&self) -> LogicalVersion;
}
