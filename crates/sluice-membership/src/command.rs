//! Controller commands, record batches and membership protocol messages.
//!
//! All membership mutations are encoded as a [`NodeCommand`] and replicated
//! through the controller log. A committed batch reaches the members
//! manager either as a node command or as a raw consensus-group
//! reconfiguration ([`RecordBatchType::RaftConfiguration`]); the payloads
//! are bincode-encoded and must round-trip bit-identically.

use serde::{Deserialize, Serialize};
use sluice_core::types::{
    Broker, GroupConfiguration, LogicalVersion, NodeId, NodeUuid, Offset,
};

/// Commands that go through the controller log.
///
/// Only membership-related commands are listed here; unrelated command
/// kinds are multiplexed by the controller state machine before they ever
/// reach the members manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCommand {
    /// Bind a node UUID to a node id, or assign a fresh id when `node_id`
    /// is `None`.
    RegisterNodeUuid {
        /// Durable node identity.
        uuid: NodeUuid,
        /// Requested id, if the caller already has one.
        node_id: Option<NodeId>,
    },

    /// Schedule a node for removal.
    DecommissionNode {
        /// Target node.
        id: NodeId,
    },

    /// Cancel an in-progress decommission.
    RecommissionNode {
        /// Target node.
        id: NodeId,
    },

    /// Signal that partition reallocations away from a node completed.
    ///
    /// This is a signal, not a membership change; the members table is
    /// never consulted.
    FinishReallocations {
        /// Target node.
        id: NodeId,
    },

    /// Enter or leave maintenance mode.
    MaintenanceMode {
        /// Target node.
        id: NodeId,
        /// True to drain, false to restore.
        enabled: bool,
    },
}

impl NodeCommand {
    /// Returns a human-readable command type string.
    #[must_use]
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::RegisterNodeUuid { .. } => "RegisterNodeUuid",
            Self::DecommissionNode { .. } => "DecommissionNode",
            Self::RecommissionNode { .. } => "RecommissionNode",
            Self::FinishReallocations { .. } => "FinishReallocations",
            Self::MaintenanceMode { .. } => "MaintenanceMode",
        }
    }

    /// Returns the node id this command targets, if it carries one.
    #[must_use]
    pub fn target(&self) -> Option<NodeId> {
        match self {
            Self::RegisterNodeUuid { node_id, .. } => *node_id,
            Self::DecommissionNode { id }
            | Self::RecommissionNode { id }
            | Self::FinishReallocations { id }
            | Self::MaintenanceMode { id, .. } => Some(*id),
        }
    }
}

/// Kind of a committed controller-log batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordBatchType {
    /// Raw consensus-group reconfiguration.
    RaftConfiguration,
    /// A [`NodeCommand`].
    NodeCommand,
}

/// A committed controller-log batch as handed to the command applier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBatch {
    /// Batch kind, selecting how the payload is decoded.
    pub batch_type: RecordBatchType,
    /// Offset of the batch in the controller log.
    pub base_offset: Offset,
    /// bincode-encoded payload.
    pub payload: Vec<u8>,
}

impl RecordBatch {
    /// Encodes a node command batch.
    ///
    /// # Panics
    ///
    /// Panics if bincode cannot encode the command; commands are plain data
    /// and this indicates programmer error.
    #[must_use]
    pub fn node_command(base_offset: Offset, cmd: &NodeCommand) -> Self {
        let payload = bincode::serialize(cmd).expect("node command is bincode-encodable");
        Self { batch_type: RecordBatchType::NodeCommand, base_offset, payload }
    }

    /// Encodes a raft configuration batch.
    ///
    /// # Panics
    ///
    /// Panics if bincode cannot encode the configuration.
    #[must_use]
    pub fn raft_configuration(base_offset: Offset, cfg: &GroupConfiguration) -> Self {
        let payload = bincode::serialize(cfg).expect("group configuration is bincode-encodable");
        Self { batch_type: RecordBatchType::RaftConfiguration, base_offset, payload }
    }

    /// Decodes the payload as a node command.
    ///
    /// # Errors
    ///
    /// Returns the bincode error when the payload is not a valid command.
    pub fn decode_command(&self) -> Result<NodeCommand, bincode::Error> {
        bincode::deserialize(&self.payload)
    }

    /// Decodes the payload as a group configuration.
    ///
    /// # Errors
    ///
    /// Returns the bincode error when the payload is not a valid
    /// configuration.
    pub fn decode_configuration(&self) -> Result<GroupConfiguration, bincode::Error> {
        bincode::deserialize(&self.payload)
    }
}

/// Kind of a downstream membership event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdateKind {
    /// Broker entered the consensus configuration.
    Added,
    /// Broker was scheduled for removal.
    Decommissioned,
    /// An in-progress decommission was cancelled.
    Recommissioned,
    /// Reallocations away from the broker completed.
    ReallocationFinished,
}

impl std::fmt::Display for NodeUpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Added => "added",
            Self::Decommissioned => "decommissioned",
            Self::Recommissioned => "recommissioned",
            Self::ReallocationFinished => "reallocation_finished",
        };
        f.write_str(s)
    }
}

/// A membership event delivered to downstream consumers in controller-log
/// offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeUpdate {
    /// The affected node.
    pub id: NodeId,
    /// What happened.
    pub kind: NodeUpdateKind,
    /// Offset of the originating batch.
    pub offset: Offset,
}

impl std::fmt::Display for NodeUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{node_id: {}, kind: {}, offset: {}}}", self.id, self.kind, self.offset)
    }
}

/// Request to join the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinNodeRequest {
    /// Logical cluster version of the sender.
    pub logical_version: LogicalVersion,
    /// Opaque UUID bytes; empty on pre-UUID senders, otherwise 16 bytes.
    pub node_uuid: Vec<u8>,
    /// The joining broker's descriptor.
    pub node: Broker,
}

/// Reply to a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinNodeReply {
    /// Whether the node may proceed.
    pub success: bool,
    /// Assigned node id, or `UNASSIGNED_NODE_ID` on failure.
    pub assigned_id: NodeId,
}

/// A running node announcing a change to its own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationUpdateRequest {
    /// The updated broker descriptor.
    pub node: Broker,
    /// The node the sender believes it is talking to.
    pub target_node: NodeId,
}

/// Reply to a configuration update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationUpdateReply {
    /// Whether the update was accepted.
    pub success: bool,
}

/// Best-effort startup notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloRequest {
    /// The announcing node.
    pub peer: NodeId,
    /// Unix epoch milliseconds of the peer's process start.
    pub start_time: u64,
}

/// Reply to a hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloReply {
    /// Always `Success` from this implementation.
    pub error: sluice_core::Errc,
}

#[cfg(test)]
mod tests {
    use sluice_core::types::{BrokerEndpoint, ConfigurationState, OldConfiguration};

    use super::*;

    fn sample_commands() -> Vec<NodeCommand> {
        vec![
            NodeCommand::RegisterNodeUuid { uuid: NodeUuid::from_bytes([7u8; 16]), node_id: None },
            NodeCommand::RegisterNodeUuid {
                uuid: NodeUuid::from_bytes([9u8; 16]),
                node_id: Some(4),
            },
            NodeCommand::DecommissionNode { id: 2 },
            NodeCommand::RecommissionNode { id: 2 },
            NodeCommand::FinishReallocations { id: 3 },
            NodeCommand::MaintenanceMode { id: 1, enabled: true },
        ]
    }

    #[test]
    fn test_command_roundtrip_bit_identical() {
        for cmd in sample_commands() {
            let batch = RecordBatch::node_command(17, &cmd);
            let decoded = batch.decode_command().unwrap();
            assert_eq!(decoded, cmd);
            // re-encoding must produce identical bytes
            assert_eq!(RecordBatch::node_command(17, &decoded).payload, batch.payload);
        }
    }

    #[test]
    fn test_configuration_roundtrip() {
        let cfg = GroupConfiguration {
            brokers: vec![Broker::new(1, "127.0.0.1:9001".parse().unwrap())
                .with_listeners(vec![BrokerEndpoint::new("internal", "10.0.0.1", 9092)])],
            state: ConfigurationState::Joint,
            old_config: Some(OldConfiguration { learners: vec![2, 3] }),
        };

        let batch = RecordBatch::raft_configuration(5, &cfg);
        assert_eq!(batch.batch_type, RecordBatchType::RaftConfiguration);

        let decoded = batch.decode_configuration().unwrap();
        assert_eq!(decoded.brokers, cfg.brokers);
        assert_eq!(decoded.state, ConfigurationState::Joint);
        assert_eq!(decoded.old_config.unwrap().learners, vec![2, 3]);
    }

    #[test]
    fn test_decode_command_rejects_garbage() {
        let batch = RecordBatch {
            batch_type: RecordBatchType::NodeCommand,
            base_offset: 0,
            payload: vec![0xff; 3],
        };
        assert!(batch.decode_command().is_err());
    }

    #[test]
    fn test_command_type_names() {
        assert_eq!(NodeCommand::DecommissionNode { id: 1 }.command_type(), "DecommissionNode");
        assert_eq!(
            NodeCommand::MaintenanceMode { id: 1, enabled: false }.command_type(),
            "MaintenanceMode"
        );
    }
}
