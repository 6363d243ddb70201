//! Per-shard replica of the cluster member set.
//!
//! Every shard holds its own copy; writes are funneled through the owning
//! shard actor in controller-log offset order (see [`crate::shard`]), so
//! reads never contend with writes. `apply` is deterministic: the same
//! command at the same offset yields the same result code on every shard,
//! and the command applier asserts exactly that.

use std::collections::BTreeMap;

use sluice_core::types::{
    Broker, MembershipState, NodeId, NodeMetadata, Offset, RemovedNodeMetadata,
};
use sluice_core::Errc;
use tracing::debug;

use crate::command::NodeCommand;

/// The member set plus tombstones for decommissioned nodes.
#[derive(Debug, Default)]
pub struct MembersTable {
    nodes: BTreeMap<NodeId, NodeMetadata>,
    removed: BTreeMap<NodeId, RemovedNodeMetadata>,
}

impl MembersTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a membership command at `offset`.
    ///
    /// Deterministic: the result code depends only on the table contents
    /// and the command.
    ///
    /// # Panics
    ///
    /// Panics on commands that do not target the members table
    /// (`RegisterNodeUuid`, `FinishReallocations`); the applier never
    /// routes them here.
    pub fn apply(&mut self, offset: Offset, cmd: &NodeCommand) -> Errc {
        match cmd {
            NodeCommand::DecommissionNode { id } => self.apply_decommission(offset, *id),
            NodeCommand::RecommissionNode { id } => self.apply_recommission(offset, *id),
            NodeCommand::MaintenanceMode { id, enabled } => {
                self.apply_maintenance(offset, *id, *enabled)
            }
            NodeCommand::RegisterNodeUuid { .. } | NodeCommand::FinishReallocations { .. } => {
                unreachable!("{} is not a members table command", cmd.command_type())
            }
        }
    }

    /// Reconciles the table with a new consensus configuration committed at
    /// `offset`.
    ///
    /// Brokers absent from `brokers` move to the tombstone map; new ones
    /// enter as active; existing entries keep their lifecycle state but
    /// pick up the new broker record.
    pub fn update_brokers(&mut self, offset: Offset, brokers: &[Broker]) {
        for broker in brokers {
            match self.nodes.get_mut(&broker.id) {
                Some(entry) => {
                    if entry.broker != *broker {
                        entry.broker = broker.clone();
                        entry.update_offset = offset;
                    }
                }
                None => {
                    self.nodes.insert(
                        broker.id,
                        NodeMetadata {
                            broker: broker.clone(),
                            state: MembershipState::Active,
                            update_offset: offset,
                        },
                    );
                }
            }
        }

        let gone: Vec<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| !brokers.iter().any(|b| b.id == *id))
            .collect();
        for id in gone {
            if let Some(entry) = self.nodes.remove(&id) {
                debug!(node_id = id, "Moving broker to tombstone set");
                self.removed.insert(
                    id,
                    RemovedNodeMetadata { broker: entry.broker, removed_at_offset: offset },
                );
            }
        }
    }

    /// Looks up an active member.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&NodeMetadata> {
        self.nodes.get(&id)
    }

    /// True when `id` is an active member.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Looks up a tombstone.
    #[must_use]
    pub fn get_removed_metadata_ref(&self, id: NodeId) -> Option<&RemovedNodeMetadata> {
        self.removed.get(&id)
    }

    /// Iterates members in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeMetadata)> {
        self.nodes.iter()
    }

    /// Active member ids, ascending.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Tombstoned ids, ascending.
    #[must_use]
    pub fn removed_node_ids(&self) -> Vec<NodeId> {
        self.removed.keys().copied().collect()
    }

    /// Current broker records, ascending by id.
    #[must_use]
    pub fn brokers(&self) -> Vec<Broker> {
        self.nodes.values().map(|n| n.broker.clone()).collect()
    }

    /// Number of active members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the table holds no active members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn apply_decommission(&mut self, offset: Offset, id: NodeId) -> Errc {
        match self.nodes.get_mut(&id) {
            Some(entry) if entry.state == MembershipState::Decommissioning => {
                Errc::InvalidNodeOperation
            }
            Some(entry) => {
                entry.state = MembershipState::Decommissioning;
                entry.update_offset = offset;
                Errc::Success
            }
            None => Errc::InvalidNodeOperation,
        }
    }

    fn apply_recommission(&mut self, offset: Offset, id: NodeId) -> Errc {
        match self.nodes.get_mut(&id) {
            Some(entry) if entry.state == MembershipState::Decommissioning => {
                entry.state = MembershipState::Active;
                entry.update_offset = offset;
                Errc::Success
            }
            _ => Errc::InvalidNodeOperation,
        }
    }

    fn apply_maintenance(&mut self, offset: Offset, id: NodeId, enabled: bool) -> Errc {
        match self.nodes.get_mut(&id) {
            Some(entry) => match (entry.state, enabled) {
                (MembershipState::Decommissioning, _) => Errc::InvalidNodeOperation,
                (MembershipState::Active, true) => {
                    entry.state = MembershipState::Draining;
                    entry.update_offset = offset;
                    Errc::Success
                }
                (MembershipState::Draining | MembershipState::Drained, true) => Errc::Success,
                (MembershipState::Draining | MembershipState::Drained, false) => {
                    entry.state = MembershipState::Active;
                    entry.update_offset = offset;
                    Errc::Success
                }
                (MembershipState::Active, false) => Errc::Success,
            },
            None => Errc::InvalidNodeOperation,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sluice_core::types::BrokerEndpoint;

    use super::*;

    fn broker(id: NodeId, port: u16) -> Broker {
        Broker::new(id, format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn test_update_brokers_adds_and_removes() {
        let mut table = MembersTable::new();
        table.update_brokers(1, &[broker(1, 9001), broker(2, 9002)]);
        assert_eq!(table.node_ids(), vec![1, 2]);

        table.update_brokers(2, &[broker(1, 9001)]);
        assert_eq!(table.node_ids(), vec![1]);
        assert!(table.get_removed_metadata_ref(2).is_some());
        assert_eq!(table.get_removed_metadata_ref(2).unwrap().removed_at_offset, 2);
    }

    #[test]
    fn test_update_brokers_keeps_state_on_record_change() {
        let mut table = MembersTable::new();
        table.update_brokers(1, &[broker(1, 9001)]);
        assert_eq!(table.apply(2, &NodeCommand::DecommissionNode { id: 1 }), Errc::Success);

        let updated = broker(1, 9001)
            .with_listeners(vec![BrokerEndpoint::new("internal", "10.0.0.1", 9092)]);
        table.update_brokers(3, &[updated.clone()]);

        let entry = table.get(1).unwrap();
        assert_eq!(entry.state, MembershipState::Decommissioning);
        assert_eq!(entry.broker, updated);
        assert_eq!(entry.update_offset, 3);
    }

    #[test]
    fn test_decommission_recommission_cycle() {
        let mut table = MembersTable::new();
        table.update_brokers(1, &[broker(1, 9001)]);

        assert_eq!(table.apply(2, &NodeCommand::DecommissionNode { id: 1 }), Errc::Success);
        // double decommission rejected
        assert_eq!(
            table.apply(3, &NodeCommand::DecommissionNode { id: 1 }),
            Errc::InvalidNodeOperation
        );
        assert_eq!(table.apply(4, &NodeCommand::RecommissionNode { id: 1 }), Errc::Success);
        assert_eq!(table.get(1).unwrap().state, MembershipState::Active);
        // recommission of an active node rejected
        assert_eq!(
            table.apply(5, &NodeCommand::RecommissionNode { id: 1 }),
            Errc::InvalidNodeOperation
        );
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let mut table = MembersTable::new();
        assert_eq!(
            table.apply(1, &NodeCommand::DecommissionNode { id: 9 }),
            Errc::InvalidNodeOperation
        );
        assert_eq!(
            table.apply(1, &NodeCommand::MaintenanceMode { id: 9, enabled: true }),
            Errc::InvalidNodeOperation
        );
    }

    #[test]
    fn test_maintenance_mode_transitions() {
        let mut table = MembersTable::new();
        table.update_brokers(1, &[broker(1, 9001)]);

        assert_eq!(
            table.apply(2, &NodeCommand::MaintenanceMode { id: 1, enabled: true }),
            Errc::Success
        );
        assert_eq!(table.get(1).unwrap().state, MembershipState::Draining);
        // enabling twice is a no-op
        assert_eq!(
            table.apply(3, &NodeCommand::MaintenanceMode { id: 1, enabled: true }),
            Errc::Success
        );
        assert_eq!(table.get(1).unwrap().update_offset, 2);
        assert_eq!(
            table.apply(4, &NodeCommand::MaintenanceMode { id: 1, enabled: false }),
            Errc::Success
        );
        assert_eq!(table.get(1).unwrap().state, MembershipState::Active);
    }

    #[test]
    fn test_maintenance_rejected_while_decommissioning() {
        let mut table = MembersTable::new();
        table.update_brokers(1, &[broker(1, 9001)]);
        table.apply(2, &NodeCommand::DecommissionNode { id: 1 });
        assert_eq!(
            table.apply(3, &NodeCommand::MaintenanceMode { id: 1, enabled: true }),
            Errc::InvalidNodeOperation
        );
    }

    fn arb_cmd() -> impl Strategy<Value = NodeCommand> {
        prop_oneof![
            (1..6i32).prop_map(|id| NodeCommand::DecommissionNode { id }),
            (1..6i32).prop_map(|id| NodeCommand::RecommissionNode { id }),
            (1..6i32, any::<bool>())
                .prop_map(|(id, enabled)| NodeCommand::MaintenanceMode { id, enabled }),
        ]
    }

    proptest! {
        /// Applying the same committed stream on two independent replicas
        /// yields identical tables and result codes at every offset.
        #[test]
        fn prop_replay_is_deterministic(cmds in proptest::collection::vec(arb_cmd(), 0..48)) {
            let mut a = MembersTable::new();
            let mut b = MembersTable::new();
            let brokers: Vec<Broker> = (1..6).map(|id| broker(id, 9000 + id as u16)).collect();
            a.update_brokers(0, &brokers);
            b.update_brokers(0, &brokers);

            for (i, cmd) in cmds.iter().enumerate() {
                let offset = (i + 1) as Offset;
                let ra = a.apply(offset, cmd);
                let rb = b.apply(offset, cmd);
                prop_assert_eq!(ra, rb);
                prop_assert_eq!(a.node_ids(), b.node_ids());
                for id in a.node_ids() {
                    prop_assert_eq!(a.get(id), b.get(id));
                }
            }
        }

        /// A tombstoned id never coexists with an active entry.
        #[test]
        fn prop_tombstones_exclusive(removals in proptest::collection::vec(1..6i32, 0..6)) {
            let mut table = MembersTable::new();
            let mut live: Vec<Broker> = (1..6).map(|id| broker(id, 9000 + id as u16)).collect();
            table.update_brokers(0, &live);

            for (i, id) in removals.iter().enumerate() {
                live.retain(|b| b.id != *id);
                table.update_brokers((i + 1) as Offset, &live);
                for removed in table.removed_node_ids() {
                    prop_assert!(!table.contains(removed));
                }
            }
        }
    }
}
