//! The node id registry: authoritative-on-leader UUID to node-id binding.
//!
//! The registry lives on the home shard only and is mutated exclusively by
//! applied `RegisterNodeUuid` commands, so every replica that applies the
//! same controller log arrives at the same bindings.

use std::collections::{HashMap, HashSet};

use sluice_core::types::{NodeId, NodeUuid, UNASSIGNED_NODE_ID};
use tracing::info;

/// In-memory UUID to node-id registry plus the id assignment counter.
///
/// The mapping is a partial bijection: no two UUIDs share an id and no two
/// ids share a UUID. `next_assigned_id` stays strictly greater than every
/// id ever bound or tombstoned.
#[derive(Debug, Default)]
pub struct IdRegistry {
    id_by_uuid: HashMap<NodeUuid, NodeId>,
    assigned_ids: HashSet<NodeId>,
    next_assigned_id: NodeId,
}

impl IdRegistry {
    /// Creates an empty registry with assignment starting at id 1.
    #[must_use]
    pub fn new() -> Self {
        Self { id_by_uuid: HashMap::new(), assigned_ids: HashSet::new(), next_assigned_id: 1 }
    }

    /// One-shot load of the persisted UUID map at startup.
    ///
    /// Seeds `next_assigned_id` just past the highest loaded id so ids of
    /// removed seed servers (which never go through [`Self::get_or_assign`])
    /// are accounted for. A loaded id of `i32::MAX` pins the counter at the
    /// exhaustion marker.
    ///
    /// # Panics
    ///
    /// Panics when called on a non-empty registry; the initial map must be
    /// applied exactly once.
    pub fn apply_initial_map(&mut self, id_by_uuid: HashMap<NodeUuid, NodeId>) {
        assert!(self.id_by_uuid.is_empty(), "will not overwrite existing node UUID map");
        for id in id_by_uuid.values() {
            if *id == i32::MAX {
                self.next_assigned_id = *id;
                break;
            }
            self.next_assigned_id = self.next_assigned_id.max(*id + 1);
        }
        self.assigned_ids = id_by_uuid.values().copied().collect();
        self.id_by_uuid = id_by_uuid;
    }

    /// Attempts to bind `uuid` to the id it requested.
    ///
    /// Returns true when the binding was created or already exists with the
    /// same id; false when either side of the pair is taken by someone
    /// else. An id already present in the active members table but absent
    /// here is the rolling-upgrade case and is bound as-if fresh (the
    /// caller logs it).
    ///
    /// # Panics
    ///
    /// Panics when `requested_id` is the unassigned sentinel; callers must
    /// resolve assignment through [`Self::get_or_assign`] first.
    pub fn try_register(&mut self, uuid: NodeUuid, requested_id: NodeId) -> bool {
        assert!(requested_id != UNASSIGNED_NODE_ID, "invalid node ID");
        if let Some(bound) = self.id_by_uuid.get(&uuid) {
            return *bound == requested_id;
        }
        if self.assigned_ids.contains(&requested_id) {
            // another UUID holds this id
            return false;
        }
        info!(node_id = requested_id, node_uuid = %uuid, "Registering node ID");
        self.bind(uuid, requested_id);
        true
    }

    /// Returns the id bound to `uuid`, assigning the next free one when the
    /// UUID is unknown.
    ///
    /// `occupied` reports ids that are taken outside the registry (active
    /// members table entries and tombstones); assignment skips them so a
    /// decommissioned node's id is never re-issued. Returns `None` when the
    /// counter reaches `i32::MAX` without finding a free slot.
    pub fn get_or_assign(
        &mut self,
        uuid: NodeUuid,
        occupied: impl Fn(NodeId) -> bool,
    ) -> Option<NodeId> {
        if let Some(id) = self.id_by_uuid.get(&uuid) {
            return Some(*id);
        }
        while occupied(self.next_assigned_id) || self.assigned_ids.contains(&self.next_assigned_id)
        {
            if self.next_assigned_id == i32::MAX {
                return None;
            }
            self.next_assigned_id += 1;
        }
        if self.next_assigned_id == i32::MAX {
            return None;
        }
        let id = self.next_assigned_id;
        self.bind(uuid, id);
        info!(node_uuid = %uuid, node_id = id, "Assigned node ID");
        Some(id)
    }

    /// Returns the id bound to `uuid`.
    ///
    /// # Panics
    ///
    /// Panics when the UUID is unknown; registration must be completed
    /// before calling.
    #[must_use]
    pub fn get_node_id(&self, uuid: &NodeUuid) -> NodeId {
        *self
            .id_by_uuid
            .get(uuid)
            .expect("node registration must be completed before calling")
    }

    /// Returns the id bound to `uuid`, if any.
    #[must_use]
    pub fn get(&self, uuid: &NodeUuid) -> Option<NodeId> {
        self.id_by_uuid.get(uuid).copied()
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.id_by_uuid.len()
    }

    /// True when no binding exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_by_uuid.is_empty()
    }

    fn bind(&mut self, uuid: NodeUuid, id: NodeId) {
        self.id_by_uuid.insert(uuid, id);
        self.assigned_ids.insert(id);
        if id < i32::MAX {
            self.next_assigned_id = self.next_assigned_id.max(id + 1);
        } else {
            self.next_assigned_id = i32::MAX;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn uuid(n: u8) -> NodeUuid {
        NodeUuid::from_bytes([n; 16])
    }

    #[test]
    fn test_get_or_assign_starts_at_one() {
        let mut reg = IdRegistry::new();
        assert_eq!(reg.get_or_assign(uuid(1), |_| false), Some(1));
        assert_eq!(reg.get_or_assign(uuid(2), |_| false), Some(2));
        // idempotent for a known uuid
        assert_eq!(reg.get_or_assign(uuid(1), |_| false), Some(1));
    }

    #[test]
    fn test_get_or_assign_skips_occupied_ids() {
        let mut reg = IdRegistry::new();
        // ids 1..=3 are held by the members table / tombstones
        assert_eq!(reg.get_or_assign(uuid(1), |id| id <= 3), Some(4));
    }

    #[test]
    fn test_get_or_assign_exhaustion() {
        let mut reg = IdRegistry::new();
        reg.apply_initial_map(HashMap::from([(uuid(9), i32::MAX)]));
        assert_eq!(reg.get_or_assign(uuid(1), |_| false), None);
    }

    #[test]
    fn test_try_register_fresh_and_idempotent() {
        let mut reg = IdRegistry::new();
        assert!(reg.try_register(uuid(1), 7));
        // identical replay succeeds without mutating state
        assert!(reg.try_register(uuid(1), 7));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&uuid(1)), Some(7));
    }

    #[test]
    fn test_try_register_conflicts() {
        let mut reg = IdRegistry::new();
        assert!(reg.try_register(uuid(1), 7));
        // same uuid, different id
        assert!(!reg.try_register(uuid(1), 8));
        // different uuid, same id
        assert!(!reg.try_register(uuid(2), 7));
    }

    #[test]
    fn test_try_register_bumps_assignment_counter() {
        let mut reg = IdRegistry::new();
        assert!(reg.try_register(uuid(1), 5));
        assert_eq!(reg.get_or_assign(uuid(2), |_| false), Some(6));
    }

    #[test]
    #[should_panic(expected = "invalid node ID")]
    fn test_try_register_rejects_unassigned_sentinel() {
        let mut reg = IdRegistry::new();
        reg.try_register(uuid(1), UNASSIGNED_NODE_ID);
    }

    #[test]
    fn test_apply_initial_map_seeds_counter() {
        let mut reg = IdRegistry::new();
        reg.apply_initial_map(HashMap::from([(uuid(1), 3), (uuid(2), 8)]));
        assert_eq!(reg.get(&uuid(1)), Some(3));
        assert_eq!(reg.get_or_assign(uuid(3), |_| false), Some(9));
    }

    #[test]
    #[should_panic(expected = "will not overwrite")]
    fn test_apply_initial_map_rejects_second_load() {
        let mut reg = IdRegistry::new();
        reg.apply_initial_map(HashMap::new());
        reg.apply_initial_map(HashMap::new());
    }

    #[test]
    #[should_panic(expected = "registration must be completed")]
    fn test_get_node_id_requires_registration() {
        let reg = IdRegistry::new();
        reg.get_node_id(&uuid(1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        TryRegister(u8, NodeId),
        GetOrAssign(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), 1..64i32).prop_map(|(u, id)| Op::TryRegister(u, id)),
            any::<u8>().prop_map(Op::GetOrAssign),
        ]
    }

    proptest! {
        /// For any call sequence the registry stays a bijection and the
        /// assignment counter strictly dominates every bound and
        /// tombstoned id.
        #[test]
        fn prop_bijection_and_counter_dominance(
            ops in proptest::collection::vec(op_strategy(), 1..64),
            tombstones in proptest::collection::hash_set(1..32i32, 0..8),
        ) {
            let mut reg = IdRegistry::new();
            for op in ops {
                match op {
                    Op::TryRegister(u, id) => {
                        let _ = reg.try_register(uuid(u), id);
                    }
                    Op::GetOrAssign(u) => {
                        let _ = reg.get_or_assign(uuid(u), |id| tombstones.contains(&id));
                    }
                }

                // bijection: distinct uuids never share an id
                let mut seen = std::collections::HashSet::new();
                for (_, id) in reg.id_by_uuid.iter() {
                    prop_assert!(seen.insert(*id), "id {} bound twice", id);
                }
                // counter dominance over bound ids
                for (_, id) in reg.id_by_uuid.iter() {
                    prop_assert!(reg.next_assigned_id > *id);
                }
            }
        }
    }
}
