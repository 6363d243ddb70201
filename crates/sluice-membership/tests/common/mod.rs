//! Shared test fixtures: in-process fakes for the manager's trait seams
//! and a harness that wires a complete node together.

// not every test binary exercises every fixture
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use sluice_core::config::MembershipConfig;
use sluice_core::types::{
    Broker, ConfigurationState, GroupConfiguration, LogicalVersion, NodeId, NodeUuid, Offset,
    OldConfiguration,
};
use sluice_core::Errc;
use sluice_membership::traits::{
    CommandReplicator, Consensus, DrainManager, FeatureGates, PartitionAllocator,
};
use sluice_membership::{MembersManager, MembershipDeps, NodeCommand, RecordBatch};

/// In-process consensus fake: holds a group configuration and loops every
/// reconfiguration back into the manager as a committed
/// `raft_configuration` batch, the way the real controller log would.
pub struct MockConsensus {
    config: Mutex<GroupConfiguration>,
    leader: Mutex<Option<NodeId>>,
    elected: AtomicBool,
    log_offset: Arc<AtomicU64>,
    manager: OnceLock<Arc<MembersManager>>,
}

impl MockConsensus {
    pub fn new(initial: Vec<Broker>, log_offset: Arc<AtomicU64>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(GroupConfiguration::simple(initial)),
            leader: Mutex::new(None),
            elected: AtomicBool::new(false),
            log_offset,
            manager: OnceLock::new(),
        })
    }

    pub fn wire(&self, manager: Arc<MembersManager>) {
        self.manager.set(manager).map_err(|_| ()).expect("consensus wired twice");
    }

    pub fn set_leader(&self, leader: Option<NodeId>, elected: bool) {
        *self.leader.lock().unwrap() = leader;
        self.elected.store(elected, Ordering::SeqCst);
    }

    pub fn set_joint(&self, learners: Vec<NodeId>) {
        let mut config = self.config.lock().unwrap();
        config.state = ConfigurationState::Joint;
        config.old_config = Some(OldConfiguration { learners });
    }

    pub fn set_simple(&self) {
        let mut config = self.config.lock().unwrap();
        config.state = ConfigurationState::Simple;
        config.old_config = None;
    }

    /// Removes a broker from the configuration and commits the result,
    /// modeling the reconfiguration that finishes a decommission.
    pub async fn drop_broker(&self, id: NodeId) {
        self.config.lock().unwrap().brokers.retain(|b| b.id != id);
        self.commit_configuration().await;
    }

    /// Commits the current configuration through the manager's applier.
    pub async fn commit_configuration(&self) -> Offset {
        let offset = self.log_offset.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config.lock().unwrap().clone();
        if let Some(manager) = self.manager.get() {
            let errc = manager.apply_update(RecordBatch::raft_configuration(offset, &config)).await;
            assert!(errc.is_success());
        }
        offset
    }
}

#[async_trait]
impl Consensus for MockConsensus {
    async fn group_configuration(&self) -> GroupConfiguration {
        self.config.lock().unwrap().clone()
    }

    async fn is_elected_leader(&self) -> bool {
        self.elected.load(Ordering::SeqCst)
    }

    async fn leader_id(&self) -> Option<NodeId> {
        *self.leader.lock().unwrap()
    }

    async fn latest_configuration_offset(&self) -> Offset {
        self.log_offset.load(Ordering::SeqCst)
    }

    async fn add_group_members(&self, brokers: Vec<Broker>, _revision: u64) -> Result<(), Errc> {
        self.config.lock().unwrap().brokers.extend(brokers);
        self.commit_configuration().await;
        Ok(())
    }

    async fn update_group_member(&self, broker: Broker) -> Result<(), Errc> {
        {
            let mut config = self.config.lock().unwrap();
            let slot = config
                .brokers
                .iter_mut()
                .find(|b| b.id == broker.id)
                .ok_or(Errc::InvalidNodeOperation)?;
            *slot = broker;
        }
        self.commit_configuration().await;
        Ok(())
    }
}

/// Replicator fake that applies commands straight back into the manager at
/// the next log offset.
pub struct LoopbackReplicator {
    log_offset: Arc<AtomicU64>,
    manager: OnceLock<Arc<MembersManager>>,
}

impl LoopbackReplicator {
    pub fn new(log_offset: Arc<AtomicU64>) -> Arc<Self> {
        Arc::new(Self { log_offset, manager: OnceLock::new() })
    }

    pub fn wire(&self, manager: Arc<MembersManager>) {
        self.manager.set(manager).map_err(|_| ()).expect("replicator wired twice");
    }
}

#[async_trait]
impl CommandReplicator for LoopbackReplicator {
    async fn replicate_and_wait(&self, cmd: NodeCommand, _timeout: Duration) -> Errc {
        let manager = self.manager.get().expect("replicator not wired");
        let offset = self.log_offset.fetch_add(1, Ordering::SeqCst) + 1;
        manager.apply_update(RecordBatch::node_command(offset, &cmd)).await
    }
}

/// Allocator fake that records every call.
#[derive(Default)]
pub struct MockAllocator {
    pub node_lists: Mutex<Vec<Vec<NodeId>>>,
    pub decommissioned: Mutex<Vec<NodeId>>,
    pub recommissioned: Mutex<Vec<NodeId>>,
}

impl MockAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PartitionAllocator for MockAllocator {
    async fn update_allocation_nodes(&self, brokers: Vec<Broker>) {
        self.node_lists.lock().unwrap().push(brokers.iter().map(|b| b.id).collect());
    }

    async fn decommission_node(&self, id: NodeId) {
        self.decommissioned.lock().unwrap().push(id);
    }

    async fn recommission_node(&self, id: NodeId) {
        self.recommissioned.lock().unwrap().push(id);
    }
}

/// Drain fake counting per-shard invocations.
#[derive(Default)]
pub struct MockDrain {
    pub drains: AtomicUsize,
    pub restores: AtomicUsize,
}

impl MockDrain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DrainManager for MockDrain {
    async fn drain(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }

    async fn restore(&self) {
        self.restores.fetch_add(1, Ordering::SeqCst);
    }
}

/// Feature gate fake.
pub struct StaticFeatures {
    active: AtomicBool,
}

impl StaticFeatures {
    pub fn new(active: bool) -> Arc<Self> {
        Arc::new(Self { active: AtomicBool::new(active) })
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl FeatureGates for StaticFeatures {
    fn node_id_assignment_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn latest_logical_version(&self) -> LogicalVersion {
        7
    }
}

/// A complete in-process node.
pub struct TestNode {
    pub manager: Arc<MembersManager>,
    pub consensus: Arc<MockConsensus>,
    pub allocator: Arc<MockAllocator>,
    pub drain: Arc<MockDrain>,
    pub features: Arc<StaticFeatures>,
    pub log_offset: Arc<AtomicU64>,
}

impl TestNode {
    /// Builds a node and commits the initial configuration so the members
    /// table reflects it.
    pub async fn new(
        self_broker: Broker,
        node_uuid: NodeUuid,
        initial_brokers: Vec<Broker>,
        feature_active: bool,
    ) -> Self {
        Self::with_config(
            self_broker,
            node_uuid,
            initial_brokers,
            feature_active,
            MembershipConfig { join_retry_timeout_ms: 20, ..Default::default() },
        )
        .await
    }

    pub async fn with_config(
        self_broker: Broker,
        node_uuid: NodeUuid,
        initial_brokers: Vec<Broker>,
        feature_active: bool,
        config: MembershipConfig,
    ) -> Self {
        let log_offset = Arc::new(AtomicU64::new(0));
        let consensus = MockConsensus::new(initial_brokers, Arc::clone(&log_offset));
        let replicator = LoopbackReplicator::new(Arc::clone(&log_offset));
        let allocator = MockAllocator::new();
        let drain = MockDrain::new();
        let features = StaticFeatures::new(feature_active);

        let manager = MembersManager::new(
            &config,
            self_broker,
            node_uuid,
            MembershipDeps {
                consensus: consensus.clone(),
                replicator: replicator.clone(),
                features: features.clone(),
                allocator: allocator.clone(),
                drain: drain.clone(),
            },
        );
        consensus.wire(Arc::clone(&manager));
        replicator.wire(Arc::clone(&manager));
        consensus.commit_configuration().await;

        Self { manager, consensus, allocator, drain, features, log_offset }
    }

    /// Applies a node command as a committed batch at the next offset.
    pub async fn apply(&self, cmd: NodeCommand) -> Errc {
        let offset = self.log_offset.fetch_add(1, Ordering::SeqCst) + 1;
        self.manager.apply_update(RecordBatch::node_command(offset, &cmd)).await
    }

    pub fn initial_uuid_map(&self, entries: &[(NodeUuid, NodeId)]) {
        let map: BTreeMap<NodeUuid, NodeId> = entries.iter().copied().collect();
        self.manager.apply_initial_node_uuid_map(map.into_iter().collect());
    }
}

/// Collects pending node updates, failing the test instead of hanging when
/// none arrive.
pub async fn take_updates(node: &TestNode) -> Vec<sluice_membership::NodeUpdate> {
    tokio::time::timeout(Duration::from_secs(1), node.manager.get_node_updates())
        .await
        .expect("timed out waiting for node updates")
        .expect("update queue aborted")
}

/// A broker descriptor on localhost.
pub fn broker(id: NodeId, port: u16) -> Broker {
    Broker::new(id, format!("127.0.0.1:{port}").parse().unwrap())
}

/// Reserves a free localhost port.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}
