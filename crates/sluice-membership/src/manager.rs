//! The members manager: command application, lifecycle and composition.
//!
//! One instance exists per process. It owns the id registry, the per-shard
//! members table replicas, the update queue and the connection cache, and
//! is the single entry point for committed controller-log batches that
//! mutate membership. The join and configuration-update flows live in
//! sibling modules but hang off the same type.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sluice_core::config::{MembershipConfig, RpcTlsConfig, SeedServer};
use sluice_core::types::{Broker, GroupConfiguration, NodeId, NodeUuid, Offset};
use sluice_core::Errc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{
    HelloReply, HelloRequest, NodeCommand, NodeUpdate, NodeUpdateKind, RecordBatch,
    RecordBatchType,
};
use crate::connections::{ChangedNodes, ConnectionCache};
use crate::id_registry::IdRegistry;
use crate::rpc::{proto, ControllerRpcServer};
use crate::shard::ShardSet;
use crate::traits::{CommandReplicator, Consensus, DrainManager, FeatureGates, PartitionAllocator};
use crate::update_queue::{NodeUpdateQueue, QueueAborted};

const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// External collaborators handed to [`MembersManager::new`].
pub struct MembershipDeps {
    /// The controller consensus group.
    pub consensus: Arc<dyn Consensus>,
    /// Command replication into the controller log.
    pub replicator: Arc<dyn CommandReplicator>,
    /// Cluster feature gates.
    pub features: Arc<dyn FeatureGates>,
    /// The partition allocator.
    pub allocator: Arc<dyn PartitionAllocator>,
    /// Per-shard drain control.
    pub drain: Arc<dyn DrainManager>,
}

/// The cluster membership manager.
///
/// Construct with [`MembersManager::new`], then drive the lifecycle:
/// `start()` (hello broadcast), `join_cluster()` (admission), committed
/// batches through `apply_update()`, and finally `stop()`.
pub struct MembersManager {
    self_broker: Broker,
    node_uuid: NodeUuid,
    seed_servers: Vec<SeedServer>,
    pub(crate) join_retry_base: Duration,
    pub(crate) join_timeout: Duration,
    rpc_tls: RpcTlsConfig,
    start_time_ms: u64,

    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) replicator: Arc<dyn CommandReplicator>,
    pub(crate) features: Arc<dyn FeatureGates>,
    allocator: Arc<dyn PartitionAllocator>,

    pub(crate) shards: ShardSet,
    pub(crate) connections: Arc<ConnectionCache>,
    pub(crate) registry: Mutex<IdRegistry>,
    updates: NodeUpdateQueue,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MembersManager {
    /// Creates the manager and spawns one members-table actor per shard
    /// (`self_broker.properties.cores`).
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        config: &MembershipConfig,
        self_broker: Broker,
        node_uuid: NodeUuid,
        deps: MembershipDeps,
    ) -> Arc<Self> {
        let shards = ShardSet::new(self_broker.properties.cores.max(1) as usize, deps.drain);
        let connections =
            Arc::new(ConnectionCache::new(self_broker.id, config.rpc_tls.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Arc::new(Self {
            self_broker,
            node_uuid,
            seed_servers: config.seed_servers.clone(),
            join_retry_base: config.join_retry_timeout(),
            join_timeout: Duration::from_secs(2),
            rpc_tls: config.rpc_tls.clone(),
            start_time_ms,
            consensus: deps.consensus,
            replicator: deps.replicator,
            features: deps.features,
            allocator: deps.allocator,
            shards,
            connections,
            registry: Mutex::new(IdRegistry::new()),
            updates: NodeUpdateQueue::new(config.update_queue_capacity),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// The local broker descriptor.
    #[must_use]
    pub fn self_broker(&self) -> &Broker {
        &self.self_broker
    }

    /// The local node's durable UUID.
    #[must_use]
    pub fn node_uuid(&self) -> NodeUuid {
        self.node_uuid
    }

    /// The seed server list the join loop walks.
    #[must_use]
    pub(crate) fn seed_servers(&self) -> &[SeedServer] {
        &self.seed_servers
    }

    pub(crate) fn rpc_tls(&self) -> &RpcTlsConfig {
        &self.rpc_tls
    }

    /// The connection cache, shared with other subsystems that talk to
    /// peers over the controller protocol.
    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionCache> {
        Arc::clone(&self.connections)
    }

    /// Starts the manager: seeds the connection-update offset and sends a
    /// best-effort `hello` to every broker in the current configuration.
    pub async fn start(self: &Arc<Self>) {
        info!("starting cluster members manager");

        let cfg = self.consensus.group_configuration().await;
        for broker in &cfg.brokers {
            if broker.id == self.self_broker.id {
                continue;
            }
            self.connections.add_or_replace(broker.id, broker.rpc_address).await;
            let this = Arc::clone(self);
            let peer = broker.id;
            self.spawn(async move { this.send_hello(peer).await });
        }
        self.connections
            .advance_update_offset(self.consensus.latest_configuration_offset().await);
    }

    /// Serves the controller client protocol on `addr` until `stop()`.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the listener cannot be bound.
    pub async fn start_rpc_server(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(), tonic::transport::Error> {
        let service = ControllerRpcServer::new(Arc::clone(self)).into_service();
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(%addr, "starting controller RPC server");
        let server = tonic::transport::Server::builder().add_service(service);
        self.spawn(async move {
            let result = server
                .serve_with_shutdown(addr, async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "controller RPC server error");
            }
        });

        // give the listener a moment to come up
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    /// One-shot load of the persisted UUID map at startup.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub fn apply_initial_node_uuid_map(
        &self,
        id_by_uuid: std::collections::HashMap<NodeUuid, NodeId>,
    ) {
        if !id_by_uuid.is_empty() {
            debug!(entries = id_by_uuid.len(), "initial node UUID map");
        }
        self.registry.lock().expect("id registry lock poisoned").apply_initial_map(id_by_uuid);
    }

    /// Returns the id bound to `uuid`.
    ///
    /// # Panics
    ///
    /// Panics when registration has not completed; see
    /// [`IdRegistry::get_node_id`].
    #[must_use]
    pub fn get_node_id(&self, uuid: &NodeUuid) -> NodeId {
        self.registry.lock().expect("id registry lock poisoned").get_node_id(uuid)
    }

    /// Applies a committed controller-log batch.
    ///
    /// Invoked by the controller state machine for every batch, strictly in
    /// offset order. The result code is deterministic across replicas.
    pub async fn apply_update(&self, batch: RecordBatch) -> Errc {
        if batch.batch_type == RecordBatchType::RaftConfiguration {
            let cfg = batch
                .decode_configuration()
                .expect("committed raft configuration batch must deserialize");
            // an aborted queue mid-fan-out only happens at shutdown
            let _ = self.handle_raft0_cfg_update(cfg, batch.base_offset).await;
            return Errc::Success;
        }

        let offset = batch.base_offset;
        let cmd = batch.decode_command().expect("committed controller command must deserialize");
        metrics::counter!("sluice_membership_commands_applied", "command" => cmd.command_type())
            .increment(1);

        match &cmd {
            NodeCommand::DecommissionNode { id } => {
                let errc = self.shards.apply_on_all(offset, &cmd).await;
                if errc.is_success() {
                    self.allocator.decommission_node(*id).await;
                    self.enqueue(NodeUpdate {
                        id: *id,
                        kind: NodeUpdateKind::Decommissioned,
                        offset,
                    })
                    .await;
                }
                errc
            }
            NodeCommand::RecommissionNode { id } => {
                let cfg = self.consensus.group_configuration().await;
                if let Some(old) = cfg.old_config.as_ref() {
                    // a demoted voter about to be removed must not be
                    // recommissioned
                    if old.learners.contains(id) {
                        return Errc::InvalidNodeOperation;
                    }
                }
                let errc = self.shards.apply_on_all(offset, &cmd).await;
                if errc.is_success() {
                    self.allocator.recommission_node(*id).await;
                    self.enqueue(NodeUpdate {
                        id: *id,
                        kind: NodeUpdateKind::Recommissioned,
                        offset,
                    })
                    .await;
                }
                errc
            }
            NodeCommand::FinishReallocations { id } => {
                // a signal for downstream consumers, never a members table
                // mutation
                self.enqueue(NodeUpdate {
                    id: *id,
                    kind: NodeUpdateKind::ReallocationFinished,
                    offset,
                })
                .await;
                Errc::Success
            }
            NodeCommand::MaintenanceMode { id, enabled } => {
                let errc = self.shards.apply_on_all(offset, &cmd).await;
                if errc.is_success() && *id == self.self_broker.id {
                    self.shards.set_drain_on_all(*enabled).await;
                }
                errc
            }
            NodeCommand::RegisterNodeUuid { uuid, node_id } => {
                self.apply_register_node_uuid(*uuid, *node_id).await
            }
        }
    }

    /// Returns pending membership events, waiting for at least one.
    ///
    /// # Errors
    ///
    /// Returns [`QueueAborted`] once the manager is stopping.
    pub async fn get_node_updates(&self) -> Result<Vec<NodeUpdate>, QueueAborted> {
        if self.updates.is_empty() {
            return Ok(vec![self.updates.pop_eventually().await?]);
        }
        Ok(self.updates.drain_nonblocking())
    }

    /// Handles an inbound startup notification.
    pub async fn handle_hello(&self, req: HelloRequest) -> HelloReply {
        debug!(peer = req.peer, start_time = req.start_time, "received hello");
        HelloReply { error: Errc::Success }
    }

    /// Stops the manager: aborts the update queue, stops background tasks
    /// and awaits quiescence of the shard actors.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub async fn stop(&self) {
        assert!(
            !self.stopped.swap(true, Ordering::SeqCst),
            "members manager stopped twice"
        );
        info!("stopping cluster members manager");

        let _ = self.shutdown_tx.send(true);
        self.updates.abort();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("task list lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.shards.stop().await;
    }

    pub(crate) fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut guard = self.tasks.lock().expect("task list lock poisoned");
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        guard.push(tokio::spawn(fut));
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    async fn handle_raft0_cfg_update(
        &self,
        cfg: GroupConfiguration,
        offset: Offset,
    ) -> Result<(), QueueAborted> {
        debug!(brokers = cfg.brokers.len(), offset, "updating cluster configuration");

        self.allocator.update_allocation_nodes(cfg.brokers.clone()).await;

        let diff = self.calculate_changed_nodes(&cfg).await;
        let added = diff.added.clone();
        self.shards.update_brokers_on_all(offset, &cfg.brokers).await;

        // a reconciliation for a newer configuration may already have run
        if !self.connections.reconcile_at(offset, diff).await {
            return Ok(());
        }

        for broker in added {
            self.updates
                .push_eventually(NodeUpdate {
                    id: broker.id,
                    kind: NodeUpdateKind::Added,
                    offset,
                })
                .await?;
        }
        Ok(())
    }

    /// Computes the members-table diff against a new configuration: a full
    /// pass classifying every broker as added, updated or removed. An id
    /// present on both sides with a changed record is updated, never
    /// removed-and-added.
    pub(crate) async fn calculate_changed_nodes(&self, cfg: &GroupConfiguration) -> ChangedNodes {
        let current = self.shards.home().snapshot().await;
        let mut changed = ChangedNodes::default();

        for broker in &cfg.brokers {
            match current.iter().find(|(id, _)| *id == broker.id) {
                None => changed.added.push(broker.clone()),
                Some((_, meta)) if meta.broker != *broker => changed.updated.push(broker.clone()),
                Some(_) => {}
            }
        }
        for (id, _) in &current {
            if !cfg.contains_broker(*id) {
                changed.removed.push(*id);
            }
        }
        changed
    }

    async fn apply_register_node_uuid(&self, uuid: NodeUuid, node_id: Option<NodeId>) -> Errc {
        match node_id {
            Some(requested) => {
                info!(node_uuid = %uuid, node_id = requested, "applying registration of node UUID");
                let in_members_table = self.shards.home().contains(requested).await;
                let mut registry = self.registry.lock().expect("id registry lock poisoned");
                if in_members_table && registry.get(&uuid).is_none() {
                    // cluster was upgraded from a pre-UUID version; the id
                    // is legitimately in use by the requester
                    info!(
                        node_id = requested,
                        "registering node ID that is already a member of the cluster"
                    );
                }
                if registry.try_register(uuid, requested) {
                    Errc::Success
                } else {
                    warn!(
                        node_uuid = %uuid,
                        node_id = requested,
                        "couldn't register node UUID, node ID already taken"
                    );
                    Errc::JoinRequestDispatchError
                }
            }
            None => {
                info!(node_uuid = %uuid, "applying registration of node UUID with no node ID");
                let (active, removed) = self.shards.home().occupancy().await;
                let occupied: HashSet<NodeId> =
                    active.into_iter().chain(removed.into_iter()).collect();
                let mut registry = self.registry.lock().expect("id registry lock poisoned");
                match registry.get_or_assign(uuid, |id| occupied.contains(&id)) {
                    Some(id) => {
                        info!(node_uuid = %uuid, node_id = id, "node UUID has node ID");
                        Errc::Success
                    }
                    None => {
                        error!("no more node IDs to assign");
                        Errc::InvalidNodeOperation
                    }
                }
            }
        }
    }

    async fn enqueue(&self, update: NodeUpdate) {
        if let Err(QueueAborted) = self.updates.push_eventually(update).await {
            debug!(%update, "dropping node update, queue aborted");
        }
    }

    async fn send_hello(&self, peer: NodeId) {
        let request = proto::HelloRequest { peer: self.self_broker.id, start_time: self.start_time_ms };
        let mut client = match self.connections.client(peer, HELLO_TIMEOUT).await {
            Ok(client) => client,
            Err(e) => {
                info!(node_id = peer, error = %e, "node is not reachable for hello");
                return;
            }
        };
        match client.hello(request).await {
            Ok(reply) => {
                let errc = Errc::from_wire(reply.into_inner().error);
                if !errc.is_success() {
                    info!(node_id = peer, error = %errc, "hello response contained error");
                }
            }
            Err(status) if status.code() == tonic::Code::Unimplemented => {
                // rolling upgrade: the peer predates the hello endpoint
                debug!(node_id = peer, "ignoring failed hello request");
            }
            Err(status) => {
                info!(node_id = peer, error = %status, "node did not respond to hello");
            }
        }
    }
}
