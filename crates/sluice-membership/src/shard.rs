//! Actor-per-shard replication of the members table.
//!
//! Every shard of the process holds its own [`MembersTable`] replica, owned
//! by a dedicated task with a typed mailbox. Mutations are fanned out to
//! every shard and the replies collected; a disagreement between shards is
//! a fatal invariant violation, not a recoverable error. Message passing is
//! sequentially consistent per (sender, shard) pair, which is what keeps
//! replicas aligned with the controller log offset order.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use sluice_core::types::{Broker, NodeId, NodeMetadata, Offset, RemovedNodeMetadata};
use sluice_core::Errc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::command::NodeCommand;
use crate::members_table::MembersTable;
use crate::traits::DrainManager;

const MAILBOX_DEPTH: usize = 128;

/// A request to a shard actor.
enum ShardRequest {
    Apply { offset: Offset, cmd: NodeCommand, reply: oneshot::Sender<Errc> },
    UpdateBrokers { offset: Offset, brokers: Vec<Broker>, reply: oneshot::Sender<()> },
    SetDrain { enabled: bool, reply: oneshot::Sender<()> },
    Get { id: NodeId, reply: oneshot::Sender<Option<NodeMetadata>> },
    Contains { id: NodeId, reply: oneshot::Sender<bool> },
    GetRemoved { id: NodeId, reply: oneshot::Sender<Option<RemovedNodeMetadata>> },
    Snapshot { reply: oneshot::Sender<Vec<(NodeId, NodeMetadata)>> },
    Occupancy { reply: oneshot::Sender<(Vec<NodeId>, Vec<NodeId>)> },
    Stop { reply: oneshot::Sender<()> },
}

/// Handle to one shard's members table replica.
#[derive(Clone)]
pub struct ShardHandle {
    shard: usize,
    tx: mpsc::Sender<ShardRequest>,
}

impl ShardHandle {
    /// Applies a membership command on this shard.
    pub async fn apply(&self, offset: Offset, cmd: NodeCommand) -> Errc {
        self.request(|reply| ShardRequest::Apply { offset, cmd, reply }).await
    }

    /// Reconciles this shard's table with a new configuration.
    pub async fn update_brokers(&self, offset: Offset, brokers: Vec<Broker>) {
        self.request(|reply| ShardRequest::UpdateBrokers { offset, brokers, reply }).await;
    }

    /// Looks up an active member.
    pub async fn get(&self, id: NodeId) -> Option<NodeMetadata> {
        self.request(|reply| ShardRequest::Get { id, reply }).await
    }

    /// True when `id` is an active member on this shard.
    pub async fn contains(&self, id: NodeId) -> bool {
        self.request(|reply| ShardRequest::Contains { id, reply }).await
    }

    /// Looks up a tombstone.
    pub async fn get_removed(&self, id: NodeId) -> Option<RemovedNodeMetadata> {
        self.request(|reply| ShardRequest::GetRemoved { id, reply }).await
    }

    /// Snapshot of the member set, ascending by id.
    pub async fn snapshot(&self) -> Vec<(NodeId, NodeMetadata)> {
        self.request(|reply| ShardRequest::Snapshot { reply }).await
    }

    /// Active and tombstoned ids, used for id assignment occupancy checks.
    pub async fn occupancy(&self) -> (Vec<NodeId>, Vec<NodeId>) {
        self.request(|reply| ShardRequest::Occupancy { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ShardRequest) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .unwrap_or_else(|_| panic!("shard {} mailbox closed", self.shard));
        reply_rx.await.unwrap_or_else(|_| panic!("shard {} terminated mid-request", self.shard))
    }
}

/// All shards of the local process.
///
/// Shard 0 is the home shard: the command applier runs there and it is the
/// replica consulted for reads that feed id assignment and join
/// validation.
pub struct ShardSet {
    shards: Vec<ShardHandle>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ShardSet {
    /// Spawns `shards` shard actors sharing the given drain manager.
    ///
    /// # Panics
    ///
    /// Panics when `shards` is zero.
    #[must_use]
    pub fn new(shards: usize, drain: Arc<dyn DrainManager>) -> Self {
        assert!(shards > 0, "a process has at least one shard");
        let mut handles = Vec::with_capacity(shards);
        let mut tasks = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
            handles.push(ShardHandle { shard, tx });
            tasks.push(tokio::spawn(run_shard(shard, rx, Arc::clone(&drain))));
        }
        Self { shards: handles, tasks: Mutex::new(tasks) }
    }

    /// Number of shards.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shards.len()
    }

    /// The home shard's handle.
    #[must_use]
    pub fn home(&self) -> &ShardHandle {
        &self.shards[0]
    }

    /// Applies `cmd` on every shard and asserts the replies are unanimous.
    ///
    /// # Panics
    ///
    /// Panics when any two shards disagree on the result code; diverged
    /// replicas cannot be repaired at runtime.
    pub async fn apply_on_all(&self, offset: Offset, cmd: &NodeCommand) -> Errc {
        let results = join_all(
            self.shards.iter().map(|shard| shard.apply(offset, cmd.clone())),
        )
        .await;

        let sentinel = results[0];
        assert!(
            results.iter().all(|r| *r == sentinel),
            "state inconsistency across shards detected, expected result: {sentinel}, have: {results:?}",
        );
        sentinel
    }

    /// Reconciles every shard's table with a new configuration.
    pub async fn update_brokers_on_all(&self, offset: Offset, brokers: &[Broker]) {
        join_all(
            self.shards.iter().map(|shard| shard.update_brokers(offset, brokers.to_vec())),
        )
        .await;
    }

    /// Drains or restores every shard.
    pub async fn set_drain_on_all(&self, enabled: bool) {
        join_all(self.shards.iter().map(|shard| {
            shard.request(move |reply| ShardRequest::SetDrain { enabled, reply })
        }))
        .await;
    }

    /// Stops every shard actor and awaits quiescence.
    pub async fn stop(&self) {
        join_all(
            self.shards.iter().map(|shard| shard.request(|reply| ShardRequest::Stop { reply })),
        )
        .await;
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("shard task list lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<ShardRequest>,
    drain: Arc<dyn DrainManager>,
) {
    let mut table = MembersTable::new();
    while let Some(request) = rx.recv().await {
        match request {
            ShardRequest::Apply { offset, cmd, reply } => {
                trace!(shard, offset, cmd = cmd.command_type(), "applying command");
                let _ = reply.send(table.apply(offset, &cmd));
            }
            ShardRequest::UpdateBrokers { offset, brokers, reply } => {
                table.update_brokers(offset, &brokers);
                let _ = reply.send(());
            }
            ShardRequest::SetDrain { enabled, reply } => {
                if enabled {
                    drain.drain().await;
                } else {
                    drain.restore().await;
                }
                let _ = reply.send(());
            }
            ShardRequest::Get { id, reply } => {
                let _ = reply.send(table.get(id).cloned());
            }
            ShardRequest::Contains { id, reply } => {
                let _ = reply.send(table.contains(id));
            }
            ShardRequest::GetRemoved { id, reply } => {
                let _ = reply.send(table.get_removed_metadata_ref(id).cloned());
            }
            ShardRequest::Snapshot { reply } => {
                let _ =
                    reply.send(table.nodes().map(|(id, meta)| (*id, meta.clone())).collect());
            }
            ShardRequest::Occupancy { reply } => {
                let _ = reply.send((table.node_ids(), table.removed_node_ids()));
            }
            ShardRequest::Stop { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
}
