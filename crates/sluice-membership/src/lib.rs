//! Cluster membership manager for the sluice streaming platform.
//!
//! This crate admits, identifies, updates, decommissions and recommissions
//! brokers in a cluster whose authoritative configuration is a replicated
//! state machine backed by the controller consensus log.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────────────┐
//!                      │    Controller log (raft) │
//!                      └────────────┬─────────────┘
//!                                   │ committed batches
//!                                   ▼
//!       ┌──────────────────────────────────────────────────┐
//!       │                 MembersManager                    │
//!       │  command applier · join coordinator · cfg update  │
//!       └───┬──────────────┬───────────────┬───────────┬───┘
//!           │ fan-out      │               │           │
//!           ▼              ▼               ▼           ▼
//!    ┌────────────┐  ┌──────────┐  ┌─────────────┐ ┌────────┐
//!    │ ShardSet   │  │ IdRegistry│ │ Connection  │ │ Update │
//!    │ (members   │  │ uuid → id │ │ Cache       │ │ Queue  │
//!    │  tables)   │  │           │ │ Reconciler  │ │        │
//!    └────────────┘  └──────────┘  └─────────────┘ └────────┘
//! ```
//!
//! The consensus layer, partition allocator, drain manager and feature gate
//! table are external collaborators reached through the traits in
//! [`traits`]; this crate never implements consensus itself.

#![warn(missing_docs)]

pub mod command;
pub mod connections;
pub mod id_registry;
pub mod members_table;
pub mod rpc;
pub mod shard;
pub mod traits;
pub mod update_queue;

mod config_update;
mod join;
pub mod manager;

pub use command::{
    ConfigurationUpdateReply, ConfigurationUpdateRequest, HelloReply, HelloRequest,
    JoinNodeReply, JoinNodeRequest, NodeCommand, NodeUpdate, NodeUpdateKind, RecordBatch,
    RecordBatchType,
};
pub use connections::{ChangedNodes, ConnectionCache};
pub use id_registry::IdRegistry;
pub use manager::{MembersManager, MembershipDeps};
pub use members_table::MembersTable;
pub use rpc::ControllerRpcServer;
pub use shard::{ShardHandle, ShardSet};
pub use update_queue::{NodeUpdateQueue, QueueAborted};
