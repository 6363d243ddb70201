//! Core domain types for the sluice streaming platform.
//!
//! This crate carries the types shared by every sluice component: node
//! identity (`NodeId`, `NodeUuid`), broker descriptors, consensus group
//! configuration snapshots, wire-level error codes and the membership
//! configuration surface.
//!
//! Nothing in here performs I/O; the heavier machinery (RPC, the members
//! manager itself) lives in `sluice-membership`.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use error::{Errc, Error, Result};
pub use types::{
    Broker, BrokerEndpoint, BrokerProperties, ConfigurationState, GroupConfiguration,
    MembershipState, NodeId, NodeMetadata, NodeUuid, Offset, OldConfiguration,
    RemovedNodeMetadata, UNASSIGNED_NODE_ID,
};
