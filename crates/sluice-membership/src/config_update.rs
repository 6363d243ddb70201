//! The node configuration update flow.
//!
//! A running broker whose RPC address, core count or advertised listeners
//! changed announces the new descriptor to the cluster. The receiver
//! validates it against every known broker, reconciles its own connection
//! cache and either applies the change through the consensus layer (when
//! leader) or forwards it.

use rand::Rng;
use sluice_core::types::{Broker, NodeId, NodeMetadata};
use sluice_core::Errc;
use tracing::{debug, info, trace, warn};

use crate::command::{ConfigurationUpdateReply, ConfigurationUpdateRequest};
use crate::connections::ChangedNodes;
use crate::manager::MembersManager;
use crate::rpc::{configuration_update_reply_from_proto, proto};

/// Validates an updated broker descriptor against the current member set.
///
/// Returns the rejection reason, or `None` when the update is acceptable:
/// a broker may never decrease its core count, and no two brokers may share
/// an RPC address or any advertised listener.
fn check_result_configuration(
    current: &[(NodeId, NodeMetadata)],
    to_update: &Broker,
) -> Option<String> {
    for (id, meta) in current {
        if *id == to_update.id {
            if meta.broker.properties.cores > to_update.properties.cores {
                return Some("core count must not decrease on any broker".to_string());
            }
            continue;
        }

        if meta.broker.rpc_address == to_update.rpc_address {
            return Some(format!(
                "duplicate rpc endpoint {} with existing node {}",
                to_update.rpc_address, id
            ));
        }
        for current_ep in &meta.broker.kafka_advertised_listeners {
            if to_update.kafka_advertised_listeners.iter().any(|ep| ep == current_ep) {
                return Some(format!(
                    "duplicate kafka advertised endpoint {} with existing node {}",
                    current_ep, id
                ));
            }
        }
    }
    None
}

/// Picks the target for an update dispatch: the leader when it is part of
/// the broker list, otherwise a uniformly random member.
fn pick_update_target(leader: Option<NodeId>, brokers: &[Broker]) -> Option<Broker> {
    if let Some(leader_id) = leader {
        if let Some(broker) = brokers.iter().find(|b| b.id == leader_id) {
            return Some(broker.clone());
        }
    }
    if brokers.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..brokers.len());
    Some(brokers[idx].clone())
}

impl MembersManager {
    /// Compares the local broker descriptor with the one in the consensus
    /// configuration and dispatches an update when they differ.
    ///
    /// # Panics
    ///
    /// Panics when the local broker is missing from the configuration;
    /// callers must only invoke this on a node that is already a member.
    pub async fn maybe_update_current_node_configuration(&self) {
        let cfg = self.consensus.group_configuration().await;
        let active = cfg
            .find_broker(self.self_broker().id)
            .cloned()
            .expect("current broker is expected to be present in members configuration");

        if active == *self.self_broker() {
            return;
        }
        debug!(from = %active, to = %self.self_broker(), "broker configuration changed");
        if self.dispatch_configuration_update(self.self_broker().clone()).await {
            info!("node configuration updated successfully");
        }
    }

    /// Pushes an updated broker descriptor at the cluster until it is
    /// accepted.
    ///
    /// Retries forever on failure; a permanent validation rejection keeps
    /// the node retrying by design. Returns false only when the manager is
    /// stopping.
    pub async fn dispatch_configuration_update(&self, broker: Broker) -> bool {
        // right after start this node may have no leader information (it
        // may never receive it when its own address changed), so dispatch
        // to any cluster node and let it forward
        let mut shutdown = self.shutdown_rx();
        loop {
            if *shutdown.borrow() {
                return false;
            }
            let cfg = self.consensus.group_configuration().await;
            let target = pick_update_target(self.consensus.leader_id().await, &cfg.brokers);

            let result = match target {
                Some(target) if target.id == self.self_broker().id => {
                    self.handle_configuration_update_request(ConfigurationUpdateRequest {
                        node: broker.clone(),
                        target_node: self.self_broker().id,
                    })
                    .await
                }
                Some(target) => self.send_configuration_update(&target, broker.clone()).await,
                None => Err(Errc::NoLeaderController),
            };

            match result {
                Ok(reply) if reply.success => return true,
                Ok(_) => debug!("configuration update refused, retrying"),
                Err(errc) => debug!(error = %errc, "configuration update failed, retrying"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.join_retry_base) => {}
                _ = shutdown.changed() => return false,
            }
        }
    }

    async fn send_configuration_update(
        &self,
        target: &Broker,
        node: Broker,
    ) -> Result<ConfigurationUpdateReply, Errc> {
        trace!(target = %target, "dispatching configuration update request");
        self.connections.add_or_replace(target.id, target.rpc_address).await;
        let mut client = self
            .connections
            .client(target.id, self.join_timeout)
            .await
            .map_err(|_| Errc::JoinRequestDispatchError)?;

        let request = ConfigurationUpdateRequest { node, target_node: target.id };
        match client.update_node_configuration(proto::ConfigurationUpdateRequest::from(request)).await
        {
            Ok(reply) => configuration_update_reply_from_proto(reply.into_inner()),
            Err(status) => {
                warn!(error = %status, "error while dispatching configuration update request");
                Err(Errc::JoinRequestDispatchError)
            }
        }
    }

    /// Validates and applies an inbound configuration update request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfigurationUpdate` on validation failure,
    /// `NoLeaderController` when no leader is known and
    /// `JoinRequestDispatchError` when forwarding to the leader fails.
    pub async fn handle_configuration_update_request(
        &self,
        req: ConfigurationUpdateRequest,
    ) -> Result<ConfigurationUpdateReply, Errc> {
        if req.target_node != self.self_broker().id {
            warn!(
                self_id = self.self_broker().id,
                target = req.target_node,
                "current node id is different than requested target, ignoring configuration update"
            );
            return Ok(ConfigurationUpdateReply { success: false });
        }
        trace!(node_id = req.node.id, "handling node configuration update");

        let current = self.shards.home().snapshot().await;
        if let Some(reason) = check_result_configuration(&current, &req.node) {
            warn!(
                node = %req.node,
                reason = %reason,
                "rejecting invalid configuration update"
            );
            return Err(Errc::InvalidConfigurationUpdate);
        }

        self.connections
            .update_connections(ChangedNodes { updated: vec![req.node.clone()], ..Default::default() })
            .await;

        let Some(leader_id) = self.consensus.leader_id().await else {
            warn!(
                node_id = req.node.id,
                "unable to handle configuration update, no leader controller"
            );
            return Err(Errc::NoLeaderController);
        };

        if leader_id == self.self_broker().id {
            return match self.consensus.update_group_member(req.node).await {
                Ok(()) => Ok(ConfigurationUpdateReply { success: true }),
                Err(errc) => {
                    warn!(error = %errc, "unable to handle configuration update");
                    Err(errc)
                }
            };
        }

        // forward to the leader
        let Some(leader) = self.shards.home().get(leader_id).await else {
            return Err(Errc::NoLeaderController);
        };
        self.connections.add_or_replace(leader_id, leader.broker.rpc_address).await;
        let mut client = self
            .connections
            .client(leader_id, self.join_timeout)
            .await
            .map_err(|_| Errc::JoinRequestDispatchError)?;

        let forward = ConfigurationUpdateRequest { node: req.node, target_node: leader_id };
        match client.update_node_configuration(proto::ConfigurationUpdateRequest::from(forward)).await
        {
            Ok(reply) => configuration_update_reply_from_proto(reply.into_inner()),
            Err(status) => {
                warn!(error = %status, "error while dispatching configuration update request");
                Err(Errc::JoinRequestDispatchError)
            }
        }
    }
}
