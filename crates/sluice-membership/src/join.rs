//! The cluster-join protocol.
//!
//! Client side: walk the seed servers in order, retry with jitter until
//! admitted. Server side: validate the request, forward to the leader when
//! necessary, drive UUID registration and finally add the broker to the
//! consensus group.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sluice_core::config::SeedServer;
use sluice_core::types::{NodeUuid, UNASSIGNED_NODE_ID};
use sluice_core::Errc;
use tracing::{debug, info, warn};

use crate::command::{
    ConfigurationUpdateRequest, JoinNodeReply, JoinNodeRequest, NodeCommand,
};
use crate::connections::one_shot_client;
use crate::manager::MembersManager;
use crate::rpc::{join_reply_from_proto, proto};

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Jittered delay between join rounds: the base plus up to one extra base.
fn jittered(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
    base + Duration::from_millis(extra)
}

impl MembersManager {
    /// Entry point called once the consensus layer is up.
    ///
    /// When the local broker is already part of the consensus
    /// configuration (a restart), only a configuration refresh may be
    /// needed; otherwise the join loop runs in the background until the
    /// node is admitted or the manager stops.
    pub async fn join_cluster(self: &Arc<Self>) {
        if self.is_already_member().await {
            let this = Arc::clone(self);
            self.spawn(async move { this.maybe_update_current_node_configuration().await });
        } else {
            self.join_controller_group();
        }
    }

    /// True when the local broker appears in the consensus configuration.
    pub async fn is_already_member(&self) -> bool {
        self.consensus.group_configuration().await.contains_broker(self.self_broker().id)
    }

    fn join_controller_group(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.spawn(async move {
            debug!("trying to join the cluster");
            let mut shutdown = this.shutdown_rx();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let request = this.build_join_request();
                let result = this.dispatch_join_to_seed_servers(request).await;
                let admitted = matches!(&result, Ok(reply) if reply.success);
                if admitted || this.is_already_member().await {
                    break;
                }

                let delay = jittered(this.join_retry_base);
                info!(delay_ms = delay.as_millis() as u64, "next cluster join attempt");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        debug!("aborting join sequence");
                        break;
                    }
                }
            }
            if this.is_already_member().await {
                this.maybe_update_current_node_configuration().await;
            }
        });
    }

    fn build_join_request(&self) -> JoinNodeRequest {
        JoinNodeRequest {
            logical_version: self.features.latest_logical_version(),
            node_uuid: self.node_uuid().to_vec(),
            node: self.self_broker().clone(),
        }
    }

    /// Walks the seed servers in order, returning the first successful
    /// reply.
    ///
    /// # Errors
    ///
    /// Returns [`Errc::SeedServersExhausted`] when every seed failed or
    /// refused.
    pub(crate) async fn dispatch_join_to_seed_servers(
        &self,
        request: JoinNodeRequest,
    ) -> Result<JoinNodeReply, Errc> {
        metrics::counter!("sluice_membership_join_attempts").increment(1);
        for seed in self.seed_servers() {
            let result = if seed.addr == self.self_broker().rpc_address {
                debug!("using current node as a seed server");
                self.handle_join_request(request.clone()).await
            } else {
                self.dispatch_join_to_remote(seed, request.clone()).await
            };

            match result {
                Ok(reply) if reply.success => return Ok(reply),
                Ok(_) => {
                    warn!(seed = %seed.addr, "error joining cluster using seed server - not allowed to join");
                }
                Err(errc) => {
                    warn!(seed = %seed.addr, error = %errc, "error joining cluster using seed server");
                }
            }
        }
        Err(Errc::SeedServersExhausted)
    }

    async fn dispatch_join_to_remote(
        &self,
        seed: &SeedServer,
        request: JoinNodeRequest,
    ) -> Result<JoinNodeReply, Errc> {
        info!(target = %seed.addr, "sending join request");
        let mut client = one_shot_client(seed.addr, self.rpc_tls(), self.join_timeout)
            .await
            .map_err(|e| {
                debug!(target = %seed.addr, error = %e, "failed to reach seed server");
                Errc::JoinRequestDispatchError
            })?;
        let reply = client
            .join_node(proto::JoinNodeRequest::from(request))
            .await
            .map_err(|_| Errc::JoinRequestDispatchError)?;
        join_reply_from_proto(reply.into_inner())
    }

    /// Validates and handles an inbound join request.
    ///
    /// Non-leaders forward to the leader and pass its reply through. On the
    /// leader this drives UUID registration through the controller log and
    /// finally adds the broker to the consensus group.
    ///
    /// # Errors
    ///
    /// Returns the wire error code for malformed requests, dispatch
    /// failures and rejected reconfigurations. A refusal to admit (wrong
    /// id, tombstoned UUID, address conflict) is not an error: it comes
    /// back as `success = false`.
    pub async fn handle_join_request(
        &self,
        req: JoinNodeRequest,
    ) -> Result<JoinNodeReply, Errc> {
        let assignment_active = self.features.node_id_assignment_active();
        let has_uuid = !req.node_uuid.is_empty();

        if assignment_active && !has_uuid {
            warn!(node_id = req.node.id, "invalid join request, node UUID is required");
            return Err(Errc::InvalidRequest);
        }
        let requested_id = (req.node.id >= 0).then_some(req.node.id);
        if !assignment_active && requested_id.is_none() {
            warn!("got request to assign node ID, but feature not active");
            return Err(Errc::InvalidRequest);
        }
        let node_uuid = if has_uuid {
            match NodeUuid::from_slice(&req.node_uuid) {
                Some(uuid) => Some(uuid),
                None => {
                    warn!(
                        len = req.node_uuid.len(),
                        "invalid join request, expected 16-byte node UUID or empty"
                    );
                    return Err(Errc::InvalidRequest);
                }
            }
        } else {
            None
        };
        if requested_id.is_none() && !has_uuid {
            warn!("node ID assignment attempt had no node UUID");
            return Err(Errc::InvalidRequest);
        }

        let node_uuid_str =
            node_uuid.map(|u| u.to_string()).unwrap_or_else(|| "no node_uuid".to_string());
        info!(
            node_id = req.node.id,
            node_uuid = %node_uuid_str,
            version = req.logical_version,
            "processing join request"
        );

        if !self.consensus.is_elected_leader().await {
            debug!("not the leader; dispatching join request to leader node");
            return self.forward_join_to_leader(req).await;
        }

        if assignment_active && has_uuid {
            let node_uuid = node_uuid.expect("validated above");
            let bound = self.registry.lock().expect("id registry lock poisoned").get(&node_uuid);

            match requested_id {
                None => {
                    return match bound {
                        // register the UUID and return the assigned id; the
                        // node comes back with another join request once its
                        // consensus subsystem runs under that id
                        None => self.replicate_new_node_uuid(node_uuid, None).await,
                        // duplicate assignment request
                        Some(id) => Ok(JoinNodeReply { success: true, assigned_id: id }),
                    };
                }
                Some(requested) => match bound {
                    None => {
                        let reply = self.replicate_new_node_uuid(node_uuid, Some(requested)).await?;
                        if !reply.success {
                            return Ok(reply);
                        }
                    }
                    Some(bound_id) => {
                        if requested != bound_id {
                            return Ok(JoinNodeReply {
                                success: false,
                                assigned_id: UNASSIGNED_NODE_ID,
                            });
                        }
                        if self.shards.home().get_removed(bound_id).await.is_some() {
                            warn!(
                                node_id = bound_id,
                                node_uuid = %node_uuid,
                                "preventing decommissioned node from joining the cluster"
                            );
                            return Ok(JoinNodeReply {
                                success: false,
                                assigned_id: UNASSIGNED_NODE_ID,
                            });
                        }
                    }
                },
            }
        }

        let cfg = self.consensus.group_configuration().await;

        // a known broker re-joining carries fresh configuration; treat the
        // join as a configuration update against self
        if cfg.contains_broker(req.node.id) {
            info!(
                node_id = req.node.id,
                "broker is already a member of the cluster, updating configuration"
            );
            let node_id = req.node.id;
            let update = ConfigurationUpdateRequest {
                node: req.node,
                target_node: self.self_broker().id,
            };
            let reply = self.handle_configuration_update_request(update).await?;
            return Ok(JoinNodeReply {
                success: reply.success,
                assigned_id: if reply.success { node_id } else { UNASSIGNED_NODE_ID },
            });
        }

        // pre-UUID clusters cannot distinguish two nodes sharing an address
        if !assignment_active && cfg.contains_address(&req.node.rpc_address) {
            info!(
                node_id = req.node.id,
                address = %req.node.rpc_address,
                "broker address conflicts with the address of another node"
            );
            return Ok(JoinNodeReply { success: false, assigned_id: UNASSIGNED_NODE_ID });
        }

        // warm the connection so the consensus append can reach the
        // requester
        if req.node.id != self.self_broker().id {
            self.connections.add_or_replace(req.node.id, req.node.rpc_address).await;
        }

        match self.consensus.add_group_members(vec![req.node.clone()], 0).await {
            Ok(()) => Ok(JoinNodeReply { success: true, assigned_id: req.node.id }),
            Err(errc) => {
                warn!(node = %req.node, error = %errc, "error adding node to cluster");
                Err(errc)
            }
        }
    }

    async fn forward_join_to_leader(&self, req: JoinNodeRequest) -> Result<JoinNodeReply, Errc> {
        let leader_id = self.consensus.leader_id().await.ok_or(Errc::NoLeaderController)?;
        let leader = self
            .consensus
            .group_configuration()
            .await
            .find_broker(leader_id)
            .cloned()
            .ok_or(Errc::NoLeaderController)?;

        self.connections.add_or_replace(leader_id, leader.rpc_address).await;
        let mut client =
            self.connections.client(leader_id, self.join_timeout).await.map_err(|e| {
                warn!(error = %e, "error while dispatching join request to leader node");
                Errc::JoinRequestDispatchError
            })?;
        match client.join_node(proto::JoinNodeRequest::from(req)).await {
            Ok(reply) => join_reply_from_proto(reply.into_inner()),
            Err(status) => {
                warn!(error = %status, "error while dispatching join request to leader node");
                Err(Errc::JoinRequestDispatchError)
            }
        }
    }

    /// Replicates a `RegisterNodeUuid` command and reads back the binding.
    async fn replicate_new_node_uuid(
        &self,
        uuid: NodeUuid,
        node_id: Option<sluice_core::types::NodeId>,
    ) -> Result<JoinNodeReply, Errc> {
        debug!(node_uuid = %uuid, requested_id = ?node_id, "replicating registration of node UUID");
        let errc = self
            .replicator
            .replicate_and_wait(
                NodeCommand::RegisterNodeUuid { uuid, node_id },
                REGISTRATION_TIMEOUT,
            )
            .await;
        debug!(node_uuid = %uuid, result = %errc, "registration replication completed");
        errc.into_result()?;

        let assigned = self.get_node_id(&uuid);
        if let Some(requested) = node_id {
            if assigned != requested {
                warn!(
                    node_uuid = %uuid,
                    requested_id = requested,
                    assigned_id = assigned,
                    "node registration completed but UUID already assigned elsewhere"
                );
                return Err(Errc::InvalidRequest);
            }
        }
        Ok(JoinNodeReply { success: true, assigned_id: assigned })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_two_bases() {
        let base = Duration::from_millis(100);
        for _ in 0..64 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d <= base * 2);
        }
    }
}
