//! Controller client protocol: gRPC surface and wire conversions.
//!
//! The generated protobuf types live in [`proto`]; this module converts
//! between them and the domain types in [`crate::command`] and hosts the
//! server-side service implementation, which delegates straight into the
//! [`MembersManager`].
//!
//! Failed requests travel as an [`Errc`] discriminant inside the reply
//! message rather than as a gRPC status, so callers can distinguish
//! protocol-level rejections from transport failures.

use std::sync::Arc;

use sluice_core::types::{Broker, BrokerEndpoint, BrokerProperties, UNASSIGNED_NODE_ID};
use sluice_core::Errc;
use thiserror::Error;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::command::{
    ConfigurationUpdateReply, ConfigurationUpdateRequest, HelloRequest, JoinNodeReply,
    JoinNodeRequest,
};
use crate::manager::MembersManager;

/// Generated gRPC client and server code.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("sluice.controller.v1");
}

/// Errors converting inbound protobuf messages into domain types.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// An address could not be parsed.
    #[error("invalid rpc address '{0}'")]
    InvalidAddress(String),

    /// A port was outside the u16 range.
    #[error("invalid port {0}")]
    InvalidPort(u32),
}

impl From<Broker> for proto::Broker {
    fn from(b: Broker) -> Self {
        Self {
            id: b.id,
            rpc_address: b.rpc_address.to_string(),
            kafka_advertised_listeners: b
                .kafka_advertised_listeners
                .into_iter()
                .map(|ep| proto::BrokerEndpoint {
                    name: ep.name,
                    host: ep.host,
                    port: u32::from(ep.port),
                })
                .collect(),
            rack: b.rack,
            properties: Some(proto::BrokerProperties { cores: b.properties.cores }),
        }
    }
}

impl TryFrom<proto::Broker> for Broker {
    type Error = ProtoError;

    fn try_from(b: proto::Broker) -> Result<Self, Self::Error> {
        let rpc_address = b
            .rpc_address
            .parse()
            .map_err(|_| ProtoError::InvalidAddress(b.rpc_address.clone()))?;
        let mut listeners = Vec::with_capacity(b.kafka_advertised_listeners.len());
        for ep in b.kafka_advertised_listeners {
            let port =
                u16::try_from(ep.port).map_err(|_| ProtoError::InvalidPort(ep.port))?;
            listeners.push(BrokerEndpoint { name: ep.name, host: ep.host, port });
        }
        let properties = b
            .properties
            .map(|p| BrokerProperties { cores: p.cores })
            .ok_or(ProtoError::MissingField("properties"))?;
        Ok(Self {
            id: b.id,
            rpc_address,
            kafka_advertised_listeners: listeners,
            rack: b.rack,
            properties,
        })
    }
}

impl From<JoinNodeRequest> for proto::JoinNodeRequest {
    fn from(req: JoinNodeRequest) -> Self {
        Self {
            logical_version: req.logical_version,
            node_uuid: req.node_uuid,
            node: Some(req.node.into()),
        }
    }
}

impl TryFrom<proto::JoinNodeRequest> for JoinNodeRequest {
    type Error = ProtoError;

    fn try_from(req: proto::JoinNodeRequest) -> Result<Self, Self::Error> {
        let node = req.node.ok_or(ProtoError::MissingField("node"))?.try_into()?;
        Ok(Self { logical_version: req.logical_version, node_uuid: req.node_uuid, node })
    }
}

impl From<ConfigurationUpdateRequest> for proto::ConfigurationUpdateRequest {
    fn from(req: ConfigurationUpdateRequest) -> Self {
        Self { node: Some(req.node.into()), target_node: req.target_node }
    }
}

impl TryFrom<proto::ConfigurationUpdateRequest> for ConfigurationUpdateRequest {
    type Error = ProtoError;

    fn try_from(req: proto::ConfigurationUpdateRequest) -> Result<Self, Self::Error> {
        let node = req.node.ok_or(ProtoError::MissingField("node"))?.try_into()?;
        Ok(Self { node, target_node: req.target_node })
    }
}

/// Encodes a join outcome into the wire reply.
#[must_use]
pub fn join_reply_to_proto(result: Result<JoinNodeReply, Errc>) -> proto::JoinNodeReply {
    match result {
        Ok(reply) => proto::JoinNodeReply {
            success: reply.success,
            assigned_id: reply.assigned_id,
            error: Errc::Success.into(),
        },
        Err(errc) => proto::JoinNodeReply {
            success: false,
            assigned_id: UNASSIGNED_NODE_ID,
            error: errc.into(),
        },
    }
}

/// Decodes a wire join reply back into the join outcome.
///
/// # Errors
///
/// Returns the carried [`Errc`] when the remote rejected the request.
pub fn join_reply_from_proto(reply: proto::JoinNodeReply) -> Result<JoinNodeReply, Errc> {
    match Errc::from_wire(reply.error) {
        Errc::Success => {
            Ok(JoinNodeReply { success: reply.success, assigned_id: reply.assigned_id })
        }
        errc => Err(errc),
    }
}

/// Encodes a configuration update outcome into the wire reply.
#[must_use]
pub fn configuration_update_reply_to_proto(
    result: Result<ConfigurationUpdateReply, Errc>,
) -> proto::ConfigurationUpdateReply {
    match result {
        Ok(reply) => proto::ConfigurationUpdateReply {
            success: reply.success,
            error: Errc::Success.into(),
        },
        Err(errc) => proto::ConfigurationUpdateReply { success: false, error: errc.into() },
    }
}

/// Decodes a wire configuration update reply.
///
/// # Errors
///
/// Returns the carried [`Errc`] when the remote rejected the request.
pub fn configuration_update_reply_from_proto(
    reply: proto::ConfigurationUpdateReply,
) -> Result<ConfigurationUpdateReply, Errc> {
    match Errc::from_wire(reply.error) {
        Errc::Success => Ok(ConfigurationUpdateReply { success: reply.success }),
        errc => Err(errc),
    }
}

/// gRPC server for the controller client protocol.
pub struct ControllerRpcServer {
    manager: Arc<MembersManager>,
}

impl ControllerRpcServer {
    /// Wraps a members manager.
    #[must_use]
    pub fn new(manager: Arc<MembersManager>) -> Self {
        Self { manager }
    }

    /// Converts into a tonic service ready to be added to a server.
    #[must_use]
    pub fn into_service(
        self,
    ) -> proto::controller_service_server::ControllerServiceServer<Self> {
        proto::controller_service_server::ControllerServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl proto::controller_service_server::ControllerService for ControllerRpcServer {
    async fn join_node(
        &self,
        request: Request<proto::JoinNodeRequest>,
    ) -> Result<Response<proto::JoinNodeReply>, Status> {
        let req = match JoinNodeRequest::try_from(request.into_inner()) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "malformed join request");
                return Ok(Response::new(join_reply_to_proto(Err(Errc::InvalidRequest))));
            }
        };
        let result = self.manager.handle_join_request(req).await;
        Ok(Response::new(join_reply_to_proto(result)))
    }

    async fn update_node_configuration(
        &self,
        request: Request<proto::ConfigurationUpdateRequest>,
    ) -> Result<Response<proto::ConfigurationUpdateReply>, Status> {
        let req = match ConfigurationUpdateRequest::try_from(request.into_inner()) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "malformed configuration update request");
                return Ok(Response::new(configuration_update_reply_to_proto(Err(
                    Errc::InvalidRequest,
                ))));
            }
        };
        let result = self.manager.handle_configuration_update_request(req).await;
        Ok(Response::new(configuration_update_reply_to_proto(result)))
    }

    async fn hello(
        &self,
        request: Request<proto::HelloRequest>,
    ) -> Result<Response<proto::HelloReply>, Status> {
        let req = request.into_inner();
        let reply = self
            .manager
            .handle_hello(HelloRequest { peer: req.peer, start_time: req.start_time })
            .await;
        Ok(Response::new(proto::HelloReply { error: reply.error.into() }))
    }
}
