//! The CSI Node service: the only place volume_context/secrets cross into
//! [`MountOrchestrator::publish`]/`unpublish`.

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::to_status;
use crate::mount::{MountOrchestrator, PublishRequest};
use crate::proto::csi::node_server::Node;
use crate::proto::csi::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse, NodeGetVolumeStatsRequest,
    NodeGetVolumeStatsResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
    NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology,
};

pub struct NodeService {
    orchestrator: Arc<MountOrchestrator>,
    node_id: String,
    max_volumes_per_node: i64,
}

impl NodeService {
    pub fn new(orchestrator: Arc<MountOrchestrator>, node_id: impl Into<String>, max_volumes_per_node: i64) -> Self {
        Self { orchestrator, node_id: node_id.into(), max_volumes_per_node }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    /// This driver stages nothing: every snapshot is acquired and bound
    /// directly at publish time, so staging is a validated no-op.
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target_path is required"));
        }

        let secret_data = if req.secrets.is_empty() { None } else { Some(req.secrets) };

        let publish_req = PublishRequest {
            volume_id: req.volume_id,
            target_path: PathBuf::from(req.target_path),
            read_only: req.readonly,
            volume_attributes: req.volume_context,
            secret_data,
        };

        self.orchestrator
            .publish(publish_req)
            .await
            .map(|()| Response::new(NodePublishVolumeResponse {}))
            .map_err(|err| to_status(err, "node_publish_volume"))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target_path is required"));
        }

        self.orchestrator
            .unpublish(&PathBuf::from(req.target_path))
            .await
            .map(|()| Response::new(NodeUnpublishVolumeResponse {}))
            .map_err(|err| to_status(err, "node_unpublish_volume"))
    }

    /// Not advertised in `NodeGetCapabilities`; the kubelet has no reason
    /// to call this, but CSI requires the method exist.
    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("volume stats are not supported by this driver"))
    }

    /// Snapshots are fixed-size; expansion is not meaningful here.
    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("volume expansion is not supported by this driver"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities: vec![] }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: Some(Topology { segments: Default::default() }),
        }))
    }
}
