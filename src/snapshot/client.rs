//! The runtime snapshot service, as consumed by the snapshot manager.

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::Channel;

use crate::proto::runtime_snapshot::{
    snapshot_service_client::SnapshotServiceClient, ListSnapshotsRequest, Mount as ProtoMount,
    PrepareRequest, RemoveRequest, SnapshotKind,
};

#[derive(Debug, Clone, Error)]
pub enum SnapshotClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl From<tonic::Status> for SnapshotClientError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => SnapshotClientError::NotFound(status.message().to_string()),
            tonic::Code::Unavailable => {
                SnapshotClientError::Unavailable(status.message().to_string())
            }
            _ => SnapshotClientError::Other(status.message().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mount {
    pub kind: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotListedKind {
    Active,
    Committed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ListedSnapshot {
    pub key: String,
    pub parent: String,
    pub kind: SnapshotListedKind,
}

#[async_trait]
pub trait RuntimeSnapshotClient: Send + Sync {
    async fn prepare(
        &self,
        key: &str,
        parent_image_ref: &str,
    ) -> Result<Vec<Mount>, SnapshotClientError>;

    async fn remove(&self, key: &str) -> Result<(), SnapshotClientError>;

    async fn list(&self) -> Result<Vec<ListedSnapshot>, SnapshotClientError>;
}

pub struct GrpcSnapshotClient {
    client: tokio::sync::Mutex<SnapshotServiceClient<Channel>>,
}

impl GrpcSnapshotClient {
    pub fn new(channel: Channel) -> Self {
        Self { client: tokio::sync::Mutex::new(SnapshotServiceClient::new(channel)) }
    }
}

fn from_proto_mount(mount: ProtoMount) -> Mount {
    Mount { kind: mount.r#type, source: mount.source, target: mount.target, options: mount.options }
}

#[async_trait]
impl RuntimeSnapshotClient for GrpcSnapshotClient {
    async fn prepare(
        &self,
        key: &str,
        parent_image_ref: &str,
    ) -> Result<Vec<Mount>, SnapshotClientError> {
        let request = PrepareRequest { key: key.to_string(), parent_image_ref: parent_image_ref.to_string() };
        let mut client = self.client.lock().await;
        let response = client.prepare(request).await?.into_inner();
        Ok(response.mounts.into_iter().map(from_proto_mount).collect())
    }

    async fn remove(&self, key: &str) -> Result<(), SnapshotClientError> {
        let request = RemoveRequest { key: key.to_string() };
        let mut client = self.client.lock().await;
        client.remove(request).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListedSnapshot>, SnapshotClientError> {
        let mut client = self.client.lock().await;
        let response = client.list(ListSnapshotsRequest {}).await?.into_inner();
        Ok(response
            .snapshots
            .into_iter()
            .map(|s| ListedSnapshot {
                key: s.key,
                parent: s.parent,
                kind: match SnapshotKind::try_from(s.kind).unwrap_or(SnapshotKind::Unknown) {
                    SnapshotKind::Active => SnapshotListedKind::Active,
                    SnapshotKind::Committed => SnapshotListedKind::Committed,
                    SnapshotKind::Unknown => SnapshotListedKind::Unknown,
                },
            })
            .collect())
    }
}
