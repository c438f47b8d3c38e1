//! The runtime image service, as consumed by the image acquirer: a
//! minimal three-call surface behind a trait so tests substitute an
//! in-process fake instead of a real runtime socket.

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::credentials::CredentialCandidate;
use crate::proto::runtime_image::{
    image_service_client::ImageServiceClient, AuthConfig, ImageSpec, ImageStatusRequest,
    ListImagesRequest, PullImageRequest,
};

#[derive(Debug, Clone, Error)]
pub enum RuntimeClientError {
    #[error("not found")]
    NotFound,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Other(String),
}

impl From<tonic::transport::Error> for RuntimeClientError {
    fn from(err: tonic::transport::Error) -> Self {
        RuntimeClientError::Transport(err.to_string())
    }
}

impl From<tonic::Status> for RuntimeClientError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => RuntimeClientError::NotFound,
            tonic::Code::Unavailable => RuntimeClientError::Unavailable(status.message().to_string()),
            tonic::Code::DeadlineExceeded => RuntimeClientError::DeadlineExceeded,
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                RuntimeClientError::Unauthenticated(status.message().to_string())
            }
            _ => RuntimeClientError::Other(status.message().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeImageInfo {
    pub id: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait RuntimeImageClient: Send + Sync {
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&CredentialCandidate>,
    ) -> Result<String, RuntimeClientError>;

    async fn image_status(
        &self,
        image: &str,
    ) -> Result<Option<RuntimeImageInfo>, RuntimeClientError>;

    async fn list_images(&self) -> Result<Vec<RuntimeImageInfo>, RuntimeClientError>;
}

/// Connects to the runtime over a Unix domain socket, matching this
/// codebase's own client-connector pattern for talking to node-local
/// gRPC services.
pub async fn connect_unix_socket(path: std::path::PathBuf) -> anyhow::Result<Channel> {
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(hyper_util::rt::tokio::TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(channel)
}

pub struct GrpcImageClient {
    client: tokio::sync::Mutex<ImageServiceClient<Channel>>,
}

impl GrpcImageClient {
    pub fn new(channel: Channel) -> Self {
        Self { client: tokio::sync::Mutex::new(ImageServiceClient::new(channel)) }
    }
}

fn candidate_to_auth(candidate: &CredentialCandidate) -> AuthConfig {
    AuthConfig {
        username: candidate.username.clone(),
        password: candidate.password.clone(),
        auth: candidate.auth.clone(),
        server_address: candidate.server_address.clone(),
        identity_token: candidate.identity_token.clone(),
        registry_token: candidate.registry_token.clone(),
    }
}

#[async_trait]
impl RuntimeImageClient for GrpcImageClient {
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&CredentialCandidate>,
    ) -> Result<String, RuntimeClientError> {
        let request = PullImageRequest {
            image: Some(ImageSpec { image: image.to_string() }),
            auth: auth.map(candidate_to_auth),
        };
        let mut client = self.client.lock().await;
        let response = client.pull_image(request).await?;
        Ok(response.into_inner().image_ref)
    }

    async fn image_status(
        &self,
        image: &str,
    ) -> Result<Option<RuntimeImageInfo>, RuntimeClientError> {
        let request = ImageStatusRequest { image: Some(ImageSpec { image: image.to_string() }) };
        let mut client = self.client.lock().await;
        let response = client.image_status(request).await?.into_inner();
        Ok(response.image.map(|info| RuntimeImageInfo { id: info.id, size_bytes: info.size_bytes }))
    }

    async fn list_images(&self) -> Result<Vec<RuntimeImageInfo>, RuntimeClientError> {
        let request = ListImagesRequest { filter: None };
        let mut client = self.client.lock().await;
        let response = client.list_images(request).await?.into_inner();
        Ok(response
            .images
            .into_iter()
            .map(|info| RuntimeImageInfo { id: info.id, size_bytes: info.size_bytes })
            .collect())
    }
}
