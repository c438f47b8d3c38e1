use std::fs::{create_dir_all, remove_file};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use image_volume_driver::cli::Args;
use image_volume_driver::credentials::{CredentialResolver, ProviderConfig, ResolverConfig};
use image_volume_driver::csi::identity::DRIVER_NAME;
use image_volume_driver::csi::{IdentityService, NodeService};
use image_volume_driver::image::client::GrpcImageClient;
use image_volume_driver::image::ImageAcquirer;
use image_volume_driver::mount::MountOrchestrator;
use image_volume_driver::proto::csi::identity_server::IdentityServer;
use image_volume_driver::proto::csi::node_server::NodeServer;
use image_volume_driver::snapshot::client::GrpcSnapshotClient;
use image_volume_driver::snapshot::{self, SnapshotManager};
use image_volume_driver::{image, logging, mount};

#[tokio::main]
async fn main() {
    logging::init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            std::process::exit(2);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let resolver_config = build_resolver_config(&args)?;
    let credentials = Arc::new(CredentialResolver::new(resolver_config));

    let runtime_channel = image::client::connect_unix_socket(args.runtime_addr.clone())
        .await
        .map_err(|err| anyhow::anyhow!("connecting to runtime at {}: {err}", args.runtime_addr.display()))?;

    let image_client = Arc::new(GrpcImageClient::new(runtime_channel.clone()));
    let images = Arc::new(ImageAcquirer::new(image_client, args.async_image_pull_timeout));

    let snapshot_client = Arc::new(GrpcSnapshotClient::new(runtime_channel));
    let snapshots = Arc::new(SnapshotManager::new(snapshot_client.clone()));

    let pod_volumes_root = snapshot::reconcile::pod_volumes_root(&args.kubelet_root);
    let reconcile = snapshot::reconcile::run(&snapshots, snapshot_client.as_ref(), &pod_volumes_root, DRIVER_NAME);
    match tokio::time::timeout(mount::RECONCILE_TIMEOUT, reconcile).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "reconcile failed, starting with an empty snapshot graph"),
        Err(_) => tracing::warn!("reconcile did not finish within {:?}, starting anyway", mount::RECONCILE_TIMEOUT),
    }

    let orchestrator = Arc::new(MountOrchestrator::new(credentials, images, snapshots));

    serve(&args, orchestrator).await
}

fn build_resolver_config(args: &Args) -> anyhow::Result<ResolverConfig> {
    let provider_config = match &args.image_credential_provider_config {
        Some(path) => Some(ProviderConfig::read(path)?),
        None => None,
    };

    if args.node_plugin_sa.is_some() {
        tracing::warn!(
            "node-plugin-sa is configured but this build resolves node-scoped pull secrets only from \
             in-process configuration, not the Kubernetes API; no secrets will be seeded from it"
        );
    }

    Ok(ResolverConfig {
        node_pull_secrets: Vec::new(),
        provider_config,
        provider_bin_dir: args.image_credential_provider_bin_dir.clone(),
        enable_cache: args.enable_cache,
    })
}

async fn serve(args: &Args, orchestrator: Arc<MountOrchestrator>) -> anyhow::Result<()> {
    let identity_service = IdentityService::new(env!("CARGO_PKG_VERSION"));
    let node_service = NodeService::new(orchestrator, args.node.clone(), args.max_volumes_per_node);

    // systemd sends SIGTERM to stop services, CTRL+C sends SIGINT; listen
    // for both to shut down the CSI server gracefully.
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let shutdown_signal = async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::info!("shutdown signal received, draining in-flight requests");
    };

    if let Some(parent) = args.endpoint.parent() {
        create_dir_all(parent).context("creating endpoint socket directory")?;
    }
    // Bind last, so any earlier failure leaves no socket behind to clean up.
    let listener = UnixListener::bind(&args.endpoint)
        .with_context(|| format!("binding endpoint {}", args.endpoint.display()))?;

    tracing::info!(endpoint = %args.endpoint.display(), node = %args.node, "csi-image-volumed listening");

    let result = Server::builder()
        .add_service(IdentityServer::new(identity_service))
        .add_service(NodeServer::new(node_service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal)
        .await;

    // Remove the UDS path after shutdown so the service can rebind on restart.
    let unlink_result = remove_file(&args.endpoint);
    result?;
    Ok(unlink_result?)
}
