//! Command-line surface, matching the flag table the node daemon is
//! deployed with (kubelet talks to `--endpoint`, the runtime lives at
//! `--runtime-addr`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "csi-image-volumed", about = "Node-local CSI driver for image-backed volumes")]
pub struct Args {
    /// Unix socket path the CSI Node/Identity services are served on.
    #[arg(long, default_value = "/run/csi/image-volume.sock")]
    pub endpoint: PathBuf,

    /// Node identity echoed back from NodeGetInfo.
    #[arg(long)]
    pub node: String,

    /// Unix socket path of the container runtime's image and snapshot services.
    #[arg(long, default_value = "/run/containerd/containerd.sock")]
    pub runtime_addr: PathBuf,

    /// Enables the async pull path in C2 when at or above 30s; also used
    /// as the per-publish deadline.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub async_image_pull_timeout: Option<Duration>,

    /// Path to a CredentialProviderConfig JSON file; enables C1's
    /// external-provider source.
    #[arg(long)]
    pub image_credential_provider_config: Option<PathBuf>,

    /// Directory containing the provider executables named in the config.
    #[arg(long)]
    pub image_credential_provider_bin_dir: Option<PathBuf>,

    /// Name of the node plugin's own service account; its attached
    /// imagePullSecrets seed C1 source 2.
    #[arg(long)]
    pub node_plugin_sa: Option<String>,

    /// Enables the in-memory credential cache for provider-sourced
    /// candidates.
    #[arg(long)]
    pub enable_cache: bool,

    /// Root directory kubelet mounts pod volumes under; reconcile walks
    /// `<kubelet-root>/pods` at startup.
    #[arg(long, default_value = "/var/lib/kubelet")]
    pub kubelet_root: PathBuf,

    /// Upper bound on the node plugin's advertised volume capacity,
    /// returned from NodeGetInfo.
    #[arg(long, default_value_t = 256)]
    pub max_volumes_per_node: i64,
}
