//! External credential-provider binary invocation: the two dialects
//! (Docker credential helper, kubelet credential-provider plugin), ECR
//! enrichment, and the provider-config file format.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

use super::CredentialCandidate;
use crate::reference::ImageReference;

const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// The `--image-credential-provider-config` file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: String,
    pub api_version: String,
    pub providers: Vec<ProviderSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub name: String,
    pub match_images: Vec<String>,
    #[serde(default)]
    pub default_cache_duration: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<ExecEnvVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

impl ProviderSpec {
    pub fn cache_ttl(&self) -> Option<Duration> {
        if self.default_cache_duration.is_empty() {
            return None;
        }
        humantime::parse_duration(&self.default_cache_duration).ok()
    }
}

impl ProviderConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading credential provider config {}", path.display()))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing credential provider config {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Deserialize)]
struct DockerCredentialHelperOutput {
    #[serde(default, rename = "ServerURL")]
    server_url: String,
    #[serde(default, rename = "Username")]
    username: String,
    #[serde(default, rename = "Secret")]
    secret: String,
}

#[derive(Serialize)]
struct CredentialProviderRequest<'a> {
    api_version: &'a str,
    kind: &'a str,
    image: &'a str,
}

#[derive(Deserialize)]
struct CredentialProviderResponse {
    #[serde(default)]
    auth: std::collections::HashMap<String, CredentialProviderAuthEntry>,
}

#[derive(Deserialize)]
struct CredentialProviderAuthEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Invokes the provider binary named by `spec.name` in `bin_dir`,
/// returning the candidates it produced. Never returns a hard error for
/// "no credentials" outcomes — only for process/IO failures, which the
/// caller logs and treats as "no candidates from this source".
pub async fn invoke(
    bin_dir: &Path,
    spec: &ProviderSpec,
    image_ref: &ImageReference,
) -> Result<Vec<CredentialCandidate>> {
    let exe = bin_dir.join(&spec.name);
    let basename = spec.name.as_str();

    let mut command = Command::new(&exe);
    command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

    for var in &spec.env {
        command.env(&var.name, &var.value);
    }

    if is_ecr_helper(basename) && std::env::var_os("AWS_REGION").is_none() {
        if let Some(region) = ecr_region(image_ref.registry_domain()) {
            command.env("AWS_REGION", region);
        }
    }

    let is_docker_helper = basename.starts_with("docker-credential-");
    let stdin_payload = if is_docker_helper {
        command.arg("get");
        format!("{}\n", image_ref.registry_domain())
    } else {
        command.args(&spec.args);
        let request = CredentialProviderRequest {
            api_version: &spec.api_version,
            kind: "CredentialProviderRequest",
            image: image_ref.as_str(),
        };
        serde_json::to_string(&request)?
    };

    let mut child = command.spawn().with_context(|| format!("spawning provider {basename}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(stdin_payload.as_bytes()).await.context("writing provider stdin")?;
    }

    let output = timeout(EXEC_TIMEOUT, async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout).await.ok();
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr).await.ok();
        }
        let status = child.wait().await;
        (status, stdout, stderr)
    })
    .await;

    let (status, stdout, stderr) = match output {
        Ok(result) => result,
        Err(_) => {
            // Timed out: the child is still being waited on by its own
            // drop, but make sure we don't leave a zombie behind.
            let _ = child.start_kill();
            let _ = child.wait().await;
            bail!("provider {basename} timed out after {EXEC_TIMEOUT:?}");
        }
    };

    let status = status.with_context(|| format!("waiting on provider {basename}"))?;

    if !status.success() {
        let stderr_text = String::from_utf8_lossy(&stderr);
        if stderr_text.to_lowercase().contains("credentials not found") {
            return Ok(Vec::new());
        }
        bail!("provider {basename} exited with {status}: {stderr_text}");
    }

    if is_docker_helper {
        parse_docker_helper_output(&stdout)
    } else {
        parse_kubelet_plugin_output(&stdout, basename)
    }
}

fn parse_docker_helper_output(stdout: &[u8]) -> Result<Vec<CredentialCandidate>> {
    let text = String::from_utf8_lossy(stdout);
    if text.to_lowercase().contains("credentials not found") {
        return Ok(Vec::new());
    }
    let parsed: DockerCredentialHelperOutput =
        serde_json::from_slice(stdout).context("parsing docker credential helper output")?;

    Ok(vec![CredentialCandidate {
        server_address: parsed.server_url,
        username: parsed.username,
        password: parsed.secret,
        ..Default::default()
    }])
}

fn parse_kubelet_plugin_output(
    stdout: &[u8],
    provider_name: &str,
) -> Result<Vec<CredentialCandidate>> {
    let parsed: CredentialProviderResponse =
        serde_json::from_slice(stdout).context("parsing kubelet credential-provider output")?;

    let mut candidates = Vec::new();
    for (pattern, entry) in parsed.auth {
        let mut candidate = CredentialCandidate {
            server_address: pattern,
            username: entry.username.clone(),
            password: entry.password.clone(),
            ..Default::default()
        };

        // ECR tokens arrive as username "AWS" plus a large base64 token;
        // emit a second candidate with the token re-encoded so runtimes
        // expecting either shape succeed.
        if entry.username == "AWS" && entry.password.len() > 64 {
            if let Some(extra) = ecr_dual_encoding_candidate(&candidate) {
                candidates.push(extra);
            }
        }

        candidates.push(candidate);
    }

    if candidates.is_empty() {
        bail!("provider {provider_name} returned no auth entries");
    }

    Ok(candidates)
}

fn ecr_dual_encoding_candidate(base: &CredentialCandidate) -> Option<CredentialCandidate> {
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD;
    let decoded = b64.decode(&base.password).ok()?;
    let decoded_text = String::from_utf8(decoded).ok()?;
    Some(CredentialCandidate {
        server_address: base.server_address.clone(),
        username: base.username.clone(),
        password: base.password.clone(),
        auth: b64.encode(format!("AWS:{decoded_text}")),
        ..Default::default()
    })
}

fn is_ecr_helper(basename: &str) -> bool {
    basename.ends_with("ecr-login") || basename.contains("ecr-credential-helper")
}

/// Parses the AWS region out of an ECR-style registry domain:
/// `acct.dkr.ecr.REGION.amazonaws.com`.
fn ecr_region(registry_domain: &str) -> Option<String> {
    let parts: Vec<&str> = registry_domain.split('.').collect();
    if parts.len() >= 6 && parts[1] == "dkr" && parts[2] == "ecr" {
        Some(parts[3].to_string())
    } else {
        None
    }
}
