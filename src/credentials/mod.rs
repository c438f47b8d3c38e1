//! Credential Resolver (C1): produces an ordered list of candidate
//! registry-auth records for a given image reference.
//!
//! Resolution never fails hard: an empty candidate list is a valid
//! result, meaning "attempt anonymous pull". Sources are tried in fixed
//! priority order and their candidates concatenated.

mod cache;
mod docker_config;
mod glob;
mod provider;

pub use docker_config::DockerConfigJson;
pub use provider::{ProviderConfig, ProviderSpec};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::reference::ImageReference;
use cache::CredentialCache;

/// A single registry-auth record tried during a pull attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialCandidate {
    pub server_address: String,
    pub username: String,
    pub password: String,
    pub auth: String,
    pub identity_token: String,
    pub registry_token: String,
}

impl CredentialCandidate {
    /// Recomputes `auth` from `username`/`password` when absent, or
    /// decodes `auth` into `username`/`password` when those are absent.
    /// Per the driver's normalization rule: exactly one direction applies
    /// to any given raw entry.
    pub fn normalize(mut self) -> Self {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD;

        if !self.auth.is_empty() && self.username.is_empty() && self.password.is_empty() {
            if let Ok(decoded) = b64.decode(&self.auth) {
                if let Ok(text) = String::from_utf8(decoded) {
                    if let Some((user, pass)) = text.split_once(':') {
                        self.username = user.to_string();
                        self.password = pass.to_string();
                    }
                }
            }
        } else if self.auth.is_empty() && !self.username.is_empty() && !self.password.is_empty() {
            self.auth = b64.encode(format!("{}:{}", self.username, self.password));
        }
        self
    }
}

/// Configuration the resolver needs at construction time, mirroring the
/// CLI surface.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub node_pull_secrets: Vec<DockerConfigJson>,
    pub provider_config: Option<ProviderConfig>,
    pub provider_bin_dir: Option<PathBuf>,
    pub enable_cache: bool,
}

/// Produces ordered credential candidates for image references. Owns the
/// provider cache as explicitly constructed state (per the driver's
/// "no module-level singletons" design note), threaded through the node
/// daemon's constructors.
pub struct CredentialResolver {
    config: ResolverConfig,
    cache: Arc<CredentialCache>,
}

impl CredentialResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config, cache: Arc::new(CredentialCache::new()) }
    }

    /// Resolves credential candidates for `image_ref`. `secret_data` is
    /// the per-mount secret blob, already opaque key-value pairs (the
    /// caller is responsible for having parsed the CSI-supplied bytes).
    pub async fn resolve(
        &self,
        image_ref: &ImageReference,
        secret_data: Option<&HashMap<String, String>>,
    ) -> Vec<CredentialCandidate> {
        let mut candidates = Vec::new();

        // Source 1: per-mount secret.
        if let Some(data) = secret_data {
            if !data.is_empty() {
                match DockerConfigJson::from_secret_data(data) {
                    Ok(config) => {
                        candidates.extend(config.candidates_for(image_ref.registry_domain()));
                    }
                    Err(err) => {
                        crate::log_warn!(image: image_ref, error = %err, "failed to parse per-mount secret as docker config");
                    }
                }
            }
        }

        // Source 2: node-scoped pull secrets.
        for config in &self.config.node_pull_secrets {
            candidates.extend(config.candidates_for(image_ref.registry_domain()));
        }

        // Source 3: external credential-provider binaries.
        if let (Some(provider_config), Some(bin_dir)) =
            (&self.config.provider_config, &self.config.provider_bin_dir)
        {
            for spec in &provider_config.providers {
                if !glob::wildcard_match_any(&spec.match_images, image_ref.registry_domain()) {
                    continue;
                }

                let cached = if self.config.enable_cache {
                    self.cache.get(image_ref.registry_domain()).await
                } else {
                    None
                };

                let produced = if let Some(cached) = cached {
                    cached
                } else {
                    let ttl = spec.cache_ttl().unwrap_or(Duration::from_secs(300));
                    match provider::invoke(bin_dir, spec, image_ref).await {
                        Ok(produced) => {
                            if self.config.enable_cache {
                                self.cache
                                    .put(image_ref.registry_domain().to_string(), produced.clone(), ttl)
                                    .await;
                            }
                            produced
                        }
                        Err(err) => {
                            crate::log_warn!(image: image_ref, provider = %spec.name, error = %err, "credential provider invocation failed, skipping");
                            Vec::new()
                        }
                    }
                };
                candidates.extend(produced);
            }
        }

        candidates.into_iter().map(CredentialCandidate::normalize).collect()
    }
}
