//! Docker-style config JSON parsing, used for both the per-mount secret
//! source and the node-scoped pull secrets source.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use super::CredentialCandidate;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
    #[serde(default)]
    identitytoken: String,
    #[serde(default)]
    registrytoken: String,
}

/// A parsed Docker-style config, either the bare `{registry: entry}` map
/// or the `{"auths": {...}}` wrapper — both are accepted on read.
#[derive(Debug, Clone, Default)]
pub struct DockerConfigJson {
    entries: HashMap<String, RawEntry>,
}

#[derive(Deserialize)]
struct Wrapper {
    auths: HashMap<String, RawEntry>,
}

impl DockerConfigJson {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if let Ok(wrapper) = serde_json::from_slice::<Wrapper>(bytes) {
            return Ok(Self { entries: wrapper.auths });
        }
        let entries: HashMap<String, RawEntry> = serde_json::from_slice(bytes)
            .map_err(|err| anyhow!("invalid docker config json: {err}"))?;
        Ok(Self { entries })
    }

    pub fn from_secret_data(data: &HashMap<String, String>) -> Result<Self> {
        // The CSI secret map carries the config under a well-known key,
        // matching how kubelet-mounted dockerconfigjson secrets arrive;
        // fall back to treating the whole map as already-decoded JSON
        // under a single value when there is exactly one entry.
        if let Some(raw) = data.get(".dockerconfigjson").or_else(|| data.get("config.json")) {
            return Self::parse(raw.as_bytes());
        }
        if data.len() == 1 {
            if let Some(raw) = data.values().next() {
                if let Ok(parsed) = Self::parse(raw.as_bytes()) {
                    return Ok(parsed);
                }
            }
        }
        Err(anyhow!("secret data does not contain a recognizable docker config payload"))
    }

    /// Finds the entry matching `registry_domain`, per the driver's match
    /// rule: exact key, then scheme-stripped key, then substring either
    /// direction as a last resort.
    pub fn candidates_for(&self, registry_domain: &str) -> Vec<CredentialCandidate> {
        let mut matched: Vec<(&String, &RawEntry)> = Vec::new();

        if let Some((key, entry)) = self.entries.get_key_value(registry_domain) {
            matched.push((key, entry));
        } else {
            for (key, entry) in &self.entries {
                let stripped = strip_scheme(key);
                if stripped == registry_domain {
                    matched.push((key, entry));
                    break;
                }
            }
        }

        if matched.is_empty() {
            for (key, entry) in &self.entries {
                let stripped = strip_scheme(key);
                if stripped.contains(registry_domain) || registry_domain.contains(stripped) {
                    matched.push((key, entry));
                }
            }
        }

        matched
            .into_iter()
            .map(|(key, entry)| CredentialCandidate {
                server_address: key.clone(),
                username: entry.username.clone(),
                password: entry.password.clone(),
                auth: entry.auth.clone(),
                identity_token: entry.identitytoken.clone(),
                registry_token: entry.registrytoken.clone(),
            })
            .collect()
    }
}

fn strip_scheme(key: &str) -> &str {
    key.strip_prefix("https://").or_else(|| key.strip_prefix("http://")).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_map() {
        let json = br#"{"registry.example.com": {"username": "u", "password": "p"}}"#;
        let config = DockerConfigJson::parse(json).unwrap();
        let candidates = config.candidates_for("registry.example.com");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].username, "u");
    }

    #[test]
    fn parses_auths_wrapper() {
        let json = br#"{"auths": {"https://index.docker.io/v1/": {"auth": "dXNlcjpwYXNz"}}}"#;
        let config = DockerConfigJson::parse(json).unwrap();
        let candidates = config.candidates_for("index.docker.io/v1/");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].auth, "dXNlcjpwYXNz");
    }

    #[test]
    fn substring_fallback_matches() {
        let json = br#"{"docker.io": {"username": "u", "password": "p"}}"#;
        let config = DockerConfigJson::parse(json).unwrap();
        let candidates = config.candidates_for("registry-1.docker.io");
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn no_match_yields_empty() {
        let json = br#"{"other.example.com": {"username": "u", "password": "p"}}"#;
        let config = DockerConfigJson::parse(json).unwrap();
        assert!(config.candidates_for("registry.example.com").is_empty());
    }
}
