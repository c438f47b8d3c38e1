//! Image reference parsing and normalization.
//!
//! An image reference is the canonical string identity of an image: a
//! fully-qualified name with a tag or a digest. Two equal references
//! denote the same image for all purposes; normalization happens once on
//! entry, at parse time.

use std::fmt;

use anyhow::{anyhow, Result};

/// A parsed, normalized image reference.
///
/// `registryDomain` is the first `/`-delimited segment if it contains `.`
/// or `:`, else the literal `docker.io` — a single-segment name (no slash
/// at all) always falls into the `docker.io` case, never the segment
/// itself; an implementation that treats a bare `nginx` as its own
/// registry domain is replicating a source bug, not this behavior.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    raw: String,
    registry_domain: String,
    repo_path: String,
}

impl ImageReference {
    /// Parses and normalizes a raw image reference string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("image reference is empty"));
        }
        if raw.contains(char::is_whitespace) {
            return Err(anyhow!("image reference {raw:?} contains whitespace"));
        }

        let repo_path = strip_tag_or_digest(raw).to_string();
        if repo_path.is_empty() {
            return Err(anyhow!("image reference {raw:?} has no repository path"));
        }

        let first_segment = repo_path.split('/').next().unwrap_or(&repo_path);
        let registry_domain = if first_segment.contains('.') || first_segment.contains(':') {
            first_segment.to_string()
        } else {
            "docker.io".to_string()
        };

        Ok(Self { raw: raw.to_string(), registry_domain, repo_path })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn registry_domain(&self) -> &str {
        &self.registry_domain
    }

    pub fn repo_path(&self) -> &str {
        &self.repo_path
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Strips a trailing `@digest` or `:tag` suffix, being careful not to
/// confuse a registry port number (`host:5000/repo`) with a tag.
fn strip_tag_or_digest(raw: &str) -> &str {
    if let Some(at) = raw.rfind('@') {
        return &raw[..at];
    }
    if let Some(colon) = raw.rfind(':') {
        let after = &raw[colon + 1..];
        // A tag never contains a slash; a port-number colon is always
        // followed by more path segments.
        if !after.contains('/') {
            return &raw[..colon];
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_official_image_defaults_domain() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.registry_domain(), "docker.io");
        assert_eq!(r.repo_path(), "nginx");
    }

    #[test]
    fn docker_hub_namespaced_image_defaults_domain() {
        let r = ImageReference::parse("library/nginx:1.25").unwrap();
        assert_eq!(r.registry_domain(), "docker.io");
        assert_eq!(r.repo_path(), "library/nginx");
    }

    #[test]
    fn fully_qualified_reference() {
        let r = ImageReference::parse("docker.io/library/nginx:1.25").unwrap();
        assert_eq!(r.registry_domain(), "docker.io");
        assert_eq!(r.repo_path(), "docker.io/library/nginx");
    }

    #[test]
    fn custom_registry_with_port() {
        let r = ImageReference::parse("registry.example.com:5000/app:1.0").unwrap();
        assert_eq!(r.registry_domain(), "registry.example.com:5000");
        assert_eq!(r.repo_path(), "registry.example.com:5000/app");
    }

    #[test]
    fn localhost_with_port_and_no_tag() {
        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry_domain(), "localhost:5000");
        assert_eq!(r.repo_path(), "localhost:5000/app");
    }

    #[test]
    fn digest_reference() {
        let r = ImageReference::parse("ghcr.io/org/app@sha256:abcdef1234").unwrap();
        assert_eq!(r.registry_domain(), "ghcr.io");
        assert_eq!(r.repo_path(), "ghcr.io/org/app");
    }

    #[test]
    fn ecr_style_domain() {
        let r =
            ImageReference::parse("123456789012.dkr.ecr.us-east-1.amazonaws.com/app:1").unwrap();
        assert_eq!(r.registry_domain(), "123456789012.dkr.ecr.us-east-1.amazonaws.com");
    }

    #[test]
    fn round_trip_registry_domain_is_stable_under_reparse() {
        let original = "docker.io/library/nginx:1.25";
        let a = ImageReference::parse(original).unwrap();
        let b = ImageReference::parse(a.as_str()).unwrap();
        assert_eq!(a.registry_domain(), b.registry_domain());
    }

    #[test]
    fn rejects_empty() {
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn rejects_whitespace() {
        assert!(ImageReference::parse("nginx:1.25 extra").is_err());
    }
}
