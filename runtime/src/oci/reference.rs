//! Remote VM name resolution.
//!
//! Parses references like `ghcr.io/org/macos-sonoma:1.0` into structured
//! components. The canonical string form (`Display`) always carries the host
//! and a tag or digest, and parses back to an identical value.

use std::fmt;
use std::str::FromStr;

use vmpull_core::error::{Result, VmError};

use super::digest::Digest;

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// Parsed remote VM reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteName {
    /// Registry host, optionally with port (e.g., "ghcr.io", "localhost:5000")
    host: String,
    /// Path segments between host and name, joined by '/' (may be empty)
    namespace: String,
    /// Last path segment
    name: String,
    /// Tag, if given or defaulted
    tag: Option<String>,
    /// Digest, authoritative over the tag when present
    digest: Option<Digest>,
}

impl RemoteName {
    /// Parse a remote VM reference.
    ///
    /// Supports formats:
    /// - `ubuntu` → docker.io/library/ubuntu:latest
    /// - `org/vm:1.0` → docker.io/org/vm:1.0
    /// - `ghcr.io/org/vm` → ghcr.io/org/vm:latest
    /// - `localhost:5000/vm:dev` → localhost:5000/vm:dev
    /// - `ghcr.io/org/vm@sha256:…` → digest reference
    pub fn parse(input: &str) -> Result<Self> {
        let reference = input.trim();
        let invalid = |reason: &str| VmError::InvalidReferenceError {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.contains("://") {
            return Err(invalid("unsupported scheme, use host/namespace/name[:tag]"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| match e {
                    VmError::InvalidReferenceError { reason, .. } => invalid(&reason),
                    other => other,
                })?;
                (name_tag, Some(digest))
            }
            None => (reference, None),
        };

        // Tag is a colon after the last slash; a colon before it belongs to host:port
        let last_slash = name_tag.rfind('/');
        let (path, tag) = match name_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            _ => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(tag).map_err(|reason| invalid(reason))?;
        }

        let segments: Vec<&str> = path.split('/').collect();
        let (host, repo_segments) = if segments.len() > 1 && looks_like_host(segments[0]) {
            validate_host(segments[0]).map_err(|reason| invalid(reason))?;
            (segments[0].to_string(), segments[1..].to_vec())
        } else {
            (DEFAULT_REGISTRY.to_string(), segments)
        };

        if repo_segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty name"));
        }
        for segment in &repo_segments {
            validate_path_segment(segment).map_err(|reason| invalid(reason))?;
        }

        let (name, mut namespace) = match repo_segments.split_last() {
            Some((name, namespace)) => (name.to_string(), namespace.join("/")),
            None => return Err(invalid("empty name")),
        };

        // Docker Hub official images live under library/
        if host == DEFAULT_REGISTRY && namespace.is_empty() {
            namespace = "library".to_string();
        }

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            host,
            namespace,
            name,
            tag,
            digest,
        })
    }

    /// Whether `input` can only be a local VM name (no registry separators).
    pub fn is_local_identifier(input: &str) -> bool {
        let input = input.trim();
        !input.is_empty() && !input.contains(['/', ':', '@'])
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Repository path as used in registry URLs (`namespace/name`).
    pub fn repository(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// The authoritative manifest reference: the digest if present, else the tag.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// A copy of this name pinned to `digest` (tag dropped).
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            tag: None,
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Filesystem path components for local storage of this name.
    ///
    /// The last component carries an `@` prefix. Repository segments cannot
    /// contain `@`, so no name's directory can nest inside another VM's.
    pub fn storage_components(&self) -> Vec<String> {
        let mut parts = vec![self.host.replace(':', "_")];
        parts.extend(self.namespace.split('/').filter(|s| !s.is_empty()).map(String::from));
        parts.push(self.name.clone());
        parts.push(match &self.digest {
            Some(digest) => format!("@{}", digest.to_path_component()),
            None => format!("@{}", self.reference()),
        });
        parts
    }
}

impl fmt::Display for RemoteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.repository())?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for RemoteName {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// First path component is a registry host if it has a dot, a port, or is localhost.
fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_host(host: &str) -> std::result::Result<(), &'static str> {
    let (hostname, port) = match host.split_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (host, None),
    };
    if hostname.is_empty() {
        return Err("malformed host");
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        || hostname.starts_with(['.', '-'])
        || hostname.ends_with(['.', '-'])
        || hostname.contains("..")
    {
        return Err("malformed host");
    }
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) || port.parse::<u16>().is_err() {
            return Err("malformed host port");
        }
    }
    Ok(())
}

fn validate_path_segment(segment: &str) -> std::result::Result<(), &'static str> {
    let valid_chars = segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let alnum_edges = segment.starts_with(|c: char| c.is_ascii_alphanumeric())
        && segment.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid_chars && alnum_edges {
        Ok(())
    } else {
        Err("name components must be lowercase alphanumerics separated by '.', '_' or '-'")
    }
}

fn validate_tag(tag: &str) -> std::result::Result<(), &'static str> {
    if tag.is_empty() {
        return Err("empty tag");
    }
    if tag.len() > MAX_TAG_LEN {
        return Err("tag longer than 128 characters");
    }
    let first_ok = tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err("malformed tag")
    }
}
