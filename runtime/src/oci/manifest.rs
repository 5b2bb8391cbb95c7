//! Manifest documents served by a registry.
//!
//! A registry answers a manifest request with either a concrete manifest
//! (config + ordered layers) or an index listing per-platform manifests.
//! Both shapes are modelled by [`ManifestDocument`].

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use vmpull_core::error::{Result, VmError};

use super::digest::Digest;

/// Largest manifest body accepted from a registry (4 MiB).
pub const MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

/// Index → index nesting accepted before giving up.
pub const MAX_INDEX_DEPTH: usize = 2;

/// Media types understood by the pull pipeline.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    pub const VM_CONFIG: &str = "application/vnd.vmpull.config.v1+json";
    pub const VM_DISK: &str = "application/vnd.vmpull.disk.v1";
    pub const VM_NVRAM: &str = "application/vnd.vmpull.nvram.v1";

    /// `Accept` header value for manifest requests.
    pub fn accept_header() -> String {
        [OCI_MANIFEST, DOCKER_MANIFEST, OCI_INDEX, DOCKER_MANIFEST_LIST].join(", ")
    }
}

/// Content descriptor: what a manifest says about a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Target platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Platform of the running host in registry vocabulary.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: None,
        }
    }

    fn matches(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

/// Concrete manifest: config plus layers in apply order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Image index: per-platform manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// Either shape a manifest request can return.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Index(ImageIndex),
    Concrete(ImageManifest),
}

/// Role of a layer inside the assembled VM directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    Disk,
    Nvram,
}

impl LayerRole {
    pub fn of(descriptor: &Descriptor) -> Result<Self> {
        match descriptor.media_type.as_str() {
            media_types::VM_DISK => Ok(LayerRole::Disk),
            media_types::VM_NVRAM => Ok(LayerRole::Nvram),
            other => Err(VmError::ManifestError(format!(
                "unsupported layer media type '{}' for {}",
                other, descriptor.digest
            ))),
        }
    }
}

/// A concrete manifest together with the exact bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// Digest of `bytes`
    pub digest: Digest,
    /// Digest of the first document the reference pointed at. Equal to
    /// `digest` unless an index was resolved on the way.
    pub root_digest: Digest,
    pub media_type: String,
    pub bytes: Bytes,
    pub manifest: ImageManifest,
}

impl ManifestDocument {
    /// Parse a manifest body, using the response `Content-Type` when present.
    pub fn parse(content_type: Option<&str>, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MANIFEST_BYTES {
            return Err(VmError::ManifestError(format!(
                "manifest is {} bytes, limit is {}",
                bytes.len(),
                MAX_MANIFEST_BYTES
            )));
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| VmError::ManifestError(format!("malformed manifest JSON: {}", e)))?;

        // Content-Type parameters (e.g. charset) are irrelevant
        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .filter(|ct| !ct.is_empty() && ct != "application/json")
            .or_else(|| {
                value
                    .get("mediaType")
                    .and_then(|m| m.as_str())
                    .map(String::from)
            });

        let is_index = match declared.as_deref() {
            Some(media_types::OCI_INDEX) | Some(media_types::DOCKER_MANIFEST_LIST) => true,
            Some(media_types::OCI_MANIFEST) | Some(media_types::DOCKER_MANIFEST) => false,
            Some(other) => {
                return Err(VmError::ManifestError(format!(
                    "unsupported manifest media type '{}'",
                    other
                )))
            }
            None => value.get("manifests").is_some(),
        };

        if is_index {
            let index: ImageIndex = serde_json::from_value(value)
                .map_err(|e| VmError::ManifestError(format!("malformed image index: {}", e)))?;
            Ok(ManifestDocument::Index(index))
        } else {
            let manifest: ImageManifest = serde_json::from_value(value)
                .map_err(|e| VmError::ManifestError(format!("malformed manifest: {}", e)))?;
            if manifest.schema_version != 2 {
                return Err(VmError::ManifestError(format!(
                    "unsupported schema version {}",
                    manifest.schema_version
                )));
            }
            Ok(ManifestDocument::Concrete(manifest))
        }
    }
}

impl ImageIndex {
    /// Pick the entry for `platform`.
    ///
    /// A single entry without platform information is taken as-is.
    pub fn select(&self, platform: &Platform) -> Result<&Descriptor> {
        if let Some(entry) = self
            .manifests
            .iter()
            .find(|entry| entry.platform.as_ref().is_some_and(|p| p.matches(platform)))
        {
            return Ok(entry);
        }

        match self.manifests.as_slice() {
            [only] if only.platform.is_none() => Ok(only),
            _ => {
                let available: Vec<String> = self
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                Err(VmError::ManifestError(format!(
                    "no manifest for platform {}/{} (available: {})",
                    platform.os,
                    platform.architecture,
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                )))
            }
        }
    }
}

impl ImageManifest {
    /// Check that every layer is something a VM directory can hold.
    ///
    /// Requires at least one disk layer and at most one NVRAM layer.
    pub fn validate_layout(&self) -> Result<()> {
        let mut disks = 0;
        let mut nvram = 0;
        for layer in &self.layers {
            match LayerRole::of(layer)? {
                LayerRole::Disk => disks += 1,
                LayerRole::Nvram => nvram += 1,
            }
        }
        if disks == 0 {
            return Err(VmError::ManifestError("manifest has no disk layer".to_string()));
        }
        if nvram > 1 {
            return Err(VmError::ManifestError(
                "manifest has more than one NVRAM layer".to_string(),
            ));
        }
        Ok(())
    }

    /// Disk layers in apply order.
    pub fn disk_layers(&self) -> impl Iterator<Item = &Descriptor> {
        self.layers
            .iter()
            .filter(|l| l.media_type == media_types::VM_DISK)
    }

    pub fn nvram_layer(&self) -> Option<&Descriptor> {
        self.layers
            .iter()
            .find(|l| l.media_type == media_types::VM_NVRAM)
    }

    /// Config followed by layers, each digest once, in manifest order.
    pub fn unique_blobs(&self) -> Vec<&Descriptor> {
        let mut seen = std::collections::HashSet::new();
        std::iter::once(&self.config)
            .chain(self.layers.iter())
            .filter(|d| seen.insert(d.digest.clone()))
            .collect()
    }

    /// Sum of declared config and layer sizes.
    pub fn total_size(&self) -> u64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }
}
