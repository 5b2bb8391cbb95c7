//! Local VM namespace.
//!
//! Published VMs live under `oci/<host>/<namespace…>/<name>/@<tag|digest>/`
//! with a `vm.json` record listing every digest they were built from. The
//! record is what keeps those blobs alive in the content store. Purely
//! local VMs live under `vms/<name>/` and are only checked for existence.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmpull_core::config::StorageConfig;
use vmpull_core::error::{Result, VmError};

use super::digest::Digest;
use super::manifest::Descriptor;
use super::reference::RemoteName;

/// Record file inside each published VM directory.
pub const VM_RECORD: &str = "vm.json";
pub const CONFIG_FILE: &str = "config.json";
pub const DISK_FILE: &str = "disk.img";
pub const NVRAM_FILE: &str = "nvram.bin";

const STAGING_DIR: &str = ".staging";

/// A VM assembled from a pulled manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmImageRef {
    /// Canonical remote name it was pulled as
    pub name: String,
    pub manifest_digest: Digest,
    pub config: Descriptor,
    /// Layers in apply order
    pub layers: Vec<Descriptor>,
    /// Declared size of config and layers
    pub size_bytes: u64,
    pub pulled_at: DateTime<Utc>,
}

impl VmImageRef {
    pub fn new(
        name: &RemoteName,
        manifest_digest: Digest,
        config: Descriptor,
        layers: Vec<Descriptor>,
    ) -> Self {
        let size_bytes = config.size + layers.iter().map(|l| l.size).sum::<u64>();
        Self {
            name: name.to_string(),
            manifest_digest,
            config,
            layers,
            size_bytes,
            pulled_at: Utc::now(),
        }
    }

    /// Every content store digest this VM depends on.
    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        std::iter::once(&self.manifest_digest)
            .chain(std::iter::once(&self.config.digest))
            .chain(self.layers.iter().map(|l| &l.digest))
    }
}

/// A published VM and where it lives.
#[derive(Debug, Clone)]
pub struct PublishedVm {
    pub path: PathBuf,
    pub record: VmImageRef,
}

/// Directory a VM is assembled in before publishing.
///
/// Removed on drop unless it was published.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    published: bool,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.published && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up VM staging directory"
                );
            }
        }
    }
}

/// The local VM namespace.
pub struct VmStorage {
    oci_dir: PathBuf,
    vms_dir: PathBuf,
}

impl VmStorage {
    pub fn new(storage: &StorageConfig) -> Result<Self> {
        let oci_dir = storage.oci_dir();
        let vms_dir = storage.vms_dir();
        for dir in [&oci_dir, &vms_dir, &oci_dir.join(STAGING_DIR)] {
            std::fs::create_dir_all(dir).map_err(|e| {
                VmError::StorageError(format!(
                    "Failed to create VM storage directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(Self { oci_dir, vms_dir })
    }

    /// Directory a remote name is published at.
    pub fn path_for(&self, name: &RemoteName) -> PathBuf {
        name.storage_components()
            .iter()
            .fold(self.oci_dir.clone(), |path, part| path.join(part))
    }

    /// Whether `name` has been published.
    pub fn exists(&self, name: &RemoteName) -> bool {
        self.path_for(name).join(VM_RECORD).is_file()
    }

    /// Whether a purely local VM called `name` exists.
    pub fn local_exists(&self, name: &str) -> bool {
        RemoteName::is_local_identifier(name) && self.vms_dir.join(name.trim()).is_dir()
    }

    /// Record of a published VM.
    pub fn load(&self, name: &RemoteName) -> Result<Option<VmImageRef>> {
        let record_path = self.path_for(name).join(VM_RECORD);
        if !record_path.is_file() {
            return Ok(None);
        }
        read_record(&record_path).map(Some)
    }

    /// Fresh directory under `oci/.staging/` to assemble a VM in.
    pub fn begin_staging(&self) -> Result<StagingDir> {
        let path = self
            .oci_dir
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path).map_err(|e| {
            VmError::StorageError(format!(
                "Failed to create staging directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(StagingDir {
            path,
            published: false,
        })
    }

    /// Write the record into `staging` and move it into place under `name`.
    ///
    /// An existing VM with the same name is replaced. Readers see either the
    /// old directory or the complete new one.
    pub fn publish(
        &self,
        name: &RemoteName,
        mut staging: StagingDir,
        record: &VmImageRef,
    ) -> Result<PathBuf> {
        let record_path = staging.path.join(VM_RECORD);
        std::fs::write(&record_path, serde_json::to_string_pretty(record)?).map_err(|e| {
            VmError::StorageError(format!(
                "Failed to write VM record {}: {}",
                record_path.display(),
                e
            ))
        })?;

        let target = self.path_for(name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let replaced = if target.exists() {
            let aside = self
                .oci_dir
                .join(STAGING_DIR)
                .join(format!("{}-replaced", uuid::Uuid::new_v4()));
            std::fs::rename(&target, &aside)?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = std::fs::rename(&staging.path, &target) {
            if let Some(ref old) = replaced {
                let _ = std::fs::rename(old, &target);
            }
            return Err(VmError::StorageError(format!(
                "Failed to publish {} at {}: {}",
                name,
                target.display(),
                e
            )));
        }
        staging.published = true;

        if let Some(old) = replaced {
            if let Err(e) = std::fs::remove_dir_all(&old) {
                tracing::warn!(path = %old.display(), error = %e, "Failed to remove replaced VM");
            }
        }

        tracing::info!(name = %name, path = %target.display(), "Published VM");
        Ok(target)
    }

    /// All published VMs, sorted by name.
    pub fn list(&self) -> Result<Vec<PublishedVm>> {
        let mut found = Vec::new();
        let mut pending = vec![self.oci_dir.clone()];

        while let Some(dir) = pending.pop() {
            let record_path = dir.join(VM_RECORD);
            if record_path.is_file() {
                match read_record(&record_path) {
                    Ok(record) => found.push(PublishedVm { path: dir, record }),
                    Err(e) => tracing::warn!(
                        path = %record_path.display(),
                        error = %e,
                        "Skipping unreadable VM record"
                    ),
                }
                continue;
            }

            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() && entry.file_name() != STAGING_DIR {
                    pending.push(entry.path());
                }
            }
        }

        found.sort_by(|a, b| a.record.name.cmp(&b.record.name));
        Ok(found)
    }

    /// Names of purely local VMs.
    pub fn list_local(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.vms_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Union of digests referenced by every published VM.
    pub fn referenced_digests(&self) -> Result<HashSet<Digest>> {
        Ok(self
            .list()?
            .iter()
            .flat_map(|vm| vm.record.digests().cloned().collect::<Vec<_>>())
            .collect())
    }
}

fn read_record(path: &Path) -> Result<VmImageRef> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        VmError::StorageError(format!("Failed to read VM record {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&data)?)
}
