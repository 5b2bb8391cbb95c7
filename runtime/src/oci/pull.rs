//! VM pull orchestrator.
//!
//! Resolves a remote name to a manifest, makes room in the content store,
//! fetches missing blobs with bounded parallelism, assembles the VM
//! directory and publishes it atomically.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use vmpull_core::config::{PullConfig, StorageConfig};
use vmpull_core::error::{Result, VmError};
use vmpull_core::event::{events, EventEmitter, PullEvent};

use super::lock::PullLocks;
use super::manifest::{Descriptor, ImageManifest};
use super::reference::RemoteName;
use super::registry::RegistryApi;
use super::store::{VmImageRef, VmStorage, CONFIG_FILE, DISK_FILE, NVRAM_FILE};
use crate::cache::{
    estimate_required, Access, ContentStore, Reclaimer, SpaceProbe, SysinfoProbe,
};

/// Pulls remote VMs into local storage.
pub struct VmPuller {
    store: Arc<ContentStore>,
    namespace: Arc<VmStorage>,
    reclaimer: Reclaimer,
    locks: PullLocks,
    emitter: EventEmitter,
    config: PullConfig,
}

/// Everything a blob download task needs, owned.
#[derive(Clone)]
struct FetchContext {
    store: Arc<ContentStore>,
    registry: Arc<dyn RegistryApi>,
    emitter: EventEmitter,
    digest_retries: u32,
    transferred: Arc<AtomicU64>,
}

impl VmPuller {
    pub fn new(
        store: Arc<ContentStore>,
        namespace: Arc<VmStorage>,
        probe: Arc<dyn SpaceProbe>,
        config: PullConfig,
    ) -> Self {
        let reclaimer = Reclaimer::new(
            Arc::clone(&store),
            Arc::clone(&namespace),
            probe,
            config.prune.safety_margin_bytes,
        );
        Self {
            store,
            namespace,
            reclaimer,
            locks: PullLocks::new(),
            emitter: EventEmitter::default(),
            config,
        }
    }

    /// Puller over the storage root, probing free space with sysinfo.
    pub fn open(storage: &StorageConfig, config: PullConfig) -> Result<Self> {
        let store = Arc::new(ContentStore::new(storage)?);
        let namespace = Arc::new(VmStorage::new(storage)?);
        Ok(Self::new(store, namespace, Arc::new(SysinfoProbe), config))
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Share pull exclusion with other pullers in this process.
    pub fn with_locks(mut self, locks: PullLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn namespace(&self) -> &Arc<VmStorage> {
        &self.namespace
    }

    /// Pull `name` from `registry` unless it is already published.
    ///
    /// On failure nothing is published; verified blobs stay in the content
    /// store and partial downloads stay staged for the next attempt.
    pub async fn pull(&self, name: &RemoteName, registry: Arc<dyn RegistryApi>) -> Result<VmImageRef> {
        self.config.validate()?;

        if let Some(existing) = self.namespace.load(name)? {
            tracing::info!(name = %name, digest = %existing.manifest_digest, "VM already present");
            return Ok(existing);
        }

        let key = name.to_string();
        let _guard = self.locks.try_acquire(&key)?;

        // A pull holding the lock may have published while we waited for it
        if let Some(existing) = self.namespace.load(name)? {
            return Ok(existing);
        }

        self.emitter
            .emit(PullEvent::with_string(events::PULL_STARTED, key.clone()));
        tracing::info!(name = %name, concurrency = self.config.concurrency, "Pulling VM");

        match self.pull_locked(name, registry).await {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "Pull failed");
                self.emitter.emit(event(
                    events::PULL_FAILED,
                    [("name", key.into()), ("error", e.to_string().into())],
                ));
                Err(e)
            }
        }
    }

    async fn pull_locked(&self, name: &RemoteName, registry: Arc<dyn RegistryApi>) -> Result<VmImageRef> {
        let resolved = registry.fetch_manifest(&name.reference()).await?;
        if let Some(expected) = name.digest() {
            if *expected != resolved.root_digest {
                return Err(VmError::DigestMismatchError {
                    expected: expected.to_string(),
                    actual: resolved.root_digest.to_string(),
                });
            }
        }
        let manifest = &resolved.manifest;
        manifest.validate_layout()?;

        self.emitter.emit(event(
            events::PULL_MANIFEST_RESOLVED,
            [
                ("digest", resolved.digest.to_string().into()),
                ("layers", manifest.layers.len().into()),
                ("size_bytes", manifest.total_size().into()),
            ],
        ));

        // Keep everything this pull needs out of reach of concurrent prunes
        let _pins = self.store.pin(
            std::iter::once(resolved.digest.clone())
                .chain(manifest.unique_blobs().into_iter().map(|d| d.digest.clone())),
        );

        if self.config.prune.enabled {
            let required = estimate_required(manifest, &self.store) + resolved.bytes.len() as u64;
            let outcome = self.reclaimer.ensure_free_space(required)?;
            for entry in &outcome.evicted {
                self.emitter.emit(event(
                    events::PULL_PRUNE_EVICTED,
                    [
                        ("digest", entry.digest.to_string().into()),
                        ("size_bytes", entry.size_bytes.into()),
                    ],
                ));
            }
        }

        self.store.put_bytes(&resolved.digest, &resolved.bytes).await?;

        let transferred = Arc::new(AtomicU64::new(0));
        self.fetch_blobs(manifest, registry, Arc::clone(&transferred))
            .await?;

        let staging = self.namespace.begin_staging()?;
        let store = Arc::clone(&self.store);
        let layout = manifest.clone();
        let dir = staging.path().to_path_buf();
        let dedup = self.config.deduplicate;
        tokio::task::spawn_blocking(move || assemble(&store, &layout, &dir, dedup))
            .await
            .map_err(|e| VmError::Other(format!("VM assembly task failed: {}", e)))??;

        let record = VmImageRef::new(
            name,
            resolved.digest.clone(),
            manifest.config.clone(),
            manifest.layers.clone(),
        );
        let path = self.namespace.publish(name, staging, &record)?;

        self.emitter.emit(event(
            events::PULL_PUBLISHED,
            [
                ("name", record.name.clone().into()),
                ("digest", record.manifest_digest.to_string().into()),
                ("path", path.display().to_string().into()),
                ("bytes_transferred", transferred.load(Ordering::Relaxed).into()),
            ],
        ));
        Ok(record)
    }

    /// Fetch every blob not yet in the store, at most `concurrency` at a time.
    ///
    /// The first failure aborts the outstanding downloads.
    async fn fetch_blobs(
        &self,
        manifest: &ImageManifest,
        registry: Arc<dyn RegistryApi>,
        transferred: Arc<AtomicU64>,
    ) -> Result<()> {
        let mut pending: VecDeque<Descriptor> = VecDeque::new();
        for blob in manifest.unique_blobs() {
            if self.store.has(&blob.digest) {
                self.store.touch(&blob.digest)?;
                self.emit_skipped(&blob.digest.to_string());
            } else {
                pending.push_back(blob.clone());
            }
        }

        let ctx = FetchContext {
            store: Arc::clone(&self.store),
            registry,
            emitter: self.emitter.clone(),
            digest_retries: self.config.retry.digest_retries,
            transferred,
        };

        let mut tasks = JoinSet::new();
        let mut failure: Option<VmError> = None;
        loop {
            while failure.is_none() && tasks.len() < self.config.concurrency {
                let Some(descriptor) = pending.pop_front() else {
                    break;
                };
                tasks.spawn(fetch_blob(ctx.clone(), descriptor));
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => {
                    Err(VmError::Cancelled("blob download aborted".to_string()))
                }
                Err(e) => Err(VmError::Other(format!("blob download task failed: {}", e))),
            };

            if let Err(e) = outcome {
                if failure.is_none() && !e.is_cancellation() {
                    tracing::warn!(error = %e, outstanding = tasks.len(), "Aborting blob downloads");
                    tasks.abort_all();
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn emit_skipped(&self, digest: &str) {
        self.emitter
            .emit(event(events::PULL_BLOB_SKIPPED, [("digest", digest.into())]));
    }
}

/// Download, verify and commit one blob, retrying digest mismatches.
async fn fetch_blob(ctx: FetchContext, descriptor: Descriptor) -> Result<u64> {
    let mut attempt = 0;
    loop {
        let mut writer = ctx.store.open_for_write(&descriptor.digest).await?;
        if writer.is_committed() {
            // Committed by a concurrent pull while we waited
            ctx.emitter.emit(event(
                events::PULL_BLOB_SKIPPED,
                [("digest", descriptor.digest.to_string().into())],
            ));
            return Ok(0);
        }

        let resumed_from = writer.offset();
        let result = match ctx.registry.fetch_blob_into(&descriptor, &mut writer).await {
            Ok(()) => {
                let fetched = writer.offset().saturating_sub(resumed_from);
                writer.commit().await.map(|size| (size, fetched))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((size, fetched)) => {
                let total = ctx.transferred.fetch_add(fetched, Ordering::Relaxed) + fetched;
                tracing::debug!(digest = %descriptor.digest, size, resumed_from, "Fetched blob");
                ctx.emitter.emit(event(
                    events::PULL_BLOB_FETCHED,
                    [
                        ("digest", descriptor.digest.to_string().into()),
                        ("size_bytes", size.into()),
                        ("bytes_transferred", total.into()),
                    ],
                ));
                return Ok(size);
            }
            Err(e @ VmError::DigestMismatchError { .. }) if attempt < ctx.digest_retries => {
                attempt += 1;
                tracing::warn!(
                    digest = %descriptor.digest,
                    attempt,
                    error = %e,
                    "Blob failed verification, downloading again"
                );
                ctx.emitter.emit(event(
                    events::PULL_BLOB_RETRY,
                    [
                        ("digest", descriptor.digest.to_string().into()),
                        ("attempt", attempt.into()),
                        ("reason", e.to_string().into()),
                    ],
                ));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Materialize config, disk and NVRAM into a staging directory.
fn assemble(store: &ContentStore, manifest: &ImageManifest, dir: &Path, dedup: bool) -> Result<()> {
    store.link_into(
        &manifest.config.digest,
        &dir.join(CONFIG_FILE),
        dedup,
        Access::ReadOnly,
    )?;

    let disks: Vec<&Descriptor> = manifest.disk_layers().collect();
    let disk_path = dir.join(DISK_FILE);
    if let [single] = disks.as_slice() {
        store.link_into(&single.digest, &disk_path, dedup, Access::Writable)?;
    } else {
        // Appending to a shared link would write through into the store
        let file = std::fs::File::create(&disk_path).map_err(|e| {
            VmError::StorageError(format!("Failed to create {}: {}", disk_path.display(), e))
        })?;
        let mut out = std::io::BufWriter::new(file);
        for layer in &disks {
            store.append_to(&layer.digest, &mut out)?;
        }
        out.flush()?;
    }

    if let Some(nvram) = manifest.nvram_layer() {
        store.link_into(&nvram.digest, &dir.join(NVRAM_FILE), dedup, Access::Writable)?;
    }
    Ok(())
}

fn event<const N: usize>(key: &str, fields: [(&str, serde_json::Value); N]) -> PullEvent {
    let map: HashMap<String, serde_json::Value> = fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    PullEvent::with_map(key, map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlobWriter;
    use crate::oci::digest::Digest;
    use crate::oci::manifest::tests::descriptor;
    use crate::oci::manifest::{media_types, ResolvedManifest};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use vmpull_core::config::{PruneConfig, RetryConfig};

    /// In-memory registry with failure injection.
    struct FakeRegistry {
        manifest: ResolvedManifest,
        blobs: HashMap<Digest, Vec<u8>>,
        /// Remaining corrupted deliveries per digest
        corrupt: Mutex<HashMap<Digest, usize>>,
        fail_on: Option<Digest>,
        delay: Duration,
        /// Per-digest delay overriding `delay`
        slow: HashMap<Digest, Duration>,
        manifest_fetches: AtomicUsize,
        blob_fetches: Mutex<HashMap<Digest, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeRegistry {
        fn new(config: &[u8], layers: &[(&str, &[u8])]) -> Self {
            let config_desc = descriptor(media_types::VM_CONFIG, config);
            let layer_descs: Vec<Descriptor> =
                layers.iter().map(|(mt, data)| descriptor(mt, data)).collect();
            let manifest = ImageManifest {
                schema_version: 2,
                media_type: Some(media_types::OCI_MANIFEST.to_string()),
                config: config_desc.clone(),
                layers: layer_descs.clone(),
                annotations: None,
            };
            let bytes = serde_json::to_vec(&manifest).unwrap();

            let mut blobs = HashMap::new();
            blobs.insert(config_desc.digest, config.to_vec());
            for (desc, (_, data)) in layer_descs.iter().zip(layers) {
                blobs.insert(desc.digest.clone(), data.to_vec());
            }

            let digest = Digest::of_bytes(&bytes);
            Self {
                manifest: ResolvedManifest {
                    root_digest: digest.clone(),
                    digest,
                    media_type: media_types::OCI_MANIFEST.to_string(),
                    bytes: Bytes::from(bytes),
                    manifest,
                },
                blobs,
                corrupt: Mutex::new(HashMap::new()),
                fail_on: None,
                delay: Duration::ZERO,
                slow: HashMap::new(),
                manifest_fetches: AtomicUsize::new(0),
                blob_fetches: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn layer(&self, index: usize) -> &Descriptor {
            &self.manifest.manifest.layers[index]
        }

        fn fetches_of(&self, digest: &Digest) -> usize {
            self.blob_fetches.lock().get(digest).copied().unwrap_or(0)
        }

        fn total_blob_fetches(&self) -> usize {
            self.blob_fetches.lock().values().sum()
        }
    }

    #[async_trait]
    impl RegistryApi for FakeRegistry {
        async fn fetch_manifest(&self, _reference: &str) -> Result<ResolvedManifest> {
            self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.manifest.clone())
        }

        async fn fetch_blob_into(&self, descriptor: &Descriptor, writer: &mut BlobWriter) -> Result<()> {
            *self
                .blob_fetches
                .lock()
                .entry(descriptor.digest.clone())
                .or_default() += 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.slow.get(&descriptor.digest).copied().unwrap_or(self.delay);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_on.as_ref() == Some(&descriptor.digest) {
                return Err(VmError::RegistryError {
                    registry: "fake".to_string(),
                    status: 404,
                    message: "blob unknown".to_string(),
                });
            }

            let mut data = self.blobs[&descriptor.digest].clone();
            {
                let mut corrupt = self.corrupt.lock();
                if let Some(remaining) = corrupt.get_mut(&descriptor.digest) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        data[0] ^= 0xff;
                    }
                }
            }
            writer.reset().await?;
            writer.write(&data).await
        }
    }

    struct Unlimited;

    impl SpaceProbe for Unlimited {
        fn available_space(&self, _path: &Path) -> Result<u64> {
            Ok(u64::MAX)
        }
    }

    struct Full;

    impl SpaceProbe for Full {
        fn available_space(&self, _path: &Path) -> Result<u64> {
            Ok(0)
        }
    }

    fn config(concurrency: usize) -> PullConfig {
        PullConfig {
            concurrency,
            deduplicate: false,
            retry: RetryConfig {
                digest_retries: 2,
                ..Default::default()
            },
            prune: PruneConfig {
                enabled: true,
                safety_margin_bytes: 0,
            },
        }
    }

    fn puller(dir: &TempDir, probe: Arc<dyn SpaceProbe>, config: PullConfig) -> VmPuller {
        let storage = StorageConfig::with_home(dir.path());
        VmPuller::new(
            Arc::new(ContentStore::new(&storage).unwrap()),
            Arc::new(VmStorage::new(&storage).unwrap()),
            probe,
            config,
        )
    }

    fn name(s: &str) -> RemoteName {
        RemoteName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_pull_publishes_vm() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(4));
        let registry = Arc::new(FakeRegistry::new(
            br#"{"cpus":2}"#,
            &[
                (media_types::VM_DISK, b"disk-part-1|"),
                (media_types::VM_DISK, b"disk-part-2"),
                (media_types::VM_NVRAM, b"nvram"),
            ],
        ));
        let mut rx = puller.emitter().subscribe();

        let vm = name("ghcr.io/org/vm:1.0");
        let record = puller.pull(&vm, registry.clone()).await.unwrap();
        assert_eq!(record.manifest_digest, registry.manifest.digest);
        assert_eq!(record.layers.len(), 3);

        let path = puller.namespace().path_for(&vm);
        assert_eq!(std::fs::read(path.join(DISK_FILE)).unwrap(), b"disk-part-1|disk-part-2");
        assert_eq!(std::fs::read(path.join(NVRAM_FILE)).unwrap(), b"nvram");
        assert_eq!(std::fs::read(path.join(CONFIG_FILE)).unwrap(), br#"{"cpus":2}"#);
        assert!(puller.store().has(&registry.manifest.digest));
        assert_eq!(puller.namespace().load(&vm).unwrap(), Some(record));

        let mut keys = Vec::new();
        while let Ok(e) = rx.try_recv() {
            keys.push(e.key);
        }
        assert_eq!(keys.first().map(String::as_str), Some(events::PULL_STARTED));
        assert_eq!(keys.last().map(String::as_str), Some(events::PULL_PUBLISHED));
    }

    #[tokio::test]
    async fn test_existing_vm_needs_no_network() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(4));
        let registry = Arc::new(FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk")]));
        let vm = name("ghcr.io/org/vm:1.0");

        let first = puller.pull(&vm, registry.clone()).await.unwrap();
        let second = puller.pull(&vm, registry.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.manifest_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(registry.total_blob_fetches(), 2);
    }

    #[tokio::test]
    async fn test_shared_layer_fetched_once() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(4));
        let shared: &[u8] = b"shared base disk";
        let a = Arc::new(FakeRegistry::new(b"{\"v\":1}", &[(media_types::VM_DISK, shared)]));
        let b = Arc::new(FakeRegistry::new(b"{\"v\":2}", &[(media_types::VM_DISK, shared)]));

        puller.pull(&name("ghcr.io/org/vm:1"), a.clone()).await.unwrap();
        let mut rx = puller.emitter().subscribe();
        puller.pull(&name("ghcr.io/org/vm:2"), b.clone()).await.unwrap();

        let digest = Digest::of_bytes(shared);
        assert_eq!(a.fetches_of(&digest), 1);
        assert_eq!(b.fetches_of(&digest), 0);

        let mut skipped = Vec::new();
        while let Ok(e) = rx.try_recv() {
            if e.key == events::PULL_BLOB_SKIPPED {
                skipped.push(e.field("digest").cloned());
            }
        }
        assert_eq!(skipped, vec![Some(serde_json::Value::from(digest.to_string()))]);
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_retried() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(2));
        let registry = FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk bytes")]);
        let disk = registry.layer(0).digest.clone();
        registry.corrupt.lock().insert(disk.clone(), 1);
        let registry = Arc::new(registry);

        puller.pull(&name("ghcr.io/org/vm:1"), registry.clone()).await.unwrap();
        assert_eq!(registry.fetches_of(&disk), 2);
        assert_eq!(puller.store().read(&disk).unwrap(), b"disk bytes");
    }

    #[tokio::test]
    async fn test_persistent_digest_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(2));
        let registry = FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk bytes")]);
        let disk = registry.layer(0).digest.clone();
        registry.corrupt.lock().insert(disk.clone(), usize::MAX);
        let registry = Arc::new(registry);
        let vm = name("ghcr.io/org/vm:1");

        let err = puller.pull(&vm, registry.clone()).await.unwrap_err();
        assert!(matches!(err, VmError::DigestMismatchError { .. }));
        // One attempt plus two retries
        assert_eq!(registry.fetches_of(&disk), 3);
        assert!(!puller.store().has(&disk));
        assert!(!puller.namespace().exists(&vm));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_order_kept() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(2));
        let mut registry = FakeRegistry::new(
            b"{}",
            &[
                (media_types::VM_DISK, b"1"),
                (media_types::VM_DISK, b"2"),
                (media_types::VM_DISK, b"3"),
                (media_types::VM_DISK, b"4"),
                (media_types::VM_DISK, b"5"),
            ],
        );
        registry.delay = Duration::from_millis(20);
        let registry = Arc::new(registry);
        let vm = name("ghcr.io/org/vm:1");

        puller.pull(&vm, registry.clone()).await.unwrap();
        assert!(registry.max_in_flight.load(Ordering::SeqCst) <= 2);
        let disk = std::fs::read(puller.namespace().path_for(&vm).join(DISK_FILE)).unwrap();
        assert_eq!(disk, b"12345");
    }

    #[tokio::test]
    async fn test_failure_keeps_completed_blobs() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(1));
        let mut registry = FakeRegistry::new(
            b"{}",
            &[
                (media_types::VM_DISK, b"one"),
                (media_types::VM_DISK, b"two"),
                (media_types::VM_DISK, b"three"),
                (media_types::VM_DISK, b"four"),
            ],
        );
        registry.fail_on = Some(registry.layer(2).digest.clone());
        let registry = Arc::new(registry);
        let vm = name("ghcr.io/org/vm:1");

        let err = puller.pull(&vm, registry.clone()).await.unwrap_err();
        assert!(matches!(err, VmError::RegistryError { status: 404, .. }));
        assert!(puller.store().has(&registry.layer(0).digest));
        assert!(puller.store().has(&registry.layer(1).digest));
        assert!(!puller.store().has(&registry.layer(2).digest));
        assert_eq!(registry.fetches_of(&registry.layer(3).digest), 0);
        assert!(!puller.namespace().exists(&vm));
        assert!(puller.namespace().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_name_conflicts() {
        let dir = TempDir::new().unwrap();
        let locks = PullLocks::new();
        let puller = puller(&dir, Arc::new(Unlimited), config(1)).with_locks(locks.clone());
        let registry = Arc::new(FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk")]));
        let vm = name("ghcr.io/org/vm:1");

        let _held = locks.try_acquire(&vm.to_string()).unwrap();
        let err = puller.pull(&vm, registry.clone()).await.unwrap_err();
        assert!(matches!(err, VmError::ConcurrentPullConflictError(_)));
        assert_eq!(registry.manifest_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_insufficient_space_fetches_nothing() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Full), config(2));
        let registry = Arc::new(FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk")]));

        let err = puller
            .pull(&name("ghcr.io/org/vm:1"), registry.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::InsufficientSpaceError { .. }));
        assert_eq!(registry.total_blob_fetches(), 0);
    }

    #[tokio::test]
    async fn test_prune_disabled_skips_space_check() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(2);
        cfg.prune.enabled = false;
        let puller = puller(&dir, Arc::new(Full), cfg);
        let registry = Arc::new(FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk")]));

        assert!(puller.pull(&name("ghcr.io/org/vm:1"), registry).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(0));
        let registry = Arc::new(FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk")]));

        let err = puller.pull(&name("ghcr.io/org/vm:1"), registry).await.unwrap_err();
        assert!(matches!(err, VmError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_unknown_layer_type_rejected_before_download() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(2));
        let registry = Arc::new(FakeRegistry::new(
            b"{}",
            &[
                (media_types::VM_DISK, b"disk"),
                ("application/vnd.oci.image.layer.v1.tar+gzip", b"tar"),
            ],
        ));

        let err = puller.pull(&name("ghcr.io/org/vm:1"), registry.clone()).await.unwrap_err();
        assert!(matches!(err, VmError::ManifestError(_)));
        assert_eq!(registry.total_blob_fetches(), 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_slow_sibling() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(2));
        let mut registry = FakeRegistry::new(
            b"{}",
            &[
                (media_types::VM_DISK, b"slow disk"),
                (media_types::VM_NVRAM, b"missing nvram"),
            ],
        );
        let slow = registry.layer(0).digest.clone();
        registry.delay = Duration::from_millis(50);
        registry.slow.insert(slow.clone(), Duration::from_secs(30));
        registry.fail_on = Some(registry.layer(1).digest.clone());
        let registry = Arc::new(registry);
        let vm = name("ghcr.io/org/vm:1");

        let err = tokio::time::timeout(Duration::from_secs(5), puller.pull(&vm, registry.clone()))
            .await
            .expect("slow download was not aborted")
            .unwrap_err();
        // The abort of the slow sibling does not mask the real failure
        assert!(matches!(err, VmError::RegistryError { status: 404, .. }), "{err}");
        assert_eq!(registry.fetches_of(&slow), 1);
        assert!(!puller.store().has(&slow));
        assert!(!puller.namespace().exists(&vm));
    }

    #[tokio::test]
    async fn test_pull_by_index_digest() {
        let dir = TempDir::new().unwrap();
        let puller = puller(&dir, Arc::new(Unlimited), config(2));
        let mut registry = FakeRegistry::new(b"{}", &[(media_types::VM_DISK, b"disk")]);
        // The name points at an index that resolved to this platform manifest
        let index = Digest::of_bytes(b"image index");
        registry.manifest.root_digest = index.clone();
        let registry = Arc::new(registry);

        let vm = name(&format!("ghcr.io/org/vm@{}", index));
        let record = puller.pull(&vm, registry.clone()).await.unwrap();
        assert_eq!(record.manifest_digest, registry.manifest.digest);
        assert!(puller.namespace().path_for(&vm).join(DISK_FILE).is_file());

        let wrong = name(&format!("ghcr.io/org/vm@{}", registry.manifest.digest));
        let err = puller.pull(&wrong, registry).await.unwrap_err();
        assert!(matches!(err, VmError::DigestMismatchError { .. }));
    }

    #[tokio::test]
    async fn test_dedup_disk_is_not_shared_with_store() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(2);
        cfg.deduplicate = true;
        let puller = puller(&dir, Arc::new(Unlimited), cfg);
        let registry = Arc::new(FakeRegistry::new(
            b"{}",
            &[(media_types::VM_DISK, b"base disk"), (media_types::VM_NVRAM, b"vars")],
        ));
        let vm = name("ghcr.io/org/vm:1");

        puller.pull(&vm, registry.clone()).await.unwrap();
        let path = puller.namespace().path_for(&vm);
        std::fs::write(path.join(DISK_FILE), b"guest wrote").unwrap();
        std::fs::write(path.join(NVRAM_FILE), b"boot order").unwrap();

        assert_eq!(puller.store().read(&registry.layer(0).digest).unwrap(), b"base disk");
        assert_eq!(puller.store().read(&registry.layer(1).digest).unwrap(), b"vars");
    }
}
