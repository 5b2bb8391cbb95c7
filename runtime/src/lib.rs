//! vmpull Runtime - registry client, content store and pull orchestration.
//!
//! Pulls VM images (disk, NVRAM and config blobs packaged as OCI artifacts)
//! from OCI registries into a local, deduplicated store.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod oci;

// Re-export common types
pub use cache::{ContentStore, ContentStoreEntry, LinkMethod, Reclaimer, SpaceProbe, SysinfoProbe};
pub use oci::{
    CredentialChain, Credentials, Descriptor, Digest, ImageManifest, PullLocks, Registry,
    RegistryApi, RemoteName, VmImageRef, VmPuller, VmStorage,
};

/// vmpull runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
