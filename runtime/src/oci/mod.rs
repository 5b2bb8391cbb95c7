//! OCI registry support for VM images.
//!
//! VM images are ordinary OCI artifacts whose layers are raw disk and NVRAM
//! blobs instead of filesystem tarballs.
//!
//! ```text
//! RemoteName ──► Registry ──► manifest ──► ContentStore ──► VmStorage
//!   (parse)     (auth, retry)   (layout)   (verify, link)   (publish)
//! ```

pub mod auth;
pub mod credentials;
pub mod digest;
pub mod lock;
pub mod manifest;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod store;

pub use auth::{AuthContext, BearerChallenge, Credentials};
pub use credentials::{
    CredentialChain, CredentialProvider, CredentialStore, DockerConfigCredentials, EnvCredentials,
};
pub use digest::{Digest, DigestHasher};
pub use lock::{PullLockGuard, PullLocks};
pub use manifest::{Descriptor, ImageIndex, ImageManifest, LayerRole, Platform, ResolvedManifest};
pub use pull::VmPuller;
pub use reference::RemoteName;
pub use registry::{BlobStream, Registry, RegistryApi};
pub use store::{PublishedVm, StagingDir, VmImageRef, VmStorage};
