//! Content-addressable blob storage.
//!
//! - `ContentStore`: verified blobs keyed by digest, with resumable staging
//! - `Linker`: clone/hardlink/copy materialization of stored blobs
//! - `Reclaimer`: least-recently-used eviction of unreferenced blobs

pub mod content_store;
pub mod link;
pub mod reclaim;

pub use content_store::{BlobWriter, ContentStore, ContentStoreEntry, PinGuard};
pub use link::{Access, LinkMethod, Linker};
pub use reclaim::{estimate_required, ReclaimOutcome, Reclaimer, SpaceProbe, SysinfoProbe};
