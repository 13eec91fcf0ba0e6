//! Shared types for reap: digests, manifests and package versions.

pub mod digest;
pub mod manifest;
pub mod package;

// Re-exports
pub use digest::{Digest, DigestError};
pub use manifest::{ChildDescriptor, Manifest, ManifestError, Platform};
pub use package::{PackageEntry, VersionId};
