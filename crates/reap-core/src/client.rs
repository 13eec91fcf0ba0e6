//! Collaborator contracts for the registry and the package metadata service.
//!
//! The engine never talks HTTP itself. It drives a [`RegistryClient`] for
//! manifests and tags and a [`PackageClient`] for the version listing and
//! deletions. Concrete implementations live in [`crate::http`] (network) and
//! [`crate::testing`] (in-memory).

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use reap_schema::{Digest, Manifest, ManifestError, PackageEntry, VersionId};
use thiserror::Error;

/// Failures reported by a collaborator.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit still exceeded after retry: {0}")]
    Throttled(String),

    #[cfg(feature = "network")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response {status}: {message}")]
    Unexpected { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl ClientError {
    /// Whether the error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Registry side: manifests and tags of one repository.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Authenticate against the registry.
    async fn login(&mut self) -> Result<(), ClientError>;

    /// Fetch the manifest stored under `digest`.
    async fn manifest_by_digest(&self, digest: &Digest) -> Result<Manifest, ClientError>;

    /// Fetch the manifest `tag` currently points at.
    async fn manifest_by_tag(&self, tag: &str) -> Result<Manifest, ClientError>;

    /// Resolve `tag` to a digest. Implementations may cache the answer until
    /// [`RegistryClient::delete_tag`] is called for the same tag. Untagging
    /// resolves both the shared and the repointed digest through here.
    async fn tag_digest(&mut self, tag: &str) -> Result<Digest, ClientError>;

    /// Push `manifest` under `tag`, repointing the tag to the manifest's digest.
    async fn put_manifest(&mut self, tag: &str, manifest: &Manifest) -> Result<(), ClientError>;

    /// Forget any cached association for `tag`. This does not delete anything
    /// remotely.
    async fn delete_tag(&mut self, tag: &str) -> Result<(), ClientError>;
}

/// Package metadata side: the version listing of one package.
///
/// Lookups are served from the [`PackageListing`] loaded by
/// [`PackageClient::load_packages`]; only loading and deleting touch the network.
#[async_trait]
pub trait PackageClient: Send + Sync {
    /// Prepare the client (e.g. resolve the owner's account type).
    async fn init(&mut self) -> Result<(), ClientError>;

    /// (Re)load every version of the package. `reset_page_cache` discards any
    /// cached listing pages so the result reflects the remote state.
    async fn load_packages(&mut self, reset_page_cache: bool) -> Result<(), ClientError>;

    /// Delete one package version (and with it, every tag it carries).
    async fn delete_package_version(
        &mut self,
        id: VersionId,
        digest: &Digest,
        tags: &[String],
        label: Option<&str>,
    ) -> Result<(), ClientError>;

    /// The most recently loaded listing.
    fn listing(&self) -> &PackageListing;

    /// Known digests in listing order.
    fn digests(&self) -> Vec<Digest> {
        self.listing().digests()
    }

    /// Union of all tags in use.
    fn tags(&self) -> BTreeSet<String> {
        self.listing().tags()
    }

    /// Digest `tag` points at, if any.
    fn digest_by_tag(&self, tag: &str) -> Option<Digest> {
        self.listing().digest_by_tag(tag).cloned()
    }

    /// Entry for `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if the digest is not in the listing.
    fn package_by_digest(&self, digest: &Digest) -> Result<&PackageEntry, ClientError> {
        self.listing()
            .get(digest)
            .ok_or_else(|| ClientError::NotFound(format!("package version {digest}")))
    }

    /// Version id for `digest`, if known.
    fn id_by_digest(&self, digest: &Digest) -> Option<VersionId> {
        self.listing().get(digest).map(|e| e.id)
    }
}

/// Digest- and tag-indexed view of one package's versions.
#[derive(Debug, Clone, Default)]
pub struct PackageListing {
    entries: Vec<PackageEntry>,
    by_digest: HashMap<Digest, usize>,
    by_tag: HashMap<String, Digest>,
}

impl PackageListing {
    /// Index `entries`. A digest listed twice keeps its first entry.
    pub fn new(entries: Vec<PackageEntry>) -> Self {
        let mut listing = Self::default();
        for entry in entries {
            if listing.by_digest.contains_key(&entry.digest) {
                continue;
            }
            for tag in &entry.tags {
                listing.by_tag.insert(tag.clone(), entry.digest.clone());
            }
            listing
                .by_digest
                .insert(entry.digest.clone(), listing.entries.len());
            listing.entries.push(entry);
        }
        listing
    }

    /// Entries in listing order.
    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    /// Number of versions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the package has no versions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `digest` is a known version.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.by_digest.contains_key(digest)
    }

    /// Entry for `digest`.
    pub fn get(&self, digest: &Digest) -> Option<&PackageEntry> {
        self.by_digest.get(digest).map(|&i| &self.entries[i])
    }

    /// Digest `tag` points at.
    pub fn digest_by_tag(&self, tag: &str) -> Option<&Digest> {
        self.by_tag.get(tag)
    }

    /// Digests in listing order.
    pub fn digests(&self) -> Vec<Digest> {
        self.entries.iter().map(|e| e.digest.clone()).collect()
    }

    /// All tags in use.
    pub fn tags(&self) -> BTreeSet<String> {
        self.by_tag.keys().cloned().collect()
    }
}
