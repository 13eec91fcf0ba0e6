//! In-memory registry and package service.
//!
//! [`MemoryStore`] models the remote store: manifests addressed by the SHA-256
//! of their JSON, package versions carrying tags, pushing under a tag
//! repointing that tag, and deleting a version deleting all of its tags.
//! [`MemoryRegistry`] and [`MemoryPackages`] are the two collaborator views of
//! one store; the package view only sees changes after `load_packages`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reap_schema::manifest::{OCI_INDEX, OCI_MANIFEST};
use reap_schema::{Digest, Manifest, PackageEntry, VersionId};
use serde_json::{Value, json};
use sha2::{Digest as _, Sha256};

use crate::client::{ClientError, PackageClient, PackageListing, RegistryClient};

const ARCHITECTURES: [&str; 6] = ["amd64", "arm64", "arm", "ppc64le", "s390x", "386"];

/// Content digest of a manifest as the store computes it.
pub fn digest_of(manifest: &Manifest) -> Digest {
    let bytes = manifest.to_bytes().unwrap_or_default();
    sha256(&bytes)
}

fn sha256(bytes: &[u8]) -> Digest {
    Digest::new(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
}

/// A point in time `minutes` before now.
pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(minutes)
}

/// A single-platform image manifest, unique per `name`.
pub fn leaf_manifest(name: &str) -> Manifest {
    let document = json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": sha256(format!("{name}/config").as_bytes()),
            "size": 2
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": sha256(format!("{name}/layer").as_bytes()),
            "size": 32
        }],
        "annotations": {"org.opencontainers.image.title": name}
    });
    Manifest::Leaf {
        layers: 1,
        document,
    }
}

/// An index listing `children`, one platform per child.
pub fn index_manifest(children: &[&Digest]) -> Manifest {
    index_document(None, children)
}

/// An index listing `children`, made unique by `label`.
pub fn labelled_index(label: &str, children: &[&Digest]) -> Manifest {
    index_document(Some(label), children)
}

fn index_document(label: Option<&str>, children: &[&Digest]) -> Manifest {
    let manifests: Vec<Value> = children
        .iter()
        .enumerate()
        .map(|(i, digest)| {
            json!({
                "mediaType": OCI_MANIFEST,
                "digest": digest.as_str(),
                "size": 512,
                "platform": {"architecture": ARCHITECTURES[i % ARCHITECTURES.len()], "os": "linux"}
            })
        })
        .collect();
    let mut document = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": manifests
    });
    if let Some(label) = label {
        document["annotations"] = json!({"org.opencontainers.image.title": label});
    }
    // Children were built from valid digests above.
    Manifest::from_document(document).unwrap_or_else(|_| Manifest::Index {
        children: Vec::new(),
        document: Value::Null,
    })
}

#[derive(Debug, Default)]
struct StoreState {
    manifests: HashMap<Digest, Manifest>,
    versions: Vec<PackageEntry>,
    next_id: VersionId,
    pushes: Vec<(String, Digest)>,
    deletions: Vec<Digest>,
    manifest_fetches: usize,
}

impl StoreState {
    fn upsert(
        &mut self,
        digest: &Digest,
        manifest: Manifest,
        tags: &[String],
        updated_at: Option<DateTime<Utc>>,
    ) {
        self.manifests.insert(digest.clone(), manifest);
        for version in &mut self.versions {
            if &version.digest != digest {
                version.tags.retain(|t| !tags.contains(t));
            }
        }
        if let Some(version) = self.versions.iter_mut().find(|v| &v.digest == digest) {
            for tag in tags {
                if !version.has_tag(tag) {
                    version.tags.push(tag.clone());
                }
            }
        } else {
            self.next_id += 1;
            self.versions.push(PackageEntry::new(
                self.next_id,
                digest.clone(),
                tags.iter().cloned(),
                updated_at,
            ));
        }
    }

    fn remove(&mut self, digest: &Digest) {
        self.versions.retain(|v| &v.digest != digest);
        self.manifests.remove(digest);
    }
}

/// Shared in-memory remote store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `manifest` as a package version carrying `tags`. Successive pushes
    /// get increasing timestamps, a day in the past.
    pub fn push(&self, manifest: Manifest, tags: &[&str]) -> Digest {
        let offset = i64::try_from(self.state().next_id).unwrap_or(0);
        self.push_at(manifest, tags, Some(minutes_ago(24 * 60 - offset)))
    }

    /// Store `manifest` with an explicit update time.
    pub fn push_at(
        &self,
        manifest: Manifest,
        tags: &[&str],
        updated_at: Option<DateTime<Utc>>,
    ) -> Digest {
        let digest = digest_of(&manifest);
        let tags: Vec<String> = tags.iter().map(ToString::to_string).collect();
        self.state().upsert(&digest, manifest, &tags, updated_at);
        digest
    }

    /// Delete a version and its manifest behind the engine's back.
    pub fn remove_version(&self, digest: &Digest) {
        self.state().remove(digest);
    }

    /// Drop only the manifest, leaving the version listed.
    pub fn drop_manifest(&self, digest: &Digest) {
        self.state().manifests.remove(digest);
    }

    /// Current listing, as a fresh `load_packages` would see it.
    pub fn listing(&self) -> PackageListing {
        PackageListing::new(self.state().versions.clone())
    }

    /// Whether `digest` is still a package version.
    pub fn has_version(&self, digest: &Digest) -> bool {
        self.state().versions.iter().any(|v| &v.digest == digest)
    }

    /// Tags currently on `digest`.
    pub fn tags_of(&self, digest: &Digest) -> Vec<String> {
        self.state()
            .versions
            .iter()
            .find(|v| &v.digest == digest)
            .map(|v| v.tags.clone())
            .unwrap_or_default()
    }

    /// Every `(tag, digest)` pushed through the registry view.
    pub fn pushes(&self) -> Vec<(String, Digest)> {
        self.state().pushes.clone()
    }

    /// Every digest deleted through the package view, in order.
    pub fn deletions(&self) -> Vec<Digest> {
        self.state().deletions.clone()
    }

    /// Number of manifest fetches served.
    pub fn manifest_fetches(&self) -> usize {
        self.state().manifest_fetches
    }

    /// Registry view of this store.
    pub fn registry(&self) -> MemoryRegistry {
        MemoryRegistry {
            store: self.clone(),
            tag_cache: HashMap::new(),
        }
    }

    /// Package view of this store (empty until loaded).
    pub fn packages(&self) -> MemoryPackages {
        MemoryPackages {
            store: self.clone(),
            listing: PackageListing::default(),
        }
    }
}

/// [`RegistryClient`] over a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    store: MemoryStore,
    tag_cache: HashMap<String, Digest>,
}

impl MemoryRegistry {
    fn lookup_tag(&self, tag: &str) -> Result<Digest, ClientError> {
        self.store
            .state()
            .versions
            .iter()
            .find(|v| v.has_tag(tag))
            .map(|v| v.digest.clone())
            .ok_or_else(|| ClientError::NotFound(format!("tag {tag}")))
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn login(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn manifest_by_digest(&self, digest: &Digest) -> Result<Manifest, ClientError> {
        let mut state = self.store.state();
        state.manifest_fetches += 1;
        state
            .manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("manifest {digest}")))
    }

    async fn manifest_by_tag(&self, tag: &str) -> Result<Manifest, ClientError> {
        let digest = self.lookup_tag(tag)?;
        self.manifest_by_digest(&digest).await
    }

    async fn tag_digest(&mut self, tag: &str) -> Result<Digest, ClientError> {
        if let Some(digest) = self.tag_cache.get(tag) {
            return Ok(digest.clone());
        }
        let digest = self.lookup_tag(tag)?;
        self.tag_cache.insert(tag.to_string(), digest.clone());
        Ok(digest)
    }

    async fn put_manifest(&mut self, tag: &str, manifest: &Manifest) -> Result<(), ClientError> {
        let digest = digest_of(manifest);
        let mut state = self.store.state();
        state.upsert(&digest, manifest.clone(), &[tag.to_string()], Some(Utc::now()));
        state.pushes.push((tag.to_string(), digest));
        Ok(())
    }

    async fn delete_tag(&mut self, tag: &str) -> Result<(), ClientError> {
        self.tag_cache.remove(tag);
        Ok(())
    }
}

/// [`PackageClient`] over a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryPackages {
    store: MemoryStore,
    listing: PackageListing,
}

#[async_trait]
impl PackageClient for MemoryPackages {
    async fn init(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn load_packages(&mut self, _reset_page_cache: bool) -> Result<(), ClientError> {
        self.listing = self.store.listing();
        Ok(())
    }

    async fn delete_package_version(
        &mut self,
        id: VersionId,
        digest: &Digest,
        _tags: &[String],
        _label: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut state = self.store.state();
        if !state.versions.iter().any(|v| v.id == id && &v.digest == digest) {
            return Err(ClientError::NotFound(format!("package version {id}")));
        }
        state.remove(digest);
        state.deletions.push(digest.clone());
        Ok(())
    }

    fn listing(&self) -> &PackageListing {
        &self.listing
    }
}
