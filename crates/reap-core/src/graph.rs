//! Reference graph between multi-architecture indexes and their children.
//!
//! Built once per reload from a full manifest snapshot of every known digest.
//! The [`ReferenceMap`] records, for every child digest that is itself a known
//! package version, the set of index digests listing it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use reap_schema::{Digest, Manifest};
use tracing::debug;

use crate::client::RegistryClient;
use crate::error::{CleanupError, Result};

/// child digest -> digests of the indexes that reference it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    parents: BTreeMap<Digest, BTreeSet<Digest>>,
}

impl ReferenceMap {
    /// Record that `parent` lists `child`.
    pub fn add(&mut self, child: Digest, parent: Digest) {
        self.parents.entry(child).or_default().insert(parent);
    }

    /// Parents recorded for `child`.
    pub fn parents(&self, child: &Digest) -> Option<&BTreeSet<Digest>> {
        self.parents.get(child)
    }

    /// Whether `child` has any recorded parent.
    pub fn contains(&self, child: &Digest) -> bool {
        self.parents.contains_key(child)
    }

    /// Whether `parent` is the one and only recorded parent of `child`.
    pub fn is_only_parent(&self, child: &Digest, parent: &Digest) -> bool {
        self.parents
            .get(child)
            .is_some_and(|p| p.len() == 1 && p.contains(parent))
    }

    /// Drop the `child` -> `parent` edge, and `child` itself once no parent
    /// is left.
    pub fn detach(&mut self, child: &Digest, parent: &Digest) {
        if let Some(parents) = self.parents.get_mut(child) {
            parents.remove(parent);
            if parents.is_empty() {
                self.parents.remove(child);
            }
        }
    }

    /// Drop `child` and all its edges.
    pub fn remove(&mut self, child: &Digest) {
        self.parents.remove(child);
    }

    /// Number of children with at least one recorded parent.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Whether no edges are recorded.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Manifest snapshot of one reload plus the reference map derived from it.
#[derive(Debug, Clone, Default)]
pub struct ManifestGraph {
    manifests: HashMap<Digest, Manifest>,
    references: ReferenceMap,
}

impl ManifestGraph {
    /// Fetch the manifest of every digest in `digests` and link known children
    /// to their parents.
    ///
    /// Children that are not in `digests` are skipped here; they are what
    /// ghost and partial detection look for.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::MissingManifest`] if the registry has no manifest
    /// for a listed digest, or the client error for any other fetch failure.
    pub async fn build<R>(registry: &R, digests: &[Digest]) -> Result<Self>
    where
        R: RegistryClient + ?Sized,
    {
        let known: HashSet<&Digest> = digests.iter().collect();
        let mut graph = Self::default();

        for digest in digests {
            let manifest = match registry.manifest_by_digest(digest).await {
                Ok(m) => m,
                Err(e) if e.is_not_found() => {
                    return Err(CleanupError::MissingManifest {
                        digest: digest.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            for child in manifest.children() {
                if known.contains(&child.digest) {
                    debug!("{} -> {} ({})", digest, child.digest, child.label());
                    graph.references.add(child.digest.clone(), digest.clone());
                }
            }
            graph.manifests.insert(digest.clone(), manifest);
        }

        debug!(
            "Built reference graph: {} manifests, {} referenced children",
            graph.manifests.len(),
            graph.references.len()
        );
        Ok(graph)
    }

    /// Snapshot manifest for `digest`.
    pub fn manifest(&self, digest: &Digest) -> Option<&Manifest> {
        self.manifests.get(digest)
    }

    /// Whether `digest` is an index in the snapshot.
    pub fn is_index(&self, digest: &Digest) -> bool {
        self.manifest(digest).is_some_and(Manifest::is_index)
    }

    /// The reference map.
    pub fn references(&self) -> &ReferenceMap {
        &self.references
    }

    /// Mutable access for the deletion cascade.
    pub fn references_mut(&mut self) -> &mut ReferenceMap {
        &mut self.references
    }

    /// Every index manifest in the snapshot.
    pub fn indexes(&self) -> impl Iterator<Item = (&Digest, &Manifest)> {
        self.manifests.iter().filter(|(_, m)| m.is_index())
    }
}
