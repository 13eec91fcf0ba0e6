//! Cascading deletion.
//!
//! Deleting an index also deletes the children only it referenced, and
//! deleting any entry also deletes its referrer artifact (the version tagged
//! `sha256-<hex>` after its digest). The traversal uses an explicit worklist;
//! the deleted set makes it idempotent across parents, referrer chains and
//! repeated invocations.

use reap_schema::{Digest, Manifest};
use tracing::{debug, info, warn};

use crate::client::{PackageClient, RegistryClient};
use crate::error::{CleanupError, Result};
use crate::task::CleanupTask;

struct Pending {
    digest: Digest,
    label: Option<String>,
}

impl<R, P> CleanupTask<R, P>
where
    R: RegistryClient,
    P: PackageClient,
{
    /// Delete every digest in the delete set, cascading into children and
    /// referrers. Safe to call again: already deleted digests are skipped.
    ///
    /// # Errors
    ///
    /// Propagates the first collaborator failure; earlier deletions stay.
    pub async fn do_delete(&mut self) -> Result<()> {
        if self.plan.delete.is_empty() {
            info!("Nothing to delete");
            return Ok(());
        }

        let scheduled: Vec<Digest> = self.plan.delete.iter().cloned().collect();
        for digest in scheduled {
            if self.packages.listing().contains(&digest) {
                self.delete_image(&digest).await?;
            } else {
                warn!("{digest} is scheduled but no longer listed, skipping");
            }
        }
        Ok(())
    }

    /// Delete `digest` and whatever depends on it alone.
    ///
    /// Children shared with a surviving index only lose this parent. Children
    /// carrying an excluded tag are never deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::MissingManifest`] if a manifest to delete is
    /// gone from the registry, or the collaborator error for other failures.
    pub async fn delete_image(&mut self, digest: &Digest) -> Result<()> {
        let mut work = vec![Pending {
            digest: digest.clone(),
            label: None,
        }];

        while let Some(Pending { digest, label }) = work.pop() {
            if self.plan.deleted.contains(&digest) {
                continue;
            }

            let manifest = self.fetch_for_delete(&digest).await?;
            self.delete_version(&digest, label.as_deref()).await?;
            self.plan.deleted.insert(digest.clone());
            self.stats.deleted += 1;
            if manifest.is_index() {
                self.stats.multi_arch_deleted += 1;
            }

            for child in manifest.children() {
                let child_digest = &child.digest;
                if self.plan.deleted.contains(child_digest)
                    || !self.packages.listing().contains(child_digest)
                {
                    continue;
                }
                if self.carries_excluded_tag(child_digest) {
                    debug!("keeping {child_digest}: it carries an excluded tag");
                    self.graph.references_mut().detach(child_digest, &digest);
                    continue;
                }
                let references = self.graph.references_mut();
                if !references.contains(child_digest) {
                    warn!("{child_digest} is a child of {digest} but has no recorded parent, skipping");
                    continue;
                }
                if references.is_only_parent(child_digest, &digest) {
                    references.remove(child_digest);
                    work.push(Pending {
                        digest: child_digest.clone(),
                        label: Some(child.label()),
                    });
                } else {
                    references.detach(child_digest, &digest);
                    debug!("keeping {child_digest}: still referenced by another index");
                }
            }

            let referrer_tag = digest.referrer_tag();
            if let Some(referrer) = self.packages.digest_by_tag(&referrer_tag) {
                if self.carries_excluded_tag(&referrer) {
                    debug!("keeping referrer {referrer}: it carries an excluded tag");
                    continue;
                }
                work.push(Pending {
                    digest: referrer,
                    label: Some("referrer".to_string()),
                });
            }
        }
        Ok(())
    }

    async fn fetch_for_delete(&self, digest: &Digest) -> Result<Manifest> {
        match self.registry.manifest_by_digest(digest).await {
            Ok(manifest) => Ok(manifest),
            Err(e) if e.is_not_found() => Err(CleanupError::MissingManifest {
                digest: digest.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_version(&mut self, digest: &Digest, label: Option<&str>) -> Result<()> {
        let entry = self.packages.package_by_digest(digest)?;
        let (id, tags) = (entry.id, entry.tags.clone());
        let shown = match label {
            Some(label) => format!("{digest} ({label})"),
            None if tags.is_empty() => digest.to_string(),
            None => format!("{digest} [{}]", tags.join(", ")),
        };

        if self.config.dry_run {
            info!("dry-run: would delete {shown}");
            return Ok(());
        }
        self.packages
            .delete_package_version(id, digest, &tags, label)
            .await?;
        info!("deleted {shown}");
        Ok(())
    }

    fn carries_excluded_tag(&self, digest: &Digest) -> bool {
        self.packages
            .listing()
            .get(digest)
            .is_some_and(|e| e.tags.iter().any(|t| self.plan.is_excluded(t)))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CleanupConfig;
    use crate::task::CleanupTask;
    use crate::testing::{
        MemoryPackages, MemoryRegistry, MemoryStore, index_manifest, labelled_index,
        leaf_manifest,
    };

    fn task(store: &MemoryStore, config: CleanupConfig) -> CleanupTask<MemoryRegistry, MemoryPackages> {
        CleanupTask::new(config, store.registry(), store.packages()).unwrap()
    }

    async fn loaded(store: &MemoryStore, config: CleanupConfig) -> CleanupTask<MemoryRegistry, MemoryPackages> {
        let mut task = task(store, config);
        task.init().await.unwrap();
        task.reload().await.unwrap();
        task
    }

    #[tokio::test]
    async fn index_takes_its_children_and_referrer() {
        let store = MemoryStore::new();
        let amd = store.push(leaf_manifest("amd"), &[]);
        let arm = store.push(leaf_manifest("arm"), &[]);
        let image = store.push(index_manifest(&[&amd, &arm]), &["v1"]);
        let sbom = store.push(leaf_manifest("sbom"), &[image.referrer_tag().as_str()]);

        let mut task = loaded(&store, CleanupConfig::default()).await;
        task.delete_image(&image).await.unwrap();

        for digest in [&image, &amd, &arm, &sbom] {
            assert!(!store.has_version(digest), "{digest} should be gone");
        }
        let stats = task.stats();
        assert_eq!(stats.deleted, 4);
        assert_eq!(stats.multi_arch_deleted, 1);
    }

    #[tokio::test]
    async fn shared_child_survives_until_last_parent() {
        let store = MemoryStore::new();
        let shared = store.push(leaf_manifest("shared"), &[]);
        let p1 = store.push(labelled_index("p1", &[&shared]), &["p1"]);
        let p2 = store.push(labelled_index("p2", &[&shared]), &["p2"]);

        let mut task = loaded(&store, CleanupConfig::default()).await;
        task.delete_image(&p1).await.unwrap();

        assert!(store.has_version(&shared));
        let parents = task.graph().references().parents(&shared).unwrap();
        assert_eq!(parents.len(), 1);
        assert!(parents.contains(&p2));

        task.delete_image(&p2).await.unwrap();
        assert!(!store.has_version(&shared));
        assert!(!task.graph().references().contains(&shared));
        assert_eq!(task.stats().deleted, 3);
    }

    #[tokio::test]
    async fn repeated_delete_does_not_double_count() {
        let store = MemoryStore::new();
        let a = store.push(leaf_manifest("a"), &[]);
        let image = store.push(index_manifest(&[&a]), &[]);

        let mut task = loaded(&store, CleanupConfig::default()).await;
        assert!(task.plan.schedule(&image));
        task.do_delete().await.unwrap();
        task.do_delete().await.unwrap();

        assert_eq!(task.stats().deleted, 2);
        assert_eq!(store.deletions().len(), 2);
    }

    #[tokio::test]
    async fn excluded_child_is_kept() {
        let store = MemoryStore::new();
        let pinned = store.push(leaf_manifest("pinned"), &["keep-me"]);
        let other = store.push(leaf_manifest("other"), &[]);
        let image = store.push(index_manifest(&[&pinned, &other]), &[]);

        let config = CleanupConfig {
            exclude_tags: Some("keep-*".to_string()),
            ..CleanupConfig::default()
        };
        let mut task = loaded(&store, config).await;
        task.delete_image(&image).await.unwrap();

        assert!(store.has_version(&pinned));
        assert!(!store.has_version(&other));
    }

    #[tokio::test]
    async fn excluded_referrer_is_kept() {
        let store = MemoryStore::new();
        let image = store.push(leaf_manifest("image"), &[]);
        let tag = image.referrer_tag();
        let sig = store.push(leaf_manifest("sig"), &[tag.as_str()]);

        let config = CleanupConfig {
            exclude_tags: Some("sha256-*".to_string()),
            ..CleanupConfig::default()
        };
        let mut task = loaded(&store, config).await;
        task.delete_image(&image).await.unwrap();

        assert!(!store.has_version(&image));
        assert!(store.has_version(&sig));
    }

    #[tokio::test]
    async fn referrer_with_an_excluded_tag_is_kept() {
        let store = MemoryStore::new();
        let image = store.push(leaf_manifest("image"), &[]);
        let tag = image.referrer_tag();
        let sig = store.push(leaf_manifest("sig"), &[tag.as_str(), "keep-sig"]);

        let config = CleanupConfig {
            exclude_tags: Some("keep-*".to_string()),
            delete_untagged: true,
            ..CleanupConfig::default()
        };
        let mut task = loaded(&store, config).await;
        task.delete_untagged();
        task.do_delete().await.unwrap();

        assert!(!store.has_version(&image));
        assert!(store.has_version(&sig));
        assert!(store.tags_of(&sig).contains(&"keep-sig".to_string()));
        assert_eq!(task.stats().deleted, 1);
    }

    #[tokio::test]
    async fn child_without_recorded_parent_is_kept() {
        let store = MemoryStore::new();
        let child = store.push(leaf_manifest("child"), &[]);
        let image = store.push(index_manifest(&[&child]), &["v1"]);

        let mut task = loaded(&store, CleanupConfig::default()).await;
        task.graph.references_mut().remove(&child);
        task.delete_image(&image).await.unwrap();

        assert!(!store.has_version(&image));
        assert!(store.has_version(&child));
        assert_eq!(task.stats().deleted, 1);
    }

    #[tokio::test]
    async fn excluded_child_leaves_no_empty_parent_set() {
        let store = MemoryStore::new();
        let pinned = store.push(leaf_manifest("pinned"), &["keep-me"]);
        let image = store.push(index_manifest(&[&pinned]), &[]);

        let config = CleanupConfig {
            exclude_tags: Some("keep-*".to_string()),
            ..CleanupConfig::default()
        };
        let mut task = loaded(&store, config).await;
        task.delete_image(&image).await.unwrap();

        assert!(store.has_version(&pinned));
        assert!(!task.graph().references().contains(&pinned));
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing_but_counts() {
        let store = MemoryStore::new();
        let a = store.push(leaf_manifest("a"), &[]);
        let image = store.push(index_manifest(&[&a]), &["old"]);

        let config = CleanupConfig {
            dry_run: true,
            ..CleanupConfig::default()
        };
        let mut task = loaded(&store, config).await;
        task.delete_image(&image).await.unwrap();

        assert!(store.has_version(&image));
        assert!(store.has_version(&a));
        assert!(store.deletions().is_empty());
        assert_eq!(task.stats().deleted, 2);
    }

    #[tokio::test]
    async fn missing_manifest_is_fatal() {
        let store = MemoryStore::new();
        let a = store.push(leaf_manifest("a"), &[]);

        let mut task = loaded(&store, CleanupConfig::default()).await;
        store.drop_manifest(&a);
        let err = task.delete_image(&a).await.unwrap_err();
        assert!(matches!(err, crate::error::CleanupError::MissingManifest { .. }));
        assert!(store.has_version(&a));
    }

    #[tokio::test]
    async fn empty_delete_set_is_a_no_op() {
        let store = MemoryStore::new();
        store.push(leaf_manifest("a"), &["v1"]);

        let mut task = loaded(&store, CleanupConfig::default()).await;
        task.do_delete().await.unwrap();
        assert_eq!(task.stats().deleted, 0);
    }
}
