//! One cleanup cycle over a single package.
//!
//! Phases run strictly in sequence on one task: build the reference graph,
//! reduce the candidates, classify (tag deletion, partial/ghost, orphaned
//! referrers, keep-n tagged, keep-n untagged or delete untagged), delete, and
//! optionally reload and validate. Any untagging invalidates the listing and
//! triggers a full reload before the next classifier.

use std::ops::AddAssign;

use chrono::Utc;
use reap_schema::Digest;
use tracing::{info, warn};

use crate::client::{PackageClient, RegistryClient};
use crate::config::CleanupConfig;
use crate::error::{CleanupError, Result};
use crate::graph::ManifestGraph;
use crate::matcher::TagMatcher;
use crate::plan::CleanupPlan;
use crate::policy;
use crate::reduce::reduce;
use crate::validate::{ValidationReport, validate};

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Package versions deleted (children and referrers included).
    pub deleted: usize,
    /// Of those, how many were multi-architecture indexes.
    pub multi_arch_deleted: usize,
    /// Tags detached from multi-tagged digests.
    pub untagged: usize,
}

impl AddAssign for CleanupStats {
    fn add_assign(&mut self, rhs: Self) {
        self.deleted += rhs.deleted;
        self.multi_arch_deleted += rhs.multi_arch_deleted;
        self.untagged += rhs.untagged;
    }
}

/// Cleanup engine bound to one package's registry and metadata clients.
#[derive(Debug)]
pub struct CleanupTask<R, P> {
    pub(crate) config: CleanupConfig,
    pub(crate) delete_matcher: TagMatcher,
    pub(crate) exclude_matcher: TagMatcher,
    pub(crate) registry: R,
    pub(crate) packages: P,
    pub(crate) graph: ManifestGraph,
    pub(crate) plan: CleanupPlan,
    pub(crate) stats: CleanupStats,
}

impl<R, P> CleanupTask<R, P>
where
    R: RegistryClient,
    P: PackageClient,
{
    /// Bind `config` to the two collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Pattern`] if a tag pattern does not compile.
    pub fn new(config: CleanupConfig, registry: R, packages: P) -> Result<Self> {
        Ok(Self {
            delete_matcher: config.delete_matcher()?,
            exclude_matcher: config.exclude_matcher()?,
            config,
            registry,
            packages,
            graph: ManifestGraph::default(),
            plan: CleanupPlan::default(),
            stats: CleanupStats::default(),
        })
    }

    /// Log in to the registry and prepare the package client.
    ///
    /// # Errors
    ///
    /// Propagates authentication and initialization failures.
    pub async fn init(&mut self) -> Result<()> {
        self.registry.login().await?;
        self.packages.init().await?;
        Ok(())
    }

    /// Reload the listing, rebuild the reference graph and start a fresh plan.
    ///
    /// # Errors
    ///
    /// Fails if the listing cannot be loaded or any known digest's manifest
    /// cannot be fetched.
    pub async fn reload(&mut self) -> Result<()> {
        self.packages.load_packages(true).await?;
        let digests = self.packages.digests();
        info!("Loaded {} package version(s)", digests.len());

        self.graph = ManifestGraph::build(&self.registry, &digests).await?;
        self.plan = CleanupPlan::new(digests);
        reduce(
            &mut self.plan,
            &self.graph,
            self.packages.listing(),
            &self.exclude_matcher,
            self.config.older_than,
            Utc::now(),
        );
        Ok(())
    }

    /// Run every configured policy, delete what they selected and, if
    /// requested, validate the result.
    ///
    /// Expects [`CleanupTask::init`] to have been called.
    ///
    /// # Errors
    ///
    /// Any collaborator failure aborts the run; deletions already made stay.
    pub async fn run(&mut self) -> Result<CleanupStats> {
        self.reload().await?;

        if !self.delete_matcher.is_empty() {
            self.delete_by_tags().await?;
        }

        if self.config.delete_partial_images {
            self.delete_partial_images();
        } else if self.config.delete_ghost_images {
            self.delete_ghost_images();
        }

        if self.config.delete_orphaned_images {
            self.delete_orphaned_images();
        }

        if let Some(n) = self.config.keep_n_tagged {
            self.keep_n_tagged(n);
        }

        if let Some(n) = self.config.keep_n_untagged {
            self.keep_n_untagged(n);
        } else if self.config.delete_untagged {
            self.delete_untagged();
        }

        self.do_delete().await?;

        if self.config.validate {
            self.reload().await?;
            self.validate();
        }

        Ok(self.stats)
    }

    /// Delete the digests of tags matched by `delete-tags`, detaching tags
    /// that share their digest with other tags instead.
    ///
    /// # Errors
    ///
    /// Propagates failures of the untagging round trip or the reload after it.
    pub async fn delete_by_tags(&mut self) -> Result<()> {
        let selection =
            policy::select_tags(&self.plan, self.packages.listing(), &self.delete_matcher);
        if selection.is_empty() {
            info!("No tags matched the delete patterns");
            return Ok(());
        }

        for tag in &selection.untag {
            self.untag(tag).await?;
        }
        if !selection.untag.is_empty() && !self.config.dry_run {
            self.reload().await?;
        }

        for tag in &selection.standard {
            let Some(digest) = self.packages.digest_by_tag(tag) else {
                warn!("tag {tag} disappeared before it could be deleted");
                continue;
            };
            if self.plan.schedule(&digest) {
                info!("tag {tag} ({digest}) marked for deletion");
            }
        }
        Ok(())
    }

    /// Detach `tag` from its multi-tagged digest.
    ///
    /// The registry deletes every tag of a digest together, so the tag is
    /// first repointed at an emptied copy of its manifest, and that new
    /// single-tag digest is deleted.
    async fn untag(&mut self, tag: &str) -> Result<()> {
        if self.config.dry_run {
            let digest = self.packages.digest_by_tag(tag);
            info!("dry-run: would untag {tag} from {}", or_unknown(digest.as_ref()));
            self.stats.untagged += 1;
            return Ok(());
        }

        let shared = self.registry.tag_digest(tag).await?;
        info!("Untagging {tag} from {shared}");
        let manifest = self.registry.manifest_by_tag(tag).await?;
        let emptied = manifest.emptied();
        self.registry.put_manifest(tag, &emptied).await?;
        // drop the cached answer so the lookup below sees the repointed tag
        self.registry.delete_tag(tag).await?;
        let digest = self.registry.tag_digest(tag).await?;
        if digest == shared {
            return Err(CleanupError::TagNotMoved {
                tag: tag.to_string(),
                digest,
            });
        }

        self.packages.load_packages(true).await?;
        let id = self
            .packages
            .id_by_digest(&digest)
            .ok_or_else(|| CleanupError::MissingTag {
                tag: tag.to_string(),
            })?;
        self.packages
            .delete_package_version(id, &digest, &[tag.to_string()], Some("untagged"))
            .await?;
        info!("Untagged {tag} (deleted placeholder {digest})");
        self.stats.untagged += 1;
        Ok(())
    }

    /// Schedule indexes with every child missing.
    pub fn delete_ghost_images(&mut self) -> Vec<Digest> {
        policy::ghost_images(&mut self.plan, &self.graph, self.packages.listing())
    }

    /// Schedule indexes with at least one child missing.
    pub fn delete_partial_images(&mut self) -> Vec<Digest> {
        policy::partial_images(&mut self.plan, &self.graph, self.packages.listing())
    }

    /// Schedule referrer artifacts whose parent is gone.
    pub fn delete_orphaned_images(&mut self) -> Vec<Digest> {
        policy::orphaned_referrers(&mut self.plan, self.packages.listing())
    }

    /// Keep the `n` newest tagged candidates.
    pub fn keep_n_tagged(&mut self, n: usize) -> Vec<Digest> {
        policy::keep_n_tagged(&mut self.plan, self.packages.listing(), n)
    }

    /// Keep the `n` newest untagged candidates.
    pub fn keep_n_untagged(&mut self, n: usize) -> Vec<Digest> {
        policy::keep_n_untagged(&mut self.plan, self.packages.listing(), n)
    }

    /// Schedule every untagged candidate.
    pub fn delete_untagged(&mut self) -> Vec<Digest> {
        policy::delete_untagged(&mut self.plan, self.packages.listing())
    }

    /// Check the current snapshot for dangling references. Warnings only.
    pub fn validate(&self) -> ValidationReport {
        validate(&self.graph, self.packages.listing())
    }

    /// Working sets of the current cycle.
    pub fn plan(&self) -> &CleanupPlan {
        &self.plan
    }

    /// Reference graph of the current cycle.
    pub fn graph(&self) -> &ManifestGraph {
        &self.graph
    }

    /// Counters so far.
    pub fn stats(&self) -> CleanupStats {
        self.stats
    }

    /// The package client.
    pub fn packages(&self) -> &P {
        &self.packages
    }
}

fn or_unknown(digest: Option<&Digest>) -> String {
    digest.map_or_else(|| "<unknown>".to_string(), ToString::to_string)
}
