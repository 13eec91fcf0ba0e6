//! Retention policy classifiers.
//!
//! Each classifier reads package metadata for the digests still in the
//! filter set and moves the ones it selects into the delete set. None of them
//! talk to the network; tag deletion's untagging step is driven by
//! [`crate::task::CleanupTask`].

use std::cmp::Reverse;
use std::collections::HashMap;

use reap_schema::{Digest, Manifest, PackageEntry};
use tracing::{debug, info};

use crate::client::PackageListing;
use crate::graph::ManifestGraph;
use crate::matcher::TagMatcher;
use crate::plan::CleanupPlan;

/// Tags matched by `delete-tags`, split by how they must be removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSelection {
    /// Tags whose digest carries no other tag: the digest itself is deleted.
    pub standard: Vec<String>,
    /// Tags sharing their digest with other tags: only the tag is detached.
    pub untag: Vec<String>,
}

impl TagSelection {
    /// Whether no tag matched.
    pub fn is_empty(&self) -> bool {
        self.standard.is_empty() && self.untag.is_empty()
    }
}

/// Match `delete` against the tags in use and decide, per tag, whether its
/// digest can go or the tag has to be detached first.
///
/// Excluded tags and tags of digests outside the filter set are ignored. Once
/// all other tags of a digest have been chosen for untagging, its last
/// matching tag falls back to the standard case.
pub fn select_tags(plan: &CleanupPlan, listing: &PackageListing, delete: &TagMatcher) -> TagSelection {
    let mut selection = TagSelection::default();
    let mut detached: HashMap<&Digest, usize> = HashMap::new();

    for tag in listing.tags() {
        if plan.is_excluded(&tag) || !delete.matches(&tag) {
            continue;
        }
        let Some(digest) = listing.digest_by_tag(&tag) else {
            continue;
        };
        // Excluded or too recent digests keep every tag, matched ones included.
        if !plan.filter.contains(digest) {
            debug!("tag {tag} matched but {digest} is not a candidate");
            continue;
        }
        let total = listing.get(digest).map_or(1, |e| e.tags.len());
        let already = detached.entry(digest).or_default();
        if total - *already > 1 {
            *already += 1;
            selection.untag.push(tag);
        } else {
            selection.standard.push(tag);
        }
    }
    selection
}

/// Count the children of `manifest` that are not known package versions.
fn missing_children(manifest: &Manifest, listing: &PackageListing) -> usize {
    manifest
        .children()
        .iter()
        .filter(|c| !listing.contains(&c.digest))
        .count()
}

fn schedule_broken_indexes(
    plan: &mut CleanupPlan,
    graph: &ManifestGraph,
    listing: &PackageListing,
    kind: &str,
    select: impl Fn(usize, usize) -> bool,
) -> Vec<Digest> {
    let broken: Vec<Digest> = plan
        .filter
        .iter()
        .filter(|digest| {
            graph.manifest(digest).is_some_and(|m| {
                let total = m.children().len();
                m.is_index() && total > 0 && select(missing_children(m, listing), total)
            })
        })
        .cloned()
        .collect();

    for digest in &broken {
        info!("{kind} image {digest} marked for deletion");
        plan.schedule(digest);
    }
    broken
}

/// Schedule every candidate index whose children are all missing.
pub fn ghost_images(
    plan: &mut CleanupPlan,
    graph: &ManifestGraph,
    listing: &PackageListing,
) -> Vec<Digest> {
    schedule_broken_indexes(plan, graph, listing, "ghost", |missing, total| {
        missing == total
    })
}

/// Schedule every candidate index with at least one missing child. Ghost
/// images are a special case and are included.
pub fn partial_images(
    plan: &mut CleanupPlan,
    graph: &ManifestGraph,
    listing: &PackageListing,
) -> Vec<Digest> {
    schedule_broken_indexes(plan, graph, listing, "partial", |missing, _| {
        missing > 0
    })
}

/// Schedule referrer artifacts (`sha256-<hex>` tags) whose parent digest is
/// not a known package version.
pub fn orphaned_referrers(plan: &mut CleanupPlan, listing: &PackageListing) -> Vec<Digest> {
    let mut orphans = Vec::new();
    for tag in listing.tags() {
        let Some(parent) = Digest::from_referrer_tag(&tag) else {
            continue;
        };
        if plan.is_excluded(&tag) || listing.contains(&parent) {
            continue;
        }
        if let Some(digest) = listing.digest_by_tag(&tag) {
            if plan.schedule(digest) {
                info!("orphaned referrer {tag} ({digest}) marked for deletion");
                orphans.push(digest.clone());
            }
        }
    }
    orphans
}

/// Candidates matching `keep`, newest first. Entries without a timestamp sort
/// last; equal timestamps keep listing order.
fn newest_first<'a>(
    plan: &CleanupPlan,
    listing: &'a PackageListing,
    keep: impl Fn(&PackageEntry) -> bool,
) -> Vec<&'a PackageEntry> {
    let mut entries: Vec<&PackageEntry> = listing
        .entries()
        .iter()
        .filter(|e| plan.filter.contains(&e.digest) && keep(*e))
        .collect();
    entries.sort_by_key(|e| Reverse(e.updated_at));
    entries
}

fn schedule_beyond(plan: &mut CleanupPlan, entries: &[&PackageEntry], n: usize, kind: &str) -> Vec<Digest> {
    let mut scheduled = Vec::new();
    for entry in entries.iter().skip(n) {
        if plan.schedule(&entry.digest) {
            info!("{kind} {} {:?} beyond keep limit {n}", entry.digest, entry.tags);
            scheduled.push(entry.digest.clone());
        }
    }
    scheduled
}

/// Keep the `n` newest tagged candidates, schedule the rest.
pub fn keep_n_tagged(plan: &mut CleanupPlan, listing: &PackageListing, n: usize) -> Vec<Digest> {
    let entries = newest_first(plan, listing, |e| !e.is_untagged());
    schedule_beyond(plan, &entries, n, "tagged")
}

/// Keep the `n` newest untagged candidates, schedule the rest.
pub fn keep_n_untagged(plan: &mut CleanupPlan, listing: &PackageListing, n: usize) -> Vec<Digest> {
    let entries = newest_first(plan, listing, PackageEntry::is_untagged);
    schedule_beyond(plan, &entries, n, "untagged")
}

/// Schedule every untagged candidate.
pub fn delete_untagged(plan: &mut CleanupPlan, listing: &PackageListing) -> Vec<Digest> {
    keep_n_untagged(plan, listing, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, index_manifest, labelled_index, leaf_manifest, minutes_ago};

    async fn snapshot(store: &MemoryStore) -> (PackageListing, ManifestGraph, CleanupPlan) {
        let listing = store.listing();
        let graph = ManifestGraph::build(&store.registry(), &listing.digests())
            .await
            .unwrap();
        let plan = CleanupPlan::new(listing.digests());
        (listing, graph, plan)
    }

    #[tokio::test]
    async fn ghost_requires_every_child_missing() {
        let store = MemoryStore::new();
        let a = store.push(leaf_manifest("a"), &[]);
        let b = store.push(leaf_manifest("b"), &[]);
        let ghost = store.push(labelled_index("ghost", &[&a, &b]), &["ghost"]);
        let lone = store.push(labelled_index("lone", &[&a]), &["lone"]);
        let c = store.push(leaf_manifest("c"), &[]);
        let mixed = store.push(labelled_index("mixed", &[&a, &c]), &["mixed"]);
        store.remove_version(&a);
        store.remove_version(&b);

        let (listing, graph, mut plan) = snapshot(&store).await;
        let ghosts = ghost_images(&mut plan, &graph, &listing);

        assert_eq!(ghosts.len(), 2);
        assert!(ghosts.contains(&ghost));
        assert!(ghosts.contains(&lone));
        assert!(!plan.filter.contains(&ghost));
        assert!(plan.filter.contains(&mixed));
        assert_eq!(plan.delete.len(), 2);
    }

    #[tokio::test]
    async fn partial_includes_any_missing_child() {
        let store = MemoryStore::new();
        let a = store.push(leaf_manifest("a"), &[]);
        let b = store.push(leaf_manifest("b"), &[]);
        let idx = store.push(index_manifest(&[&a, &b]), &["latest"]);
        store.remove_version(&a);

        let (listing, graph, mut plan) = snapshot(&store).await;
        assert!(ghost_images(&mut plan.clone(), &graph, &listing).is_empty());
        assert_eq!(partial_images(&mut plan, &graph, &listing), [idx]);
    }

    #[tokio::test]
    async fn empty_index_is_neither_ghost_nor_partial() {
        let store = MemoryStore::new();
        let _ = store.push(index_manifest(&[]), &["empty"]);

        let (listing, graph, mut plan) = snapshot(&store).await;
        assert!(ghost_images(&mut plan, &graph, &listing).is_empty());
        assert!(partial_images(&mut plan, &graph, &listing).is_empty());
    }

    #[tokio::test]
    async fn keep_n_tagged_keeps_newest() {
        let store = MemoryStore::new();
        let t1 = store.push_at(leaf_manifest("t1"), &["t1"], Some(minutes_ago(30)));
        let t3 = store.push_at(leaf_manifest("t3"), &["t3"], Some(minutes_ago(10)));
        let t2 = store.push_at(leaf_manifest("t2"), &["t2"], Some(minutes_ago(20)));
        let untagged = store.push_at(leaf_manifest("u"), &[], Some(minutes_ago(40)));

        let (listing, _, mut plan) = snapshot(&store).await;
        assert_eq!(keep_n_tagged(&mut plan, &listing, 2), [t1.clone()]);
        assert!(plan.filter.contains(&t3));
        assert!(plan.filter.contains(&t2));
        assert!(plan.filter.contains(&untagged));
    }

    #[tokio::test]
    async fn keep_n_ties_keep_listing_order() {
        let store = MemoryStore::new();
        let when = Some(minutes_ago(10));
        let first = store.push_at(leaf_manifest("first"), &[], when);
        let second = store.push_at(leaf_manifest("second"), &[], when);
        let third = store.push_at(leaf_manifest("third"), &[], when);

        let (listing, _, mut plan) = snapshot(&store).await;
        assert_eq!(keep_n_untagged(&mut plan, &listing, 1), [second, third]);
        assert!(plan.filter.contains(&first));
    }

    #[tokio::test]
    async fn delete_untagged_takes_every_untagged_candidate() {
        let store = MemoryStore::new();
        let u1 = store.push(leaf_manifest("u1"), &[]);
        let u2 = store.push(leaf_manifest("u2"), &[]);
        let tagged = store.push(leaf_manifest("t"), &["v1"]);

        let (listing, _, mut plan) = snapshot(&store).await;
        let deleted = delete_untagged(&mut plan, &listing);
        assert_eq!(deleted.len(), 2);
        assert!(plan.delete.contains(&u1) && plan.delete.contains(&u2));
        assert!(plan.filter.contains(&tagged));
    }

    #[tokio::test]
    async fn select_tags_splits_shared_digests() {
        let store = MemoryStore::new();
        let shared = store.push(leaf_manifest("shared"), &["v1", "stable"]);
        let single = store.push(leaf_manifest("single"), &["v2"]);
        let both = store.push(leaf_manifest("both"), &["v3", "v4"]);

        let (listing, _, plan) = snapshot(&store).await;
        let delete = TagMatcher::new("v*", false).unwrap();
        let selection = select_tags(&plan, &listing, &delete);

        assert_eq!(selection.untag, ["v1", "v3"]);
        assert_eq!(selection.standard, ["v2", "v4"]);
        assert!(plan.filter.contains(&shared));
        assert!(plan.filter.contains(&single) && plan.filter.contains(&both));
    }

    #[tokio::test]
    async fn select_tags_skips_excluded_and_non_candidates() {
        let store = MemoryStore::new();
        let _ = store.push(leaf_manifest("a"), &["v1"]);
        let b = store.push(leaf_manifest("b"), &["v2"]);

        let (listing, _, mut plan) = snapshot(&store).await;
        plan.exclude_tags.insert("v1".to_string());
        plan.trim(&b);
        let selection = select_tags(&plan, &listing, &TagMatcher::new("v*", false).unwrap());
        assert!(selection.is_empty());
    }

    #[tokio::test]
    async fn orphaned_referrer_is_scheduled() {
        let store = MemoryStore::new();
        let parent = store.push(leaf_manifest("parent"), &["v1"]);
        let referrer = store.push(leaf_manifest("sig"), &[parent.referrer_tag().as_str()]);
        let live_parent = store.push(leaf_manifest("live"), &["v2"]);
        let live_referrer = store.push(leaf_manifest("sig2"), &[live_parent.referrer_tag().as_str()]);
        store.remove_version(&parent);

        let (listing, _, mut plan) = snapshot(&store).await;
        assert_eq!(orphaned_referrers(&mut plan, &listing), [referrer]);
        assert!(plan.filter.contains(&live_referrer));
    }
}
