//! Candidate reduction: shrink the filter set to top-level, unprotected,
//! old-enough digests before any policy runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reap_schema::Digest;
use tracing::{debug, info, warn};

use crate::client::PackageListing;
use crate::graph::ManifestGraph;
use crate::matcher::TagMatcher;
use crate::plan::CleanupPlan;

/// Apply the exclusion, child and age trims to a fresh plan.
///
/// After this the filter set holds only digests that are not listed by any
/// index, are not the referrer artifact of another digest, carry no excluded
/// tag, and were last updated before `now - older_than`.
pub fn reduce(
    plan: &mut CleanupPlan,
    graph: &ManifestGraph,
    listing: &PackageListing,
    exclude: &TagMatcher,
    older_than: Option<Duration>,
    now: DateTime<Utc>,
) {
    collect_excluded_tags(plan, listing, exclude);
    trim_children(plan, graph, listing);
    trim_excluded(plan, listing);
    if let Some(age) = older_than {
        trim_recent(plan, listing, age, now);
    }
    info!("{} candidate(s) after reduction", plan.filter.len());
}

fn collect_excluded_tags(plan: &mut CleanupPlan, listing: &PackageListing, exclude: &TagMatcher) {
    if exclude.is_empty() {
        return;
    }
    plan.exclude_tags = listing
        .tags()
        .into_iter()
        .filter(|tag| exclude.matches(tag))
        .collect();
}

fn trim_index_children(plan: &mut CleanupPlan, graph: &ManifestGraph, digest: &Digest) {
    if let Some(manifest) = graph.manifest(digest) {
        for child in manifest.children() {
            plan.trim(&child.digest);
        }
    }
}

fn trim_children(plan: &mut CleanupPlan, graph: &ManifestGraph, listing: &PackageListing) {
    for (digest, _) in graph.indexes() {
        trim_index_children(plan, graph, digest);
    }

    for digest in listing.digests() {
        let tag = digest.referrer_tag();
        if plan.is_excluded(&tag) {
            continue;
        }
        if let Some(referrer) = listing.digest_by_tag(&tag) {
            debug!("{referrer} is a referrer of {digest}");
            plan.trim(referrer);
            trim_index_children(plan, graph, referrer);
        }
    }
}

fn trim_excluded(plan: &mut CleanupPlan, listing: &PackageListing) {
    let excluded: Vec<String> = plan.exclude_tags.iter().cloned().collect();
    for tag in excluded {
        if let Some(digest) = listing.digest_by_tag(&tag) {
            if plan.trim(digest) {
                info!("excluding tag {tag} ({digest})");
            }
        }
    }
}

fn trim_recent(plan: &mut CleanupPlan, listing: &PackageListing, age: Duration, now: DateTime<Utc>) {
    let cutoff = match chrono::Duration::from_std(age) {
        Ok(age) => now - age,
        Err(e) => {
            warn!("older-than {age:?} is out of range, skipping age filter: {e}");
            return;
        }
    };

    let recent: Vec<Digest> = plan
        .filter
        .iter()
        .filter(|digest| {
            listing
                .get(digest)
                .and_then(|e| e.updated_at)
                .is_some_and(|updated| updated >= cutoff)
        })
        .cloned()
        .collect();

    for digest in &recent {
        debug!("{digest} is newer than {}", cutoff.to_rfc3339());
        plan.trim(digest);
    }
    if !recent.is_empty() {
        info!("{} candidate(s) too recent to delete", recent.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, index_manifest, leaf_manifest, minutes_ago};

    async fn reduced(
        store: &MemoryStore,
        exclude: &str,
        older_than: Option<Duration>,
    ) -> CleanupPlan {
        let listing = store.listing();
        let graph = ManifestGraph::build(&store.registry(), &listing.digests())
            .await
            .unwrap();
        let mut plan = CleanupPlan::new(listing.digests());
        let exclude = TagMatcher::new(exclude, false).unwrap();
        reduce(&mut plan, &graph, &listing, &exclude, older_than, Utc::now());
        plan
    }

    #[tokio::test]
    async fn children_are_not_candidates() {
        let store = MemoryStore::new();
        let a = store.push(leaf_manifest("a"), &[]);
        let b = store.push(leaf_manifest("b"), &[]);
        let idx = store.push(index_manifest(&[&a, &b]), &["latest"]);

        let plan = reduced(&store, "", None).await;
        assert_eq!(plan.filter.into_iter().collect::<Vec<_>>(), [idx]);
    }

    #[tokio::test]
    async fn referrers_and_their_children_are_not_candidates() {
        let store = MemoryStore::new();
        let image = store.push(leaf_manifest("image"), &["v1"]);
        let sig = store.push(leaf_manifest("sig"), &[]);
        let referrer = store.push(index_manifest(&[&sig]), &[image.referrer_tag().as_str()]);

        let plan = reduced(&store, "", None).await;
        assert!(plan.filter.contains(&image));
        assert!(!plan.filter.contains(&referrer));
        assert!(!plan.filter.contains(&sig));
    }

    #[tokio::test]
    async fn excluded_tags_protect_their_digest() {
        let store = MemoryStore::new();
        let keep = store.push(leaf_manifest("keep"), &["release-1", "extra"]);
        let other = store.push(leaf_manifest("other"), &["dev-1"]);

        let plan = reduced(&store, "release-*", None).await;
        assert!(!plan.filter.contains(&keep));
        assert!(plan.filter.contains(&other));
        assert_eq!(
            plan.exclude_tags.into_iter().collect::<Vec<_>>(),
            ["release-1"]
        );
    }

    #[tokio::test]
    async fn excluded_referrer_tag_is_not_followed_as_child() {
        let store = MemoryStore::new();
        let image = store.push(leaf_manifest("image"), &["v1"]);
        let referrer = store.push(leaf_manifest("att"), &[image.referrer_tag().as_str()]);

        let plan = reduced(&store, "sha256-*", None).await;
        // Excluded either way: the tag protects its digest.
        assert!(!plan.filter.contains(&referrer));
        assert!(plan.exclude_tags.contains(&image.referrer_tag()));
    }

    #[tokio::test]
    async fn age_filter_keeps_recent_and_undated() {
        let store = MemoryStore::new();
        let old = store.push_at(leaf_manifest("old"), &[], Some(minutes_ago(600)));
        let recent = store.push_at(leaf_manifest("recent"), &[], Some(minutes_ago(5)));
        let undated = store.push_at(leaf_manifest("undated"), &[], None);

        let plan = reduced(&store, "", Some(Duration::from_secs(3600))).await;
        assert!(plan.filter.contains(&old));
        assert!(!plan.filter.contains(&recent));
        assert!(plan.filter.contains(&undated));
    }
}
