//! Post-run integrity check. Advisory only: it never deletes and never fails.

use std::collections::BTreeSet;

use reap_schema::Digest;
use tracing::{info, warn};

use crate::client::PackageListing;
use crate::graph::ManifestGraph;

/// Dangling references found in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// `(index, child)` pairs where the child is not a known version. Each
    /// child is reported once, under the first index found listing it.
    pub missing_children: Vec<(Digest, Digest)>,
    /// Referrer tags whose parent digest is not a known version.
    pub orphaned_referrers: Vec<String>,
}

impl ValidationReport {
    /// Whether nothing was flagged.
    pub fn is_clean(&self) -> bool {
        self.missing_children.is_empty() && self.orphaned_referrers.is_empty()
    }
}

/// Walk every index and referrer tag of the snapshot, warning about
/// references to versions that no longer exist.
pub fn validate(graph: &ManifestGraph, listing: &PackageListing) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen: BTreeSet<&Digest> = BTreeSet::new();

    for digest in listing.digests() {
        let Some(manifest) = graph.manifest(&digest) else {
            continue;
        };
        for child in manifest.children() {
            if listing.contains(&child.digest) || !seen.insert(&child.digest) {
                continue;
            }
            warn!(
                "{digest} references missing {} ({})",
                child.digest,
                child.label()
            );
            report
                .missing_children
                .push((digest.clone(), child.digest.clone()));
        }
    }

    for tag in listing.tags() {
        let Some(parent) = Digest::from_referrer_tag(&tag) else {
            continue;
        };
        if !listing.contains(&parent) {
            warn!("referrer tag {tag} points at missing parent {parent}");
            report.orphaned_referrers.push(tag);
        }
    }

    if report.is_clean() {
        info!("Validation found no dangling references");
    }
    report
}
