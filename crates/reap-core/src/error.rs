//! Engine-level errors

use reap_schema::Digest;
use thiserror::Error;

use crate::client::ClientError;
use crate::matcher::MatcherError;

#[derive(Error, Debug)]
pub enum CleanupError {
    /// Contradictory or missing settings, detected before any remote call.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid tag pattern: {0}")]
    Pattern(#[from] MatcherError),

    /// A digest from the package listing has no manifest in the registry.
    #[error("Manifest for known digest {digest} is missing from the registry")]
    MissingManifest { digest: Digest },

    /// A tag vanished from the listing while it was being detached.
    #[error("Tag '{tag}' no longer resolves to a package version")]
    MissingTag { tag: String },

    /// Pushing the emptied manifest did not move the tag off its digest.
    #[error("Tag '{tag}' still points at {digest} after repointing")]
    TagNotMoved { tag: String, digest: Digest },

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub type Result<T, E = CleanupError> = std::result::Result<T, E>;
