//! reap - garbage collection for container image packages
//!
//! Deletes package versions from a GitHub container registry package under a
//! set of retention policies, without breaking multi-architecture images that
//! are still in use.
//!
//! # Example
//!
//! ```text
//! GITHUB_TOKEN=... reap --owner acme --package app \
//!     --delete-tags 'pr-*' --exclude-tags 'latest,v*' \
//!     --keep-n-untagged 5 --older-than '2weeks' --dry-run
//! ```

#![allow(clippy::doc_markdown)]

pub mod run;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use reap_core::CleanupConfig;

/// Command-line surface.
#[derive(Debug, Parser)]
#[command(name = "reap")]
#[command(author, version, about = "reap - clean up container image packages on ghcr.io")]
pub struct Cli {
    /// Owner (user or organization) of the packages
    #[arg(long, env = "REAP_OWNER")]
    pub owner: Option<String>,

    /// Repository name; used as the package name when --package is not given
    #[arg(long, env = "REAP_REPOSITORY")]
    pub repository: Option<String>,

    /// Packages to clean, comma-separated
    #[arg(long = "package", env = "REAP_PACKAGES", value_delimiter = ',')]
    pub packages: Vec<String>,

    /// Token with read, write and delete access to packages
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Container registry base URL
    #[arg(long, env = "REAP_REGISTRY_URL", default_value = "https://ghcr.io")]
    pub registry_url: String,

    /// GitHub REST API base URL
    #[arg(long, env = "REAP_API_URL", default_value = "https://api.github.com")]
    pub api_url: String,

    /// Tags to delete, comma-separated patterns
    #[arg(long, env = "REAP_DELETE_TAGS")]
    pub delete_tags: Option<String>,

    /// Tags to protect, comma-separated patterns
    #[arg(long, env = "REAP_EXCLUDE_TAGS")]
    pub exclude_tags: Option<String>,

    /// Treat tag patterns as regular expressions instead of globs
    #[arg(long, env = "REAP_USE_REGEX")]
    pub use_regex: bool,

    /// Only consider versions last updated longer ago than this (e.g. "2weeks", "30d")
    #[arg(long, env = "REAP_OLDER_THAN", value_parser = humantime::parse_duration)]
    pub older_than: Option<Duration>,

    /// Delete every untagged version
    #[arg(long, env = "REAP_DELETE_UNTAGGED")]
    pub delete_untagged: bool,

    /// Delete multi-architecture images whose children are all missing
    #[arg(long, env = "REAP_DELETE_GHOST_IMAGES")]
    pub delete_ghost_images: bool,

    /// Delete multi-architecture images with any child missing
    #[arg(long, env = "REAP_DELETE_PARTIAL_IMAGES")]
    pub delete_partial_images: bool,

    /// Delete referrer artifacts (signatures, attestations) whose image is gone
    #[arg(long, env = "REAP_DELETE_ORPHANED_IMAGES")]
    pub delete_orphaned_images: bool,

    /// Keep only the newest N tagged versions
    #[arg(long, env = "REAP_KEEP_N_TAGGED")]
    pub keep_n_tagged: Option<usize>,

    /// Keep only the newest N untagged versions
    #[arg(long, env = "REAP_KEEP_N_UNTAGGED")]
    pub keep_n_untagged: Option<usize>,

    /// Show what would be deleted without changing anything
    #[arg(long, env = "REAP_DRY_RUN")]
    pub dry_run: bool,

    /// Check for dangling references after cleaning
    #[arg(long, env = "REAP_VALIDATE")]
    pub validate: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "REAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Everything a run needs, checked.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Package owner.
    pub owner: String,
    /// Packages to process, in order.
    pub packages: Vec<String>,
    /// API and registry token.
    pub token: String,
    /// Registry base URL.
    pub registry_url: String,
    /// REST API base URL.
    pub api_url: String,
    /// Engine configuration.
    pub config: CleanupConfig,
}

impl Cli {
    /// Check the arguments and build the run settings. Makes no network calls.
    ///
    /// # Errors
    ///
    /// Fails on missing owner, package or token and on invalid policy settings.
    pub fn settings(self) -> Result<Settings> {
        let owner = non_empty(self.owner).context("--owner is required")?;
        let token = non_empty(self.token).context("a token is required (--token or GITHUB_TOKEN)")?;

        let mut packages: Vec<String> = self
            .packages
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if packages.is_empty() {
            packages.extend(non_empty(self.repository));
        }
        if packages.is_empty() {
            bail!("--package (or --repository) is required");
        }

        let config = CleanupConfig {
            delete_tags: self.delete_tags,
            exclude_tags: self.exclude_tags,
            use_regex: self.use_regex,
            older_than: self.older_than,
            delete_untagged: self.delete_untagged,
            delete_ghost_images: self.delete_ghost_images,
            delete_partial_images: self.delete_partial_images,
            delete_orphaned_images: self.delete_orphaned_images,
            keep_n_tagged: self.keep_n_tagged,
            keep_n_untagged: self.keep_n_untagged,
            dry_run: self.dry_run,
            validate: self.validate,
        }
        .validated()?;

        Ok(Settings {
            owner,
            packages,
            token,
            registry_url: self.registry_url,
            api_url: self.api_url,
            config,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
