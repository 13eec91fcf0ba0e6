//! Per-package run loop.

use anyhow::{Context, Result};
use reap_core::http::{GhcrRegistryClient, GithubPackageClient, http_client};
use reap_core::{CleanupStats, CleanupTask};
use tracing::{Instrument, info, info_span};

use crate::Settings;

/// Clean every package in `settings` in order and return the summed stats.
///
/// # Errors
///
/// The first failing package aborts the run; packages already cleaned stay
/// cleaned.
pub async fn run(settings: &Settings) -> Result<CleanupStats> {
    let http = http_client()?;
    let mut total = CleanupStats::default();

    for package in &settings.packages {
        let registry = GhcrRegistryClient::new(
            http.clone(),
            &settings.registry_url,
            &settings.owner,
            package,
            &settings.token,
        );
        let packages = GithubPackageClient::new(
            http.clone(),
            &settings.api_url,
            &settings.owner,
            package,
            &settings.token,
        );

        let stats = clean_package(settings, registry, packages)
            .instrument(info_span!("package", name = %package))
            .await
            .with_context(|| format!("cleaning {}/{package} failed", settings.owner))?;
        print_summary(package, &stats, settings.config.dry_run);
        total += stats;
    }

    if settings.packages.len() > 1 {
        print_summary("total", &total, settings.config.dry_run);
    }
    Ok(total)
}

async fn clean_package(
    settings: &Settings,
    registry: GhcrRegistryClient,
    packages: GithubPackageClient,
) -> Result<CleanupStats> {
    info!("Starting cleanup");
    let mut task = CleanupTask::new(settings.config.clone(), registry, packages)?;
    task.init().await?;
    Ok(task.run().await?)
}

fn print_summary(name: &str, stats: &CleanupStats, dry_run: bool) {
    let verb = if dry_run { "would delete" } else { "deleted" };
    println!(
        "{name}: {verb} {} version(s) ({} multi-arch), untagged {}",
        stats.deleted, stats.multi_arch_deleted, stats.untagged
    );
}
