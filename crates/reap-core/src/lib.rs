pub mod cascade;
pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod matcher;
pub mod plan;
pub mod policy;
pub mod reduce;
pub mod task;
pub mod validate;

#[cfg(feature = "network")]
pub mod http;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ClientError, PackageClient, PackageListing, RegistryClient};
pub use config::CleanupConfig;
pub use error::{CleanupError, Result};
pub use task::{CleanupStats, CleanupTask};

/// User Agent string for registry and API requests
pub const USER_AGENT: &str = concat!("reap/", env!("CARGO_PKG_VERSION"));
