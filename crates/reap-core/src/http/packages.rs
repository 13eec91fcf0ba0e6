//! GitHub REST packages API client for one container package.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reap_schema::{Digest, PackageEntry, VersionId};
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{RateLimit, check};
use crate::client::{ClientError, PackageClient, PackageListing};

const PAGE_SIZE: usize = 100;
const GITHUB_JSON: &str = "application/vnd.github+json";
const API_VERSION: (&str, &str) = ("x-github-api-version", "2022-11-28");

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VersionRecord {
    id: VersionId,
    name: String,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<VersionMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct VersionMetadata {
    container: Option<ContainerMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

impl VersionRecord {
    fn into_entry(self) -> Option<PackageEntry> {
        let digest = match Digest::parse(&self.name) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("skipping package version {} ({}): {e}", self.id, self.name);
                return None;
            }
        };
        let tags = self
            .metadata
            .and_then(|m| m.container)
            .map(|c| c.tags)
            .unwrap_or_default();
        Some(PackageEntry::new(self.id, digest, tags, self.updated_at))
    }
}

#[derive(Debug, Clone)]
struct CachedPage {
    etag: String,
    records: Vec<VersionRecord>,
}

/// Package metadata client for `owner`'s container package `package`.
#[derive(Debug)]
pub struct GithubPackageClient {
    http: Client,
    api_url: String,
    owner: String,
    package: String,
    token: String,
    namespace: Option<&'static str>,
    listing: PackageListing,
    page_cache: HashMap<String, CachedPage>,
    rate_limit: RateLimit,
}

impl GithubPackageClient {
    /// Client for the API at `api_url`, authenticating with `token`.
    pub fn new(http: Client, api_url: &str, owner: &str, package: &str, token: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            package: package.to_string(),
            token: token.to_string(),
            namespace: None,
            listing: PackageListing::default(),
            page_cache: HashMap::new(),
            rate_limit: RateLimit::default(),
        }
    }

    /// Override the rate-limit retry behaviour.
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    fn request(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header(ACCEPT, GITHUB_JSON)
            .header(API_VERSION.0, API_VERSION.1)
    }

    fn versions_url(&self) -> String {
        // Nested package names ("app/sub") are one path segment.
        format!(
            "{}/{}/{}/packages/container/{}/versions",
            self.api_url,
            self.namespace.unwrap_or("users"),
            self.owner,
            self.package.replace('/', "%2F")
        )
    }

    async fn fetch_page(&mut self, page: usize) -> Result<Vec<VersionRecord>, ClientError> {
        let url = format!("{}?per_page={PAGE_SIZE}&page={page}", self.versions_url());
        let mut request = self.request(self.http.get(&url));
        if let Some(cached) = self.page_cache.get(&url) {
            request = request.header(IF_NONE_MATCH, &cached.etag);
        }

        let response = self.rate_limit.send(request).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some(cached) = self.page_cache.get(&url) {
                debug!("page {page} unchanged");
                return Ok(cached.records.clone());
            }
        }
        let response = check(response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let records: Vec<VersionRecord> = serde_json::from_slice(&response.bytes().await?)?;
        if let Some(etag) = etag {
            self.page_cache.insert(
                url,
                CachedPage {
                    etag,
                    records: records.clone(),
                },
            );
        }
        Ok(records)
    }
}

#[async_trait]
impl PackageClient for GithubPackageClient {
    async fn init(&mut self) -> Result<(), ClientError> {
        let url = format!("{}/users/{}", self.api_url, self.owner);
        let request = self.request(self.http.get(url));
        let response = check(self.rate_limit.send(request).await?).await?;
        let account: Account = serde_json::from_slice(&response.bytes().await?)?;
        let namespace = if account.kind == "Organization" {
            "orgs"
        } else {
            "users"
        };
        debug!("{} is a {} account", self.owner, account.kind);
        self.namespace = Some(namespace);
        Ok(())
    }

    async fn load_packages(&mut self, reset_page_cache: bool) -> Result<(), ClientError> {
        if reset_page_cache {
            self.page_cache.clear();
        }
        let mut entries = Vec::new();
        for page in 1.. {
            let records = self.fetch_page(page).await?;
            let last = records.len() < PAGE_SIZE;
            entries.extend(records.into_iter().filter_map(VersionRecord::into_entry));
            if last {
                break;
            }
        }
        debug!("{} version(s) of {}", entries.len(), self.package);
        self.listing = PackageListing::new(entries);
        Ok(())
    }

    async fn delete_package_version(
        &mut self,
        id: VersionId,
        digest: &Digest,
        tags: &[String],
        label: Option<&str>,
    ) -> Result<(), ClientError> {
        let url = format!("{}/{id}", self.versions_url());
        let request = self.request(self.http.delete(url));
        check(self.rate_limit.send(request).await?).await?;

        let mut shown = digest.to_string();
        if !tags.is_empty() {
            shown.push_str(&format!(" [{}]", tags.join(", ")));
        }
        if let Some(label) = label {
            shown.push_str(&format!(" ({label})"));
        }
        debug!("DELETE version {id}: {shown}");
        Ok(())
    }

    fn listing(&self) -> &PackageListing {
        &self.listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::time::Duration;

    fn digest(n: usize) -> String {
        format!("sha256:{n:064x}")
    }

    fn version(id: usize, tags: &[&str]) -> serde_json::Value {
        json!({
            "id": id,
            "name": digest(id),
            "updated_at": "2024-05-01T12:00:00Z",
            "metadata": {"package_type": "container", "container": {"tags": tags}}
        })
    }

    fn client(server: &mockito::ServerGuard) -> GithubPackageClient {
        GithubPackageClient::new(Client::new(), &server.url(), "acme", "app", "secret")
            .with_rate_limit(RateLimit {
                max_delay: Duration::ZERO,
            })
    }

    fn page_query(page: &str) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("per_page".into(), "100".into()),
            Matcher::UrlEncoded("page".into(), page.into()),
        ])
    }

    #[tokio::test]
    async fn init_detects_organizations() {
        let mut server = Server::new_async().await;
        let _user = server
            .mock("GET", "/users/acme")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body(r#"{"login":"acme","type":"Organization"}"#)
            .create_async()
            .await;
        let versions = server
            .mock("GET", "/orgs/acme/packages/container/app/versions")
            .match_query(page_query("1"))
            .with_status(200)
            .with_body(json!([version(1, &["latest"])]).to_string())
            .create_async()
            .await;

        let mut packages = client(&server);
        packages.init().await.unwrap();
        packages.load_packages(false).await.unwrap();
        versions.assert_async().await;

        assert_eq!(packages.listing().len(), 1);
        assert_eq!(
            packages.digest_by_tag("latest").map(|d| d.to_string()),
            Some(digest(1))
        );
    }

    #[tokio::test]
    async fn load_walks_every_page() {
        let mut server = Server::new_async().await;
        let full: Vec<_> = (1..=100).map(|i| version(i, &[])).collect();
        let _p1 = server
            .mock("GET", "/users/acme/packages/container/app/versions")
            .match_query(page_query("1"))
            .with_status(200)
            .with_body(serde_json::Value::Array(full).to_string())
            .create_async()
            .await;
        let _p2 = server
            .mock("GET", "/users/acme/packages/container/app/versions")
            .match_query(page_query("2"))
            .with_status(200)
            .with_body(json!([version(101, &["v1", "v2"]), {"id": 102, "name": "not-a-digest"}]).to_string())
            .create_async()
            .await;

        let mut packages = client(&server);
        packages.load_packages(true).await.unwrap();

        assert_eq!(packages.listing().len(), 101);
        let entry = packages.package_by_digest(&Digest::new(digest(101))).unwrap();
        assert_eq!(entry.tags, vec!["v1".to_string(), "v2".to_string()]);
        assert_eq!(packages.id_by_digest(&Digest::new(digest(7))), Some(7));
    }

    #[tokio::test]
    async fn unchanged_page_is_served_from_cache() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/users/acme/packages/container/app/versions")
            .match_query(page_query("1"))
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"abc\"")
            .with_body(json!([version(1, &["latest"])]).to_string())
            .expect(2)
            .create_async()
            .await;
        let revalidated = server
            .mock("GET", "/users/acme/packages/container/app/versions")
            .match_query(page_query("1"))
            .match_header("if-none-match", "\"abc\"")
            .with_status(304)
            .expect(1)
            .create_async()
            .await;

        let mut packages = client(&server);
        packages.load_packages(false).await.unwrap();
        packages.load_packages(false).await.unwrap();
        assert_eq!(packages.listing().len(), 1);

        // A reset drops the cache, so the next load is unconditional.
        packages.load_packages(true).await.unwrap();
        first.assert_async().await;
        revalidated.assert_async().await;
    }

    #[tokio::test]
    async fn delete_targets_the_version_id() {
        let mut server = Server::new_async().await;
        let delete = server
            .mock("DELETE", "/users/acme/packages/container/app/versions/42")
            .with_status(204)
            .create_async()
            .await;

        let mut packages = client(&server);
        packages
            .delete_package_version(42, &Digest::new(digest(42)), &["old".to_string()], None)
            .await
            .unwrap();
        delete.assert_async().await;
    }

    #[test]
    fn nested_package_names_are_encoded() {
        let packages =
            GithubPackageClient::new(Client::new(), "https://api.example.com/", "acme", "app/web", "t");
        assert_eq!(
            packages.versions_url(),
            "https://api.example.com/users/acme/packages/container/app%2Fweb/versions"
        );
    }
}
