//! OCI distribution client for ghcr.io.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reap_schema::manifest::ACCEPTED_MEDIA_TYPES;
use reap_schema::{Digest, Manifest};
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{RateLimit, check};
use crate::client::{ClientError, RegistryClient};

const CONTENT_DIGEST: &str = "docker-content-digest";

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static challenge regex"));

/// `WWW-Authenticate: Bearer realm=...,service=...`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    realm: String,
    service: Option<String>,
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header.strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        for caps in CHALLENGE_PARAM.captures_iter(params) {
            match &caps[1] {
                "realm" => realm = Some(caps[2].to_string()),
                "service" => service = Some(caps[2].to_string()),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            service,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client for one repository (`owner/package`).
#[derive(Debug)]
pub struct GhcrRegistryClient {
    http: Client,
    base_url: String,
    repository: String,
    username: String,
    password: String,
    bearer: Option<String>,
    tag_cache: HashMap<String, Digest>,
    rate_limit: RateLimit,
}

impl GhcrRegistryClient {
    /// Client for `owner/package` on the registry at `base_url`,
    /// authenticating with `owner` and `token`.
    pub fn new(http: Client, base_url: &str, owner: &str, package: &str, token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            repository: format!("{owner}/{package}").to_lowercase(),
            username: owner.to_string(),
            password: token.to_string(),
            bearer: None,
            tag_cache: HashMap::new(),
            rate_limit: RateLimit::default(),
        }
    }

    /// Override the rate-limit retry behaviour.
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{reference}", self.base_url, self.repository)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_manifest(&self, reference: &str) -> Result<Manifest, ClientError> {
        let request = self
            .authorized(self.http.get(self.manifest_url(reference)))
            .header(ACCEPT, ACCEPTED_MEDIA_TYPES.join(", "));
        let response = check(self.rate_limit.send(request).await?).await?;
        let body = response.bytes().await?;
        Ok(Manifest::parse(&body)?)
    }
}

#[async_trait]
impl RegistryClient for GhcrRegistryClient {
    async fn login(&mut self) -> Result<(), ClientError> {
        let ping = self.http.get(format!("{}/v2/", self.base_url));
        let response = self.rate_limit.send(ping).await?;
        if response.status().is_success() {
            debug!("registry allows anonymous access");
            return Ok(());
        }
        if response.status() != StatusCode::UNAUTHORIZED {
            check(response).await?;
            return Ok(());
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| ClientError::Auth("registry sent no bearer challenge".to_string()))?;

        let scope = format!("repository:{}:pull,push,delete", self.repository);
        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        let request = self
            .http
            .get(&challenge.realm)
            .query(&query)
            .basic_auth(&self.username, Some(&self.password));
        let response = match check(self.rate_limit.send(request).await?).await {
            Err(ClientError::NotFound(url)) => return Err(ClientError::Auth(url)),
            other => other?,
        };

        let body: TokenResponse = serde_json::from_slice(&response.bytes().await?)?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| ClientError::Auth("token endpoint returned no token".to_string()))?;
        self.bearer = Some(token);
        info!("Logged in to {} for {}", self.base_url, self.repository);
        Ok(())
    }

    async fn manifest_by_digest(&self, digest: &Digest) -> Result<Manifest, ClientError> {
        self.fetch_manifest(digest.as_str()).await
    }

    async fn manifest_by_tag(&self, tag: &str) -> Result<Manifest, ClientError> {
        self.fetch_manifest(tag).await
    }

    async fn tag_digest(&mut self, tag: &str) -> Result<Digest, ClientError> {
        if let Some(digest) = self.tag_cache.get(tag) {
            return Ok(digest.clone());
        }
        let request = self
            .authorized(self.http.head(self.manifest_url(tag)))
            .header(ACCEPT, ACCEPTED_MEDIA_TYPES.join(", "));
        let response = check(self.rate_limit.send(request).await?).await?;
        let header = response
            .headers()
            .get(CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ClientError::Unexpected {
                status: response.status().as_u16(),
                message: format!("no {CONTENT_DIGEST} header for tag {tag}"),
            })?;
        let digest = Digest::parse(header).map_err(|e| ClientError::Unexpected {
            status: response.status().as_u16(),
            message: e.to_string(),
        })?;
        self.tag_cache.insert(tag.to_string(), digest.clone());
        Ok(digest)
    }

    async fn put_manifest(&mut self, tag: &str, manifest: &Manifest) -> Result<(), ClientError> {
        let body = manifest.to_bytes()?;
        let request = self
            .authorized(self.http.put(self.manifest_url(tag)))
            .header(CONTENT_TYPE, manifest.media_type())
            .body(body);
        check(self.rate_limit.send(request).await?).await?;
        self.tag_cache.remove(tag);
        debug!("pushed {} manifest under {tag}", manifest.media_type());
        Ok(())
    }

    async fn delete_tag(&mut self, tag: &str) -> Result<(), ClientError> {
        self.tag_cache.remove(tag);
        Ok(())
    }
}
