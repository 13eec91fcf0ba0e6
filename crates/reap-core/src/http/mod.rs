//! reqwest implementations of the two collaborators.
//!
//! Both share [`RateLimit`]: a primary rate limit (429, or 403 with
//! `x-ratelimit-remaining: 0`) is retried once after the advertised delay,
//! capped; a secondary rate limit (403 carrying `retry-after`) logs a warning
//! and is retried once. A second throttled answer is returned as
//! [`ClientError::Throttled`].

pub mod packages;
pub mod registry;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::client::ClientError;

pub use packages::GithubPackageClient;
pub use registry::GhcrRegistryClient;

const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Build the shared HTTP client.
///
/// # Errors
///
/// Fails if the TLS backend cannot be initialized.
pub fn http_client() -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .build()?)
}

/// Retry behaviour for throttled requests.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Upper bound on how long to wait before the single retry.
    pub max_delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Throttle {
    Primary(Duration),
    Secondary(Duration),
}

impl RateLimit {
    /// Send `request`, retrying once if the server signals a rate limit.
    ///
    /// Non-throttled responses are returned as-is, whatever their status.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let Some(retry) = request.try_clone() else {
            return Ok(request.send().await?);
        };

        let response = request.send().await?;
        let delay = match classify(&response) {
            None => return Ok(response),
            Some(Throttle::Primary(delay)) => {
                debug!("rate limited on {}, retrying in {delay:?}", response.url());
                delay
            }
            Some(Throttle::Secondary(delay)) => {
                warn!("secondary rate limit hit on {}, retrying in {delay:?}", response.url());
                delay
            }
        };
        tokio::time::sleep(delay.min(self.max_delay)).await;

        let response = retry.send().await?;
        if classify(&response).is_some() {
            return Err(ClientError::Throttled(response.url().to_string()));
        }
        Ok(response)
    }
}

fn classify(response: &Response) -> Option<Throttle> {
    let headers = response.headers();
    match response.status() {
        StatusCode::TOO_MANY_REQUESTS => Some(Throttle::Primary(advertised_delay(headers))),
        StatusCode::FORBIDDEN if header_str(headers, RATELIMIT_REMAINING) == Some("0") => {
            Some(Throttle::Primary(advertised_delay(headers)))
        }
        StatusCode::FORBIDDEN if headers.contains_key(RETRY_AFTER) => {
            Some(Throttle::Secondary(advertised_delay(headers)))
        }
        _ => None,
    }
}

/// `retry-after` seconds, else the distance to `x-ratelimit-reset`, else one
/// second.
fn advertised_delay(headers: &HeaderMap) -> Duration {
    if let Some(secs) = header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.parse().ok()) {
        return Duration::from_secs(secs);
    }
    if let Some(reset) = header_str(headers, RATELIMIT_RESET).and_then(|v| v.parse::<u64>().ok()) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        return Duration::from_secs(reset.saturating_sub(now));
    }
    Duration::from_secs(1)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Turn a non-success response into a [`ClientError`].
pub(crate) async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let message = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(url),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ClientError::Auth(format!("{url}: {message}"))
        }
        _ => ClientError::Unexpected {
            status: status.as_u16(),
            message,
        },
    })
}
