//! Cloud authority client.
//!
//! The orchestrator only sees the [`CloudClient`] trait; [`HttpCloudClient`]
//! is the production implementation talking to the admin dashboard sync API.

use reqwest::{Client, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::RemoteError;
use crate::mutation::Mutation;

/// Default timeout for sync requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout used specifically for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote authority the orchestrator mirrors local writes to.
pub trait CloudClient: Send + Sync {
    /// Apply one row image. Must be idempotent on the row key.
    fn push<'a>(&'a self, mutation: &'a Mutation) -> CloudFuture<'a, Result<(), RemoteError>>;

    /// Cheap reachability probe.
    fn is_reachable(&self) -> CloudFuture<'_, bool>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the cloud base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout;
    }
    if err.is_connect() {
        return RemoteError::Unavailable(format!("cannot reach {url}"));
    }
    RemoteError::Unavailable(format!("network error communicating with {url}: {err}"))
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        s if s >= 500 => format!("server error (HTTP {s})"),
        s => format!("unexpected response (HTTP {s})"),
    };
    let body = body.trim();
    RemoteError::Rejected {
        status: status.as_u16(),
        message: if body.is_empty() {
            message
        } else {
            format!("{message}: {body}")
        },
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpCloudClient {
    base_url: String,
    api_key: Zeroizing<String>,
    terminal_id: String,
    client: Client,
}

impl HttpCloudClient {
    pub fn new(
        base_url: &str,
        api_key: Zeroizing<String>,
        terminal_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key,
            terminal_id: terminal_id.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, mutation: &Mutation) -> Result<(), RemoteError> {
        let request = match mutation {
            Mutation::Tombstone(t) => {
                let url = format!("{}/api/pos/sync/{}/{}", self.base_url, t.table_name, t.id);
                self.client.delete(url)
            }
            other => {
                let url = format!("{}/api/pos/sync/{}", self.base_url, other.table());
                self.client.post(url).json(&other.row())
            }
        };

        let started = Instant::now();
        let resp = request
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("x-terminal-id", &self.terminal_id)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let status = resp.status();
        // A delete of a row the cloud never saw is already in the desired state.
        if status.is_success()
            || (status == StatusCode::NOT_FOUND && matches!(mutation, Mutation::Tombstone(_)))
        {
            debug!(
                table = mutation.table(),
                key = %mutation.row_key(),
                latency_ms = started.elapsed().as_millis() as u64,
                "Cloud acknowledged mutation"
            );
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .client
            .head(&url)
            .timeout(HEALTH_TIMEOUT)
            .header("X-POS-API-Key", self.api_key.as_str())
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if ok {
                    info!("Cloud health check passed");
                }
                ok
            }
            Err(_) => false,
        }
    }
}

impl CloudClient for HttpCloudClient {
    fn push<'a>(&'a self, mutation: &'a Mutation) -> CloudFuture<'a, Result<(), RemoteError>> {
        Box::pin(self.send(mutation))
    }

    fn is_reachable(&self) -> CloudFuture<'_, bool> {
        Box::pin(self.health())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Tombstone;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("admin.thesmall.app/"), "https://admin.thesmall.app");
        assert_eq!(normalize_base_url("localhost:3000/api/"), "http://localhost:3000");
        assert_eq!(
            normalize_base_url(" https://cloud.example.com/api "),
            "https://cloud.example.com"
        );
    }

    #[test]
    fn test_status_error_mapping() {
        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 503,
                message: "server error (HTTP 503)".into()
            }
        );
        let err = status_error(StatusCode::UNAUTHORIZED, "{\"error\":\"bad key\"}");
        assert!(err.to_string().contains("bad key"));
    }

    #[tokio::test]
    async fn test_push_to_closed_port_is_unavailable() {
        let client = HttpCloudClient::new(
            "http://127.0.0.1:9",
            Zeroizing::new("key".into()),
            "t1",
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        let mutation = Mutation::Tombstone(Tombstone {
            table_name: "order_items".into(),
            id: "it-1".into(),
        });
        let err = client.push(&mutation).await.unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Unavailable(_) | RemoteError::Timeout
        ));
        assert!(!client.is_reachable().await);
    }
}
