use super::client::HttpClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum EndpointError {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme `{scheme}`, expected http or https")]
    UnsupportedScheme { scheme: String },
}

/// A remote endpoint server: URL, headers and a connected flag.
///
/// The flag is bookkeeping only; protocol state is owned by the lifecycle
/// that holds this endpoint.
#[derive(Debug)]
pub struct HttpEndpoint {
    url: String,
    headers: HashMap<String, String>,
    connected: AtomicBool,
}

impl HttpEndpoint {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            connected: AtomicBool::new(false),
        }
    }

    /// Parses the configured URL, rejecting anything that is not an absolute
    /// http(s) URL.
    pub fn validate(&self) -> Result<Url, EndpointError> {
        let parsed = Url::parse(&self.url).map_err(|err| EndpointError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(EndpointError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    /// Best-effort reachability probe: a HEAD request under `timeout`. Any
    /// HTTP response counts as reachable, error statuses included; only
    /// transport failures (and invalid URLs) report unreachable.
    pub fn reachable(&self, timeout: Duration) -> bool {
        let Ok(url) = self.validate() else {
            return false;
        };
        let Ok(client) = HttpClient::new() else {
            return false;
        };
        match client.head(&url, &self.headers, timeout) {
            Ok(status) => {
                debug!(url = %url, %status, "endpoint probe answered");
                true
            }
            Err(err) => {
                debug!(url = %url, %err, "endpoint probe failed");
                false
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
