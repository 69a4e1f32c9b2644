//! Thin wrapper over a blocking reqwest client.

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum HttpClientError {
    #[error("could not build the http client: {0}")]
    Builder(String),

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("request failed: {0}")]
    Transport(String),
}

/// A blocking HTTP client with a per-request timeout, used for best-effort
/// reachability probes against endpoint servers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, HttpClientError> {
        let client = Client::builder()
            .build()
            .map_err(|err| HttpClientError::Builder(err.to_string()))?;
        Ok(Self { client })
    }

    /// Issues a HEAD request and reports the response status. Any response,
    /// including client and server errors, means the endpoint answered.
    pub fn head(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<StatusCode, HttpClientError> {
        let headers = build_header_map(headers)?;
        let response = self
            .client
            .head(url.clone())
            .headers(headers)
            .timeout(timeout)
            .send()
            .map_err(|err| HttpClientError::Transport(err.to_string()))?;
        Ok(response.status())
    }
}

fn build_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, HttpClientError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name =
            name.parse::<HeaderName>()
                .map_err(|err| HttpClientError::InvalidHeader {
                    name: name.clone(),
                    reason: err.to_string(),
                })?;
        let header_value =
            value
                .parse::<HeaderValue>()
                .map_err(|err| HttpClientError::InvalidHeader {
                    name: name.clone(),
                    reason: err.to_string(),
                })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    #[test]
    fn head_returns_response_status() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::HEAD).path("/probe");
            then.status(503);
        });

        let client = HttpClient::new().unwrap();
        let url = Url::parse(&server.url("/probe")).unwrap();
        let status = client
            .head(&url, &HashMap::default(), Duration::from_secs(5))
            .unwrap();

        mock.assert();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn head_sends_configured_headers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::HEAD)
                .path("/probe")
                .header("authorization", "Bearer token");
            then.status(200);
        });

        let client = HttpClient::new().unwrap();
        let url = Url::parse(&server.url("/probe")).unwrap();
        let headers =
            HashMap::from([("authorization".to_string(), "Bearer token".to_string())]);
        let status = client.head(&url, &headers, Duration::from_secs(5)).unwrap();

        mock.assert();
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn unreachable_host_is_a_transport_error() {
        let client = HttpClient::new().unwrap();
        // Reserved TEST-NET-1 address, nothing listens there.
        let url = Url::parse("http://192.0.2.1:9/").unwrap();
        let result = client.head(&url, &HashMap::default(), Duration::from_millis(200));
        assert!(matches!(result, Err(HttpClientError::Transport(_))));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let client = HttpClient::new().unwrap();
        let url = Url::parse("http://localhost/").unwrap();
        let headers = HashMap::from([("bad header name".to_string(), "v".to_string())]);
        let result = client.head(&url, &headers, Duration::from_secs(1));
        assert!(matches!(result, Err(HttpClientError::InvalidHeader { .. })));
    }
}
