//! Outbound transport to the Gemini API.
//!
//! The [`Forwarder`] owns the pooled HTTP client and the upstream base URL.
//! Translation code hands it a method, path, headers, query and body; it
//! hands back the upstream status, headers and body, either buffered or as a
//! byte stream.

use crate::config::UpstreamConfig;
use crate::credentials::{bearer_token, GOOG_API_KEY_HEADER};
use crate::error::{ProxyError, Result};

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Response headers that must not be relayed to the client as-is.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct UpstreamStream {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl UpstreamStream {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the remaining body into memory.
    pub async fn collect_body(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.trim_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Shared client with the configured pool and connect timeout.
    pub fn build_client(config: &UpstreamConfig) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()?)
    }

    pub fn generate_path(&self, model: &str) -> String {
        format!("/{}/models/{}:generateContent", self.api_version, model)
    }

    pub fn stream_generate_path(&self, model: &str) -> String {
        format!("/{}/models/{}:streamGenerateContent", self.api_version, model)
    }

    pub fn models_path(&self) -> String {
        format!("/{}/models", self.api_version)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        query: &[(String, String)],
        body: Bytes,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.client.request(method, url).headers(headers);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }
        builder
    }

    /// Send a request and buffer the whole response.
    pub async fn send_unary(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        query: &[(String, String)],
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let response = self
            .request(method, path, headers, query, body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProxyError::transport(format!("Request to {path} failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::transport(format!("Failed to read response body: {e}")))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Send a request and return the response body as it arrives.
    /// Dropping the returned stream releases the connection.
    pub async fn send_streaming(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        query: &[(String, String)],
        body: Bytes,
    ) -> Result<UpstreamStream> {
        let response = self
            .request(method, path, headers, query, body)
            .send()
            .await
            .map_err(|e| ProxyError::transport(format!("Request to {path} failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProxyError::transport(format!("Upstream stream error: {e}"))))
            .boxed();

        Ok(UpstreamStream {
            status,
            headers,
            body,
        })
    }
}

/// Headers for a call made on the caller's behalf with `api_key`.
pub fn api_key_headers(api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(HeaderName::from_static(GOOG_API_KEY_HEADER), key_value(api_key)?);
    Ok(headers)
}

fn key_value(api_key: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(api_key)
        .map_err(|_| ProxyError::malformed("API key contains characters not allowed in a header"))
}

/// Inbound headers prepared for native passthrough: `host`, `content-length`
/// and hop-by-hop headers removed, and a Bearer token moved into
/// `x-goog-api-key` unless that header is already set.
pub fn passthrough_request_headers(inbound: &HeaderMap) -> Result<HeaderMap> {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(header::HOST);

    if let Some(token) = bearer_token(inbound) {
        headers.remove(header::AUTHORIZATION);
        if !headers.contains_key(GOOG_API_KEY_HEADER) {
            headers.insert(HeaderName::from_static(GOOG_API_KEY_HEADER), key_value(&token)?);
        }
    }

    Ok(headers)
}

/// Copy of `headers` without hop-by-hop entries.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder() -> Forwarder {
        let config = UpstreamConfig {
            base_url: "http://localhost:9000/".to_string(),
            ..UpstreamConfig::default()
        };
        Forwarder::new(reqwest::Client::new(), &config)
    }

    #[test]
    fn test_target_paths() {
        let f = forwarder();
        assert_eq!(
            f.generate_path("gemini-1.5-flash"),
            "/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(
            f.stream_generate_path("gemini-1.5-flash"),
            "/v1beta/models/gemini-1.5-flash:streamGenerateContent"
        );
        assert_eq!(f.models_path(), "/v1beta/models");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-custom", HeaderValue::from_static("1"));

        let out = strip_hop_by_hop(&headers);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("content-type"));
        assert!(out.contains_key("x-custom"));
    }

    #[test]
    fn test_passthrough_moves_bearer_into_goog_header() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost:8000"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-123"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let out = passthrough_request_headers(&headers).unwrap();
        assert!(!out.contains_key("host"));
        assert!(!out.contains_key("authorization"));
        assert_eq!(out.get(GOOG_API_KEY_HEADER).unwrap(), "sk-123");
        assert_eq!(out.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_passthrough_keeps_existing_goog_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer from-bearer"));
        headers.insert(GOOG_API_KEY_HEADER, HeaderValue::from_static("explicit"));

        let out = passthrough_request_headers(&headers).unwrap();
        assert_eq!(out.get(GOOG_API_KEY_HEADER).unwrap(), "explicit");
        assert!(!out.contains_key("authorization"));
    }

    #[test]
    fn test_api_key_headers() {
        let headers = api_key_headers("abc").unwrap();
        assert_eq!(headers.get(GOOG_API_KEY_HEADER).unwrap(), "abc");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(api_key_headers("bad\nkey").is_err());
    }
}
