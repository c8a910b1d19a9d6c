use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use axum::response::Response;
use bytes::Bytes;
use reqwest::Client;

use crate::config::types::HttpProxyConfig;

use super::error::BackendError;

/// Build a shared reqwest HTTP client with connection pooling.
///
/// No overall request timeout is set here: event streams are long-lived, so
/// timeouts are applied per request from the backend configuration.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .tcp_nodelay(true)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(5))
        // Redirects go back to the caller untouched.
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Headers that describe one hop and must not be forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Joins the target base URL with the path left after the backend prefix.
pub fn target_url(base: &str, rest: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    let mut url = if rest.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{rest}")
    };
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Parses the configured static headers, skipping (and logging) any that are
/// not valid HTTP.
pub fn static_headers(backend: &str, headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                tracing::warn!(backend = %backend, header = %name, "Skipping invalid static header");
            }
        }
    }
    map
}

/// Reverse proxy to one HTTP target.
pub struct HttpProxy<'a> {
    client: &'a Client,
    backend: &'a str,
    config: &'a HttpProxyConfig,
}

impl<'a> HttpProxy<'a> {
    pub fn new(client: &'a Client, backend: &'a str, config: &'a HttpProxyConfig) -> Self {
        Self {
            client,
            backend,
            config,
        }
    }

    /// Forwards one request to the target.
    ///
    /// `Host` is dropped so the target sees its own origin; configured static
    /// headers override whatever the client sent. The upstream response is
    /// streamed back unchanged apart from hop-by-hop headers.
    pub async fn forward(
        &self,
        method: Method,
        rest: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, BackendError> {
        let url = target_url(&self.config.url, rest, query);

        let mut outbound = HeaderMap::new();
        for (name, value) in headers {
            if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }
        for (name, value) in static_headers(self.backend, &self.config.headers) {
            if let Some(name) = name {
                outbound.insert(name, value);
            }
        }

        tracing::debug!(backend = %self.backend, method = %method, url = %url, "Proxying request");

        let mut request = self
            .client
            .request(method, &url)
            .headers(outbound)
            .body(body);
        if let Some(secs) = self.config.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let upstream = request.send().await.map_err(BackendError::Request)?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(response_headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    response_headers.append(name.clone(), value.clone());
                }
            }
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| BackendError::InvalidResponse(format!("unrepresentable upstream response: {e}")))
    }
}
