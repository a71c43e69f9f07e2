//! Request forwarding to the cached backend
//!
//! The inbound body has already been buffered, so the outgoing request is
//! rebuilt around those exact bytes: Content-Length is recomputed and any
//! chunked framing from the original request is dropped. Forwarding is never
//! retried, since the backend may already have acted on the body.

use crate::address::BackendAddress;
use crate::config::Config;
use crate::error::{json_error_response, ForwardError, ProxyBody};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-scoped headers that must not be relayed to the backend
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An inbound exchange without its body
#[derive(Debug)]
pub struct Invocation {
    pub parts: Parts,
    pub client_addr: Option<SocketAddr>,
    pub request_id: String,
}

impl Invocation {
    /// Wrap request parts, propagating an inbound `x-request-id` or minting one
    pub fn new(parts: Parts, client_addr: Option<SocketAddr>) -> Self {
        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            parts,
            client_addr,
            request_id,
        }
    }
}

/// Settings for the forwarder
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Max time to wait for the backend's response head
    pub request_timeout: Duration,
    /// Query parameter removed before forwarding
    pub rewrite_marker: Option<String>,
    /// Maximum idle connections kept to the backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ForwardSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.defaults.request_timeout(),
            rewrite_marker: config
                .defaults
                .rewrite_marker
                .clone()
                .filter(|m| !m.is_empty()),
            max_idle_per_host: config.defaults.pool_max_idle_per_host,
            idle_timeout: config.defaults.pool_idle_timeout(),
        }
    }
}

/// Statistics for forwarded exchanges
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Total number of exchanges attempted
    pub total_requests: AtomicU64,
    /// Exchanges that ended in a transport error or timeout
    pub failures: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Forwards buffered requests to a backend through a pooled client
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    settings: ForwardSettings,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    /// Forwarder for `http` backends (and `https` backends with public roots
    /// supplied through [`with_tls_roots`](Forwarder::with_tls_roots))
    pub fn new(settings: ForwardSettings) -> anyhow::Result<Self> {
        Self::with_tls_roots(settings, &[])
    }

    /// Forwarder that trusts `roots` when talking to `https` backends
    pub fn with_tls_roots(settings: ForwardSettings, roots: &[CertificateDer<'static>]) -> anyhow::Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);

        let tls_config = crate::tls::client_config(roots)?;
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .pool_idle_timeout(settings.idle_timeout)
            .build(https);

        debug!(
            max_idle = settings.max_idle_per_host,
            idle_timeout_secs = settings.idle_timeout.as_secs(),
            request_timeout_secs = settings.request_timeout.as_secs(),
            trusted_roots = roots.len(),
            "Forwarder initialized"
        );

        Ok(Self {
            client,
            settings,
            stats: Arc::new(ForwardStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Forward one exchange. Always yields a response: transport failures
    /// become a 502, timeouts a 504.
    pub async fn forward(&self, invocation: Invocation, body: Bytes, address: &BackendAddress) -> Response<ProxyBody> {
        let request_id = invocation.request_id.clone();
        match self.send(invocation, body, address).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                let message = match &e {
                    ForwardError::Timeout(timeout) => {
                        warn!(%address, request_id, timeout_ms = timeout.as_millis() as u64, "Backend request timed out");
                        format!("Request timed out after {}ms", timeout.as_millis())
                    }
                    ForwardError::Client(_) => {
                        error!(%address, request_id, error = %e, "Failed to forward request");
                        "Failed to connect to backend".to_string()
                    }
                    ForwardError::RequestBuild(_) => {
                        error!(%address, request_id, error = %e, "Failed to build backend request");
                        "Internal proxy error".to_string()
                    }
                };
                json_error_response(e.code(), message)
            }
        }
    }

    /// Forward one exchange, surfacing the failure to the caller
    pub async fn send(
        &self,
        invocation: Invocation,
        body: Bytes,
        address: &BackendAddress,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let request_id = invocation.request_id.clone();
        let request = build_backend_request(invocation, body, address, self.settings.rewrite_marker.as_deref())?;

        self.stats.record_request();
        debug!(%address, request_id, method = %request.method(), uri = %request.uri(), "Forwarding request");

        let timeout = self.settings.request_timeout;
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Rebuild the inbound request for the backend around the buffered body
pub fn build_backend_request(
    invocation: Invocation,
    body: Bytes,
    address: &BackendAddress,
    rewrite_marker: Option<&str>,
) -> Result<Request<Full<Bytes>>, ForwardError> {
    let Invocation {
        parts,
        client_addr,
        request_id,
    } = invocation;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let path_and_query = match rewrite_marker {
        Some(marker) => strip_query_param(path_and_query, marker),
        None => path_and_query.to_string(),
    };

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(address.uri(&path_and_query)?);

    let connection_listed = connection_tokens(&parts.headers);

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name) || name == CONTENT_LENGTH {
                continue;
            }
            if connection_listed.iter().any(|listed| listed == name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        // Forwarding headers are overwritten, never appended: this host is the first hop
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Some(client) = client_addr {
            if let Ok(value) = HeaderValue::from_str(&client.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = parts.uri.scheme_str().unwrap_or("http");
        if let Ok(value) = HeaderValue::from_str(proto) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }

    Ok(builder.body(Full::new(body))?)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names the client declared connection-scoped via `Connection`
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Remove every occurrence of query parameter `name`, keeping the rest in order
pub fn strip_query_param(path_and_query: &str, name: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
            let key = key.replace('+', " ");
            let decoded = urlencoding::decode(&key)
                .map(|k| k.into_owned())
                .unwrap_or(key);
            decoded != name
        })
        .collect();

    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, kept.join("&"))
    }
}
