//! One proxied exchange, end to end
//!
//! Buffering the inbound body and making the backend ready are independent, so
//! both run concurrently; forwarding starts only once both have finished.

use crate::cache::{BackendLease, BootstrapCache};
use crate::config::Config;
use crate::error::{json_error_response, BootstrapError, ProxyBody, ProxyErrorCode};
use crate::forward::{Forwarder, Invocation};
use crate::probe;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Settings for the invocation handler
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Largest inbound body that will be buffered
    pub max_body_bytes: usize,
    /// How long to wait for a dev backend to accept connections
    pub readiness_timeout: Duration,
    /// Interval between readiness attempts
    pub readiness_interval: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_body_bytes: config.defaults.max_body_bytes,
            readiness_timeout: config.defaults.readiness_timeout(),
            readiness_interval: config.defaults.readiness_interval(),
        }
    }
}

/// Serves invocations by proxying them to the cached backend
pub struct InvocationHandler {
    cache: Arc<BootstrapCache>,
    forwarder: Arc<Forwarder>,
    settings: HandlerSettings,
}

impl InvocationHandler {
    pub fn new(cache: Arc<BootstrapCache>, forwarder: Arc<Forwarder>, settings: HandlerSettings) -> Self {
        Self {
            cache,
            forwarder,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<BootstrapCache> {
        &self.cache
    }

    /// Handle one exchange. Every failure becomes a JSON error response.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let invocation = Invocation::new(parts, client_addr);
        let request_id = invocation.request_id.clone();

        debug!(
            request_id,
            method = %invocation.parts.method,
            uri = %invocation.parts.uri,
            "Invocation received"
        );

        let (body, lease) = tokio::join!(
            buffer_body(body, self.settings.max_body_bytes, &request_id),
            self.cache.ensure_ready()
        );
        let generation = lease.as_ref().ok().and_then(|lease| lease.generation());

        let response = match (body, lease) {
            (Err(response), _) => response,
            (Ok(_), Err(e)) => bootstrap_failed(&request_id, &e),
            (Ok(bytes), Ok(lease)) => self.forward_leased(invocation, bytes, lease).await,
        };

        if !self.cache.settings().enable_cache {
            if let Some(generation) = generation {
                if self.cache.invalidate(generation) {
                    debug!(request_id, generation, "Cache disabled, backend scheduled for teardown");
                }
            }
        }

        response
    }

    async fn forward_leased(&self, invocation: Invocation, body: Bytes, lease: BackendLease) -> Response<ProxyBody> {
        // A dev backend may have been started alongside this process and
        // not be listening yet
        if lease.is_dev() && !self.cache.settings().enable_cache {
            let ready = probe::wait_until_accepting(
                lease.address(),
                self.settings.readiness_timeout,
                self.settings.readiness_interval,
            )
            .await;
            if !ready {
                warn!(
                    request_id = %invocation.request_id,
                    address = %lease.address(),
                    "Dev backend not accepting connections"
                );
                return json_error_response(
                    ProxyErrorCode::BackendNotReady,
                    format!("Backend at {} is not accepting connections", lease.address()),
                );
            }
        }

        let response = self.forwarder.forward(invocation, body, lease.address()).await;
        let (parts, body) = response.into_parts();
        Response::from_parts(parts, LeasedBody::new(body, lease).boxed())
    }
}

fn bootstrap_failed(request_id: &str, e: &BootstrapError) -> Response<ProxyBody> {
    error!(request_id, error = %e, "Backend bootstrap failed");
    json_error_response(
        ProxyErrorCode::BootstrapFailed,
        format!("Backend bootstrap failed: {}", e),
    )
}

/// Read the whole inbound body, bounded by `limit`
async fn buffer_body<B>(body: B, limit: usize, request_id: &str) -> Result<Bytes, Response<ProxyBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(request_id, limit, "Request body exceeds limit");
            Err(json_error_response(
                ProxyErrorCode::PayloadTooLarge,
                format!("Request body exceeds {} bytes", limit),
            ))
        }
        Err(e) => {
            warn!(request_id, error = %e, "Failed to read request body");
            Err(json_error_response(
                ProxyErrorCode::BodyReadFailed,
                "Failed to read request body",
            ))
        }
    }
}

/// Response body that keeps the exchange counted as in flight until the
/// body has been relayed (or dropped)
struct LeasedBody {
    inner: ProxyBody,
    _lease: BackendLease,
}

impl LeasedBody {
    fn new(inner: ProxyBody, lease: BackendLease) -> Self {
        Self { inner, _lease: lease }
    }
}

impl Body for LeasedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
