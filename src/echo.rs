//! Echo application
//!
//! Serves every request by describing it back as JSON. The binary runs it as
//! its default backend and the tests use it to observe exactly what the
//! forwarder transmitted.
//!
//! A request header `x-echo-status: <code>` selects the response status.

use crate::backend::Application;
use crate::error::ProxyBody;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Header selecting the echo response status
pub const ECHO_STATUS_HEADER: &str = "x-echo-status";

/// What the echo app reports about a request
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EchoReport {
    pub method: String,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub body_length: usize,
}

#[derive(Debug, Default)]
pub struct EchoApp {
    requests: AtomicU64,
    shut_down: AtomicBool,
}

impl EchoApp {
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Application for EchoApp {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Response<ProxyBody>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        echo(req).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            self.shut_down.store(true, Ordering::SeqCst);
            debug!("Echo application shut down");
            Ok(())
        }
        .boxed()
    }
}

async fn echo(req: Request<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let status = parts
        .headers
        .get(ECHO_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Echo failed to read request body");
            Bytes::new()
        }
    };

    let report = EchoReport {
        method: parts.method.to_string(),
        uri: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
        body_length: body.len(),
    };

    let json = serde_json::to_vec(&report).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
