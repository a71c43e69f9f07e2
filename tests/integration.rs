//! Integration tests for Warmstart

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use warmstart::address::{bind, resolve, Transport};
use warmstart::backend::{factory_fn, Backend, BackendHandle, BackendKind, EphemeralPorts};
use warmstart::cache::{BootstrapCache, CacheSettings, StateKind};
use warmstart::config::Config;
use warmstart::echo::{EchoApp, EchoReport};
use warmstart::forward::{ForwardSettings, Forwarder};
use warmstart::handler::{HandlerSettings, InvocationHandler};
use warmstart::server::InvocationServer;
use warmstart::tls;

/// A running invocation host with an observable echo backend factory
struct Host {
    port: u16,
    cache: Arc<BootstrapCache>,
    shutdown_tx: watch::Sender<bool>,
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    apps: Arc<Mutex<Vec<Arc<EchoApp>>>>,
}

impl Host {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_app(&self) -> Arc<EchoApp> {
        self.apps.lock().last().cloned().expect("a backend was bootstrapped")
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.cache.shutdown().await;
    }
}

#[derive(Default)]
struct HostOptions {
    disable_cache: bool,
    backend_tls: bool,
    dev_address: Option<String>,
    max_body_bytes: Option<usize>,
    factory_delay: Duration,
}

fn test_config(options: &HostOptions) -> Config {
    let mut config = Config::default();
    config.cache.enable_cache = !options.disable_cache;
    if let Some(address) = &options.dev_address {
        config.cache.environment = "development".to_string();
        config.cache.dev_mode_address = Some(address.clone());
    }
    if let Some(max) = options.max_body_bytes {
        config.defaults.max_body_bytes = max;
    }
    config.defaults.request_timeout_secs = 5;
    config.defaults.drain_timeout_secs = 2;
    config.defaults.shutdown_grace_period_secs = 2;
    config.defaults.readiness_timeout_secs = 2;
    config.defaults.readiness_interval_ms = 20;
    config.validate().unwrap();
    config
}

async fn start_host(options: HostOptions) -> Host {
    let config = test_config(&options);

    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(false));
    let apps: Arc<Mutex<Vec<Arc<EchoApp>>>> = Arc::new(Mutex::new(Vec::new()));

    let (transport, roots) = if options.backend_tls {
        let signed = tls::self_signed_acceptor().unwrap();
        (Transport::Tls(signed.acceptor), vec![signed.certificate])
    } else {
        (Transport::Plain, Vec::new())
    };

    let factory = {
        let calls = Arc::clone(&calls);
        let fail = Arc::clone(&fail);
        let apps = Arc::clone(&apps);
        let delay = options.factory_delay;
        factory_fn(move || {
            let calls = Arc::clone(&calls);
            let fail = Arc::clone(&fail);
            let apps = Arc::clone(&apps);
            let transport = transport.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                if fail.load(Ordering::SeqCst) {
                    anyhow::bail!("migrations failed");
                }
                let app = Arc::new(EchoApp::default());
                apps.lock().push(Arc::clone(&app));
                Ok(Backend::managed(app).with_transport(transport))
            }
        })
    };

    let cache = BootstrapCache::new(
        Arc::new(factory),
        Arc::new(EphemeralPorts),
        CacheSettings::from_config(&config).unwrap(),
    );
    let forwarder = Forwarder::with_tls_roots(ForwardSettings::from_config(&config), &roots).unwrap();
    let handler = Arc::new(InvocationHandler::new(
        Arc::clone(&cache),
        Arc::new(forwarder),
        HandlerSettings::from_config(&config),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = InvocationServer::new(listener.local_addr().unwrap(), handler, shutdown_rx);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    Host {
        port,
        cache,
        shutdown_tx,
        calls,
        fail,
        apps,
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(port: u16, method: &str, path: &str, extra_headers: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: fn.local\r\nConnection: close\r\nContent-Length: {}\r\n{}\r\n{}",
        method,
        path,
        body.len(),
        extra_headers,
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_post(port: u16, path: &str, body: &str) -> String {
    http_request(port, "POST", path, "", body).await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

fn echo_report(response: &str) -> EchoReport {
    serde_json::from_str(body_of(response))
        .unwrap_or_else(|e| panic!("not an echo report ({}): {}", e, response))
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_concurrent_invocations_share_one_backend() {
    let host = start_host(HostOptions {
        factory_delay: Duration::from_millis(100),
        ..Default::default()
    })
    .await;

    let (a, b) = tokio::join!(
        http_post(host.port, "/first", "a"),
        http_post(host.port, "/second", "b")
    );

    assert_eq!(status_of(&a), 200, "{}", a);
    assert_eq!(status_of(&b), 200, "{}", b);
    assert_eq!(host.calls(), 1);
    assert_eq!(host.last_app().request_count(), 2);
    assert_eq!(host.cache.state(), StateKind::Ready);

    let address = host.cache.cached_address().unwrap();
    let third = http_post(host.port, "/third", "c").await;
    assert_eq!(status_of(&third), 200);
    assert_eq!(host.cache.cached_address(), Some(address));
    assert_eq!(host.calls(), 1);

    host.stop().await;
}

#[tokio::test]
async fn test_cache_disabled_rebuilds_backend_each_invocation() {
    let host = start_host(HostOptions {
        disable_cache: true,
        ..Default::default()
    })
    .await;

    let first = http_post(host.port, "/", "one").await;
    assert_eq!(status_of(&first), 200, "{}", first);

    host.cache.drained().await;
    assert_eq!(host.cache.state(), StateKind::Idle);
    assert!(host.cache.cached_port().is_none());
    assert!(host.last_app().was_shut_down());

    let second = http_post(host.port, "/", "two").await;
    assert_eq!(echo_report(&second).body, "two");
    assert_eq!(host.calls(), 2);

    host.stop().await;
}

#[tokio::test]
async fn test_factory_failure_then_recovery() {
    let host = start_host(HostOptions::default()).await;
    host.fail.store(true, Ordering::SeqCst);

    let failed = http_post(host.port, "/", "x").await;
    assert_eq!(status_of(&failed), 500, "{}", failed);
    assert!(failed.to_lowercase().contains("x-proxy-error: bootstrap_failed"));
    assert!(body_of(&failed).contains("migrations failed"));
    assert_eq!(host.cache.state(), StateKind::Failed);

    host.fail.store(false, Ordering::SeqCst);
    let recovered = http_post(host.port, "/", "x").await;
    assert_eq!(status_of(&recovered), 200, "{}", recovered);
    assert_eq!(host.calls(), 2);

    host.stop().await;
}

#[tokio::test]
async fn test_chunked_body_forwarded_with_exact_length() {
    let host = start_host(HostOptions::default()).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", host.port)).await.unwrap();
    let request = "POST /upload HTTP/1.1\r\nHost: fn.local\r\nConnection: close\r\n\
                   Transfer-Encoding: chunked\r\n\r\n\
                   5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert_eq!(status_of(&response), 200, "{}", response);
    let report = echo_report(&response);
    assert_eq!(report.body, "hello world");
    assert_eq!(report.headers.get("content-length").unwrap(), "11");
    assert!(!report.headers.contains_key("transfer-encoding"));

    host.stop().await;
}

#[tokio::test]
async fn test_marker_query_parameter_is_stripped() {
    let host = start_host(HostOptions::default()).await;

    let response = http_request(host.port, "GET", "/api/users?match=api&sort=name&page=2", "", "").await;
    assert_eq!(status_of(&response), 200, "{}", response);

    let report = echo_report(&response);
    assert_eq!(report.method, "GET");
    assert_eq!(report.uri, "/api/users?sort=name&page=2");
    assert_eq!(report.headers.get("x-forwarded-host").unwrap(), "fn.local");
    assert_eq!(report.headers.get("x-forwarded-for").unwrap(), "127.0.0.1");

    host.stop().await;
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let host = start_host(HostOptions::default()).await;

    let response = http_request(host.port, "GET", "/", "X-Request-Id: trace-77\r\n", "").await;
    let report = echo_report(&response);
    assert_eq!(report.headers.get("x-request-id").unwrap(), "trace-77");

    host.stop().await;
}

#[tokio::test]
async fn test_backend_status_is_relayed() {
    let host = start_host(HostOptions::default()).await;

    let response = http_request(host.port, "DELETE", "/items/9", "X-Echo-Status: 404\r\n", "").await;
    assert_eq!(status_of(&response), 404, "{}", response);
    assert!(!response.to_lowercase().contains("x-proxy-error"));

    host.stop().await;
}

#[tokio::test]
async fn test_payload_too_large() {
    let host = start_host(HostOptions {
        max_body_bytes: Some(16),
        ..Default::default()
    })
    .await;

    let response = http_post(host.port, "/", "this body is definitely over the limit").await;
    assert_eq!(status_of(&response), 413, "{}", response);
    assert!(body_of(&response).contains("PAYLOAD_TOO_LARGE"));

    host.stop().await;
}

#[tokio::test]
async fn test_unreachable_dev_backend_is_bad_gateway() {
    let host = start_host(HostOptions {
        dev_address: Some(format!("http://127.0.0.1:{}", closed_port())),
        ..Default::default()
    })
    .await;

    let response = http_post(host.port, "/", "x").await;
    assert_eq!(status_of(&response), 502, "{}", response);
    assert!(body_of(&response).contains("CONNECTION_FAILED"));
    assert_eq!(host.calls(), 0);

    host.stop().await;
}

#[tokio::test]
async fn test_dev_backend_probed_when_cache_disabled() {
    let dev_port = closed_port();
    let host = start_host(HostOptions {
        disable_cache: true,
        dev_address: Some(format!("http://127.0.0.1:{}", dev_port)),
        ..Default::default()
    })
    .await;

    // The dev backend comes up shortly after the invocation arrives
    let app = Arc::new(EchoApp::default());
    let dev_app = Arc::clone(&app);
    let dev = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = bind(dev_port, Transport::Plain).await.unwrap();
        assert_eq!(resolve(&listener).unwrap().port(), dev_port);
        BackendHandle::start(listener, dev_app, BackendKind::Plain).unwrap()
    });

    let response = http_post(host.port, "/dev", "payload").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(echo_report(&response).body, "payload");
    assert_eq!(app.request_count(), 1);
    assert_eq!(host.calls(), 0);

    dev.await.unwrap().close(Duration::from_secs(1)).await.unwrap();
    host.stop().await;
}

#[tokio::test]
async fn test_https_backend() {
    let host = start_host(HostOptions {
        backend_tls: true,
        ..Default::default()
    })
    .await;

    let response = http_post(host.port, "/secure", "over tls").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(echo_report(&response).body, "over tls");

    let address = host.cache.cached_address().unwrap();
    assert!(address.to_string().starts_with("https://127.0.0.1:"));

    host.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_cached_backend() {
    let host = start_host(HostOptions::default()).await;

    let response = http_post(host.port, "/", "x").await;
    assert_eq!(status_of(&response), 200);
    let backend_port = host.cache.cached_port().unwrap();
    let app = host.last_app();

    host.stop().await;
    assert!(app.was_shut_down());
    assert!(TcpStream::connect(("127.0.0.1", backend_port)).await.is_err());
}
