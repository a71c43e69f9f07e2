//! Backend seams: the application being adapted, the factory that builds it,
//! the port allocator, and the handle that serves it on a bound listener.

use crate::address::{BoundListener, Transport, LOOPBACK};
use crate::error::{ProxyBody, ShutdownError};
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// The long-running application a backend serves
pub trait Application: Send + Sync + 'static {
    /// Handle one request
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Response<ProxyBody>>;

    /// Application-level shutdown hook, run for [`BackendKind::Managed`] backends
    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// Selects the shutdown protocol of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Closing the listener is the whole teardown
    Plain,
    /// The application's own shutdown hook runs after the listener closes
    Managed,
}

/// What a [`BackendFactory`] produces: an application ready to be served
pub struct Backend {
    pub app: Arc<dyn Application>,
    pub transport: Transport,
    pub kind: BackendKind,
}

impl Backend {
    pub fn plain(app: Arc<dyn Application>) -> Self {
        Self {
            app,
            transport: Transport::Plain,
            kind: BackendKind::Plain,
        }
    }

    pub fn managed(app: Arc<dyn Application>) -> Self {
        Self {
            app,
            transport: Transport::Plain,
            kind: BackendKind::Managed,
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }
}

/// Builds the backend. Called at most once per cache cycle.
pub trait BackendFactory: Send + Sync + 'static {
    fn create(&self) -> BoxFuture<'static, anyhow::Result<Backend>>;
}

/// Adapts an async closure into a [`BackendFactory`]
pub struct FnFactory<F>(F);

pub fn factory_fn<F, Fut>(f: F) -> FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Backend>> + Send + 'static,
{
    FnFactory(f)
}

impl<F, Fut> BackendFactory for FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Backend>> + Send + 'static,
{
    fn create(&self) -> BoxFuture<'static, anyhow::Result<Backend>> {
        (self.0)().boxed()
    }
}

/// Hands out a currently unused local port
pub trait PortAllocator: Send + Sync + 'static {
    fn allocate(&self) -> BoxFuture<'static, std::io::Result<u16>>;
}

/// Lets the OS pick a free loopback port
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralPorts;

impl PortAllocator for EphemeralPorts {
    fn allocate(&self) -> BoxFuture<'static, std::io::Result<u16>> {
        async {
            let probe = TcpListener::bind((LOOPBACK, 0)).await?;
            Ok(probe.local_addr()?.port())
        }
        .boxed()
    }
}

/// A backend being served on its own listener.
///
/// Dropping the handle also stops the listener, but without waiting for
/// connections to drain; [`close`](BackendHandle::close) is the orderly path.
pub struct BackendHandle {
    app: Arc<dyn Application>,
    kind: BackendKind,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
}

impl BackendHandle {
    /// Start serving `app` on an already bound listener
    pub fn start(listener: BoundListener, app: Arc<dyn Application>, kind: BackendKind) -> std::io::Result<Self> {
        let port = listener.local_addr()?.port();
        let (listener, transport) = listener.into_parts();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let serve_app = Arc::clone(&app);
        let serve_task = tokio::spawn(async move {
            serve(listener, transport, serve_app, shutdown_rx).await;
        });

        info!(port, ?kind, "Backend serving");

        Ok(Self {
            app,
            kind,
            port,
            shutdown_tx,
            serve_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, let open connections finish within `grace_period`,
    /// then run the application hook if the kind requires one.
    ///
    /// All steps run even if an earlier one fails; the first error is returned.
    pub async fn close(self, grace_period: Duration) -> Result<(), ShutdownError> {
        let port = self.port;
        let _ = self.shutdown_tx.send(true);

        let mut serve_task = self.serve_task;
        let listener_result = match tokio::time::timeout(grace_period, &mut serve_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ShutdownError::Join(e)),
            Err(_) => {
                serve_task.abort();
                Err(ShutdownError::GracePeriodExceeded(grace_period))
            }
        };

        let app_result = match self.kind {
            BackendKind::Plain => Ok(()),
            BackendKind::Managed => {
                debug!(port, "Running application shutdown hook");
                self.app.shutdown().await.map_err(ShutdownError::Application)
            }
        };

        info!(port, kind = ?self.kind, "Backend closed");
        listener_result.and(app_result)
    }
}

async fn serve(
    listener: TcpListener,
    transport: Transport,
    app: Arc<dyn Application>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let app = Arc::clone(&app);
                        let transport = transport.clone();
                        let shutdown_rx = shutdown_rx.clone();

                        connections.spawn(async move {
                            match transport {
                                Transport::Plain => {
                                    serve_connection(stream, addr, app, shutdown_rx).await;
                                }
                                Transport::Tls(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        serve_connection(tls_stream, addr, app, shutdown_rx).await;
                                    }
                                    Err(e) => {
                                        debug!(addr = %addr, error = %e, "Backend TLS handshake failed");
                                    }
                                },
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Backend failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Listener is dropped here; nothing new is accepted while connections drain
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    app: Arc<dyn Application>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(app.call(req).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(addr = %addr, error = %e, "Backend connection error");
    }
}
