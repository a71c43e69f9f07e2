//! Lazy, single-flight backend bootstrap
//!
//! [`BootstrapCache`] owns at most one backend per execution context. The
//! first caller that finds the cache idle spawns the bootstrap task; every
//! caller that arrives while it runs awaits the same shared future, so the
//! factory and the port allocator run once per cache cycle no matter how many
//! invocations overlap.
//!
//! The bootstrap runs as its own task. A caller that gives up (host-level
//! invocation timeout) does not stall the bootstrap for anyone else, and the
//! state always leaves `Starting` once the factory settles.
//!
//! When caching is disabled, [`BootstrapCache::invalidate`] is called after
//! every exchange. It returns the cache to `Idle` at once and tears the backend
//! down in the background after its in-flight exchanges drain. A bootstrap
//! that begins while a teardown is pending waits for it, so two backends
//! never serve at the same time.

use crate::address::{self, BackendAddress};
use crate::backend::{BackendFactory, BackendHandle, PortAllocator};
use crate::config::Config;
use crate::error::{BindError, BootstrapError};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Interval for polling drain status during teardown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 20;

type BootstrapResult = Result<Arc<ReadyBackend>, Arc<BootstrapError>>;
type SharedBootstrap = Shared<BoxFuture<'static, BootstrapResult>>;
type SharedTeardown = Shared<BoxFuture<'static, ()>>;

/// Settings the cache needs, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Keep the backend between exchanges
    pub enable_cache: bool,
    /// Pre-started backend; skips bootstrap entirely
    pub dev_address: Option<BackendAddress>,
    pub bootstrap_timeout: Duration,
    pub drain_timeout: Duration,
    pub shutdown_grace_period: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_parts(&Config::default())
    }
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut settings = Self::from_parts(config);
        settings.dev_address = config.cache.dev_address()?;
        Ok(settings)
    }

    fn from_parts(config: &Config) -> Self {
        Self {
            enable_cache: config.cache.enable_cache,
            dev_address: None,
            bootstrap_timeout: config.defaults.bootstrap_timeout(),
            drain_timeout: config.defaults.drain_timeout(),
            shutdown_grace_period: config.defaults.shutdown_grace_period(),
        }
    }

    pub fn with_enable_cache(mut self, enable_cache: bool) -> Self {
        self.enable_cache = enable_cache;
        self
    }

    pub fn with_dev_address(mut self, address: BackendAddress) -> Self {
        self.dev_address = Some(address);
        self
    }
}

/// Observable shape of the bootstrap state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Idle,
    Starting,
    Ready,
    Failed,
}

/// A resolved backend generation
#[derive(Debug)]
struct ReadyBackend {
    generation: u64,
    address: BackendAddress,
    /// Leases currently held against this generation
    in_flight: Arc<AtomicUsize>,
}

enum BootstrapState {
    Idle,
    Starting {
        generation: u64,
        pending: SharedBootstrap,
    },
    Ready {
        ready: Arc<ReadyBackend>,
        handle: BackendHandle,
    },
    Failed,
}

impl BootstrapState {
    fn kind(&self) -> StateKind {
        match self {
            BootstrapState::Idle => StateKind::Idle,
            BootstrapState::Starting { .. } => StateKind::Starting,
            BootstrapState::Ready { .. } => StateKind::Ready,
            BootstrapState::Failed => StateKind::Failed,
        }
    }

    fn is_starting(&self, generation: u64) -> bool {
        matches!(self, BootstrapState::Starting { generation: g, .. } if *g == generation)
    }
}

/// Counters for the cache lifecycle
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Bootstraps that reached `Ready`
    pub bootstraps: AtomicU64,
    /// Bootstraps that failed
    pub failures: AtomicU64,
    /// Completed teardowns
    pub teardowns: AtomicU64,
}

impl CacheStats {
    fn record_bootstrap(&self) {
        self.bootstraps.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_bootstraps(&self) -> u64 {
        self.bootstraps.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn get_teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }
}

/// Proof that a backend is ready, held for the duration of one exchange.
///
/// While any lease on a generation is alive, teardown of that generation
/// waits (up to the drain timeout).
#[derive(Debug)]
pub struct BackendLease {
    address: BackendAddress,
    generation: Option<u64>,
    in_flight: Option<Arc<AtomicUsize>>,
}

impl BackendLease {
    fn tracked(ready: &ReadyBackend) -> Self {
        ready.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            address: ready.address.clone(),
            generation: Some(ready.generation),
            in_flight: Some(Arc::clone(&ready.in_flight)),
        }
    }

    fn untracked(address: BackendAddress) -> Self {
        Self {
            address,
            generation: None,
            in_flight: None,
        }
    }

    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    /// Generation of the bootstrapped backend; `None` for the dev address
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Whether this lease points at the fixed dev address
    pub fn is_dev(&self) -> bool {
        self.generation.is_none()
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        if let Some(counter) = &self.in_flight {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Single-flight owner of the execution context's backend.
///
/// Like other shared managers in this crate it is used behind an `Arc`;
/// [`new`](BootstrapCache::new) returns `Arc<Self>` because the bootstrap and
/// teardown tasks keep their own reference.
pub struct BootstrapCache {
    factory: Arc<dyn BackendFactory>,
    ports: Arc<dyn PortAllocator>,
    settings: CacheSettings,
    state: Mutex<BootstrapState>,
    next_generation: AtomicU64,
    /// Most recent teardown; the next bootstrap waits for it
    teardown: Mutex<Option<SharedTeardown>>,
    stats: Arc<CacheStats>,
}

impl BootstrapCache {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        ports: Arc<dyn PortAllocator>,
        settings: CacheSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            ports,
            settings,
            state: Mutex::new(BootstrapState::Idle),
            next_generation: AtomicU64::new(0),
            teardown: Mutex::new(None),
            stats: Arc::new(CacheStats::default()),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> StateKind {
        self.state.lock().kind()
    }

    /// Address of the cached backend, if one is ready
    pub fn cached_address(&self) -> Option<BackendAddress> {
        match &*self.state.lock() {
            BootstrapState::Ready { ready, .. } => Some(ready.address.clone()),
            _ => None,
        }
    }

    /// Port of the cached backend, if one is ready
    pub fn cached_port(&self) -> Option<u16> {
        match &*self.state.lock() {
            BootstrapState::Ready { handle, .. } => Some(handle.port()),
            _ => None,
        }
    }

    /// Make sure a backend is serving and lease it for one exchange.
    ///
    /// Concurrent callers share one bootstrap and observe the same outcome.
    /// A failed bootstrap is not sticky: the next call starts over.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<BackendLease, Arc<BootstrapError>> {
        if let Some(address) = &self.settings.dev_address {
            return Ok(BackendLease::untracked(address.clone()));
        }

        loop {
            let pending = {
                let mut state = self.state.lock();
                match &*state {
                    BootstrapState::Ready { ready, .. } => {
                        return Ok(BackendLease::tracked(ready));
                    }
                    BootstrapState::Starting { pending, .. } => pending.clone(),
                    BootstrapState::Idle | BootstrapState::Failed => {
                        self.start_bootstrap(&mut *state)
                    }
                }
            };

            let ready = pending.await?;

            // Lease only if this generation is still the cached one. It may
            // have been invalidated between resolution and now.
            let state = self.state.lock();
            if let BootstrapState::Ready { ready: current, .. } = &*state {
                if current.generation == ready.generation {
                    return Ok(BackendLease::tracked(current));
                }
            }
            debug!(generation = ready.generation, "Backend changed while waiting, retrying");
        }
    }

    fn start_bootstrap(self: &Arc<Self>, state: &mut BootstrapState) -> SharedBootstrap {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous_teardown = self.teardown.lock().clone();

        debug!(generation, "Starting backend bootstrap");

        let cache = Arc::clone(self);
        let task = tokio::spawn(async move { cache.run_bootstrap(generation, previous_teardown).await });

        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(BootstrapError::Aborted(e.to_string()))),
            }
        }
        .boxed()
        .shared();

        *state = BootstrapState::Starting {
            generation,
            pending: pending.clone(),
        };
        pending
    }

    async fn run_bootstrap(
        self: Arc<Self>,
        generation: u64,
        previous_teardown: Option<SharedTeardown>,
    ) -> BootstrapResult {
        if let Some(teardown) = previous_teardown {
            teardown.await;
        }

        let started = Instant::now();
        let timeout = self.settings.bootstrap_timeout;
        let result = match tokio::time::timeout(timeout, self.bootstrap()).await {
            Ok(result) => result,
            Err(_) => Err(BootstrapError::Timeout(timeout)),
        };

        let mut state = self.state.lock();
        if !state.is_starting(generation) {
            // The cache was shut down while this bootstrap ran
            drop(state);
            if let Ok((handle, address)) = result {
                warn!(generation, %address, "Discarding backend bootstrapped after shutdown");
                let grace = self.settings.shutdown_grace_period;
                tokio::spawn(async move {
                    if let Err(e) = handle.close(grace).await {
                        warn!(error = %e, "Failed to close discarded backend");
                    }
                });
            }
            return Err(Arc::new(BootstrapError::Aborted(
                "cache was shut down during bootstrap".to_string(),
            )));
        }

        match result {
            Ok((handle, address)) => {
                let ready = Arc::new(ReadyBackend {
                    generation,
                    address,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                });
                info!(
                    generation,
                    address = %ready.address,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend ready"
                );
                *state = BootstrapState::Ready {
                    ready: Arc::clone(&ready),
                    handle,
                };
                self.stats.record_bootstrap();
                Ok(ready)
            }
            Err(e) => {
                error!(generation, error = %e, "Backend bootstrap failed");
                *state = BootstrapState::Failed;
                self.stats.record_failure();
                Err(Arc::new(e))
            }
        }
    }

    /// Allocate a port and build the backend concurrently, then bind and serve.
    async fn bootstrap(&self) -> Result<(BackendHandle, BackendAddress), BootstrapError> {
        let (port, backend) = tokio::join!(self.ports.allocate(), self.factory.create());
        let port = port.map_err(BootstrapError::PortAllocation)?;
        let backend = backend.map_err(BootstrapError::Factory)?;

        let listener = address::bind(port, backend.transport).await?;
        let address = address::resolve(&listener)?;
        let handle = BackendHandle::start(listener, backend.app, backend.kind)
            .map_err(BindError::LocalAddr)?;

        Ok((handle, address))
    }

    /// Drop the cached backend of `generation` and tear it down.
    ///
    /// Returns `false` without doing anything when that generation is not the
    /// cached one (already invalidated, or never ready).
    pub fn invalidate(self: &Arc<Self>, generation: u64) -> bool {
        let (ready, handle) = {
            let mut state = self.state.lock();
            match &*state {
                BootstrapState::Ready { ready, .. } if ready.generation == generation => {}
                _ => return false,
            }
            let BootstrapState::Ready { ready, handle } =
                std::mem::replace(&mut *state, BootstrapState::Idle)
            else {
                return false;
            };
            (ready, handle)
        };

        debug!(generation, address = %ready.address, "Invalidating cached backend");
        self.schedule_teardown(ready, handle);
        true
    }

    fn schedule_teardown(&self, ready: Arc<ReadyBackend>, handle: BackendHandle) {
        let drain_timeout = self.settings.drain_timeout;
        let grace_period = self.settings.shutdown_grace_period;
        let stats = Arc::clone(&self.stats);

        let task = tokio::spawn(async move {
            teardown(ready, handle, drain_timeout, grace_period).await;
            stats.record_teardown();
        });

        let mut slot = self.teardown.lock();
        let previous = slot.take();
        let done = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            let _ = task.await;
        }
        .boxed()
        .shared();
        *slot = Some(done);
    }

    /// Wait for every teardown scheduled so far
    pub async fn drained(&self) {
        let pending = self.teardown.lock().clone();
        if let Some(pending) = pending {
            pending.await;
        }
    }

    /// Tear down whatever is cached and wait for it. Used on process exit.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), BootstrapState::Idle);
        if let BootstrapState::Ready { ready, handle } = previous {
            info!(address = %ready.address, "Shutting down cached backend");
            self.schedule_teardown(ready, handle);
        }
        self.drained().await;
    }
}

/// Wait for leases to drain, then close the backend. Errors are logged only.
async fn teardown(
    ready: Arc<ReadyBackend>,
    handle: BackendHandle,
    drain_timeout: Duration,
    grace_period: Duration,
) {
    let generation = ready.generation;
    let drain_start = Instant::now();
    while ready.in_flight.load(Ordering::SeqCst) > 0 {
        if drain_start.elapsed() > drain_timeout {
            warn!(
                generation,
                remaining = ready.in_flight.load(Ordering::SeqCst),
                "Drain timeout exceeded, proceeding with shutdown"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
    }

    match handle.close(grace_period).await {
        Ok(()) => debug!(generation, "Backend torn down"),
        Err(e) => warn!(generation, error = %e, "Backend teardown failed"),
    }
}
