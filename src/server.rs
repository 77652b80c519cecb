use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientId};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::filter::FindClientsFilter;
use crate::handler::{Anonymous, Authenticator, Handler, PingHandler};
use crate::hooks::{Hooks, LifecyclePhase};
use crate::index::ClientMap;
use crate::lifecycle::{LifecycleState, StateCell};
use crate::listener::{BoundListener, Transport, bind_listeners};
use crate::registry::ClientRegistry;

/// Extra time the shutdown watcher gives a listener on top of the
/// per-connection grace before aborting it.
const LISTENER_ABORT_MARGIN: Duration = Duration::from_secs(1);

/// Back-off after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Cheap, cloneable handle to one HTTP server instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    state: StateCell,
    parent: CancellationToken,
    run: Mutex<Option<CancellationToken>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    bound: Mutex<Vec<(Transport, SocketAddr)>>,
    clients: Arc<ClientRegistry>,
    connection_id: AtomicU64,
    hooks: Hooks,
    handler: RwLock<Arc<dyn Handler>>,
    authenticator: RwLock<Arc<dyn Authenticator>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_parent(config, CancellationToken::new())
    }

    /// Every start derives its run token from `parent`; cancelling the
    /// parent shuts the listeners down as a stop would.
    pub fn with_parent(config: ServerConfig, parent: CancellationToken) -> Result<Self> {
        config.validate()?;
        info!(server = %config.name, "creating server instance");

        let clients = Arc::new(ClientRegistry::with_indexing(config.enable_indexing));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: StateCell::default(),
                parent,
                run: Mutex::new(None),
                watcher: Mutex::new(None),
                bound: Mutex::new(Vec::new()),
                clients,
                connection_id: AtomicU64::new(0),
                hooks: Hooks::default(),
                handler: RwLock::new(Arc::new(PingHandler)),
                authenticator: RwLock::new(Arc::new(Anonymous)),
                started_at: Mutex::new(None),
                stopped_at: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn description(&self) -> &str {
        &self.inner.config.description
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.inner.clients
    }

    pub async fn find_clients(&self, filter: FindClientsFilter) -> ClientMap {
        self.inner.clients.find(filter).await
    }

    pub fn set_handler(&self, handler: impl Handler) {
        *self.inner.handler.write() = Arc::new(handler);
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.inner.handler.read().clone()
    }

    pub fn set_authenticator(&self, authenticator: impl Authenticator) {
        *self.inner.authenticator.write() = Arc::new(authenticator);
    }

    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        self.inner.authenticator.read().clone()
    }

    /// Next connection id; ids start at 1 and are never reused.
    pub fn next_connection_id(&self) -> ClientId {
        ClientId::new(self.inner.connection_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Last id handed out, 0 before the first request.
    pub fn current_connection_id(&self) -> u64 {
        self.inner.connection_id.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == LifecycleState::Stopping
    }

    /// True before the first start and after every completed stop.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::NotStarted | LifecycleState::Stopped
        )
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.started_at.lock()
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.stopped_at.lock()
    }

    /// Addresses bound by the latest start.
    pub fn bound_addresses(&self) -> Vec<(Transport, SocketAddr)> {
        self.inner.bound.lock().clone()
    }

    // ==================== Hooks ====================

    pub fn on_lifecycle<F>(&self, phase: LifecyclePhase, name: impl Into<String>, hook: F) -> bool
    where
        F: Fn(&Server) + Send + Sync + 'static,
    {
        self.inner.hooks.lifecycle(phase).add(name, Arc::new(hook))
    }

    pub fn remove_lifecycle_hook(&self, phase: LifecyclePhase, name: &str) -> bool {
        self.inner.hooks.lifecycle(phase).remove(name)
    }

    pub fn on_request<F>(&self, name: impl Into<String>, hook: F) -> bool
    where
        F: Fn(&Client, &Server) + Send + Sync + 'static,
    {
        self.inner.hooks.request.add(name, Arc::new(hook))
    }

    pub fn remove_request_hook(&self, name: &str) -> bool {
        self.inner.hooks.request.remove(name)
    }

    pub fn on_response<F>(&self, name: impl Into<String>, hook: F) -> bool
    where
        F: Fn(&Client, &Server) + Send + Sync + 'static,
    {
        self.inner.hooks.response.add(name, Arc::new(hook))
    }

    pub fn remove_response_hook(&self, name: &str) -> bool {
        self.inner.hooks.response.remove(name)
    }

    fn fire(&self, phase: LifecyclePhase) {
        let hooks = self.inner.hooks.lifecycle(phase).snapshot();
        if hooks.is_empty() {
            return;
        }
        debug!(server = %self.name(), event = %phase, hooks = hooks.len(), "start");
        for hook in hooks {
            hook(self);
        }
        debug!(server = %self.name(), event = %phase, "finish");
    }

    pub(crate) fn fire_request(&self, client: &Client) {
        for hook in self.inner.hooks.request.snapshot() {
            hook(client, self);
        }
    }

    pub(crate) fn fire_response(&self, client: &Client) {
        for hook in self.inner.hooks.response.snapshot() {
            hook(client, self);
        }
    }

    // ==================== Lifecycle ====================

    /// Binds every configured listener and starts serving.
    ///
    /// Listeners that cannot bind are logged and skipped; the start itself
    /// still succeeds. Fails when another start or a stop holds the
    /// lifecycle, the server is already running, or the parent token has
    /// been cancelled.
    pub async fn start(&self) -> Result<()> {
        info!(server = %self.name(), "entering start function");

        if self.inner.parent.is_cancelled() {
            warn!(server = %self.name(), "start rejected, parent context is cancelled");
            return Err(ServerError::Cancelled);
        }

        // restores the previous state if this future is dropped before the
        // listeners are up
        let claim = self.inner.state.guard_start().inspect_err(|e| {
            warn!(server = %self.name(), error = %e, "start rejected");
        })?;
        debug!(server = %self.name(), from = %claim.previous(), "start claimed");

        self.fire(LifecyclePhase::BeforeStart);
        self.fire(LifecyclePhase::Start);

        let token = self.inner.parent.child_token();
        let grace = self.inner.config.shutdown_grace();

        let listeners = bind_listeners(&self.inner.config).await;
        let mut bound = Vec::with_capacity(listeners.len());
        let mut handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let local_addr = listener.local_addr;
            bound.push((listener.transport, local_addr));
            let handle = tokio::spawn(run_listener(self.clone(), listener, token.clone(), grace));
            handles.push((local_addr, handle));
        }
        if bound.is_empty() {
            warn!(server = %self.name(), "no listener could be bound");
        }

        let watcher = tokio::spawn(watch_shutdown(token.clone(), handles, grace));

        *self.inner.run.lock() = Some(token);
        *self.inner.watcher.lock() = Some(watcher);
        *self.inner.bound.lock() = bound;
        *self.inner.started_at.lock() = Some(Utc::now());

        claim.complete(LifecycleState::Running);
        self.fire(LifecyclePhase::Started);

        info!(server = %self.name(), "leaving start function");
        Ok(())
    }

    /// Cancels the run token; listeners drain in the background.
    ///
    /// A no-op while a start is in flight, before the first start, or when
    /// another caller is already stopping.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.state.claim_stop() {
            debug!(server = %self.name(), state = %self.state(), "stop ignored");
            return Ok(());
        }
        info!(server = %self.name(), "stopping server");

        self.fire(LifecyclePhase::BeforeStop);
        self.fire(LifecyclePhase::Stop);

        if let Some(token) = self.inner.run.lock().take() {
            token.cancel();
        }

        *self.inner.stopped_at.lock() = Some(Utc::now());
        self.inner.state.release(LifecycleState::Stopped);
        self.fire(LifecyclePhase::Stopped);

        Ok(())
    }

    /// Waits until every listener of the last run has shut down.
    pub async fn wait_for_shutdown(&self) {
        let watcher = self.inner.watcher.lock().take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                error!(server = %self.name(), error = %e, "shutdown watcher failed");
            }
        }
    }
}

/// Accept loop for one listener; returns once `shutdown` fires and all of
/// its connections have drained.
async fn run_listener(
    server: Server,
    bound: BoundListener,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let BoundListener {
        transport,
        requested,
        local_addr,
        listener,
        tls,
    } = bound;
    info!(
        running_on = %local_addr,
        requested = requested.raw(),
        scheme = transport.scheme(),
        "running http server"
    );

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let server = server.clone();
                    let tls = tls.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(err) = crate::conn::handle(server, socket, peer, tls, shutdown, grace).await {
                            debug!(%peer, error = %err, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(listening_address = %local_addr, error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    info!(listening_address = %local_addr, "listener stopped");
}

/// Waits for cancellation, then gives every listener a bounded time to
/// drain before aborting it.
async fn watch_shutdown(
    token: CancellationToken,
    listeners: Vec<(SocketAddr, JoinHandle<()>)>,
    grace: Duration,
) {
    token.cancelled().await;
    info!("terminating...");

    let deadline = tokio::time::Instant::now() + grace + LISTENER_ABORT_MARGIN;
    for (address, mut handle) in listeners {
        info!(shutting_down = %address, "shutting down server");
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(listening_address = %address, error = %e, "listener task failed"),
            Err(_) => {
                warn!(listening_address = %address, "listener did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}
