//! Host lifecycle: build the pipeline, own the listening socket.
//!
//! A [`Host`] is either Stopped or Running. `initialize`, `start` and `stop`
//! are serialized by an internal mutex, so concurrent callers observe the
//! transitions one at a time.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use keel_core::Authorizer;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{BodyParsing, ErrorHandling, HostConfig, InitializeOptions};
use crate::error::HostError;
use crate::pipeline::{Pipeline, PipelineStage, RouteRegistrar};

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    /// Signal graceful shutdown and wait for the server task to finish.
    async fn shutdown(self) -> Result<(), HostError> {
        // A dropped receiver means the task has already exited.
        self.shutdown.send(()).ok();
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HostError::Close(e.to_string())),
            Err(e) => Err(HostError::Close(e.to_string())),
        }
    }
}

struct HostState {
    config: HostConfig,
    pipeline: Option<Pipeline>,
    server: Option<RunningServer>,
}

/// An HTTP service host.
///
/// Configuration changes made through the setters take effect the next time
/// a pipeline is built: on [`Host::initialize`], or on [`Host::start`] when
/// no pipeline is installed.
pub struct Host {
    inner: Mutex<HostState>,
    registrar: Arc<dyn RouteRegistrar>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}

impl Host {
    #[must_use]
    pub fn new(config: HostConfig, registrar: impl RouteRegistrar + 'static) -> Self {
        Self {
            inner: Mutex::new(HostState {
                config,
                pipeline: None,
                server: None,
            }),
            registrar: Arc::new(registrar),
        }
    }

    /// Apply `options` and rebuild the whole pipeline.
    ///
    /// The new pipeline is built before anything changes; if building fails
    /// the host keeps its old configuration, pipeline and socket. A running
    /// host is then stopped, and stays stopped until the next
    /// [`Host::start`].
    ///
    /// # Errors
    /// Returns the pipeline build error, or [`HostError::Close`] if the
    /// running server failed while shutting down. In the latter case the new
    /// pipeline is still installed.
    pub async fn initialize(&self, options: InitializeOptions) -> Result<(), HostError> {
        let mut state = self.inner.lock().await;

        let mut config = state.config.clone();
        options.apply(&mut config);
        let pipeline = Pipeline::build(&config, self.registrar.as_ref())?;

        let closed = match state.server.take() {
            Some(server) => {
                let addr = server.addr;
                let closed = server.shutdown().await;
                info!(addr = %addr, "host stopped for reinitialization");
                closed
            }
            None => Ok(()),
        };

        info!(stages = ?pipeline.stages(), "host initialized");
        state.config = config;
        state.pipeline = Some(pipeline);
        closed
    }

    /// Bind and start serving.
    ///
    /// The port is `port` if given, else the environment's `PORT`, else 80.
    /// Returns `Ok(false)` without binding when already running, and
    /// `Ok(true)` once the socket is accepting connections.
    ///
    /// # Errors
    /// Returns [`HostError::Bind`] if the address cannot be bound; the host
    /// stays stopped. Returns a pipeline build error if no pipeline was
    /// installed and building one fails.
    pub async fn start(&self, port: Option<u16>) -> Result<bool, HostError> {
        let mut state = self.inner.lock().await;
        if state.server.is_some() {
            return Ok(false);
        }

        let env = state.config.env();
        let addr = SocketAddr::new(env.bind_addr, env.resolve_port(port));

        let router = self.installed_router(&mut state)?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HostError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| HostError::Bind { addr, source })?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    signal.await.ok();
                })
                .await
        });

        info!(addr = %local, "host listening");
        state.server = Some(RunningServer {
            addr: local,
            shutdown,
            task,
        });
        Ok(true)
    }

    /// Stop serving and release the socket.
    ///
    /// Returns `Ok(false)` when not running, `Ok(true)` once the server task
    /// has fully finished.
    ///
    /// # Errors
    /// Returns [`HostError::Close`] if the server task failed. The host is
    /// stopped either way.
    pub async fn stop(&self) -> Result<bool, HostError> {
        let mut state = self.inner.lock().await;
        let Some(server) = state.server.take() else {
            return Ok(false);
        };
        let addr = server.addr;
        server.shutdown().await?;
        info!(addr = %addr, "host stopped");
        Ok(true)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.server.is_some()
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.server.as_ref().map(|s| s.addr)
    }

    /// Stages of the installed pipeline, if one has been built.
    pub async fn stages(&self) -> Option<Vec<PipelineStage>> {
        self.inner
            .lock()
            .await
            .pipeline
            .as_ref()
            .map(|p| p.stages().to_vec())
    }

    /// The installed request handler, building a pipeline first if needed.
    ///
    /// # Errors
    /// Returns the pipeline build error.
    pub async fn router(&self) -> Result<Router, HostError> {
        let mut state = self.inner.lock().await;
        self.installed_router(&mut state)
    }

    fn installed_router(&self, state: &mut HostState) -> Result<Router, HostError> {
        let pipeline = match state.pipeline.take() {
            Some(pipeline) => pipeline,
            None => Pipeline::build(&state.config, self.registrar.as_ref())?,
        };
        let router = pipeline.router();
        state.pipeline = Some(pipeline);
        Ok(router)
    }

    /// Snapshot of the current configuration.
    pub async fn config(&self) -> HostConfig {
        self.inner.lock().await.config.clone()
    }

    /// Replace the authorization predicate; `None` allows every request.
    pub async fn set_authorizer(&self, authorizer: Option<Authorizer>) {
        self.update(|config| config.set_authorizer(authorizer)).await;
    }

    /// Set the identity header value; empty disables the header.
    pub async fn set_identity(&self, identity: impl Into<String>) {
        let identity = identity.into();
        self.update(|config| config.set_identity(identity)).await;
    }

    pub async fn set_body_parsing(&self, body_parsing: BodyParsing) {
        self.update(|config| config.set_body_parsing(body_parsing)).await;
    }

    pub async fn set_error_handling(&self, error_handling: ErrorHandling) {
        self.update(|config| config.set_error_handling(error_handling)).await;
    }

    async fn update(&self, change: impl FnOnce(&mut HostConfig)) {
        let mut state = self.inner.lock().await;
        change(&mut state.config);
        // A running server keeps its pipeline until the next initialize.
        if state.server.is_none() {
            state.pipeline = None;
        }
    }
}
