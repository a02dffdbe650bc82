//! Daemon supervisor
//!
//! Wires the subsystems together at startup, binds the CRI and REST
//! sockets, restores persisted state, and coordinates graceful shutdown.

#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::backend::{ExecutionMode, ProcessBackend, RuntimeBackend};
use crate::config::Configuration;
use crate::container::ContainerEngine;
use crate::cri::{self, CriService};
use crate::events::EventBus;
use crate::image::{HttpFetcher, ImageFetcher, ImageStore};
use crate::platform::Platform;
use crate::sandbox::SandboxManager;
use crate::streaming::StreamingHub;
use crate::vm::{providers, select_provider_kind, VmBackend, VmManager};
use crate::volume::VolumeManager;

/// Process-wide daemon state
pub struct Daemon {
    pub config: Arc<Configuration>,
    pub platform: Arc<Platform>,
    pub events: EventBus,
    pub images: Arc<ImageStore>,
    pub volumes: Arc<VolumeManager>,
    pub engine: Arc<ContainerEngine>,
    pub sandboxes: Arc<SandboxManager>,
    pub hub: Arc<StreamingHub>,
    pub vm: Option<Arc<VmManager>>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub started_at: chrono::DateTime<chrono::Utc>,

    shutdown: CancellationToken,
}

impl Daemon {
    /// Probe the platform, select the execution path, and wire every
    /// subsystem. No sockets are bound yet.
    pub fn bootstrap(config: Configuration) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let platform = Arc::new(Platform::probe());
        let events = EventBus::new();

        info!(
            "host: {} {} ({} cpus), virtualization={}",
            platform.os, platform.arch, platform.cpus, platform.virtualization
        );

        let images = Arc::new(
            ImageStore::open(config.system.images_dir(), events.clone())
                .context("opening image store")?,
        );
        let volumes = Arc::new(
            VolumeManager::open(config.system.volumes_dir(), events.clone())
                .context("opening volume manager")?,
        );

        // Provider selection pins the execution path for this daemon's
        // lifetime
        let provider_kind = select_provider_kind(&platform, &config.vm)
            .map_err(|e| anyhow::anyhow!("provider selection: {}", e))?;

        let (backend, vm): (Arc<dyn RuntimeBackend>, Option<Arc<VmManager>>) =
            match provider_kind {
                Some(kind) => {
                    info!("VM mode with the {} provider", kind);
                    let provider = providers::build_provider(kind, &config.system.state_root);
                    let manager = Arc::new(VmManager::new(
                        provider,
                        (&config.vm).into(),
                        config.system.vm_running_marker(),
                        events.clone(),
                    ));
                    (Arc::new(VmBackend::new(manager.clone())), Some(manager))
                }
                None => {
                    #[cfg(target_os = "linux")]
                    if platform.supports_native() {
                        info!("native Linux execution path");
                        (
                            Arc::new(crate::backend::NativeBackend::new())
                                as Arc<dyn RuntimeBackend>,
                            None,
                        )
                    } else {
                        warn!(
                            "insufficient privilege for kernel isolation; \
                             falling back to plain process execution"
                        );
                        (Arc::new(ProcessBackend::new()) as Arc<dyn RuntimeBackend>, None)
                    }
                    #[cfg(not(target_os = "linux"))]
                    {
                        warn!("no VM provider and no native path; using plain process execution");
                        (Arc::new(ProcessBackend::new()) as Arc<dyn RuntimeBackend>, None)
                    }
                }
            };

        let execution_mode = if vm.is_some() {
            ExecutionMode::Vm
        } else {
            ExecutionMode::Native
        };

        let engine = Arc::new(ContainerEngine::new(
            config.system.containers_dir(),
            images.clone(),
            volumes.clone(),
            backend.clone(),
            events.clone(),
            config.runtime.clone(),
            execution_mode,
        ));

        // Force-removal of an image refuses while a Running container uses
        // it; the probe is weak so store and engine do not keep each other
        // alive
        let engine_probe = Arc::downgrade(&engine);
        images.set_running_probe(Box::new(move |image_id| {
            engine_probe
                .upgrade()
                .map(|engine| engine.has_running_consumer(image_id))
                .unwrap_or(false)
        }));

        let sandboxes = Arc::new(
            SandboxManager::open(
                config.system.sandboxes_dir(),
                backend,
                config.network.clone(),
                events.clone(),
            )
            .context("opening sandbox manager")?,
        );

        let hub = Arc::new(StreamingHub::new(
            config.cri.stream_token_grace,
            config.runtime.stream_buffer,
        ));

        let fetcher: Arc<dyn ImageFetcher> =
            Arc::new(HttpFetcher::new(config.registry.base_url.clone()));

        Ok(Arc::new(Self {
            config,
            platform,
            events,
            images,
            volumes,
            engine,
            sandboxes,
            hub,
            vm,
            fetcher,
            started_at: chrono::Utc::now(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Live-restore: resume VM supervision from the marker file, rehydrate
    /// container and sandbox records, adopt or bury running containers.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        if let Some(vm) = &self.vm {
            if let Err(e) = vm.resume_supervision().await {
                warn!("VM resume failed: {}", e);
            }
        }

        let restored = self.engine.load_state().await?;
        if restored > 0 {
            info!("restored {} container(s) from disk", restored);
        }

        // The lost-window flag gates restart policies; keep the engine's
        // view in sync with the VM manager
        if let Some(vm) = self.vm.clone() {
            let engine = self.engine.clone();
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => {
                            engine.suppress_restarts(vm.in_lost_window());
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Bind the sockets and serve until a shutdown signal arrives
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let api_state = ApiState {
            engine: self.engine.clone(),
            images: self.images.clone(),
            volumes: self.volumes.clone(),
            sandboxes: self.sandboxes.clone(),
            hub: self.hub.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            platform: self.platform.clone(),
            vm: self.vm.clone(),
            fetcher: self.fetcher.clone(),
            started_at: self.started_at,
        };
        let api_router = api::build_router(api_state);

        let cri_service = Arc::new(CriService::new(
            self.engine.clone(),
            self.sandboxes.clone(),
            self.images.clone(),
            self.hub.clone(),
            self.fetcher.clone(),
            format!("unix://{}", self.config.cri.socket.display()),
        ));
        let cri_router = cri::build_router(cri_service);

        #[cfg(unix)]
        {
            // CRI socket
            let cri_listener = bind_unix_socket(&self.config.cri.socket)?;
            info!("CRI service on unix://{}", self.config.cri.socket.display());
            spawn_unix_server(cri_listener, cri_router, self.shutdown.clone());

            // REST socket
            let api_listener = bind_unix_socket(&self.config.api.socket)?;
            info!("REST API on unix://{}", self.config.api.socket.display());
            spawn_unix_server(api_listener, api_router.clone(), self.shutdown.clone());
        }
        #[cfg(not(unix))]
        {
            let _ = cri_router;
            warn!("unix sockets unavailable on this host; configure api.tcp_bind");
        }

        // Optional TCP listener, TLS when configured
        if let Some(bind) = &self.config.api.tcp_bind {
            let addr: std::net::SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid tcp bind address: {}", bind))?;

            let tls = &self.config.api.tls;
            if tls.enabled {
                info!("REST API on https://{}", addr);
                let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    &tls.cert, &tls.key,
                )
                .await
                .context("loading TLS configuration")?;
                let router = api_router.clone();
                tokio::spawn(async move {
                    if let Err(e) = axum_server::bind_rustls(addr, rustls)
                        .serve(router.into_make_service())
                        .await
                    {
                        error!("TLS listener failed: {}", e);
                    }
                });
            } else {
                info!("REST API on http://{} (insecure)", addr);
                let router = api_router.clone();
                tokio::spawn(async move {
                    if let Err(e) = axum_server::bind(addr)
                        .serve(router.into_make_service())
                        .await
                    {
                        error!("TCP listener failed: {}", e);
                    }
                });
            }
        }

        // Block until ctrl-c, then drain
        tokio::signal::ctrl_c()
            .await
            .context("installing signal handler")?;
        warn!("shutdown signal received");
        self.shutdown_gracefully().await;
        Ok(())
    }

    /// Stop accepting, drain streams, stop containers, release sockets.
    /// The VM keeps running: the marker file lets the next daemon resume
    /// supervision without a reboot.
    pub async fn shutdown_gracefully(&self) {
        self.shutdown.cancel();

        info!("stopping containers...");
        self.engine.shutdown().await;

        let _ = std::fs::remove_file(&self.config.cri.socket);
        let _ = std::fs::remove_file(&self.config.api.socket);
        info!("daemon stopped");
    }
}

/// Bind a unix socket, replacing a stale file from a previous run
#[cfg(unix)]
fn bind_unix_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

/// Accept loop serving an axum router over a unix listener
#[cfg(unix)]
fn spawn_unix_server(listener: UnixListener, router: axum::Router, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("unix accept failed: {}", e);
                        continue;
                    }
                },
            };

            let router = router.clone();
            tokio::spawn(async move {
                let socket = hyper_util::rt::TokioIo::new(stream);
                let service = hyper::service::service_fn(
                    move |request: hyper::Request<hyper::body::Incoming>| {
                        tower::ServiceExt::oneshot(router.clone(), request)
                    },
                );

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                    hyper_util::rt::TokioExecutor::new(),
                )
                .serve_connection_with_upgrades(socket, service)
                .await
                {
                    tracing::debug!("connection ended: {}", e);
                }
            });
        }
    });
}
