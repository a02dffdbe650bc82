//! REST route table

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Configuration;
use crate::container::ContainerEngine;
use crate::events::EventBus;
use crate::image::{ImageFetcher, ImageStore};
use crate::platform::Platform;
use crate::sandbox::SandboxManager;
use crate::streaming::StreamingHub;
use crate::vm::VmManager;
use crate::volume::VolumeManager;

use super::handlers;
use super::middleware::require_auth;

/// Application state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ContainerEngine>,
    pub images: Arc<ImageStore>,
    pub volumes: Arc<VolumeManager>,
    pub sandboxes: Arc<SandboxManager>,
    pub hub: Arc<StreamingHub>,
    pub events: EventBus,
    pub config: Arc<Configuration>,
    pub platform: Arc<Platform>,
    pub vm: Option<Arc<VmManager>>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Build the REST router
pub fn build_router(state: ApiState) -> Router {
    let routes = Router::new()
        // System
        .route("/version", get(handlers::system::version))
        .route("/info", get(handlers::system::info))
        .route("/events", get(handlers::system::events))
        .route("/system/df", get(handlers::system::disk_usage))
        // Containers
        .route("/containers/json", get(handlers::containers::list))
        .route("/containers/create", post(handlers::containers::create))
        .route("/containers/:id/json", get(handlers::containers::inspect))
        .route("/containers/:id/start", post(handlers::containers::start))
        .route("/containers/:id/stop", post(handlers::containers::stop))
        .route("/containers/:id/restart", post(handlers::containers::restart))
        .route("/containers/:id/kill", post(handlers::containers::kill))
        .route("/containers/:id/pause", post(handlers::containers::pause))
        .route("/containers/:id/unpause", post(handlers::containers::unpause))
        .route("/containers/:id/rename", post(handlers::containers::rename))
        .route("/containers/:id/wait", post(handlers::containers::wait))
        .route("/containers/:id/logs", get(handlers::containers::logs))
        .route("/containers/:id/stats", get(handlers::containers::stats))
        .route("/containers/:id", delete(handlers::containers::remove))
        // Exec
        .route("/containers/:id/exec", post(handlers::exec::create))
        .route("/exec/:token/start", get(handlers::exec::start))
        .route("/containers/:id/attach/ws", get(handlers::exec::attach))
        // Images
        .route("/images/json", get(handlers::images::list))
        .route("/images/load", post(handlers::images::load))
        .route("/images/create", post(handlers::images::pull))
        .route("/images/:name/json", get(handlers::images::inspect))
        .route("/images/:name/get", get(handlers::images::export))
        .route("/images/:name", delete(handlers::images::remove))
        // Volumes
        .route("/volumes", get(handlers::volumes::list))
        .route("/volumes/create", post(handlers::volumes::create))
        .route("/volumes/:name", get(handlers::volumes::inspect))
        .route("/volumes/:name", delete(handlers::volumes::remove))
        // Networks (static contract surface; the plugin owns real networks)
        .route("/networks", get(handlers::system::networks))
        // VM control
        .route("/vm/start", post(handlers::system::vm_start))
        .route("/vm/stop", post(handlers::system::vm_stop))
        .route("/vm/status", get(handlers::system::vm_status));

    routes
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
