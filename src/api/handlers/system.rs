//! System, events, and VM control handlers

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::DaemonError;

use super::super::router::ApiState;

pub async fn version(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "Version": env!("CARGO_PKG_VERSION"),
        "ApiVersion": "1.41",
        "Os": state.platform.os.to_string(),
        "Arch": state.platform.arch,
        "KernelVersion": state.platform.os_version,
    }))
}

pub async fn info(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let containers = state.engine.list(true);
    let running = containers
        .iter()
        .filter(|c| c.state == crate::container::ContainerState::Running)
        .count();
    let (image_count, _) = state.images.disk_usage();

    Json(json!({
        "ID": "servin",
        "Name": "servin-daemon",
        "ServerVersion": env!("CARGO_PKG_VERSION"),
        "Containers": containers.len(),
        "ContainersRunning": running,
        "Images": image_count,
        "OperatingSystem": state.platform.os_version,
        "OSType": state.platform.os.to_string(),
        "Architecture": state.platform.arch,
        "NCPU": state.platform.cpus,
        "MemTotal": state.platform.total_memory,
        "ExecutionMode": state.engine.execution_mode().to_string(),
        "SystemTime": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: Option<i64>,
}

/// Persistent newline-delimited JSON event stream
pub async fn events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    // Replay from the journal first, then stay live
    let replay: Vec<Result<Vec<u8>, std::io::Error>> = state
        .events
        .since(query.since.unwrap_or(i64::MAX))
        .iter()
        .map(|record| {
            let mut line = serde_json::to_vec(record).unwrap_or_default();
            line.push(b'\n');
            Ok(line)
        })
        .collect();

    let live = futures_util::StreamExt::filter_map(
        tokio_stream::wrappers::BroadcastStream::new(state.events.subscribe()),
        |record| async move {
            record.ok().map(|r| {
                let mut line = serde_json::to_vec(&r).unwrap_or_default();
                line.push(b'\n');
                Ok::<_, std::io::Error>(line)
            })
        },
    );

    let stream = futures_util::StreamExt::chain(futures_util::stream::iter(replay), live);

    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        axum::body::Body::from_stream(stream),
    )
}

pub async fn disk_usage(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (image_count, image_bytes) = state.images.disk_usage();
    let (volume_count, volume_bytes) = state.volumes.disk_usage();
    let containers = state.engine.list(true);

    Json(json!({
        "LayersSize": image_bytes,
        "Images": [{"Count": image_count, "Size": image_bytes}],
        "Containers": [{"Count": containers.len()}],
        "Volumes": [{"Count": volume_count, "Size": volume_bytes}],
    }))
}

/// Static network surface; the external plugin owns real network state
pub async fn networks(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!([
        {"Name": "bridge", "Driver": "bridge", "Subnet": state.config.network.bridge_subnet},
        {"Name": "host", "Driver": "host"},
        {"Name": "none", "Driver": "null"},
    ]))
}

pub async fn vm_start(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, DaemonError> {
    let Some(vm) = &state.vm else {
        return Err(DaemonError::unavailable("vm_start", "no VM provider selected"));
    };

    let vm_id = vm.ensure_started().await?;
    // A fresh start ends the vm-lost window
    state.engine.suppress_restarts(false);
    Ok(Json(json!({"Id": vm_id, "State": "running"})))
}

pub async fn vm_stop(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, DaemonError> {
    let Some(vm) = &state.vm else {
        return Err(DaemonError::unavailable("vm_stop", "no VM provider selected"));
    };

    vm.stop(true).await?;
    Ok(Json(json!({"State": "stopped"})))
}

pub async fn vm_status(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let Some(vm) = &state.vm else {
        return Ok(Json(json!({"Provider": null, "State": "disabled"})));
    };

    let status = vm.status().await?;
    Ok(Json(json!({
        "Provider": vm.provider().kind().to_string(),
        "State": status.to_string(),
        "LostWindow": vm.in_lost_window(),
    })))
}
