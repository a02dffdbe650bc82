//! Volume REST handlers

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::DaemonError;

use super::super::router::ApiState;

fn volume_json(v: &crate::volume::Volume) -> serde_json::Value {
    json!({
        "Name": v.name,
        "Driver": v.driver,
        "Mountpoint": v.mountpoint,
        "Labels": v.labels,
        "CreatedAt": v.created_at.to_rfc3339(),
        "UsageData": {"RefCount": v.ref_count},
    })
}

pub async fn list(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let volumes: Vec<_> = state.volumes.list().iter().map(volume_json).collect();
    Json(json!({"Volumes": volumes, "Warnings": []}))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

pub async fn create(
    State(state): State<ApiState>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), DaemonError> {
    let name = if request.name.is_empty() {
        // Anonymous volumes get a generated name
        format!("vol-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
    } else {
        request.name
    };

    let volume = state.volumes.create(&name, request.labels)?;
    Ok((StatusCode::CREATED, Json(volume_json(&volume))))
}

pub async fn inspect(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let volume = state.volumes.inspect(&name)?;
    Ok(Json(volume_json(&volume)))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, DaemonError> {
    state.volumes.remove(&name, query.force)?;
    Ok(StatusCode::NO_CONTENT)
}
