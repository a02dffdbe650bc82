//! Image REST handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::DaemonError;

use super::super::router::ApiState;

pub async fn list(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let images: Vec<_> = state
        .images
        .list()
        .into_iter()
        .map(|i| {
            json!({
                "Id": i.id,
                "RepoTags": i.repo_tags,
                "Created": i.created_at.timestamp(),
                "Size": i.size_bytes,
                "Labels": i.config.labels,
                "Containers": i.ref_count,
            })
        })
        .collect();
    Json(json!(images))
}

#[derive(Debug, Deserialize)]
pub struct LoadQuery {
    /// Reference to tag the uploaded tarball with
    pub name: String,
}

/// Import an uploaded gzip tarball
pub async fn load(
    State(state): State<ApiState>,
    Query(query): Query<LoadQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, DaemonError> {
    if body.is_empty() {
        return Err(DaemonError::invalid_argument("import_image", "empty body"));
    }

    let scratch = std::env::temp_dir().join(format!("servin-load-{}.tar.gz", uuid::Uuid::new_v4()));
    tokio::fs::write(&scratch, &body).await?;

    let result = state.images.import(&scratch, &query.name).await;
    let _ = tokio::fs::remove_file(&scratch).await;

    let image = result?;
    Ok((
        StatusCode::OK,
        Json(json!({"Id": image.id, "RepoTags": image.repo_tags})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    #[serde(rename = "fromImage")]
    pub from_image: String,

    #[serde(default)]
    pub tag: Option<String>,
}

pub async fn pull(
    State(state): State<ApiState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let reference = match &query.tag {
        Some(tag) => format!("{}:{}", query.from_image, tag),
        None => query.from_image.clone(),
    };

    let image = state.images.pull(&reference, state.fetcher.as_ref()).await?;
    Ok(Json(json!({"Id": image.id, "RepoTags": image.repo_tags})))
}

pub async fn inspect(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let i = state.images.inspect(&name)?;
    Ok(Json(json!({
        "Id": i.id,
        "RepoTags": i.repo_tags,
        "Created": i.created_at.to_rfc3339(),
        "Size": i.size_bytes,
        "RootFS": {"Type": "layers", "Layers": i.layers},
        "Config": {
            "Env": i.config.env,
            "Cmd": i.config.cmd,
            "Entrypoint": i.config.entrypoint,
            "WorkingDir": i.config.working_dir,
            "User": i.config.user,
            "ExposedPorts": i.config.exposed_ports,
            "Labels": i.config.labels,
        },
        "Containers": i.ref_count,
    })))
}

/// Export the materialized tree as a gzip tarball
pub async fn export(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, DaemonError> {
    let scratch =
        std::env::temp_dir().join(format!("servin-export-{}.tar.gz", uuid::Uuid::new_v4()));
    state.images.export(&name, &scratch).await?;

    let data = tokio::fs::read(&scratch).await?;
    let _ = tokio::fs::remove_file(&scratch).await;

    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/gzip")],
        data,
    ))
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
) -> Result<Json<serde_json::Value>, DaemonError> {
    state.images.remove(&name, query.force)?;
    Ok(Json(json!([{"Deleted": name}])))
}
