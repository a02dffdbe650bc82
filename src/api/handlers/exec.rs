//! Exec and attach REST handlers
//!
//! Exec is two-step like the engine's other streaming surfaces: create
//! parks the operation behind a one-time token, start upgrades to a
//! websocket and bridges the session.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::DaemonError;
use crate::streaming::PendingOp;

use super::super::router::ApiState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreateRequest {
    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub tty: bool,
}

pub async fn create(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ExecCreateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), DaemonError> {
    let c = state.engine.inspect(&id)?;
    if c.state != crate::container::ContainerState::Running {
        return Err(DaemonError::invalid_state(
            "exec_create",
            format!("container is {}", c.state),
        )
        .with_id(c.id));
    }
    if request.cmd.is_empty() {
        return Err(DaemonError::invalid_argument("exec_create", "empty Cmd"));
    }

    let token = state.hub.register(PendingOp::Exec {
        container_id: c.id,
        command: request.cmd,
        env: request.env,
        tty: request.tty,
    });

    Ok((StatusCode::CREATED, Json(json!({"Id": token}))))
}

pub async fn start(
    State(state): State<ApiState>,
    Path(token): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse, DaemonError> {
    let op = state.hub.claim(&token)?;

    let PendingOp::Exec {
        container_id,
        command,
        env,
        tty,
    } = op
    else {
        return Err(DaemonError::invalid_argument(
            "exec_start",
            "token does not reference an exec",
        ));
    };

    Ok(upgrade.on_upgrade(move |socket| async move {
        match state.engine.exec(&container_id, command, env, tty).await {
            Ok(session) => state.hub.serve_exec(socket, session).await,
            Err(e) => tracing::warn!("exec stream setup failed: {}", e),
        }
    }))
}

pub async fn attach(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse, DaemonError> {
    // Validate before upgrading so errors surface as HTTP statuses
    let c = state.engine.inspect(&id)?;
    if c.state != crate::container::ContainerState::Running {
        return Err(DaemonError::invalid_state(
            "attach",
            format!("container is {}", c.state),
        )
        .with_id(c.id));
    }

    Ok(upgrade.on_upgrade(move |socket| async move {
        match state.engine.attach(&c.id).await {
            Ok((output, stdin)) => state.hub.serve_attach(socket, output, stdin).await,
            Err(e) => tracing::warn!("attach stream setup failed: {}", e),
        }
    }))
}
