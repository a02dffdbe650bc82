//! Container REST handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::backend::{MountKind, MountSpec, ResourceLimits};
use crate::container::{read_log_tail, ContainerConfig, ContainerState, CreateOptions, RestartPolicy};
use crate::error::DaemonError;

use super::super::router::ApiState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn list(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let containers: Vec<_> = state
        .engine
        .list(query.all)
        .into_iter()
        .map(|c| {
            json!({
                "Id": c.id,
                "Names": c.names.iter().map(|n| format!("/{}", n)).collect::<Vec<_>>(),
                "Image": c.image_name,
                "ImageID": c.image_ref,
                "Command": c.command.join(" "),
                "Created": c.created_at.timestamp(),
                "State": c.state.to_string(),
                "Status": c.status_line(),
                "Labels": c.config.labels,
            })
        })
        .collect();
    Json(json!(containers))
}

/// Docker-shaped create request (the consumed subset)
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    pub image: String,

    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub entrypoint: Vec<String>,

    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub tty: bool,

    #[serde(default)]
    pub open_stdin: bool,

    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,

    #[serde(default)]
    pub stop_signal: Option<String>,

    #[serde(default)]
    pub stop_timeout: Option<u64>,

    #[serde(default)]
    pub host_config: Option<HostConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// "src:dst[:ro]" bind specs or "volume:dst"
    #[serde(default)]
    pub binds: Vec<String>,

    #[serde(default)]
    pub memory: u64,

    #[serde(default)]
    pub cpu_shares: u64,

    #[serde(default)]
    pub cpu_quota: i64,

    #[serde(default)]
    pub cpu_period: i64,

    #[serde(default)]
    pub pids_limit: i64,

    #[serde(default)]
    pub blkio_weight: u16,

    #[serde(default)]
    pub network_mode: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub cap_add: Vec<String>,

    #[serde(default)]
    pub dns: Vec<String>,

    #[serde(default)]
    pub restart_policy: Option<RestartPolicySpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicySpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub maximum_retry_count: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateQuery {
    #[serde(default)]
    pub name: Option<String>,
}

fn parse_bind(bind: &str) -> Result<MountSpec, DaemonError> {
    let parts: Vec<&str> = bind.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(DaemonError::invalid_argument(
            "create_container",
            format!("unparseable bind: {}", bind),
        ));
    }

    let readonly = parts.get(2).map(|o| o.contains("ro")).unwrap_or(false);
    // Absolute sources are host binds; anything else names a volume
    let kind = if parts[0].starts_with('/') {
        MountKind::Bind
    } else {
        MountKind::Volume
    };

    Ok(MountSpec {
        source: parts[0].to_string(),
        target: parts[1].to_string(),
        kind,
        readonly,
        propagation: None,
        tmpfs_size: None,
    })
}

pub async fn create(
    State(state): State<ApiState>,
    Query(query): Query<CreateQuery>,
    Json(request): Json<CreateRequest>,
) -> Result<impl IntoResponse, DaemonError> {
    let host = request.host_config.unwrap_or_default();

    let restart_policy = match &host.restart_policy {
        Some(spec) if !spec.name.is_empty() => {
            if spec.name == "on-failure" && spec.maximum_retry_count > 0 {
                RestartPolicy::OnFailure {
                    max: spec.maximum_retry_count,
                }
            } else {
                RestartPolicy::parse(&spec.name)?
            }
        }
        _ => RestartPolicy::No,
    };

    let mounts = host
        .binds
        .iter()
        .map(|b| parse_bind(b))
        .collect::<Result<Vec<_>, _>>()?;

    let options = CreateOptions {
        name: query.name,
        image: request.image,
        config: ContainerConfig {
            entrypoint: request.entrypoint,
            cmd: request.cmd,
            env: request.env,
            working_dir: request.working_dir,
            user: request.user,
            tty: request.tty,
            stdin_open: request.open_stdin,
            hostname: request.hostname,
            dns: host.dns,
            labels: request.labels,
            restart_policy,
            resources: ResourceLimits {
                memory_bytes: host.memory,
                cpu_shares: host.cpu_shares,
                cpu_quota: host.cpu_quota,
                cpu_period: host.cpu_period,
                pids_limit: host.pids_limit,
                blkio_weight: host.blkio_weight,
            },
            stop_signal: request.stop_signal,
            stop_timeout: request.stop_timeout,
            privileged: host.privileged,
            capabilities: host.cap_add,
            ..Default::default()
        },
        mounts,
        network: crate::container::ContainerNetwork {
            mode: host.network_mode.unwrap_or_default(),
            ..Default::default()
        },
        ..Default::default()
    };

    let record = state.engine.create(options).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"Id": record.id, "Warnings": []})),
    ))
}

pub async fn inspect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let c = state.engine.inspect(&id)?;

    Ok(Json(json!({
        "Id": c.id,
        "Name": c.names.first().map(|n| format!("/{}", n)).unwrap_or_default(),
        "Created": c.created_at.to_rfc3339(),
        "Image": c.image_ref,
        "Path": c.command.first().cloned().unwrap_or_default(),
        "Args": c.command.get(1..).unwrap_or_default(),
        "State": {
            "Status": c.state.to_string(),
            "Running": c.state == ContainerState::Running,
            "Paused": c.state == ContainerState::Paused,
            "Dead": c.dead,
            "Pid": c.pid.unwrap_or(0),
            "ExitCode": c.exit_code.unwrap_or(0),
            "OOMKilled": c.oom_killed,
            "StartedAt": c.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            "FinishedAt": c.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            "Health": format!("{:?}", c.health_status).to_lowercase(),
            "Reason": c.reason.unwrap_or_default(),
        },
        "Config": {
            "Image": c.image_name,
            "Cmd": c.command,
            "Env": c.config.env,
            "WorkingDir": c.config.working_dir.unwrap_or_default(),
            "User": c.config.user.unwrap_or_default(),
            "Tty": c.config.tty,
            "OpenStdin": c.config.stdin_open,
            "Labels": c.config.labels,
            "Hostname": c.config.hostname.unwrap_or_default(),
        },
        "HostConfig": {
            "NetworkMode": c.network.mode,
            "Memory": c.config.resources.memory_bytes,
            "CpuShares": c.config.resources.cpu_shares,
            "PidsLimit": c.config.resources.pids_limit,
        },
        "Mounts": c.mounts.iter().map(|m| json!({
            "Source": m.source,
            "Destination": m.target,
            "RW": !m.readonly,
        })).collect::<Vec<_>>(),
        "LogPath": c.log_path,
        "SandboxID": c.sandbox_id,
        "ExecutionMode": c.execution_mode.to_string(),
        "RestartCount": c.restart_count,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    #[serde(default)]
    pub t: Option<u64>,
}

pub async fn start(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    state.engine.start(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, DaemonError> {
    state.engine.stop(&id, query.t).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restart(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, DaemonError> {
    match state.engine.stop(&id, query.t).await {
        Ok(()) => {}
        Err(e) if e.kind == crate::error::ErrorKind::InvalidState => {}
        Err(e) => return Err(e),
    }
    state.engine.start(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct KillQuery {
    #[serde(default)]
    pub signal: Option<String>,
}

pub async fn kill(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<StatusCode, DaemonError> {
    state.engine.kill(&id, query.signal.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    state.engine.pause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpause(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    state.engine.unpause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RenameQuery {
    pub name: String,
}

pub async fn rename(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<RenameQuery>,
) -> Result<StatusCode, DaemonError> {
    state.engine.rename(&id, &query.name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn wait(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let exit_code = state.engine.wait(&id).await?;
    Ok(Json(json!({"StatusCode": exit_code})))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, DaemonError> {
    state.engine.remove(&id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<usize>,

    #[serde(default)]
    pub follow: bool,
}

pub async fn logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, DaemonError> {
    let c = state.engine.inspect(&id)?;
    let records = read_log_tail(&c.log_path, query.tail)?;

    if !query.follow {
        let body: String = records
            .iter()
            .map(|r| serde_json::to_string(r).unwrap_or_default() + "\n")
            .collect();
        return Ok((
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response());
    }

    // Follow: replay the tail, then stream live records as NDJSON lines
    let live = state.engine.follow_logs(&id)?;
    let replay: Vec<Result<Vec<u8>, std::io::Error>> = records
        .iter()
        .map(|r| {
            let mut line = serde_json::to_vec(r).unwrap_or_default();
            line.push(b'\n');
            Ok(line)
        })
        .collect();

    let live_stream = futures_util::StreamExt::filter_map(
        tokio_stream::wrappers::BroadcastStream::new(live),
        |record| async move {
            record.ok().map(|r| {
                let mut line = serde_json::to_vec(&r).unwrap_or_default();
                line.push(b'\n');
                Ok(line)
            })
        },
    );
    let stream = futures_util::StreamExt::chain(futures_util::stream::iter(replay), live_stream);

    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        axum::body::Body::from_stream(stream),
    )
        .into_response())
}

pub async fn stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, DaemonError> {
    let stats = state.engine.stats(&id).await?;
    Ok(Json(json!({
        "memory_stats": {
            "usage": stats.memory_bytes,
            "limit": stats.memory_limit_bytes,
        },
        "cpu_stats": {
            "cpu_usage": {"total_usage": stats.cpu_nanos},
        },
        "pids_stats": {"current": stats.pids},
    })))
}
