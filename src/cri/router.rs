//! CRI route table
//!
//! One POST route per RPC under the service names kubelet uses, plus the
//! websocket endpoints the streaming URLs point back at.

use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::error::DaemonError;
use crate::streaming::PendingOp;

use super::service::CriService;
use super::types::*;

type Service = Arc<CriService>;

/// Build the CRI router served on the runtime socket
pub fn build_router(service: Service) -> Router {
    Router::new()
        // RuntimeService
        .route("/runtime.v1alpha2.RuntimeService/Version", post(version))
        .route("/runtime.v1alpha2.RuntimeService/Status", post(status))
        .route(
            "/runtime.v1alpha2.RuntimeService/RunPodSandbox",
            post(run_pod_sandbox),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/StopPodSandbox",
            post(stop_pod_sandbox),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/RemovePodSandbox",
            post(remove_pod_sandbox),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/PodSandboxStatus",
            post(pod_sandbox_status),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/ListPodSandbox",
            post(list_pod_sandbox),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/CreateContainer",
            post(create_container),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/StartContainer",
            post(start_container),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/StopContainer",
            post(stop_container),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/RemoveContainer",
            post(remove_container),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/ListContainers",
            post(list_containers),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/ContainerStatus",
            post(container_status),
        )
        .route(
            "/runtime.v1alpha2.RuntimeService/UpdateContainerResources",
            post(update_container_resources),
        )
        .route("/runtime.v1alpha2.RuntimeService/ExecSync", post(exec_sync))
        .route("/runtime.v1alpha2.RuntimeService/Exec", post(exec))
        .route("/runtime.v1alpha2.RuntimeService/Attach", post(attach))
        .route(
            "/runtime.v1alpha2.RuntimeService/PortForward",
            post(port_forward),
        )
        // ImageService
        .route("/runtime.v1alpha2.ImageService/ListImages", post(list_images))
        .route(
            "/runtime.v1alpha2.ImageService/ImageStatus",
            post(image_status),
        )
        .route("/runtime.v1alpha2.ImageService/PullImage", post(pull_image))
        .route(
            "/runtime.v1alpha2.ImageService/RemoveImage",
            post(remove_image),
        )
        .route(
            "/runtime.v1alpha2.ImageService/ImageFsInfo",
            post(image_fs_info),
        )
        // Streaming reconnect endpoints
        .route("/stream/:kind/:token", get(stream))
        .with_state(service)
}

async fn version(
    State(service): State<Service>,
    Json(request): Json<VersionRequest>,
) -> Json<VersionResponse> {
    Json(service.version(request))
}

async fn status(
    State(service): State<Service>,
    Json(request): Json<StatusRequest>,
) -> Json<StatusResponse> {
    Json(service.status(request))
}

async fn run_pod_sandbox(
    State(service): State<Service>,
    Json(request): Json<RunPodSandboxRequest>,
) -> Result<Json<RunPodSandboxResponse>, DaemonError> {
    service.run_pod_sandbox(request).await.map(Json)
}

async fn stop_pod_sandbox(
    State(service): State<Service>,
    Json(request): Json<PodSandboxIdRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.stop_pod_sandbox(request).await.map(Json)
}

async fn remove_pod_sandbox(
    State(service): State<Service>,
    Json(request): Json<PodSandboxIdRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.remove_pod_sandbox(request).await.map(Json)
}

async fn pod_sandbox_status(
    State(service): State<Service>,
    Json(request): Json<PodSandboxIdRequest>,
) -> Result<Json<PodSandboxStatusResponse>, DaemonError> {
    service.pod_sandbox_status(request).map(Json)
}

async fn list_pod_sandbox(
    State(service): State<Service>,
    Json(request): Json<ListPodSandboxRequest>,
) -> Json<ListPodSandboxResponse> {
    Json(service.list_pod_sandbox(request))
}

async fn create_container(
    State(service): State<Service>,
    Json(request): Json<CreateContainerRequest>,
) -> Result<Json<CreateContainerResponse>, DaemonError> {
    service.create_container(request).await.map(Json)
}

async fn start_container(
    State(service): State<Service>,
    Json(request): Json<ContainerIdRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.start_container(request).await.map(Json)
}

async fn stop_container(
    State(service): State<Service>,
    Json(request): Json<StopContainerRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.stop_container(request).await.map(Json)
}

async fn remove_container(
    State(service): State<Service>,
    Json(request): Json<ContainerIdRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.remove_container(request).await.map(Json)
}

async fn list_containers(
    State(service): State<Service>,
    Json(request): Json<ListContainersRequest>,
) -> Json<ListContainersResponse> {
    Json(service.list_containers(request))
}

async fn container_status(
    State(service): State<Service>,
    Json(request): Json<ContainerIdRequest>,
) -> Result<Json<ContainerStatusResponse>, DaemonError> {
    service.container_status(request).map(Json)
}

async fn update_container_resources(
    State(service): State<Service>,
    Json(request): Json<UpdateContainerResourcesRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.update_container_resources(request).await.map(Json)
}

async fn exec_sync(
    State(service): State<Service>,
    Json(request): Json<ExecSyncRequest>,
) -> Result<Json<ExecSyncResponse>, DaemonError> {
    service.exec_sync(request).await.map(Json)
}

async fn exec(
    State(service): State<Service>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<StreamUrlResponse>, DaemonError> {
    service.exec(request).map(Json)
}

async fn attach(
    State(service): State<Service>,
    Json(request): Json<AttachRequest>,
) -> Result<Json<StreamUrlResponse>, DaemonError> {
    service.attach(request).map(Json)
}

async fn port_forward(
    State(service): State<Service>,
    Json(request): Json<PortForwardRequest>,
) -> Result<Json<StreamUrlResponse>, DaemonError> {
    service.port_forward(request).map(Json)
}

async fn list_images(
    State(service): State<Service>,
    Json(request): Json<ListImagesRequest>,
) -> Json<ListImagesResponse> {
    Json(service.list_images(request))
}

async fn image_status(
    State(service): State<Service>,
    Json(request): Json<ImageStatusRequest>,
) -> Json<ImageStatusResponse> {
    Json(service.image_status(request))
}

async fn pull_image(
    State(service): State<Service>,
    Json(request): Json<PullImageRequest>,
) -> Result<Json<PullImageResponse>, DaemonError> {
    service.pull_image(request).await.map(Json)
}

async fn remove_image(
    State(service): State<Service>,
    Json(request): Json<RemoveImageRequest>,
) -> Result<Json<EmptyResponse>, DaemonError> {
    service.remove_image(request).map(Json)
}

async fn image_fs_info(State(service): State<Service>) -> Json<ImageFsInfoResponse> {
    Json(service.image_fs_info())
}

/// Streaming reconnect: the token resolves back to the parked operation
async fn stream(
    State(service): State<Service>,
    Path((kind, token)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse, DaemonError> {
    let op = service.hub.claim(&token)?;

    // The URL kind and the parked op must agree
    let matches = matches!(
        (&op, kind.as_str()),
        (PendingOp::Exec { .. }, "exec")
            | (PendingOp::Attach { .. }, "attach")
            | (PendingOp::PortForward { .. }, "port-forward")
    );
    if !matches {
        return Err(DaemonError::invalid_argument(
            "stream",
            "token does not match endpoint",
        ));
    }

    let service = service.clone();
    Ok(upgrade.on_upgrade(move |socket| async move {
        match op {
            PendingOp::Exec {
                container_id,
                command,
                env,
                tty,
            } => match service.engine.exec(&container_id, command, env, tty).await {
                Ok(session) => service.hub.serve_exec(socket, session).await,
                Err(e) => {
                    tracing::warn!("exec stream setup failed: {}", e);
                }
            },
            PendingOp::Attach { container_id } => {
                match service.engine.attach(&container_id).await {
                    Ok((output, stdin)) => service.hub.serve_attach(socket, output, stdin).await,
                    Err(e) => {
                        tracing::warn!("attach stream setup failed: {}", e);
                    }
                }
            }
            PendingOp::PortForward { port, .. } => {
                service.hub.serve_port_forward(socket, port).await;
            }
        }
    }))
}
