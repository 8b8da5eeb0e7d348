//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use kubedevice_coordinator::{Coordinator, LaunchDescriptor, NodeSummary};
use kubedevice_core::{ApiConfig, ContainerInfo, ContainerKind, DeviceError, NodeInfo, PodInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

type ApiError = (StatusCode, String);

/// Create the API router
pub fn create_router(coordinator: Arc<Coordinator>, config: &ApiConfig) -> Router {
    let state = Arc::new(AppState { coordinator });

    let router = Router::new()
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/:name", get(get_node).delete(remove_node))
        .route("/api/v1/nodes/:name/refresh", post(refresh_node))
        .route("/api/v1/allocate", post(allocate))
        .route("/api/v1/release", post(release))
        .route("/api/v1/plugins", get(list_plugins))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Map a coordinator error to a status code
fn error_response(e: DeviceError) -> ApiError {
    let status = match e {
        DeviceError::NodeNotFound(_) | DeviceError::PluginNotFound(_) => StatusCode::NOT_FOUND,
        DeviceError::InsufficientResources(_) | DeviceError::Conflict(_) => StatusCode::CONFLICT,
        DeviceError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// List all nodes
async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeSummary>> {
    Json(state.coordinator.list_nodes().await)
}

/// Get a specific node
async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<NodeSummary>, ApiError> {
    let summary = state
        .coordinator
        .node_summary(&name)
        .await
        .map_err(error_response)?;
    Ok(Json(summary))
}

/// Re-read every plugin's report for a node
async fn refresh_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<NodeInfo>, ApiError> {
    let node = state
        .coordinator
        .refresh_node(&name)
        .await
        .map_err(error_response)?;
    Ok(Json(node))
}

/// Remove a node
async fn remove_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<NodeInfo>, ApiError> {
    info!(node = %name, "Removing node");

    let node = state
        .coordinator
        .remove_node(&name)
        .await
        .map_err(error_response)?;
    Ok(Json(node))
}

/// Names one container of a pod
#[derive(Debug, Deserialize)]
pub struct ContainerRequest {
    pub pod: PodInfo,
    /// Container name, running or init
    pub container: String,
}

/// Result of an allocation
#[derive(Debug, Serialize)]
pub struct AllocateResponse {
    /// Pod with the container's allocation recorded
    pub pod: PodInfo,
    pub container: ContainerInfo,
    pub launch: LaunchDescriptor,
}

/// Result of a release
#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub pod: PodInfo,
    pub container: ContainerInfo,
}

/// Pod with the named container taken out, plus the container itself
struct Split {
    pod: PodInfo,
    name: String,
    kind: ContainerKind,
    container: ContainerInfo,
}

impl Split {
    /// Put the container back and return the pod
    fn rejoin(self) -> (PodInfo, ContainerInfo) {
        let mut pod = self.pod;
        pod.insert_container(self.kind, self.name, self.container.clone());
        (pod, self.container)
    }
}

fn split_container(req: ContainerRequest) -> Result<Split, ApiError> {
    let mut pod = req.pod;
    let (kind, container) = pod.take_container(&req.container).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("container {} not found in pod {}", req.container, pod.name),
        )
    })?;
    Ok(Split {
        pod,
        name: req.container,
        kind,
        container,
    })
}

/// Allocate devices for a container
async fn allocate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContainerRequest>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let mut split = split_container(req)?;
    info!(
        pod = %split.pod.name,
        node = %split.pod.node_name,
        container = %split.name,
        "Allocating devices"
    );

    let launch = state
        .coordinator
        .allocate(&split.pod, &split.name, &mut split.container)
        .await
        .map_err(error_response)?;

    let (pod, container) = split.rejoin();
    Ok(Json(AllocateResponse {
        pod,
        container,
        launch,
    }))
}

/// Release a container's devices
async fn release(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContainerRequest>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let mut split = split_container(req)?;
    info!(pod = %split.pod.name, container = %split.name, "Releasing devices");

    state
        .coordinator
        .release(&split.pod, &split.name, &mut split.container)
        .await
        .map_err(error_response)?;

    let (pod, container) = split.rejoin();
    Ok(Json(ReleaseResponse { pod, container }))
}

/// Registered device kinds
async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.coordinator.plugin_kinds())
}
