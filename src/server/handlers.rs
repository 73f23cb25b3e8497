use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::deploy::{
    DeployError, DeployTarget, ServiceSpec, TargetError, ClusterRecord,
};
use crate::fleet::join::JoinError;
use crate::fleet::node::{HeartbeatPayload, JoinRequestInfo, NodeRole, NodeState};
use crate::fleet::registry::{FleetNodeCounts, RegistryError};
use crate::provider::template::{Provider, ProviderError};
use crate::provider::wiring::WiringError;
use crate::server::state::AppState;

/// API failure carrying the core's stable error code
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

/// HTTP status for a stable error code
fn status_for(code: &str) -> StatusCode {
    match code {
        "TOKEN_EXPIRED" | "TOKEN_INVALID" => StatusCode::UNAUTHORIZED,
        "TOKEN_ALREADY_USED" | "NODE_EXISTS" | "NODE_RETIRED" | "INSTANCE_EXISTS"
        | "TARGET_OFFLINE" | "INVALID_TRANSITION" => StatusCode::CONFLICT,
        c if c.ends_with("_NOT_FOUND") => StatusCode::NOT_FOUND,
        "INVALID_TARGET_ID" | "INVALID_PORT_SPEC" | "CAPABILITY_MISMATCH" => {
            StatusCode::BAD_REQUEST
        }
        "UNRESOLVED_DEPENDENCY" | "NO_WIRING_CONFIGURED" | "PROVIDER_NOT_CONFIGURED" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "DEPLOYMENT_FAILED" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<JoinError> for ApiError {
    fn from(e: JoinError) -> Self {
        ApiError::new(status_for(e.code()), e.code(), e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::new(status_for(e.code()), e.code(), e.to_string())
    }
}

impl From<TargetError> for ApiError {
    fn from(e: TargetError) -> Self {
        ApiError::new(status_for(e.code()), e.code(), e.to_string())
    }
}

impl From<WiringError> for ApiError {
    fn from(e: WiringError) -> Self {
        ApiError::new(status_for(e.code()), e.code(), e.to_string())
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError::new(status_for(e.code()), e.code(), e.to_string())
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        ApiError::new(status_for(e.code()), e.code(), e.to_string())
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct FleetStatus {
    fleet_nodes: FleetNodeCounts,
    deployments: crate::deploy::DeploymentCounts,
    tokens_issued: usize,
    providers_registered: usize,
}

/// Fleet-wide summary endpoint
pub async fn fleet_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(FleetStatus {
        fleet_nodes: state.nodes.state_counts(),
        deployments: state.deployments.counts(),
        tokens_issued: state.issuer.list_tokens().len(),
        providers_registered: state.providers.len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    #[serde(default)]
    pub role: Option<NodeRole>,
    /// Lifetime override in seconds
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

pub async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<IssueTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issued = match request.ttl_secs {
        Some(secs) => state
            .issuer
            .issue_with_ttl(request.role, chrono::Duration::seconds(secs))?,
        None => state.issuer.issue(request.role)?,
    };
    Ok((StatusCode::CREATED, Json(issued)))
}

/// Token audit listing; bearer values are never stored or returned
pub async fn list_tokens(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.issuer.list_tokens())
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub token: String,
    #[serde(flatten)]
    pub node: JoinRequestInfo,
}

pub async fn redeem_token(
    State(state): State<AppState>,
    Json(request): Json<RedeemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state.issuer.redeem(&request.token, request.node)?;
    Ok((StatusCode::CREATED, Json(node)))
}

#[derive(Debug, Deserialize)]
pub struct NodeFilter {
    pub capability: Option<String>,
    pub status: Option<String>,
}

fn parse_state(s: &str) -> Result<NodeState, ApiError> {
    match s {
        "online" => Ok(NodeState::Online),
        "offline" => Ok(NodeState::Offline),
        "unknown" => Ok(NodeState::Unknown),
        "retired" => Ok(NodeState::Retired),
        other => Err(ApiError::bad_request(
            "INVALID_STATUS",
            format!("unknown node status '{}'", other),
        )),
    }
}

pub async fn list_nodes(
    State(state): State<AppState>,
    Query(filter): Query<NodeFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let mut views = match &filter.capability {
        Some(capability) => state.nodes.list_by_capability(capability),
        None => state.nodes.list(),
    };
    if let Some(status) = &filter.status {
        let wanted = parse_state(status)?;
        views.retain(|v| v.state == wanted);
    }
    Ok(Json(views))
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .nodes
        .view(&id)
        .map(Json)
        .ok_or_else(|| ApiError::from(RegistryError::NodeNotFound(id)))
}

pub async fn node_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<impl IntoResponse, ApiError> {
    state.nodes.record_heartbeat(&id, payload)?;
    state
        .nodes
        .view(&id)
        .map(Json)
        .ok_or_else(|| ApiError::from(RegistryError::NodeNotFound(id)))
}

pub async fn retire_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.nodes.retire(&id)?;
    state
        .nodes
        .view(&id)
        .map(Json)
        .ok_or_else(|| ApiError::from(RegistryError::NodeNotFound(id)))
}

#[derive(Debug, Deserialize)]
pub struct RegisterClusterRequest {
    pub id: String,
    pub api_url: String,
}

pub async fn register_cluster(
    State(state): State<AppState>,
    Json(request): Json<RegisterClusterRequest>,
) -> impl IntoResponse {
    let record = ClusterRecord::new(request.id, request.api_url);
    state.clusters.register(record.clone());
    (StatusCode::CREATED, Json(record))
}

pub async fn list_clusters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.clusters.list())
}

pub async fn register_provider(
    State(state): State<AppState>,
    Json(provider): Json<Provider>,
) -> impl IntoResponse {
    state.providers.register_provider(provider.clone());
    (StatusCode::CREATED, Json(provider))
}

#[derive(Debug, Deserialize)]
pub struct ProviderFilter {
    pub capability: Option<String>,
}

pub async fn list_providers(
    State(state): State<AppState>,
    Query(filter): Query<ProviderFilter>,
) -> impl IntoResponse {
    match filter.capability {
        Some(capability) => Json(state.providers.providers_for_capability(&capability)),
        None => Json(state.providers.list_providers()),
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterInstanceRequest {
    pub instance_id: String,
    pub provider: String,
}

pub async fn register_instance(
    State(state): State<AppState>,
    Json(request): Json<RegisterInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .providers
        .register_instance(request.instance_id, &request.provider)?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Debug, Deserialize)]
pub struct CreateWiringRequest {
    pub source_instance_id: String,
    pub source_capability: String,
    pub target_instance_id: String,
    pub target_capability: String,
}

pub async fn create_wiring(
    State(state): State<AppState>,
    Json(request): Json<CreateWiringRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let wiring = state.wirings.create_wiring(
        &request.source_instance_id,
        &request.source_capability,
        &request.target_instance_id,
        &request.target_capability,
    )?;
    Ok((StatusCode::CREATED, Json(wiring)))
}

pub async fn delete_wiring(
    State(state): State<AppState>,
    Path((source, capability)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .wirings
        .delete_wiring(&source, &capability)
        .map(Json)
        .ok_or_else(|| {
            ApiError::from(WiringError::NoWiringConfigured {
                instance: source,
                capability,
            })
        })
}

pub async fn list_instance_wirings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.wirings.list_for_instance(&id))
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub service: ServiceSpec,
    pub target_id: String,
}

pub async fn deploy_service(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .deployments
        .deploy(&request.service, &request.target_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn list_deployments(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.deployments.list())
}

/// Current record; finalizes an in-flight deployment against the backend
pub async fn get_deployment(
    State(state): State<AppState>,
    Path((target_id, service_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.deployments.reconcile(&service_id, &target_id).await?;
    Ok(Json(deployment))
}

pub async fn stop_deployment(
    State(state): State<AppState>,
    Path((target_id, service_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.deployments.stop(&service_id, &target_id).await?;
    Ok(Json(deployment))
}

#[derive(Debug, Deserialize, Default)]
pub struct RestartRequest {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

pub async fn restart_deployment(
    State(state): State<AppState>,
    Path((target_id, service_id)): Path<(String, String)>,
    Json(request): Json<RestartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .deployments
        .restart(&service_id, &target_id, request.replicas)
        .await?;
    Ok(Json(deployment))
}

pub async fn remove_deployment(
    State(state): State<AppState>,
    Path((target_id, service_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.deployments.remove(&service_id, &target_id).await?;
    Ok(Json(deployment))
}

#[derive(Serialize)]
struct TargetView {
    id: String,
    kind: &'static str,
    status: crate::deploy::TargetStatus,
}

pub async fn target_status(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let target = DeployTarget::from_id(&target_id, &state.nodes, &state.clusters)?;
    Ok(Json(TargetView {
        id: target.id.to_string(),
        kind: target.kind().as_str(),
        status: target.status(),
    }))
}

pub async fn target_workloads(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workloads = state.deployments.list_workloads(&target_id).await?;
    Ok(Json(workloads))
}

pub async fn certificate_status(
    State(state): State<AppState>,
    Path((target_id, domain)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .deployments
        .certificate_status(&target_id, &domain)
        .await?;
    match status {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::not_found(
            "CERTIFICATE_NOT_FOUND",
            format!("no certificate for '{}'", domain),
        )),
    }
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(fleet_status))
        .route("/v1/join/tokens", post(issue_token).get(list_tokens))
        .route("/v1/join/redeem", post(redeem_token))
        .route("/v1/nodes", get(list_nodes))
        .route("/v1/nodes/{id}", get(get_node))
        .route("/v1/nodes/{id}/heartbeat", post(node_heartbeat))
        .route("/v1/nodes/{id}/retire", post(retire_node))
        .route("/v1/clusters", post(register_cluster).get(list_clusters))
        .route("/v1/providers", post(register_provider).get(list_providers))
        .route("/v1/instances", post(register_instance))
        .route("/v1/instances/{id}/wirings", get(list_instance_wirings))
        .route("/v1/wirings", put(create_wiring))
        .route("/v1/wirings/{source}/{capability}", delete(delete_wiring))
        .route("/v1/deployments", post(deploy_service).get(list_deployments))
        .route("/v1/targets/{target_id}", get(target_status))
        .route("/v1/targets/{target_id}/workloads", get(target_workloads))
        .route(
            "/v1/targets/{target_id}/services/{service_id}",
            get(get_deployment).delete(remove_deployment),
        )
        .route(
            "/v1/targets/{target_id}/services/{service_id}/stop",
            post(stop_deployment),
        )
        .route(
            "/v1/targets/{target_id}/services/{service_id}/restart",
            post(restart_deployment),
        )
        .route(
            "/v1/targets/{target_id}/certificates/{domain}",
            get(certificate_status),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
