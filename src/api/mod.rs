//! Admin control surface and agent WebSocket endpoint
//!
//! A thin axum layer over the core components. Admin routes are
//! authenticated by API key and pass two rate-limit gates: a coarse
//! per-process governor quota, then the per-caller token buckets on
//! the `http` channel. The `/ws` route skips both and authenticates
//! inside the `identify` handshake instead.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::auth::{auth_middleware, AuthState};
use crate::config::{ApiConfig, Config, TierLimits};
use crate::fsm::{FsmStatus, FsmTransition, HubFsm};
use crate::lifecycle::AgentLifecycle;
use crate::models::{
    AgentSnapshot, HubState, Priority, QueueStats, SubmitTaskParams, Task, TaskFilter,
};
use crate::queue::TaskQueue;
use crate::ratelimit::{RateChannel, RateDecision, RateLimiter, RateTier};
use crate::session::{serve_socket, SessionContext};
use crate::validation::IngressValidator;
use crate::{HubError, Result};

const SERVICE_NAME: &str = "agentcom";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_WS: &str = "/ws";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_RECLAIM: &str = "/tasks/{task_id}/reclaim";
const ROUTE_DEAD_LETTER: &str = "/dead-letter";
const ROUTE_DEAD_LETTER_RETRY: &str = "/dead-letter/{task_id}/retry";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_STATS: &str = "/stats";
const ROUTE_RATE_OVERRIDE: &str = "/rate-limits/{agent_id}/override";
const ROUTE_RATE_EXEMPT: &str = "/rate-limits/{agent_id}/exempt";
const ROUTE_FSM: &str = "/fsm";
const ROUTE_FSM_HISTORY: &str = "/fsm/history";
const ROUTE_FSM_TRANSITION: &str = "/fsm/transition";
const ROUTE_FSM_PAUSE: &str = "/fsm/pause";
const ROUTE_FSM_RESUME: &str = "/fsm/resume";

/// Shared state behind every handler.
pub struct ApiState {
    queue: TaskQueue,
    lifecycle: AgentLifecycle,
    limiter: RateLimiter,
    fsm: HubFsm,
    validator: IngressValidator,
    session_ctx: SessionContext,
    started: std::time::Instant,
    /// Coarse per-process quota ahead of the per-caller buckets.
    edge_limiter: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    auth: Arc<AuthState>,
    state: Arc<ApiState>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub needed_capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub complete_by: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue: QueueStats,
    pub agents_by_state: HashMap<String, usize>,
    pub fsm: FsmStatus,
}

#[derive(Debug, Deserialize)]
pub struct RateOverrideRequest {
    pub tier: String,
    pub capacity: u64,
    pub refill_per_min: u64,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub target_state: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReclaimRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

fn error_response(err: HubError) -> Response {
    let status = match &err {
        HubError::InvalidArgs(_) => StatusCode::BAD_REQUEST,
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::WrongState { .. }
        | HubError::StaleGeneration { .. }
        | HubError::BudgetExhausted { .. } => StatusCode::CONFLICT,
        HubError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        HubError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        HubError::Unauthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

impl ApiServer {
    pub fn new(
        config: &Config,
        queue: TaskQueue,
        lifecycle: AgentLifecycle,
        limiter: RateLimiter,
        fsm: HubFsm,
        session_ctx: SessionContext,
    ) -> Result<Self> {
        let validator = IngressValidator::new()?;
        let quota = Quota::per_minute(
            NonZeroU32::new(config.api.admin_requests_per_minute.max(1))
                .expect("nonzero admin quota"),
        );
        Ok(Self {
            config: config.api.clone(),
            auth: Arc::new(AuthState {
                config: config.auth.clone(),
            }),
            state: Arc::new(ApiState {
                queue,
                lifecycle,
                limiter,
                fsm,
                validator,
                session_ctx,
                started: std::time::Instant::now(),
                edge_limiter: GovernorLimiter::direct(quota),
            }),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| HubError::Internal(e.into()))?;

        info!(
            "admin API listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| HubError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
                axum::http::HeaderName::from_static("x-admin-id"),
            ]);

        let admin_routes = Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_RECLAIM, post(reclaim_task))
            .route(ROUTE_DEAD_LETTER, get(list_dead_letter))
            .route(ROUTE_DEAD_LETTER_RETRY, post(retry_dead_letter))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_STATS, get(stats))
            .route(ROUTE_RATE_OVERRIDE, post(set_rate_override))
            .route(ROUTE_RATE_EXEMPT, post(add_exempt))
            .route(ROUTE_FSM, get(fsm_state))
            .route(ROUTE_FSM_HISTORY, get(fsm_history))
            .route(ROUTE_FSM_TRANSITION, post(fsm_transition))
            .route(ROUTE_FSM_PAUSE, post(fsm_pause))
            .route(ROUTE_FSM_RESUME, post(fsm_resume))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        self.auth.clone(),
                        auth_middleware,
                    ))
                    .layer(middleware::from_fn_with_state(
                        self.state.clone(),
                        admin_rate_limit_middleware,
                    )),
            );

        Router::new()
            .route(ROUTE_WS, get(ws_upgrade))
            .merge(admin_routes)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .layer(cors_layer)
            .with_state(self.state.clone())
    }
}

/// Admin rate limiting: governor edge quota first, then the caller's
/// own buckets on the http channel. Reads are light, writes normal.
async fn admin_rate_limit_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.edge_limiter.check().is_err() {
        warn!("admin edge quota exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limited", "retry_after_ms": 1000})),
        )
            .into_response();
    }

    let caller = request
        .headers()
        .get("x-admin-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("admin")
        .to_string();
    let tier = if request.method() == axum::http::Method::GET {
        RateTier::Light
    } else {
        RateTier::Normal
    };

    if let RateDecision::Deny { retry_after_ms } =
        state.limiter.check(&caller, RateChannel::Http, tier, 1)
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limited", "retry_after_ms": retry_after_ms})),
        )
            .into_response();
    }

    next.run(request).await
}

async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> Response {
    let ctx = state.session_ctx.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, ctx))
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    let priority = match request.priority.map(Priority::try_from).transpose() {
        Ok(priority) => priority,
        Err(e) => return error_response(HubError::InvalidArgs(e)),
    };
    let params = SubmitTaskParams {
        description: request.description,
        priority,
        needed_capabilities: request.needed_capabilities.into_iter().collect(),
        metadata: request.metadata,
        complete_by: request.complete_by,
        max_retries: request.max_retries,
    };

    if let Err(e) = state.validator.validate_submit(&params) {
        return error_response(e);
    }
    match state.queue.submit(params).await {
        Ok(task_id) => (
            StatusCode::CREATED,
            Json(CreateTaskResponse {
                task_id,
                status: "queued".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<TaskFilter>,
) -> Json<Vec<Task>> {
    Json(state.queue.list(filter).await)
}

async fn get_task(State(state): State<Arc<ApiState>>, Path(task_id): Path<String>) -> Response {
    match state.queue.get(&task_id).await {
        Some(task) => Json(task).into_response(),
        None => error_response(HubError::NotFound(format!("task {task_id}"))),
    }
}

async fn reclaim_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    Json(request): Json<ReclaimRequest>,
) -> Response {
    let reason = request.reason.unwrap_or_else(|| "operator".to_string());
    match state.queue.reclaim(&task_id, &reason).await {
        Ok(()) => Json(json!({"task_id": task_id, "status": "queued"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_dead_letter(State(state): State<Arc<ApiState>>) -> Json<Vec<Task>> {
    Json(state.queue.list_dead_letter().await)
}

async fn retry_dead_letter(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.queue.retry_dead_letter(&task_id).await {
        Ok(()) => Json(json!({"task_id": task_id, "status": "queued"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_agents(State(state): State<Arc<ApiState>>) -> Json<Vec<AgentSnapshot>> {
    Json(state.lifecycle.list_all().await)
}

async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsResponse> {
    let queue = state.queue.stats().await;
    let mut agents_by_state: HashMap<String, usize> = HashMap::new();
    for agent in state.lifecycle.list_all().await {
        *agents_by_state
            .entry(agent.fsm_state.to_string())
            .or_insert(0) += 1;
    }
    Json(StatsResponse {
        service: SERVICE_NAME.to_string(),
        version: SERVICE_VERSION.to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        queue,
        agents_by_state,
        fsm: state.fsm.status().await,
    })
}

async fn set_rate_override(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<RateOverrideRequest>,
) -> Response {
    let tier = match request.tier.as_str() {
        "light" => RateTier::Light,
        "normal" => RateTier::Normal,
        "heavy" => RateTier::Heavy,
        other => {
            return error_response(HubError::InvalidArgs(format!("unknown tier: {other}")));
        }
    };
    if request.capacity == 0 {
        return error_response(HubError::InvalidArgs("capacity must be positive".into()));
    }
    state.limiter.set_override(
        &agent_id,
        tier,
        TierLimits {
            capacity: request.capacity,
            refill_per_min: request.refill_per_min,
        },
    );
    Json(json!({"agent_id": agent_id, "tier": request.tier})).into_response()
}

async fn add_exempt(State(state): State<Arc<ApiState>>, Path(agent_id): Path<String>) -> Response {
    state.limiter.add_exempt(&agent_id);
    Json(json!({"agent_id": agent_id, "exempt": true})).into_response()
}

async fn fsm_state(State(state): State<Arc<ApiState>>) -> Json<FsmStatus> {
    Json(state.fsm.status().await)
}

async fn fsm_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<FsmTransition>> {
    Json(state.fsm.history(query.limit.unwrap_or(50)).await)
}

async fn fsm_transition(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<TransitionRequest>,
) -> Response {
    let target: HubState = match request.target_state.parse() {
        Ok(target) => target,
        Err(e) => return error_response(HubError::InvalidArgs(e)),
    };
    let reason = request.reason.unwrap_or_else(|| "operator".to_string());
    match state.fsm.force_transition(target, &reason).await {
        Ok(()) => Json(json!({"state": target.as_str()})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn fsm_pause(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.fsm.pause().await;
    Json(json!({"paused": true}))
}

async fn fsm_resume(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.fsm.resume().await;
    Json(json!({"paused": false}))
}
