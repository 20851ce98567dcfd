//! REST API for the guard.
//!
//! Every response is an envelope: `{"ok": true, ...data}` on success,
//! `{"ok": false, "errorKind": "...", "message": "..."}` on failure.
//! Allocation writes that leave the active sum off 100 still succeed and carry
//! a `warning`.
//!
//! Authentication is `Authorization: Bearer <session token>`.
//!
//! - `GET /api/health`
//! - `GET /api/session` - gate decision for the presented token (public)
//! - `POST /api/onboarding/steps` - complete an onboarding step
//! - `GET /api/status` - full snapshot (mode, allocation, session)
//! - `GET /api/accounts` - allocation summary with balances
//! - `POST /api/accounts` - link an account
//! - `DELETE /api/accounts/{id}`
//! - `POST /api/accounts/{id}/primary`
//! - `POST /api/accounts/{id}/active` - `{"active": bool}`
//! - `POST /api/accounts/{id}/test` - credential connection test
//! - `PUT /api/allocations` - batch update, all or nothing
//! - `GET /api/mode`
//! - `POST /api/mode/live` - start go-live, returns a confirmation token
//! - `POST /api/mode/confirm` - `{"tokenId": ..., "acknowledged": bool}`
//! - `POST /api/mode/cancel`
//! - `POST /api/mode/paper`
//! - `POST /api/mode/emergency-stop` - any authenticated user, never fails
//! - `POST /api/admin/users/{user_id}/mode/clear` - `X-Admin-Key` header

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use guard_common::UserId;

use crate::allocation::{AccountSpec, AllocationEdit, AllocationSet, InvariantWarning};
use crate::config::ServerConfig;
use crate::error::{ErrorKind, GuardError};
use crate::gate::{AuthError, GateDecision, RouteKind, Session};
use crate::guard::TradingGuard;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

// ============================================================================
// Envelope
// ============================================================================

/// Failed call, rendered as `{ok: false, errorKind, message}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

impl From<GuardError> for ApiError {
    fn from(e: GuardError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::validation(e.body_text())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    ok: bool,
    error_kind: ErrorKind,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            ok: false,
            error_kind: self.kind,
            message: &self.message,
        };
        (self.status(), Json(body)).into_response()
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ExternalProvider => StatusCode::BAD_GATEWAY,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::OnboardingIncomplete => StatusCode::FORBIDDEN,
    }
}

/// Successful call, rendered as `{ok: true, ...body}`.
#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

impl<T: Serialize> ApiOk<T> {
    pub fn new(body: T) -> Json<Self> {
        Json(Self { ok: true, body })
    }
}

type ApiResult<T> = Result<Json<ApiOk<T>>, ApiError>;

/// Allocation set plus the invariant warning, if any.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocationBody {
    allocation: AllocationSet,
    warning: Option<InvariantWarning>,
}

impl From<AllocationSet> for AllocationBody {
    fn from(allocation: AllocationSet) -> Self {
        let warning = allocation.warning();
        Self {
            allocation,
            warning,
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct StepRequest {
    step: u8,
}

#[derive(Debug, Deserialize)]
struct ActiveRequest {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct AllocationsRequest {
    allocations: Vec<AllocationEdit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    token_id: Uuid,
    acknowledged: bool,
}

// ============================================================================
// State and auth
// ============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub guard: Arc<TradingGuard>,
}

impl ApiState {
    pub fn new(guard: Arc<TradingGuard>) -> Self {
        Self { guard }
    }

    async fn session(&self, headers: &HeaderMap, route: RouteKind) -> Result<Session, ApiError> {
        let token = bearer_token(headers).ok_or_else(|| GuardError::from(AuthError::Invalid))?;
        Ok(self.guard.authorize(token, route).await?)
    }

    async fn active_user(&self, headers: &HeaderMap) -> Result<UserId, ApiError> {
        Ok(self.session(headers, RouteKind::Protected).await?.user_id)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    ApiOk::new(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    session: Option<Session>,
    decision: GateDecision,
}

/// GET /api/session - where the presented token may go.
async fn get_session(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<SessionBody> {
    let session = match bearer_token(&headers) {
        Some(token) => match state.guard.gate().validate(token).await {
            Ok(session) => Some(session),
            Err(AuthError::Invalid) => None,
            Err(e) => return Err(GuardError::from(e).into()),
        },
        None => None,
    };
    let decision = state.guard.gate().gate(session.as_ref());
    Ok(ApiOk::new(SessionBody { session, decision }))
}

#[derive(Serialize)]
struct SessionOnly {
    session: Session,
}

/// POST /api/onboarding/steps
async fn complete_step(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<StepRequest>, JsonRejection>,
) -> ApiResult<SessionOnly> {
    let Json(req) = body?;
    let token = bearer_token(&headers).ok_or_else(|| GuardError::from(AuthError::Invalid))?;
    let session = state
        .guard
        .gate()
        .complete_step(token, req.step)
        .await
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(SessionOnly { session }))
}

/// GET /api/status
async fn get_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<crate::guard::StatusSnapshot> {
    let user = state.active_user(&headers).await?;
    Ok(ApiOk::new(state.guard.snapshot(&user).await))
}

/// GET /api/accounts
async fn get_summary(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<crate::allocation::AllocationSummary> {
    let user = state.active_user(&headers).await?;
    Ok(ApiOk::new(state.guard.ledger().get_summary(&user).await))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedBody {
    #[serde(flatten)]
    created: crate::allocation::AccountCreated,
    warning: Option<InvariantWarning>,
}

/// POST /api/accounts
async fn add_account(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<AccountSpec>, JsonRejection>,
) -> ApiResult<CreatedBody> {
    let user = state.active_user(&headers).await?;
    let Json(spec) = body?;
    let created = state
        .guard
        .ledger()
        .add_account(&user, spec)
        .await
        .map_err(GuardError::from)?;
    let warning = created.allocation.warning();
    Ok(ApiOk::new(CreatedBody { created, warning }))
}

/// DELETE /api/accounts/{id}
async fn remove_account(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(account_id): Path<Uuid>,
) -> ApiResult<AllocationBody> {
    let user = state.active_user(&headers).await?;
    let set = state
        .guard
        .ledger()
        .remove_account(&user, account_id)
        .await
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(set.into()))
}

/// POST /api/accounts/{id}/primary
async fn set_primary(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(account_id): Path<Uuid>,
) -> ApiResult<AllocationBody> {
    let user = state.active_user(&headers).await?;
    let set = state
        .guard
        .ledger()
        .set_primary(&user, account_id)
        .await
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(set.into()))
}

/// POST /api/accounts/{id}/active
async fn toggle_active(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(account_id): Path<Uuid>,
    body: Result<Json<ActiveRequest>, JsonRejection>,
) -> ApiResult<AllocationBody> {
    let user = state.active_user(&headers).await?;
    let Json(req) = body?;
    let set = state
        .guard
        .ledger()
        .toggle_active(&user, account_id, req.active)
        .await
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(set.into()))
}

/// POST /api/accounts/{id}/test
async fn test_connection(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(account_id): Path<Uuid>,
) -> ApiResult<crate::allocation::ConnectionCheck> {
    let user = state.active_user(&headers).await?;
    let check = state
        .guard
        .ledger()
        .test_connection(&user, account_id)
        .await
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(check))
}

/// PUT /api/allocations
async fn update_allocations(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<AllocationsRequest>, JsonRejection>,
) -> ApiResult<AllocationBody> {
    let user = state.active_user(&headers).await?;
    let Json(req) = body?;
    let set = state
        .guard
        .ledger()
        .update_allocations(&user, &req.allocations)
        .await
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(set.into()))
}

#[derive(Serialize)]
struct ModeBody {
    mode: crate::mode::ModeState,
}

/// GET /api/mode
async fn get_mode(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<ModeBody> {
    let user = state.active_user(&headers).await?;
    Ok(ApiOk::new(ModeBody {
        mode: state.guard.mode().state(&user),
    }))
}

#[derive(Serialize)]
struct TokenBody {
    confirmation: crate::confirmation::ConfirmationToken,
}

/// POST /api/mode/live
async fn request_live(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<TokenBody> {
    let user = state.active_user(&headers).await?;
    let confirmation = state.guard.request_live(&user).await?;
    Ok(ApiOk::new(TokenBody { confirmation }))
}

/// POST /api/mode/confirm
async fn confirm_live(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<ConfirmRequest>, JsonRejection>,
) -> ApiResult<ModeBody> {
    let user = state.active_user(&headers).await?;
    let Json(req) = body?;
    let mode = state
        .guard
        .mode()
        .confirm(&user, req.token_id, req.acknowledged)
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(ModeBody { mode }))
}

/// POST /api/mode/cancel
async fn cancel_live(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<ModeBody> {
    let user = state.active_user(&headers).await?;
    let mode = state.guard.mode().cancel(&user).map_err(GuardError::from)?;
    Ok(ApiOk::new(ModeBody { mode }))
}

/// POST /api/mode/paper
async fn request_paper(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<ModeBody> {
    let user = state.active_user(&headers).await?;
    let mode = state
        .guard
        .mode()
        .request_paper(&user)
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(ModeBody { mode }))
}

/// POST /api/mode/emergency-stop
///
/// Admitted for onboarding-incomplete users too, and for recently validated
/// sessions while the identity service is down. Once the caller is known the
/// stop cannot fail.
async fn emergency_stop(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<crate::mode::EmergencyStopAck> {
    let token = bearer_token(&headers).ok_or_else(|| GuardError::from(AuthError::Invalid))?;
    let user = state.guard.authorize_stop(token).await?;
    Ok(ApiOk::new(state.guard.mode().emergency_stop(&user)))
}

/// POST /api/admin/users/{user_id}/mode/clear
async fn admin_clear(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> ApiResult<ModeBody> {
    let presented = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(capability) = state.guard.admin().authorize(presented) else {
        warn!(user_id = %user_id, "Rejected admin clear: bad or missing admin key");
        return Err(ApiError::new(ErrorKind::Auth, "admin key required"));
    };
    let user = UserId::new(user_id);
    let mode = state
        .guard
        .mode()
        .admin_clear(&capability, &user)
        .map_err(GuardError::from)?;
    Ok(ApiOk::new(ModeBody { mode }))
}

// ============================================================================
// Router Configuration
// ============================================================================

/// Configuration for the REST API server.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
    /// Enable CORS for browser dashboards served from another origin.
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.api_port,
            enable_cors: config.enable_cors,
        }
    }
}

/// Create the API router with all endpoints.
pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/session", get(get_session))
        .route("/api/onboarding/steps", post(complete_step))
        .route("/api/status", get(get_status))
        .route("/api/accounts", get(get_summary).post(add_account))
        .route("/api/accounts/{id}", delete(remove_account))
        .route("/api/accounts/{id}/primary", post(set_primary))
        .route("/api/accounts/{id}/active", post(toggle_active))
        .route("/api/accounts/{id}/test", post(test_connection))
        .route("/api/allocations", put(update_allocations))
        .route("/api/mode", get(get_mode))
        .route("/api/mode/live", post(request_live))
        .route("/api/mode/confirm", post(confirm_live))
        .route("/api/mode/cancel", post(cancel_live))
        .route("/api/mode/paper", post(request_paper))
        .route("/api/mode/emergency-stop", post(emergency_stop))
        .route("/api/admin/users/{user_id}/mode/clear", post(admin_clear))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router with the optional CORS layer applied.
pub fn build_app(config: &ApiServerConfig, guard: Arc<TradingGuard>) -> Router {
    let app = create_api_router(ApiState::new(guard));
    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app.layer(cors)
    } else {
        app
    }
}

/// Run the API server until the process shuts down.
pub async fn run_api_server(
    config: ApiServerConfig,
    guard: Arc<TradingGuard>,
) -> anyhow::Result<()> {
    let app = build_app(&config, guard);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, cors = config.enable_cors, "REST API server started");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Spawn the API server as a background task.
pub fn spawn_api_server(
    config: ApiServerConfig,
    guard: Arc<TradingGuard>,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_api_server(config, guard).await })
}
