//! HTTP endpoints
//!
//! Admin surface under `/api/admin` (shared admin key), tenant surface
//! under `/api/v1` and `/webhooks` (bearer tokens, scope-gated), health
//! and Prometheus metrics public, and the bridge WebSocket.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use callweave_core::{
    AgentId, CallId, EventEnvelope, OrgId, RecordingId, WebhookEvent, WebhookId,
};
use callweave_persistence::{AuditKind, OrgPlan, Scope, TokenContext, WebhookRecord};
use callweave_storage::Metadata;
use callweave_webhooks::Subscription;

use crate::auth::{admin_auth, bearer_auth, require_scope};
use crate::bridge::bridge_handler;
use crate::state::AppState;
use crate::ServerError;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let config = state.config.read();
    let cors = build_cors_layer(&config.server.cors_origins, config.server.cors_enabled);
    drop(config);

    let admin = Router::new()
        .route("/api/admin/orgs", post(create_org))
        .route("/api/admin/tokens", post(create_token))
        .route("/api/admin/tokens/:id/rotate", post(rotate_token))
        .route("/api/admin/reload-config", post(reload_config))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_auth,
        ));

    let client = Router::new()
        .route("/api/v1/me", get(me))
        .route("/api/v1/agents", get(list_agents).post(create_agent))
        .route("/api/v1/agents/:id", get(get_agent).put(update_agent))
        .route("/api/v1/calls", get(list_calls))
        .route("/api/v1/calls/metrics/summary", get(metrics_summary))
        .route("/api/v1/calls/:id", get(get_call))
        .route(
            "/api/v1/recordings/unprocessed",
            get(list_unprocessed_recordings),
        )
        .route("/api/v1/recordings/:id", get(get_recording))
        .route("/api/v1/recordings/:id/metadata", put(replace_metadata))
        .route(
            "/api/v1/corrections",
            post(learn_correction).delete(unlearn_correction),
        )
        .route(
            "/api/v1/qa/evaluations",
            get(list_evaluations).post(create_evaluation),
        )
        .route("/api/v1/qa/criteria", get(list_criteria).post(create_criterion))
        .route("/webhooks", get(list_webhooks).post(create_webhook))
        .route("/webhooks/:id", delete(delete_webhook))
        .route("/webhooks/:id/toggle", patch(toggle_webhook))
        .route("/webhooks/test/:id", post(test_webhook))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            bearer_auth,
        ));

    Router::new()
        .merge(admin)
        .merge(client)
        .route("/bridge", get(bridge_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS from configured origins; empty config falls back to localhost
fn build_cors_layer(origins: &[String], enabled: bool) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    if !enabled {
        tracing::warn!("CORS disabled, allowing all origins");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Invalid CORS origin ignored");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
            ])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any)
}

fn parse_id<T>(raw: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T, ServerError> {
    parse(raw).ok_or_else(|| ServerError::Validation(format!("malformed id: {}", raw)))
}

// ---------------------------------------------------------------- health

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_sessions": state.registry.len(),
    }))
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

// ----------------------------------------------------------------- admin

#[derive(Debug, Deserialize)]
struct CreateOrgRequest {
    name: String,
    #[serde(default)]
    plan: OrgPlan,
    #[serde(default = "default_max_agents")]
    max_agents: i32,
    #[serde(default = "default_max_concurrent_calls")]
    max_concurrent_calls: i32,
}

fn default_max_agents() -> i32 {
    5
}

fn default_max_concurrent_calls() -> i32 {
    10
}

async fn create_org(
    State(state): State<AppState>,
    Json(body): Json<CreateOrgRequest>,
) -> Result<impl IntoResponse, ServerError> {
    if body.name.trim().is_empty() {
        return Err(ServerError::Validation("name must not be empty".into()));
    }

    let record = state
        .persistence
        .orgs
        .create(
            &body.name,
            body.plan,
            body.max_agents,
            body.max_concurrent_calls,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    org_id: OrgId,
    scopes: Vec<String>,
}

async fn create_token(
    State(state): State<AppState>,
    Json(body): Json<CreateTokenRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let mut scopes = Vec::new();
    for raw in &body.scopes {
        let scope = Scope::parse(raw)
            .ok_or_else(|| ServerError::Validation(format!("unknown scope: {}", raw)))?;
        scopes.push(scope);
    }

    // Org must exist
    state.persistence.orgs.get(body.org_id).await?;

    let ttl_days = state.config.read().server.token_ttl_days;
    let (record, raw_secret) = state
        .persistence
        .tokens
        .create(body.org_id, &scopes, ttl_days)
        .await?;

    state
        .persistence
        .audit
        .record(body.org_id, AuditKind::TokenCreated, &record.token_prefix)
        .await;

    // The raw token is surfaced exactly once
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token_id": record.token_id,
            "token_prefix": record.token_prefix,
            "token": raw_secret,
            "expires_at": record.expires_at,
            "scopes": body.scopes,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct RotateTokenRequest {
    org_id: OrgId,
}

async fn rotate_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RotateTokenRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let token_id = parse_id(&id, callweave_core::TokenId::parse)?;
    let ttl_days = state.config.read().server.token_ttl_days;

    let (record, raw_secret) = state
        .persistence
        .tokens
        .rotate(body.org_id, token_id, ttl_days)
        .await?;

    state
        .persistence
        .audit
        .record(body.org_id, AuditKind::TokenRotated, &record.token_prefix)
        .await;

    Ok(Json(json!({
        "token_id": record.token_id,
        "token_prefix": record.token_prefix,
        "token": raw_secret,
        "expires_at": record.expires_at,
    })))
}

async fn reload_config(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    state
        .reload_config()
        .map_err(ServerError::Validation)?;
    Ok(Json(json!({ "status": "reloaded" })))
}

// ---------------------------------------------------------------- client

async fn me(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
) -> Result<impl IntoResponse, ServerError> {
    let org = state.persistence.orgs.get(ctx.org_id).await?;
    Ok(Json(json!({
        "org_id": org.org_id,
        "name": org.name,
        "plan": org.plan,
        "scopes": ctx.scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
    })))
}

async fn list_agents(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::AgentRead)?;
    let agents = state.persistence.agents.list(ctx.org_id).await?;
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    #[serde(default)]
    voice_profile: Option<String>,
    #[serde(default)]
    context_profile: Option<String>,
}

async fn create_agent(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Json(body): Json<CreateAgentRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::AgentWrite)?;
    let org = state.persistence.orgs.get(ctx.org_id).await?;
    let agent = state
        .persistence
        .agents
        .create(
            ctx.org_id,
            org.max_agents,
            body.voice_profile,
            body.context_profile,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn get_agent(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::AgentRead)?;
    let agent_id = parse_id(&id, AgentId::parse)?;
    let agent = state.persistence.agents.get(ctx.org_id, agent_id).await?;
    Ok(Json(agent))
}

#[derive(Debug, Deserialize)]
struct UpdateAgentRequest {
    #[serde(default)]
    voice_profile: Option<String>,
    #[serde(default)]
    context_profile: Option<String>,
    #[serde(default)]
    config: HashMap<String, String>,
}

async fn update_agent(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAgentRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::AgentWrite)?;
    let agent_id = parse_id(&id, AgentId::parse)?;
    state
        .persistence
        .agents
        .update(
            ctx.org_id,
            agent_id,
            body.voice_profile,
            body.context_profile,
            body.config,
        )
        .await?;
    Ok(Json(json!({ "status": "updated" })))
}

async fn list_calls(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsRead)?;
    let calls = state.persistence.calls.list(ctx.org_id).await?;
    Ok(Json(calls))
}

async fn get_call(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsRead)?;
    let call_id = parse_id(&id, CallId::parse)?;

    match state.persistence.calls.get(ctx.org_id, call_id).await {
        Ok(call) => Ok(Json(call)),
        Err(callweave_persistence::PersistenceError::NotFound) => {
            // Cross-tenant ids are indistinguishable from missing ones; the
            // attempt is still audited
            state
                .persistence
                .audit
                .record(
                    ctx.org_id,
                    AuditKind::CrossTenantAttempt,
                    &format!("call {}", call_id),
                )
                .await;
            Err(ServerError::Persistence(
                callweave_persistence::PersistenceError::NotFound,
            ))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    7
}

async fn metrics_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Query(query): Query<SummaryQuery>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsRead)?;
    if !(1..=365).contains(&query.days) {
        return Err(ServerError::Validation("days must be in 1..=365".into()));
    }
    let summary = state
        .persistence
        .calls
        .metrics_summary(ctx.org_id, query.days)
        .await?;
    Ok(Json(summary))
}

// ----------------------------------------------------- batch worker contract

#[derive(Debug, Deserialize)]
struct UnprocessedQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_unprocessed_recordings(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Query(query): Query<UnprocessedQuery>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsRead)?;
    let list = state
        .recordings
        .list_unprocessed(ctx.org_id, query.limit.min(500))
        .await?;
    Ok(Json(list))
}

async fn get_recording(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsRead)?;
    let recording_id = parse_id(&id, RecordingId::parse)?;
    let stored = state.recordings.get(ctx.org_id, recording_id).await?;
    Ok(Json(json!({
        "metadata": stored.metadata,
        "audio_path": stored.audio_path,
    })))
}

async fn replace_metadata(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
    Json(metadata): Json<Metadata>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;
    let recording_id = parse_id(&id, RecordingId::parse)?;
    state
        .recordings
        .replace_metadata(ctx.org_id, recording_id, metadata)
        .await?;
    Ok(Json(json!({ "status": "replaced" })))
}

// ------------------------------------------------------------ corrections

#[derive(Debug, Deserialize)]
struct CorrectionRequest {
    original: String,
    corrected: Option<String>,
}

/// Teach a correction pair: it lands in the in-process dictionary for the
/// live path and is forwarded to the transcription service so future
/// transcriptions apply it at the source too.
async fn learn_correction(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Json(body): Json<CorrectionRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;
    let Some(corrected) = body.corrected.as_deref() else {
        return Err(ServerError::Validation("corrected is required".into()));
    };
    if body.original.trim().is_empty() || corrected.trim().is_empty() {
        return Err(ServerError::Validation("empty correction pair".into()));
    }

    state.dictionary.learn(&body.original, corrected);

    // Best effort: the local dictionary already covers the live path
    if let Err(e) = state.stt.learn_correction(&body.original, corrected).await {
        tracing::warn!(error = %e, "STT service did not accept the correction");
    }

    Ok((StatusCode::CREATED, Json(json!({ "status": "learned" }))))
}

async fn unlearn_correction(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Json(body): Json<CorrectionRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;
    if body.original.trim().is_empty() {
        return Err(ServerError::Validation("original is required".into()));
    }

    state.dictionary.unlearn(&body.original);
    Ok(Json(json!({ "status": "unlearned" })))
}

// -------------------------------------------------------------------- qa

async fn list_criteria(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::QaRead)?;
    let criteria = state.persistence.qa.list_criteria(ctx.org_id).await?;
    Ok(Json(criteria))
}

#[derive(Debug, Deserialize)]
struct CreateCriterionRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_weight")]
    weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

async fn create_criterion(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Json(body): Json<CreateCriterionRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::QaWrite)?;
    let criterion = state
        .persistence
        .qa
        .create_criterion(ctx.org_id, &body.name, body.description.as_deref(), body.weight)
        .await?;
    Ok((StatusCode::CREATED, Json(criterion)))
}

async fn list_evaluations(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::QaRead)?;
    let evaluations = state.persistence.qa.list_evaluations(ctx.org_id).await?;
    Ok(Json(evaluations))
}

#[derive(Debug, Deserialize)]
struct CreateEvaluationRequest {
    call_id: CallId,
    evaluator: String,
    scores: HashMap<String, f32>,
    #[serde(default)]
    notes: Option<String>,
}

async fn create_evaluation(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Json(body): Json<CreateEvaluationRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::QaWrite)?;
    // The evaluated call must be visible in this org
    state.persistence.calls.get(ctx.org_id, body.call_id).await?;

    let evaluation = state
        .persistence
        .qa
        .create_evaluation(
            ctx.org_id,
            body.call_id,
            &body.evaluator,
            body.scores,
            body.notes.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(evaluation)))
}

// -------------------------------------------------------------- webhooks

/// Convert a persisted record into a live dispatcher subscription
pub fn subscription_from_record(record: &WebhookRecord) -> Subscription {
    Subscription {
        id: record.webhook_id,
        org_id: record.org_id,
        url: record.url.clone(),
        events: record.events.iter().copied().collect(),
        secret: record.secret.clone(),
        description: record.description.clone(),
        active: record.active,
    }
}

#[derive(Debug, Deserialize)]
struct CreateWebhookRequest {
    url: String,
    events: Vec<String>,
    secret: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Json(body): Json<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;

    if !body.url.starts_with("http://") && !body.url.starts_with("https://") {
        return Err(ServerError::Validation("url must be http(s)".into()));
    }
    if body.secret.is_empty() {
        return Err(ServerError::Validation("secret must not be empty".into()));
    }

    let mut events = Vec::new();
    for raw in &body.events {
        let event = WebhookEvent::parse(raw)
            .ok_or_else(|| ServerError::Validation(format!("unknown event: {}", raw)))?;
        events.push(event);
    }

    let record = state
        .persistence
        .webhooks
        .create(
            ctx.org_id,
            &body.url,
            events,
            &body.secret,
            body.description.as_deref(),
        )
        .await?;

    state
        .dispatcher
        .upsert_subscription(subscription_from_record(&record));
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_webhooks(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsRead)?;
    let webhooks = state.persistence.webhooks.list(ctx.org_id).await?;
    Ok(Json(webhooks))
}

async fn delete_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;
    let webhook_id = parse_id(&id, WebhookId::parse)?;
    state.persistence.webhooks.delete(ctx.org_id, webhook_id).await?;
    state.dispatcher.remove_subscription(webhook_id);
    Ok(Json(json!({ "status": "deleted" })))
}

async fn toggle_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;
    let webhook_id = parse_id(&id, WebhookId::parse)?;

    let record = state.persistence.webhooks.get(ctx.org_id, webhook_id).await?;
    let next_active = !record.active;
    state
        .persistence
        .webhooks
        .set_active(ctx.org_id, webhook_id, next_active)
        .await?;

    let mut updated = record;
    updated.active = next_active;
    state
        .dispatcher
        .upsert_subscription(subscription_from_record(&updated));
    Ok(Json(json!({ "active": next_active })))
}

async fn test_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<TokenContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    require_scope(&ctx, Scope::CallsWrite)?;
    let webhook_id = parse_id(&id, WebhookId::parse)?;

    // Existence (and org ownership) check
    state.persistence.webhooks.get(ctx.org_id, webhook_id).await?;

    let envelope = EventEnvelope::new(
        WebhookEvent::Error,
        CallId::new(),
        ctx.org_id,
        json!({ "test": true }),
    );

    if state.dispatcher.enqueue_to(webhook_id, &envelope) {
        Ok(Json(json!({ "status": "enqueued" })))
    } else {
        Err(ServerError::Validation("subscription not live".into()))
    }
}
