//! HTTP surface: REST endpoints over the engine operations.
//!
//! Tenant resolution happens upstream (gateway/auth); every route consumes the
//! resolved tenant from the `X-Tenant-Id` header and passes it down explicitly.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::engine::{CampaignScheduler, DispatchService, MessageGenerator};
use crate::error::{DatabaseError, Error};
use crate::model::{CampaignStatus, MessageStatus};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub scheduler: Arc<CampaignScheduler>,
    pub generator: Arc<MessageGenerator>,
    pub dispatch: Arc<DispatchService>,
}

/// Build the Axum router with engine routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/campaigns/{id}", get(campaign_status))
        .route("/api/campaigns/{id}/launch", post(launch_campaign))
        .route("/api/campaigns/{id}/generate", post(generate_campaign))
        .route("/api/campaigns/{id}/pause", post(pause_campaign))
        .route("/api/campaigns/{id}/resume", post(resume_campaign))
        .route("/api/campaigns/{id}/archive", post(archive_campaign))
        .route("/api/messages/{id}/dispatch", post(dispatch_message))
        .route("/api/messages/{id}/events", post(delivery_event))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

fn map_engine_error(e: Error) -> ApiError {
    match &e {
        Error::Database(DatabaseError::NotFound { entity, id }) => {
            error_body(StatusCode::NOT_FOUND, format!("{entity} {id} not found"))
        }
        _ => {
            warn!(error = %e, "Request failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn tenant_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            error_body(
                StatusCode::BAD_REQUEST,
                "missing or invalid X-Tenant-Id header",
            )
        })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "outreach"
    }))
}

// ── Campaigns ───────────────────────────────────────────────────────────

async fn launch_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let passes = state
        .scheduler
        .launch(tenant, id)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(serde_json::json!({ "passes": passes })))
}

#[derive(Debug, Deserialize)]
struct GenerateParams {
    step: Option<Uuid>,
}

async fn generate_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<GenerateParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let summary = state
        .generator
        .generate(tenant, id, params.step)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(serde_json::json!({
        "created": summary.created,
        "skipped": summary.skipped,
    })))
}

/// Pause takes effect at the next batch boundary of any in-flight pass.
async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let updated = state
        .db
        .set_campaign_status_if(
            tenant,
            id,
            &[CampaignStatus::Scheduled, CampaignStatus::Running],
            CampaignStatus::Paused,
        )
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let updated = state
        .db
        .set_campaign_status_if(tenant, id, &[CampaignStatus::Paused], CampaignStatus::Running)
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn archive_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    state
        .db
        .archive_campaign(tenant, id)
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn campaign_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let campaign = state
        .db
        .get_campaign(tenant, id)
        .await
        .map_err(|e| map_engine_error(e.into()))?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("campaign {id} not found")))?;

    let counts = state
        .db
        .count_messages_by_status(tenant, id)
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    let by_status: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count.into()))
        .collect();

    Ok(Json(serde_json::json!({
        "campaign": campaign,
        "messages": by_status,
    })))
}

// ── Messages ────────────────────────────────────────────────────────────

async fn dispatch_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    state
        .dispatch
        .dispatch_message(tenant, id)
        .await
        .map_err(map_engine_error)?;

    let message = state
        .db
        .get_message(tenant, id)
        .await
        .map_err(|e| map_engine_error(e.into()))?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("message {id} not found")))?;
    Ok(Json(serde_json::json!({
        "status": message.status,
        "provider": message.provider,
    })))
}

#[derive(Debug, Deserialize)]
struct DeliveryEventBody {
    status: MessageStatus,
    at: Option<DateTime<Utc>>,
}

/// Provider webhook callback: apply a delivery event to a sent message.
async fn delivery_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<DeliveryEventBody>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let applied = state
        .dispatch
        .apply_delivery_event(tenant, id, body.status, body.at.unwrap_or_else(Utc::now))
        .await
        .map_err(map_engine_error)?;
    Ok(Json(serde_json::json!({ "applied": applied })))
}
