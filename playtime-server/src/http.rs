//! Playtime HTTP admin/query API
//!
//! Axum-based HTTP server for operators: manage tracked accounts, read
//! recorded sessions, and nudge the poller. Each endpoint has a thin axum
//! handler that delegates to an inner function taking the store directly,
//! so the logic is testable without axum dispatch.
//!
//! Endpoints:
//! - GET    /health                 store ping + version
//! - GET    /version
//! - GET    /accounts
//! - POST   /accounts               {account_id, username?}
//! - DELETE /accounts/:id          also releases its open sessions
//! - GET    /accounts/:id/sessions  finished sessions
//! - GET    /accounts/:id/active    open sessions
//! - GET    /titles/:id             cached title metadata
//! - POST   /control                {kind}

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use playtime_core::config::HttpConfig;
use chrono::Utc;
use playtime_core::{AccountId, ControlMessage, Session, SessionStore, StoreError, TitleId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::subsystems::reconcile::release_sessions;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn SessionStore>,
    pub control: mpsc::Sender<ControlMessage>,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/accounts", get(list_accounts_handler).post(add_account_handler))
        .route("/accounts/:id", axum::routing::delete(remove_account_handler))
        .route("/accounts/:id/sessions", get(sessions_handler))
        .route("/accounts/:id/active", get(active_handler))
        .route("/titles/:id", get(title_handler))
        .route("/control", post(control_handler))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn start_http_server(
    state: HttpState,
    config: &HttpConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Playtime HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    /// Decimal SteamID64; a string so 64-bit ids survive JSON clients.
    pub account_id: String,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn body(msg: impl Into<String>) -> serde_json::Value {
        serde_json::to_value(Self::new(msg)).unwrap_or_default()
    }
}

type Reply = (StatusCode, serde_json::Value);

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(store: &dyn SessionStore) -> Reply {
    match store.ping().await {
        Ok(backend) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": backend,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "service": "playtime",
    })
}

pub async fn list_accounts_inner(store: &dyn SessionStore) -> Reply {
    match store.list_accounts().await {
        Ok(accounts) => (
            StatusCode::OK,
            serde_json::json!({
                "count": accounts.len(),
                "accounts": accounts,
            }),
        ),
        Err(e) => internal_error("list accounts", e),
    }
}

pub async fn add_account_inner(
    store: &dyn SessionStore,
    control: &mpsc::Sender<ControlMessage>,
    req: AddAccountRequest,
) -> Reply {
    let account = match parse_account(&req.account_id) {
        Ok(a) => a,
        Err(reply) => return reply,
    };
    let username = req
        .username
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());

    match store.add_account(account, username).await {
        Ok(added) => {
            if added {
                tracing::info!(account = %account, "Tracking account");
                notify(control, ControlMessage::AccountListChanged).await;
            }
            let status = if added {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (
                status,
                serde_json::json!({
                    "account_id": account,
                    "added": added,
                }),
            )
        }
        Err(e) => internal_error("add account", e),
    }
}

pub async fn remove_account_inner(
    store: &dyn SessionStore,
    control: &mpsc::Sender<ControlMessage>,
    raw_id: &str,
) -> Reply {
    let account = match parse_account(raw_id) {
        Ok(a) => a,
        Err(reply) => return reply,
    };

    match store.remove_account(account).await {
        Ok(true) => {
            tracing::info!(account = %account, "Stopped tracking account");
            notify(control, ControlMessage::AccountListChanged).await;
            // The poller no longer visits this account, so nothing else would close its rows.
            let released = match release_untracked(store, account).await {
                Ok(sessions) => sessions.len(),
                Err(e) => return internal_error("release open sessions", e),
            };
            (
                StatusCode::OK,
                serde_json::json!({
                    "account_id": account,
                    "removed": true,
                    "released": released,
                }),
            )
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            ErrorResponse::body(format!("account {} is not tracked", account)),
        ),
        Err(e) => internal_error("remove account", e),
    }
}

async fn release_untracked(
    store: &dyn SessionStore,
    account: AccountId,
) -> std::result::Result<Vec<Session>, StoreError> {
    let active = store.list_active(account).await?;
    release_sessions(store, &active, Utc::now()).await
}

pub async fn sessions_inner(store: &dyn SessionStore, raw_id: &str) -> Reply {
    let account = match parse_account(raw_id) {
        Ok(a) => a,
        Err(reply) => return reply,
    };

    match store.finished_sessions(account).await {
        Ok(sessions) => {
            let total: i64 = sessions.iter().map(|s| s.duration_minutes()).sum();
            (
                StatusCode::OK,
                serde_json::json!({
                    "account_id": account,
                    "count": sessions.len(),
                    "total_minutes": total,
                    "sessions": sessions,
                }),
            )
        }
        Err(e) => internal_error("list sessions", e),
    }
}

pub async fn active_inner(store: &dyn SessionStore, raw_id: &str) -> Reply {
    let account = match parse_account(raw_id) {
        Ok(a) => a,
        Err(reply) => return reply,
    };

    match store.list_active(account).await {
        Ok(active) => (
            StatusCode::OK,
            serde_json::json!({
                "account_id": account,
                "count": active.len(),
                "active": active,
            }),
        ),
        Err(e) => internal_error("list active sessions", e),
    }
}

pub async fn title_inner(store: &dyn SessionStore, raw_id: &str) -> Reply {
    let title = match raw_id.trim().parse::<u32>() {
        Ok(id) => TitleId(id),
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                ErrorResponse::body(format!("invalid title id: {}", raw_id)),
            )
        }
    };

    match store.title_info(title).await {
        Ok(Some(info)) => (StatusCode::OK, serde_json::json!(info)),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            ErrorResponse::body(format!("title {} not cached", title)),
        ),
        Err(e) => internal_error("read title", e),
    }
}

pub async fn control_inner(
    control: &mpsc::Sender<ControlMessage>,
    msg: ControlMessage,
) -> Reply {
    match control.send(msg.clone()).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            serde_json::json!({ "status": "accepted", "message": msg }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::body("poller is not running"),
        ),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.store.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn list_accounts_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = list_accounts_inner(state.store.as_ref()).await;
    (status, Json(body))
}

pub async fn add_account_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<AddAccountRequest>,
) -> impl IntoResponse {
    let (status, body) = add_account_inner(state.store.as_ref(), &state.control, req).await;
    (status, Json(body))
}

pub async fn remove_account_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = remove_account_inner(state.store.as_ref(), &state.control, &id).await;
    (status, Json(body))
}

pub async fn sessions_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = sessions_inner(state.store.as_ref(), &id).await;
    (status, Json(body))
}

pub async fn active_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = active_inner(state.store.as_ref(), &id).await;
    (status, Json(body))
}

pub async fn title_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = title_inner(state.store.as_ref(), &id).await;
    (status, Json(body))
}

pub async fn control_handler(
    State(state): State<Arc<HttpState>>,
    Json(msg): Json<ControlMessage>,
) -> impl IntoResponse {
    let (status, body) = control_inner(&state.control, msg).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_account(raw: &str) -> std::result::Result<AccountId, Reply> {
    raw.parse::<AccountId>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            ErrorResponse::body(format!("invalid account id: {}", raw)),
        )
    })
}

fn internal_error(action: &str, e: impl std::fmt::Display) -> Reply {
    tracing::error!(error = %e, "Failed to {}", action);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorResponse::body(format!("failed to {}: {}", action, e)),
    )
}

async fn notify(control: &mpsc::Sender<ControlMessage>, msg: ControlMessage) {
    if control.send(msg).await.is_err() {
        tracing::warn!("Poller is not running, account list change not delivered");
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
