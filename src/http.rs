//! HTTP surface
//!
//! `/health` plus the `/session?action=` dispatcher. `/api/health` and
//! `/api/whatsapp` are served as aliases.

use crate::config::SERVICE_NAME;
use crate::error::Result;
use crate::health::health_report;
use crate::session::SessionState;
use crate::status::{is_scannable, StatusStore};
use crate::supervisor::SupervisorHandle;
use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

/// Shared state for all handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
    pub store: Arc<StatusStore>,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub action: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/health", get(handle_health))
        .route(
            "/session",
            get(handle_session).post(handle_session).options(handle_options),
        )
        .route(
            "/api/whatsapp",
            get(handle_session).post(handle_session).options(handle_options),
        )
        .with_state(state)
        .layer(cors)
}

/// GET /health: always 200, degraded body on internal failure
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(health_report(&state.store)))
}

async fn handle_options() -> StatusCode {
    StatusCode::OK
}

/// GET|POST /session?action=status|qr|restart
async fn handle_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Response {
    // First request boots the session if nothing else has
    if let Err(e) = state.supervisor.ensure_started().await {
        error!("Could not trigger session start: {}", e);
    }

    let action = query.action.as_deref().unwrap_or("info");
    match run_action(&state, action).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => {
            error!("Action '{}' failed: {}", action, e);
            let body = json!({
                "success": false,
                "error": e.to_string(),
                "status": state.supervisor.state(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn run_action(state: &AppState, action: &str) -> Result<Value> {
    match action {
        "status" => status_body(state),
        "qr" => qr_body(state),
        "restart" => restart_body(state).await,
        _ => Ok(info_body(state)),
    }
}

fn status_body(state: &AppState) -> Result<Value> {
    let mut body = state.store.read_raw()?;
    body.insert("success".to_string(), json!(true));
    body.insert("serverTime".to_string(), json!(Utc::now().to_rfc3339()));
    body.insert("platform".to_string(), json!(state.platform));
    body.insert(
        "endpoints".to_string(),
        json!({
            "qr": "/session?action=qr",
            "status": "/session?action=status",
            "restart": "/session?action=restart",
            "health": "/health",
        }),
    );
    Ok(Value::Object(body))
}

fn qr_body(state: &AppState) -> Result<Value> {
    let qr = state.store.read_qr()?;
    let status = state.supervisor.state();
    Ok(json!({
        "success": true,
        "qr": qr,
        "status": status,
        "hasQr": is_scannable(&qr),
        "message": qr_hint(status),
    }))
}

/// Operator hint for the QR page
pub fn qr_hint(state: SessionState) -> &'static str {
    match state {
        SessionState::Connected => "WhatsApp is connected",
        SessionState::AwaitingQrScan => "Scan the QR code with WhatsApp",
        _ => "Initialization in progress...",
    }
}

async fn restart_body(state: &AppState) -> Result<Value> {
    state.supervisor.restart().await?;
    Ok(json!({
        "success": true,
        "message": "Restart in progress...",
        "restartInitiated": true,
    }))
}

fn info_body(state: &AppState) -> Value {
    json!({
        "success": true,
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": state.supervisor.state(),
        "endpoints": [
            "GET /session?action=qr",
            "GET /session?action=status",
            "GET /session?action=restart",
            "GET /health",
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_hint() {
        assert_eq!(qr_hint(SessionState::Connected), "WhatsApp is connected");
        assert_eq!(
            qr_hint(SessionState::AwaitingQrScan),
            "Scan the QR code with WhatsApp"
        );
        assert_eq!(
            qr_hint(SessionState::Disconnected),
            "Initialization in progress..."
        );
    }
}
