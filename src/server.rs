use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<Agent>,
    pub sessions: Arc<SessionManager>,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    reply: String,
    session_id: String,
}

pub async fn serve(agent: Arc<Agent>, sessions: Arc<SessionManager>) -> Result<()> {
    let bind_addr = std::env::var("QUERYDESK_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8191".to_string())
        .parse::<SocketAddr>()
        .context("Invalid QUERYDESK_BIND (expected host:port)")?;

    let auth = load_auth_config()?;

    let state = Arc::new(ServerState {
        agent,
        sessions,
        auth,
    });

    let protected = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Querydesk listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

fn load_auth_config() -> Result<AuthConfig> {
    let mode = parse_auth_mode(std::env::var("QUERYDESK_AUTH_MODE").ok())?;
    let token = std::env::var("QUERYDESK_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "QUERYDESK_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(AuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid QUERYDESK_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &AuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// One conversational exchange. The session lock is held for the whole
/// turn, so concurrent posts to the same session serialize; on failure the
/// stored state is left as it was before the turn.
async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message cannot be empty".to_string(),
        ));
    }

    let (session_id, session) = state.sessions.get_or_create(body.session_id.as_deref()).await;
    let mut guard = session.lock().await;

    let (new_state, reply) = state
        .agent
        .run_turn(guard.clone(), message)
        .await
        .map_err(internal_error)?;
    *guard = new_state;

    Ok(Json(ChatResponse { reply, session_id }))
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("chat turn failed: {:#}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
