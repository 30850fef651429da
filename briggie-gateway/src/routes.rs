//! HTTP API routes.

use crate::error::GatewayError;
use crate::message::Message;
use crate::relay::Relay;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /// `<kind>:<model>` reported by the health probe
    pub provider_label: String,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, provider_label: impl Into<String>) -> Self {
        Self {
            relay,
            provider_label: provider_label.into(),
        }
    }
}

/// Build the application router.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Conversation history
        .route(
            "/chat-system/chat/:user_id",
            get(get_history).post(submit_turn),
        )
        // Streaming relay
        .route("/chat-system/chat-streaming/:user_id", post(chat_streaming))
        .with_state(state)
}

// ============ Health Check ============

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: String,
    mode: &'static str,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.provider_label,
        mode: "online",
    })
}

// ============ Chat ============

#[derive(Debug, Deserialize)]
pub struct ChatIn {
    pub content: String,
}

fn validate_user_id(user_id: String) -> Result<String, GatewayError> {
    if user_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(user_id)
}

async fn get_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Message>>, GatewayError> {
    let user_id = validate_user_id(user_id)?;
    Ok(Json(state.relay.history(&user_id).await))
}

async fn submit_turn(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<ChatIn>,
) -> Result<Json<Message>, GatewayError> {
    let user_id = validate_user_id(user_id)?;
    let message = state.relay.submit_turn(&user_id, body.content).await?;
    tracing::debug!(user_id = %user_id, "User turn recorded");
    Ok(Json(message))
}

async fn chat_streaming(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<ChatIn>,
) -> Result<Response, GatewayError> {
    let user_id = validate_user_id(user_id)?;
    let relay = state.relay.start(&user_id, body.content).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(relay.into_stream()),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_id() {
        assert_eq!(validate_user_id("alice".into()).unwrap(), "alice");
        assert!(matches!(
            validate_user_id("   ".into()),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_chat_in_deserializes() {
        let body: ChatIn = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(body.content, "hello");
        assert!(serde_json::from_str::<ChatIn>(r#"{"text":"hello"}"#).is_err());
    }
}
