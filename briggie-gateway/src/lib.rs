//! Briggie Gateway - chat relay with persisted per-user history.
//!
//! ## Architecture
//!
//! ```text
//! Client → routes → Relay → Provider (OpenAI / Mistral)
//!                     ↓
//!          ConversationSession → HistoryStore (JSON file)
//! ```
//!
//! Conversations are hydrated once at startup and re-serialized wholesale
//! after every user turn and every completed assistant turn.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod history;
pub mod message;
pub mod provider;
pub mod relay;
pub mod routes;
pub mod session;

pub use error::GatewayError;
pub use history::{HistoryStore, JsonFileStore};
pub use message::{Message, Role, Snapshot};
pub use provider::{
    build_provider, CompatibleProvider, DeliveryMode, FragmentStream, Provider, ProviderError,
};
pub use relay::{Relay, RelayOutcome, RelayStream};
pub use routes::{build_routes, AppState};
pub use session::ConversationSession;

use axum::http::HeaderValue;
use axum::Router;
use briggie_common::config::{Config, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Hydrate the session and wire the configured provider into a relay.
pub async fn build_state(config: &Config) -> AppState {
    let store = Arc::new(JsonFileStore::new(&config.storage.history_path));
    let session = Arc::new(ConversationSession::hydrate(store).await);

    let provider = build_provider(&config.provider);
    let relay = Relay::new(
        session,
        provider,
        config.provider.system_prompt().map(ToString::to_string),
        config.provider.batch_context,
    );

    AppState::new(Arc::new(relay), config.provider.label())
}

/// CORS layer allowing the configured origins with any method and header.
pub fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins = if server.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let list: Vec<HeaderValue> = server
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(list)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the gateway router with all routes and middleware.
pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    build_routes(state).layer(cors_layer(server))
}

/// Start the gateway server and run until Ctrl-C.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let state = build_state(config).await;
    let router = build_router(state, &config.server);

    tracing::info!("Starting Briggie Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Briggie Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
