//! HTTP server wiring.
//!
//! Builds the axum router over a shared [`AppState`], spawns the
//! orchestrator's background loops, and serves until shutdown.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use eoslink_flow::dispatch::HttpWebhookSender;
use eoslink_flow::eos::HttpEosClient;
use eoslink_flow::error::Result;
use eoslink_flow::guard::StaticSignalSource;
use eoslink_flow::runtime::Orchestrator;
use eoslink_flow::store::memory::MemoryRunStore;

use crate::config::Config;
use crate::routes;

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator owning all flow components.
    pub orchestrator: Arc<Orchestrator>,
}

/// The eoslink HTTP server.
pub struct Server {
    config: Config,
    orchestrator: Arc<Orchestrator>,
}

impl Server {
    /// Builds a server and its orchestrator from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the optimizer client cannot be constructed
    /// from the configured base URL.
    pub fn from_config(config: Config) -> Result<Self> {
        let eos = HttpEosClient::new(
            config.eos_base_url.clone(),
            std::time::Duration::from_secs(config.eos_http_timeout_seconds),
        )?;
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(eos),
            Arc::new(HttpWebhookSender::new()?),
            Arc::new(StaticSignalSource::new()),
            config.flow.clone(),
        ));
        Ok(Self {
            config,
            orchestrator,
        })
    }

    /// Builds a server around an externally-constructed orchestrator,
    /// for tests with mock collaborators.
    #[must_use]
    pub fn with_orchestrator(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Returns the router for in-process testing.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(AppState {
            orchestrator: Arc::clone(&self.orchestrator),
        })
    }

    /// Spawns the background loops and serves HTTP until ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn serve(self) -> std::io::Result<()> {
        let handles = self.orchestrator.spawn_loops();
        let router = self.router();

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "eoslink listening");

        let orchestrator = Arc::clone(&self.orchestrator);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                orchestrator.shutdown();
            })
            .await?;

        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}

/// Builds the full route tree over the given state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/eos", routes::api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(_state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
