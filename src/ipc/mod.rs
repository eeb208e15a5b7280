mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::supervisor::managed_process::BotStatus;
use crate::supervisor::Supervisor;

/// IPC 요청/응답 타입
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRequest {
    #[serde(default)]
    pub url: String,
}

/// Body of start/stop/restart, and query of the log endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRequest {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotListResponse {
    pub success: bool,
    pub bots: Vec<BotStatus>,
    pub message: String,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/api/repo",
                get(handlers::repo::get_repo).post(handlers::repo::provision_repo),
            )
            .route("/api/bots", get(handlers::bot::list_bots))
            .route("/api/bot/start", post(handlers::bot::start_bot))
            .route("/api/bot/stop", post(handlers::bot::stop_bot))
            .route("/api/bot/restart", post(handlers::bot::restart_bot))
            .route("/api/bot/logs", get(handlers::bot::bot_logs))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}
