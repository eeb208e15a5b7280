use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use super::super::{IPCServer, RepoRequest};
use crate::supervisor::error::SupervisorError;

/// GET /api/repo - 현재 저장소 조회
pub async fn get_repo(State(state): State<IPCServer>) -> impl IntoResponse {
    let repo = state.supervisor.repository().await;
    let message = match &repo {
        Some(r) => format!("Active repository: {}", r.url),
        None => "No repository configured".to_string(),
    };
    Json(json!({
        "success": true,
        "repository": repo,
        "message": message,
    }))
}

/// POST /api/repo - 저장소 clone/pull + requirements 설치
pub async fn provision_repo(
    State(state): State<IPCServer>,
    Json(req): Json<RepoRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let repo = state.supervisor.provision(&req.url).await?;
    Ok(Json(json!({
        "success": true,
        "repository": repo,
        "message": format!("Repository set and cloned: {}", repo.url),
    })))
}
