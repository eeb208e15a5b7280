use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{BotListResponse, BotRequest, IPCServer};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::validate_key;

/// POST /api/bot/start - 봇 시작 (실행 중이면 교체)
pub async fn start_bot(
    State(state): State<IPCServer>,
    Json(req): Json<BotRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let started = state.supervisor.start(&req.key).await?;
    Ok(Json(json!({
        "success": true,
        "key": started.key,
        "pid": started.pid,
        "log_path": started.log_path,
        "message": format!(
            "Bot {} started (PID {}). Logs: /api/bot/logs?key={}",
            started.key, started.pid, started.key
        ),
    })))
}

/// POST /api/bot/stop - 봇 중지
pub async fn stop_bot(
    State(state): State<IPCServer>,
    Json(req): Json<BotRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let key = validate_key(&req.key)?;
    state.supervisor.stop(&key).await?;
    Ok(Json(json!({
        "success": true,
        "key": key,
        "message": format!("Bot {} stopped.", key),
    })))
}

/// POST /api/bot/restart - 실행 중인 봇 재시작
pub async fn restart_bot(
    State(state): State<IPCServer>,
    Json(req): Json<BotRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let started = state.supervisor.restart(&req.key).await?;
    Ok(Json(json!({
        "success": true,
        "key": started.key,
        "pid": started.pid,
        "log_path": started.log_path,
        "message": format!("Bot {} restarted (PID {}).", started.key, started.pid),
    })))
}

/// GET /api/bots - 실행 중인 봇 목록
pub async fn list_bots(State(state): State<IPCServer>) -> impl IntoResponse {
    let bots = state.supervisor.list().await;
    let message = if bots.is_empty() {
        "No bots running.".to_string()
    } else {
        let lines: Vec<String> = bots
            .iter()
            .map(|b| {
                let suffix = if b.alive { "" } else { " [exited]" };
                format!("{} (PID: {}){}", b.key, b.pid, suffix)
            })
            .collect();
        format!("Running bots:\n{}", lines.join("\n"))
    };
    Json(BotListResponse {
        success: true,
        bots,
        message,
    })
}

/// GET /api/bot/logs?key=bot.py - 로그 끝부분 조회
pub async fn bot_logs(
    State(state): State<IPCServer>,
    Query(req): Query<BotRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let key = validate_key(&req.key)?;
    let log = state.supervisor.tail_log(&key).await?;
    Ok(Json(json!({
        "success": true,
        "key": key,
        "log": log,
        "message": format!("Logs for {}:\n{}", key, log),
    })))
}
