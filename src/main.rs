use std::sync::Arc;

use gitbot_core::config::GlobalConfig;
use gitbot_core::ipc::IPCServer;
use gitbot_core::process_monitor;
use gitbot_core::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("gitbot daemon starting");

    let cfg = GlobalConfig::load()?;

    for dir in [&cfg.base_dir, &cfg.logs_dir] {
        std::fs::create_dir_all(dir)?;
    }

    let supervisor = Arc::new(Supervisor::new(&cfg));
    if let Err(e) = supervisor.initialize().await {
        tracing::warn!("Failed to restore repository state: {:#}", e);
    }

    // 이전 데몬이 남긴 봇 프로세스는 레지스트리에 없으므로 경고만 남김
    for orphan in process_monitor::find_orphans_async(supervisor.base_dir()).await {
        tracing::warn!(
            "Bot process from a previous run is still alive: pid {} ({})",
            orphan.pid,
            orphan.cmd.join(" ")
        );
    }

    // Graceful shutdown: Ctrl+C 시 모든 봇 종료
    let supervisor_shutdown = supervisor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping bots...");
        supervisor_shutdown.shutdown().await;
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let ipc_server = IPCServer::new(supervisor.clone(), &cfg.listen_addr);
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    supervisor.shutdown().await;
    tracing::info!("gitbot daemon shutting down");
    Ok(())
}
