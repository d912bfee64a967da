//! outreach 守护进程
//!
//! 入口：加载配置、初始化日志、装配引擎，启动周期批次与维护循环，
//! 收到 Ctrl+C / SIGTERM 后停止调度并登出全部会话。
//!
//! 用法: outreach [config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use outreach::config::load_config;
use outreach::core::{
    open_store, run_with_graceful_shutdown, EngineBuilder, SchedulerStopCleanup,
    SessionResetCleanup, ShutdownCoordinator, ShutdownManager,
};
use outreach::observability;
use outreach::protocol::DryRunConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    if !config.app.dry_run {
        anyhow::bail!(
            "No chat protocol client is linked into this build; set app.dry_run = true \
             or embed the engine with your own SessionConnector"
        );
    }
    tracing::info!("Running in dry-run mode: sends are logged, not delivered");

    let store = open_store(&config).await?;
    let engine = EngineBuilder::new(config)
        .with_store(store)
        .with_connector(Arc::new(DryRunConnector::new()))
        .build()
        .context("Failed to assemble engine")?;

    let shutdown = Arc::new(ShutdownManager::new());

    // 生命周期事件以 JSON 行写入日志
    let mut events = engine.lifecycle.subscribe();
    let token = shutdown.token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let json = serde_json::to_string(&event).unwrap_or_default();
                        tracing::info!(target: "outreach::events", "{}", json);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {} lifecycle events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    if engine.config.app.autostart_scheduler {
        engine.scheduler.start();
    }
    let maintenance = engine.scheduler.spawn_maintenance(shutdown.token());

    let sign_out_grace = engine.config.lifecycle().sign_out_grace;
    let mut coordinator =
        ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(sign_out_grace * 3);
    coordinator.register(SchedulerStopCleanup::new(Arc::clone(&engine.scheduler)));
    coordinator.register(SessionResetCleanup::new(Arc::clone(&engine.lifecycle)));

    let wait_token = shutdown.token();
    run_with_graceful_shutdown(coordinator, async move {
        wait_token.cancelled().await;
    })
    .await;

    let _ = maintenance.await;
    tracing::info!("outreach stopped");
    Ok(())
}
