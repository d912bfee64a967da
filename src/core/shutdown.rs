//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后：停止周期批次，登出（或强制关闭）全部会话，再退出。
//! 清理任务各自有超时，单个任务失败不影响其他任务。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::delivery::DeliveryScheduler;
use crate::lifecycle::LifecycleController;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 主应用自行结束
    AppFinished,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 关闭 token：后台循环（批次、维护）以它为退出条件
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 只有第一次调用会记录原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_token.is_cancelled() {
            tracing::info!(?reason, "Shutdown requested");
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止周期批次循环
pub struct SchedulerStopCleanup {
    scheduler: Arc<DeliveryScheduler>,
}

impl SchedulerStopCleanup {
    pub fn new(scheduler: Arc<DeliveryScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerStopCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.scheduler.stop();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeliveryScheduler"
    }
}

/// 登出全部会话
pub struct SessionResetCleanup {
    lifecycle: Arc<LifecycleController>,
}

impl SessionResetCleanup {
    pub fn new(lifecycle: Arc<LifecycleController>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionResetCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let report = self.lifecycle.reset_all().await;
        tracing::info!("Closed {} session(s) on shutdown", report.total);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SessionPool"
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(coordinator: ShutdownCoordinator, app: F)
where
    F: Future<Output = ()>,
{
    let manager = Arc::clone(coordinator.manager());
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    // 后台循环以 token 为退出条件
    manager.shutdown(ShutdownReason::AppFinished);
    coordinator.run_cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{GlobalSendPolicy, SchedulerConfig};
    use crate::lifecycle::{CreateSession, LifecycleConfig};
    use crate::pool::{PoolLimits, SessionPool};
    use crate::protocol::DryRunConnector;
    use crate::store::{MemoryStore, Store};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    struct Stalled;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stalled {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_resets_sessions_and_stops_loop() {
        let store = Arc::new(MemoryStore::default());
        let pool = Arc::new(SessionPool::new(PoolLimits::default()));
        let connector = DryRunConnector::new();
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&pool),
            store.clone(),
            Arc::new(connector.clone()),
            LifecycleConfig::default(),
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            store,
            Arc::clone(&pool),
            Arc::new(GlobalSendPolicy::default()),
            SchedulerConfig::default(),
        ));

        lifecycle
            .create_session(CreateSession::sending("a"))
            .await
            .unwrap();
        assert!(scheduler.start());

        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(Stalled);
        coordinator.register(SchedulerStopCleanup::new(Arc::clone(&scheduler)));
        coordinator.register(SessionResetCleanup::new(lifecycle));
        coordinator.run_cleanup().await;

        assert!(!scheduler.is_running());
        assert!(pool.is_empty());
        assert_eq!(connector.signed_out(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sign_outs_all_closed_within_cleanup_timeout() {
        let ids = ["a", "b", "c", "d"];
        let connector = ids
            .iter()
            .fold(DryRunConnector::new(), |c, id| c.stall_sign_out(id));
        let store = Arc::new(MemoryStore::default());
        let pool = Arc::new(SessionPool::new(PoolLimits {
            max_sending: 4,
            max_pairing: 2,
        }));
        let config = LifecycleConfig::default();
        let grace = config.sign_out_grace;
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&pool),
            store.clone(),
            Arc::new(connector.clone()),
            config,
        ));
        let mut rx = lifecycle.subscribe();
        for id in ids {
            lifecycle
                .create_session(CreateSession::sending(id))
                .await
                .unwrap();
        }
        let mut ready = 0;
        while ready < ids.len() {
            if let crate::lifecycle::LifecycleEvent::Ready { .. } = rx.recv().await.unwrap() {
                ready += 1;
            }
        }

        let mut coordinator =
            ShutdownCoordinator::new(Arc::new(ShutdownManager::new())).with_timeout(grace * 3);
        coordinator.register(SessionResetCleanup::new(lifecycle));
        coordinator.run_cleanup().await;

        assert!(pool.is_empty());
        let mut terminated = connector.terminated();
        terminated.sort();
        assert_eq!(terminated, vec!["a", "b", "c", "d"]);
        for id in ids {
            let account = store.get_account(id).await.unwrap().unwrap();
            assert_eq!(account.status, crate::store::AccountStatus::Inactive);
        }
    }
}
