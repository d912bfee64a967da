//! 引擎构建器：按配置装配存储、会话池、生命周期控制器、调度器与操作面
//!
//! 所有服务以 Arc 显式注入，没有全局单例。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::control::ControlSurface;
use crate::core::EngineError;
use crate::delivery::{DeliveryScheduler, GlobalSendPolicy};
use crate::lifecycle::LifecycleController;
use crate::pool::SessionPool;
use crate::protocol::{DryRunConnector, SessionConnector};
use crate::store::{MemoryStore, Store};

/// 装配好的引擎
pub struct Engine {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub pool: Arc<SessionPool>,
    pub policy: Arc<GlobalSendPolicy>,
    pub lifecycle: Arc<LifecycleController>,
    pub scheduler: Arc<DeliveryScheduler>,
    pub control: Arc<ControlSurface>,
}

pub struct EngineBuilder {
    config: AppConfig,
    store: Option<Arc<dyn Store>>,
    connector: Option<Arc<dyn SessionConnector>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            connector: None,
        }
    }

    /// 未设置时使用内存存储
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// 未设置时使用 dry-run 连接器
    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::default()),
        };
        let connector: Arc<dyn SessionConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(DryRunConnector::new()),
        };

        let policy = Arc::new(GlobalSendPolicy::new(
            &config.policy.allowed_days,
            config.policy.paused,
        )?);
        let pool = Arc::new(SessionPool::new(config.pool_limits()));
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            connector,
            config.lifecycle(),
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&policy),
            config.scheduler(),
        ));
        let control = Arc::new(ControlSurface::new(
            Arc::clone(&lifecycle),
            Arc::clone(&scheduler),
            Arc::clone(&store),
        ));

        tracing::info!(
            max_sending = config.pool.max_sending,
            max_pairing = config.pool.max_pairing,
            allowed_days = ?config.policy.allowed_days,
            "Engine assembled"
        );

        Ok(Engine {
            config,
            store,
            pool,
            policy,
            lifecycle,
            scheduler,
            control,
        })
    }
}

/// 按 [storage] 段打开存储：启用 async-sqlite 且配置了路径时使用 SQLite
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    #[cfg(feature = "async-sqlite")]
    {
        if let Some(path) = &config.storage.sqlite_path {
            use anyhow::Context;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory {}", parent.display())
                })?;
            }
            let store = crate::store::SqliteStore::open(path)
                .await
                .with_context(|| format!("Failed to open SQLite store at {}", path.display()))?;
            tracing::info!(path = %path.display(), "Using SQLite store");
            return Ok(Arc::new(store));
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    {
        if config.storage.sqlite_path.is_some() {
            tracing::warn!("storage.sqlite_path is set but the async-sqlite feature is disabled");
        }
    }

    tracing::info!("Using in-memory store");
    Ok(Arc::new(MemoryStore::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_policy_rejected_at_build() {
        let mut config = AppConfig::default();
        config.policy.allowed_days = vec![9];
        assert!(matches!(
            EngineBuilder::new(config).build(),
            Err(EngineError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected_at_build() {
        let mut config = AppConfig::default();
        config.delivery.interval_secs = 0;
        let err = EngineBuilder::new(config).build().err().unwrap();
        assert_eq!(err.code(), "invalid_config");
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_unusable_storage_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = AppConfig::default();
        config.storage.sqlite_path = Some(blocker.join("outreach.db"));
        let err = open_store(&config).await.err().unwrap();
        assert!(err.to_string().contains("storage directory"));
    }

    #[tokio::test]
    async fn test_default_engine_uses_configured_limits() {
        let mut config = AppConfig::default();
        config.pool.max_sending = 3;
        let engine = EngineBuilder::new(config).build().unwrap();
        assert_eq!(engine.pool.limits().max_sending, 3);
        assert!(!engine.scheduler.is_running());
        assert!(open_store(&engine.config).await.is_ok());
    }
}
