//! 全局发送策略：允许的星期与暂停开关，运行时可修改

use serde::Serialize;
use tokio::sync::RwLock;

use crate::core::EngineError;

/// 默认周一到周五（0 = 周日 … 6 = 周六）
pub fn default_allowed_days() -> Vec<u32> {
    vec![1, 2, 3, 4, 5]
}

/// 校验星期列表：非空、取值 0..=6；返回去重并排序后的结果
pub fn normalize_days(days: &[u32]) -> Result<Vec<u32>, EngineError> {
    if days.is_empty() {
        return Err(EngineError::InvalidPolicy(
            "allowed days must contain at least one day".to_string(),
        ));
    }
    if let Some(bad) = days.iter().find(|d| **d > 6) {
        return Err(EngineError::InvalidPolicy(format!(
            "day {} is out of range, expected 0 (Sunday) to 6 (Saturday)",
            bad
        )));
    }
    let mut days = days.to_vec();
    days.sort_unstable();
    days.dedup();
    Ok(days)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySnapshot {
    pub allowed_days: Vec<u32>,
    pub paused: bool,
}

#[derive(Debug)]
pub struct GlobalSendPolicy {
    allowed_days: RwLock<Vec<u32>>,
    paused: RwLock<bool>,
}

impl GlobalSendPolicy {
    pub fn new(allowed_days: &[u32], paused: bool) -> Result<Self, EngineError> {
        Ok(Self {
            allowed_days: RwLock::new(normalize_days(allowed_days)?),
            paused: RwLock::new(paused),
        })
    }

    pub async fn allowed_days(&self) -> Vec<u32> {
        self.allowed_days.read().await.clone()
    }

    pub async fn set_allowed_days(&self, days: &[u32]) -> Result<Vec<u32>, EngineError> {
        let days = normalize_days(days)?;
        *self.allowed_days.write().await = days.clone();
        tracing::info!(?days, "Allowed send days updated");
        Ok(days)
    }

    pub async fn is_day_allowed(&self, weekday: u32) -> bool {
        self.allowed_days.read().await.contains(&weekday)
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.read().await
    }

    pub async fn pause(&self) {
        *self.paused.write().await = true;
        tracing::info!("Delivery paused");
    }

    pub async fn resume(&self) {
        *self.paused.write().await = false;
        tracing::info!("Delivery resumed");
    }

    pub async fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            allowed_days: self.allowed_days().await,
            paused: self.is_paused().await,
        }
    }
}

impl Default for GlobalSendPolicy {
    fn default() -> Self {
        Self {
            allowed_days: RwLock::new(default_allowed_days()),
            paused: RwLock::new(false),
        }
    }
}
