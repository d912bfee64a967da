//! 定时投递
//!
//! - **policy**: 全局发送策略（允许的星期、暂停）
//! - **pacing**: 发送间隔（分配窗口均摊 + 抖动 / 立即全发）
//! - **phase**: 账号阶段推进
//! - **phone**: 目标号码规范化
//! - **scheduler**: 批次调度器

pub mod pacing;
pub mod phase;
pub mod phone;
pub mod policy;
pub mod scheduler;

pub use pacing::{DeliveryMode, PacingConfig};
pub use phase::{PhaseChange, PhaseRefreshReport};
pub use policy::{GlobalSendPolicy, PolicySnapshot};
pub use scheduler::{
    AccountTally, BatchOutcome, BatchReport, DeliveryScheduler, SchedulerConfig, SchedulerStatus,
};
