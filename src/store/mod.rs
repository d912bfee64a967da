//! 持久化边界：账号、阶段策略、待发消息
//!
//! 引擎只通过 [`Store`] 的访问方法读写计数、阶段与状态，不直接改字段。
//! - **memory**: 内存实现（默认；测试与 dry-run 使用）
//! - **sqlite**: sqlx 异步 SQLite 实现（feature = "async-sqlite"）

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

/// 分配窗口缺省小时数（策略未配置时）
pub const DEFAULT_WINDOW_HOURS: u32 = 8;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 账号状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => AccountStatus::Active,
            _ => AccountStatus::Inactive,
        }
    }
}

/// 一个外呼账号（持久化记录）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub display_name: String,
    pub status: AccountStatus,
    pub phase: u32,
    pub phase_started_on: NaiveDate,
    pub messages_sent_today: u32,
    pub messages_sent_total: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Account {
    /// 新账号：处于首个阶段、今天开始计时
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, today: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            status: AccountStatus::Active,
            phase: 1,
            phase_started_on: today,
            messages_sent_today: 0,
            messages_sent_total: 0,
            last_activity_at: Some(now),
            registered_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// 阶段策略：每日上限、持续天数（0 = 不限）、分配窗口（小时）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePolicy {
    pub phase: u32,
    pub daily_cap: u32,
    pub duration_days: u32,
    pub distribution_window_hours: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl PhasePolicy {
    pub fn new(phase: u32, daily_cap: u32, duration_days: u32, window_hours: u32) -> Self {
        Self {
            phase,
            daily_cap,
            duration_days,
            distribution_window_hours: window_hours,
            description: None,
        }
    }

    pub fn window(&self) -> Duration {
        let hours = if self.distribution_window_hours == 0 {
            DEFAULT_WINDOW_HOURS
        } else {
            self.distribution_window_hours
        };
        Duration::from_secs(u64::from(hours) * 3600)
    }

    /// 今日剩余额度
    pub fn remaining(&self, sent_today: u32) -> u32 {
        self.daily_cap.saturating_sub(sent_today)
    }

    pub fn is_unlimited(&self) -> bool {
        self.duration_days == 0
    }
}

/// 预热阶段的默认阶梯
pub fn default_phases() -> Vec<PhasePolicy> {
    vec![
        PhasePolicy::new(1, 20, 7, 8),
        PhasePolicy::new(2, 40, 7, 8),
        PhasePolicy::new(3, 80, 14, 10),
        PhasePolicy::new(4, 150, 0, 12),
    ]
}

/// 消息失败种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageErrorKind {
    /// 号码不在网络中（永久）
    DestinationUnreachable,
    /// 临时失败，后续批次可重试
    TransientSendFailure,
    /// 没有可用号码或号码无法格式化（永久）
    InvalidDestination,
}

impl MessageErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MessageErrorKind::TransientSendFailure)
    }
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed(MessageErrorKind),
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed(MessageErrorKind::DestinationUnreachable) => {
                "destination_unreachable"
            }
            MessageStatus::Failed(MessageErrorKind::TransientSendFailure) => {
                "transient_send_failure"
            }
            MessageStatus::Failed(MessageErrorKind::InvalidDestination) => "invalid_destination",
        }
    }

    /// 未知值返回 None：空/NULL 状态视为数据问题，不当作 pending
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "destination_unreachable" => {
                Some(MessageStatus::Failed(MessageErrorKind::DestinationUnreachable))
            }
            "transient_send_failure" => {
                Some(MessageStatus::Failed(MessageErrorKind::TransientSendFailure))
            }
            "invalid_destination" => {
                Some(MessageStatus::Failed(MessageErrorKind::InvalidDestination))
            }
            _ => None,
        }
    }

    /// 是否可被调度器领取
    pub fn is_claimable(&self) -> bool {
        match self {
            MessageStatus::Pending => true,
            MessageStatus::Failed(kind) => kind.is_retryable(),
            MessageStatus::Sent => false,
        }
    }
}

/// 待发消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: i64,
    /// 号码按优先级排列：主号、手机、公司、其他
    pub phones: Vec<String>,
    pub contact_name: Option<String>,
    pub company: Option<String>,
    /// 定制文案；为空时使用问候模板
    pub body: Option<String>,
    pub status: MessageStatus,
    pub error_detail: Option<String>,
    pub account_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl PendingMessage {
    pub fn new(id: i64, phone: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            phones: vec![phone.into()],
            contact_name: None,
            company: None,
            body: Some(body.into()),
            status: MessageStatus::Pending,
            error_detail: None,
            account_id: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    /// 第一个非空号码
    pub fn destination(&self) -> Option<&str> {
        self.phones
            .iter()
            .map(|p| p.trim())
            .find(|p| !p.is_empty())
    }

    /// 实际发送的文本
    pub fn text(&self) -> String {
        match self.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => body.to_string(),
            _ => format!(
                "Hola {}, te contactamos desde {}.",
                self.contact_name.as_deref().unwrap_or(""),
                self.company.as_deref().unwrap_or("nuestra empresa")
            ),
        }
    }
}

/// 持久化接口（外部存储边界）
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>>;

    /// 所有账号（按注册时间倒序）
    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// 活跃账号（阶段降序）
    async fn list_active_accounts(&self) -> StoreResult<Vec<Account>>;

    /// 新建或更新：更新时改名、置为 active、刷新活动时间
    async fn upsert_account(&self, id: &str, display_name: &str) -> StoreResult<Account>;

    /// 原地改 id（临时 id → 真实 id），保留阶段与计数
    async fn rename_account(&self, old_id: &str, new_id: &str, display_name: &str)
        -> StoreResult<Account>;

    async fn delete_account(&self, id: &str) -> StoreResult<bool>;

    async fn set_account_status(&self, id: &str, status: AccountStatus) -> StoreResult<()>;

    async fn set_account_phase(
        &self,
        id: &str,
        phase: u32,
        started_on: NaiveDate,
    ) -> StoreResult<Account>;

    /// 原子递增今日与累计计数
    async fn increment_counters(&self, id: &str, n: u32) -> StoreResult<()>;

    /// 所有账号今日计数归零，返回受影响账号数
    async fn reset_daily_counters(&self) -> StoreResult<usize>;

    /// 可领取的消息（pending 与可重试失败），按创建时间升序
    async fn get_pending_messages(&self, limit: usize) -> StoreResult<Vec<PendingMessage>>;

    async fn mark_message(
        &self,
        id: i64,
        status: MessageStatus,
        error_detail: Option<String>,
        account_id: Option<&str>,
    ) -> StoreResult<()>;

    async fn get_phase_policy(&self, phase: u32) -> StoreResult<Option<PhasePolicy>>;

    /// 严格大于 phase 的下一个阶段
    async fn next_phase_policy(&self, phase: u32) -> StoreResult<Option<PhasePolicy>>;

    async fn list_phase_policies(&self) -> StoreResult<Vec<PhasePolicy>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_rejects_blank() {
        assert_eq!(MessageStatus::parse("pending"), Some(MessageStatus::Pending));
        assert_eq!(MessageStatus::parse(""), None);
        let unreachable = MessageStatus::Failed(MessageErrorKind::DestinationUnreachable);
        assert_eq!(MessageStatus::parse(unreachable.as_str()), Some(unreachable));
    }

    #[test]
    fn test_claimable_statuses() {
        assert!(MessageStatus::Pending.is_claimable());
        assert!(MessageStatus::Failed(MessageErrorKind::TransientSendFailure).is_claimable());
        assert!(!MessageStatus::Failed(MessageErrorKind::DestinationUnreachable).is_claimable());
        assert!(!MessageStatus::Sent.is_claimable());
    }

    #[test]
    fn test_destination_falls_back_to_next_phone() {
        let mut msg = PendingMessage::new(1, "  ", "hi");
        msg.phones.push("5215550001111".into());
        assert_eq!(msg.destination(), Some("5215550001111"));
    }

    #[test]
    fn test_text_template_when_body_missing() {
        let mut msg = PendingMessage::new(1, "5215550001111", "");
        msg.contact_name = Some("Ana".into());
        assert_eq!(msg.text(), "Hola Ana, te contactamos desde nuestra empresa.");
    }

    #[test]
    fn test_policy_window_defaults() {
        let policy = PhasePolicy::new(1, 20, 7, 0);
        assert_eq!(policy.window(), Duration::from_secs(8 * 3600));
        assert_eq!(policy.remaining(25), 0);
    }
}
