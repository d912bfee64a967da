//! 操作面：供外部 HTTP 层调用的成功/失败信封 API
//!
//! 每个操作返回 [`ApiResponse`]；失败时带稳定的错误码与可操作的提示，
//! 容量不足（capacity_exceeded）与一般错误区分开。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::EngineError;
use crate::delivery::{DeliveryMode, DeliveryScheduler, PolicySnapshot, SchedulerStatus};
use crate::lifecycle::{CreateSession, LifecycleController};
use crate::pool::{ResetOutcome, ResetReport, SessionClass, SessionStatus};
use crate::store::{Account, PhasePolicy, Store};

/// 失败详情
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&EngineError> for ApiError {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
            retry_after_secs: e.retry_after().map(|d| d.as_secs()),
        }
    }
}

/// 统一响应信封
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(err: &EngineError) -> Self {
        Self {
            success: false,
            message: hint(err),
            data: None,
            error: Some(ApiError::from(err)),
        }
    }

    fn from_result(result: Result<T, EngineError>, message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok(message, data),
            Err(e) => Self::fail(&e),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "success": false, "message": e.to_string() })
        })
    }
}

/// 面向操作者的提示：说明下一步怎么做
fn hint(err: &EngineError) -> String {
    match err {
        EngineError::CapacityExceeded { class, current, max } => format!(
            "All {} slots are in use ({}/{}). Sign out a session or try again later.",
            class, current, max
        ),
        EngineError::PairingCooldownActive { remaining_secs, .. } => format!(
            "A pairing code was issued recently. Scan it or wait {}s before requesting a new one.",
            remaining_secs
        ),
        EngineError::PairingTimeout { .. } => {
            "No pairing code yet; the session is still starting. Poll the pairing code again."
                .to_string()
        }
        EngineError::InitInProgress(_) => {
            "This session is already being initialized; poll its status.".to_string()
        }
        EngineError::BatchAlreadyRunning => {
            "A delivery batch is already running; try again when it finishes.".to_string()
        }
        EngineError::SessionNotFound(_) => {
            "Session not found; initialize it again.".to_string()
        }
        other => other.to_string(),
    }
}

/// 会话配对码视图
#[derive(Debug, Clone, Serialize)]
pub struct PairingView {
    pub session_id: String,
    pub code: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotUsage {
    pub in_use: usize,
    pub max: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountOverview {
    #[serde(flatten)]
    pub account: Account,
    pub policy: Option<PhasePolicy>,
    pub remaining_today: u32,
    pub has_session: bool,
    pub ready: bool,
    pub can_send: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub accounts: Vec<AccountOverview>,
    pub sending_slots: SlotUsage,
    pub pairing_slots: SlotUsage,
    pub scheduler: SchedulerStatus,
}

pub struct ControlSurface {
    lifecycle: Arc<LifecycleController>,
    scheduler: Arc<DeliveryScheduler>,
    store: Arc<dyn Store>,
}

impl ControlSurface {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        scheduler: Arc<DeliveryScheduler>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            lifecycle,
            scheduler,
            store,
        }
    }

    pub async fn create_session(&self, req: CreateSession) -> ApiResponse<SessionStatus> {
        let result = self.lifecycle.create_session(req).await;
        let message = match &result {
            Ok(status) if status.ready => "Session already connected",
            _ => "Session accepted; waiting for pairing",
        };
        ApiResponse::from_result(result, message)
    }

    pub async fn session_status(&self, id: &str) -> ApiResponse<SessionStatus> {
        ApiResponse::from_result(self.lifecycle.status(id).await, "Session status")
    }

    pub async fn list_sessions(&self) -> ApiResponse<Vec<SessionStatus>> {
        ApiResponse::ok("Live sessions", self.lifecycle.pool().snapshot().await)
    }

    pub async fn pairing_code(&self, id: &str) -> ApiResponse<PairingView> {
        let result = self.lifecycle.status(id).await.map(|status| PairingView {
            session_id: status.temp_id,
            code: status.pairing_code,
            ready: status.ready,
        });
        ApiResponse::from_result(result, "Pairing code")
    }

    /// 等待配对码（timeout 为空时使用配置的默认值）
    pub async fn await_pairing_code(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> ApiResponse<PairingView> {
        let timeout = timeout.unwrap_or(self.lifecycle.config().pairing_wait_timeout);
        let result = match self.lifecycle.await_pairing_code(id, timeout).await {
            Ok(code) => Ok(PairingView {
                session_id: id.to_string(),
                ready: code.is_none(),
                code,
            }),
            Err(e) => Err(e),
        };
        ApiResponse::from_result(result, "Pairing code")
    }

    pub async fn sign_out(&self, id: &str) -> ApiResponse<ResetOutcome> {
        ApiResponse::from_result(self.lifecycle.sign_out(id).await, "Session signed out")
    }

    pub async fn reset_all(&self) -> ApiResponse<ResetReport> {
        let report = self.lifecycle.reset_all().await;
        let message = format!("{} session(s) reset", report.total);
        ApiResponse::ok(message, report)
    }

    pub async fn pause(&self) -> ApiResponse<PolicySnapshot> {
        self.scheduler.policy().pause().await;
        ApiResponse::ok("Delivery paused", self.scheduler.policy().snapshot().await)
    }

    pub async fn resume(&self) -> ApiResponse<PolicySnapshot> {
        self.scheduler.policy().resume().await;
        ApiResponse::ok("Delivery resumed", self.scheduler.policy().snapshot().await)
    }

    /// 立即在后台处理一个批次
    pub fn force_process(&self) -> ApiResponse<()> {
        ApiResponse::from_result(
            self.scheduler.trigger(DeliveryMode::Paced),
            "Batch started",
        )
    }

    /// 以短间隔发送全部待发消息（仍受星期、暂停与每日上限约束）
    pub fn send_all_now(&self) -> ApiResponse<()> {
        ApiResponse::from_result(
            self.scheduler.trigger(DeliveryMode::SendAllNow),
            "Send-all batch started",
        )
    }

    pub async fn allowed_days(&self) -> ApiResponse<Vec<u32>> {
        ApiResponse::ok(
            "Allowed send days",
            self.scheduler.policy().allowed_days().await,
        )
    }

    pub async fn set_allowed_days(&self, days: &[u32]) -> ApiResponse<Vec<u32>> {
        ApiResponse::from_result(
            self.scheduler.policy().set_allowed_days(days).await,
            "Allowed send days updated",
        )
    }

    pub async fn scheduler_status(&self) -> ApiResponse<SchedulerStatus> {
        ApiResponse::ok("Scheduler status", self.scheduler.status().await)
    }

    pub async fn queue_overview(&self) -> ApiResponse<QueueOverview> {
        let result = self.build_overview().await;
        ApiResponse::from_result(result, "Queue overview")
    }

    async fn build_overview(&self) -> Result<QueueOverview, EngineError> {
        let pool = self.lifecycle.pool();
        let mut accounts = Vec::new();
        for account in self.store.list_accounts().await? {
            let policy = self.store.get_phase_policy(account.phase).await?;
            let remaining_today = policy
                .as_ref()
                .map(|p| p.remaining(account.messages_sent_today))
                .unwrap_or(0);
            let has_session = pool.contains(&account.id);
            let ready = pool.ready_transport(&account.id).await.is_some();
            let can_send = account.is_active() && ready && remaining_today > 0;
            accounts.push(AccountOverview {
                account,
                policy,
                remaining_today,
                has_session,
                ready,
                can_send,
            });
        }

        let usage = |class: SessionClass| SlotUsage {
            in_use: pool.occupancy(class),
            max: pool.limits().max_for(class),
            available: pool.available_slots(class),
        };
        Ok(QueueOverview {
            accounts,
            sending_slots: usage(SessionClass::Sending),
            pairing_slots: usage(SessionClass::Pairing),
            scheduler: self.scheduler.status().await,
        })
    }
}
