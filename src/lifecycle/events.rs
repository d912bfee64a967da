//! 会话生命周期事件：经 broadcast 通道推送给控制面与等待者

use serde::Serialize;

use crate::pool::SessionClass;

/// 生命周期事件（可序列化为 JSON 供外部展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// 会话已登记，正在连接
    Created {
        session_id: String,
        class: SessionClass,
        ephemeral: bool,
    },
    /// 新的配对码（attempt 从 1 开始）
    PairingCode {
        session_id: String,
        code: String,
        attempt: u32,
    },
    /// 认证完成，可发送
    Ready {
        temp_id: String,
        real_id: String,
        display_name: String,
    },
    /// 连接丢失，退避后原地重连
    Reconnecting { session_id: String, reason: String },
    /// 正常关闭（登出 / 重置）
    Closed {
        session_id: String,
        account_id: String,
        reason: String,
    },
    /// 强制关闭（配对次数耗尽、重连失败、身份冲突）
    Terminated {
        session_id: String,
        account_id: String,
        reason: String,
    },
}

impl LifecycleEvent {
    /// 事件所属会话的 temp_id
    pub fn session_id(&self) -> &str {
        match self {
            LifecycleEvent::Created { session_id, .. }
            | LifecycleEvent::PairingCode { session_id, .. }
            | LifecycleEvent::Reconnecting { session_id, .. }
            | LifecycleEvent::Closed { session_id, .. }
            | LifecycleEvent::Terminated { session_id, .. } => session_id,
            LifecycleEvent::Ready { temp_id, .. } => temp_id,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Closed { .. } | LifecycleEvent::Terminated { .. }
        )
    }
}
