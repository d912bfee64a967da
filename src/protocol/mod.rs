//! 聊天协议边界
//!
//! 协议客户端本身（配对、加密、线格式）由外部库提供；引擎只依赖这里的窄接口：
//! - [`SessionConnector`]: 为一个会话 id 建立连接，返回发送原语与事件流
//! - [`ProtocolSession`]: send / sign_out / terminate
//! - [`TransportEvent`]: 配对挑战、认证成功、传输关闭

mod dry_run;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::SendError;

pub use dry_run::{DryRunConnector, SentRecord};

/// 传输关闭原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// 账号主动登出：终态，不重连
    LoggedOut,
    /// 连接丢失、被替换、服务端重启等：可重连
    ConnectionLost(String),
}

impl CloseReason {
    pub fn is_logout(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LoggedOut => write!(f, "logged out"),
            CloseReason::ConnectionLost(detail) => write!(f, "connection lost: {}", detail),
        }
    }
}

/// 协议层推送的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 新的配对码（QR / pairing code）
    PairingChallenge { code: String },
    /// 认证成功；account_id 为握手得到的真实账号（可能缺失）
    Authenticated {
        account_id: Option<String>,
        display_name: Option<String>,
    },
    TransportClosed { reason: CloseReason },
}

/// 发送成功后的回执
#[derive(Debug, Clone, Serialize)]
pub struct MessageRef {
    pub id: String,
    pub to: String,
    pub sent_at: DateTime<Utc>,
}

/// 一个已建立的协议会话（一个外呼账号）
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    async fn send(&self, destination: &str, body: &str) -> Result<MessageRef, SendError>;

    /// 正常登出（解除设备绑定）
    async fn sign_out(&self) -> anyhow::Result<()>;

    /// 强制关闭底层连接，不做登出
    async fn terminate(&self) -> anyhow::Result<()>;
}

/// 一次连接的产物：发送原语 + 事件流
pub struct Connection {
    pub session: Arc<dyn ProtocolSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// 建立协议连接
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, session_id: &str) -> anyhow::Result<Connection>;
}
