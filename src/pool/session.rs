//! 单个协议会话的记录与状态
//!
//! 会话由 SessionPool 独占持有；real_id 一旦写入，在会话存活期间不再改变。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::ProtocolSession;

/// 容量池类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionClass {
    /// 用于外呼发送
    Sending,
    /// 仅用于配对/登记
    Pairing,
}

impl std::fmt::Display for SessionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionClass::Sending => write!(f, "sending"),
            SessionClass::Pairing => write!(f, "pairing"),
        }
    }
}

/// 会话状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    AwaitingPairing,
    Ready,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    /// 仍处于配对流程（可接收新的配对码）
    pub fn is_pairing(&self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::AwaitingPairing)
    }
}

/// 当前有效的配对码
#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub issued_at: Instant,
    pub issued_at_utc: DateTime<Utc>,
}

/// 单个会话
pub struct Session {
    pub temp_id: String,
    real_id: Option<String>,
    pub class: SessionClass,
    pub state: SessionState,
    pub display_name: Option<String>,
    pub pairing: Option<PairingCode>,
    pub pairing_attempts: u32,
    /// 仅登记用：Ready 后自动登出
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
    transport: Option<Arc<dyn ProtocolSession>>,
    lifetime: CancellationToken,
    pending_sign_out: Option<CancellationToken>,
}

impl Session {
    pub fn new(
        temp_id: impl Into<String>,
        class: SessionClass,
        display_name: Option<String>,
        ephemeral: bool,
        transport: Arc<dyn ProtocolSession>,
    ) -> Self {
        Self {
            temp_id: temp_id.into(),
            real_id: None,
            class,
            state: SessionState::Initializing,
            display_name,
            pairing: None,
            pairing_attempts: 0,
            ephemeral,
            created_at: Utc::now(),
            transport: Some(transport),
            lifetime: CancellationToken::new(),
            pending_sign_out: None,
        }
    }

    pub fn real_id(&self) -> Option<&str> {
        self.real_id.as_deref()
    }

    /// 权威账号 id：已配对时为 real_id，否则为 temp_id
    pub fn account_id(&self) -> &str {
        self.real_id.as_deref().unwrap_or(&self.temp_id)
    }

    /// 仅在尚未设置（或相同）时写入；返回是否生效
    pub fn bind_real_id(&mut self, real_id: &str) -> bool {
        match &self.real_id {
            None => {
                self.real_id = Some(real_id.to_string());
                true
            }
            Some(existing) => existing == real_id,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// 距离上一个配对码仍在冷却期内时返回剩余时长
    pub fn pairing_cooldown_remaining(&self, cooldown: Duration) -> Option<Duration> {
        let pairing = self.pairing.as_ref()?;
        let elapsed = pairing.issued_at.elapsed();
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    pub fn record_pairing_code(&mut self, code: String) {
        self.pairing = Some(PairingCode {
            code,
            issued_at: Instant::now(),
            issued_at_utc: Utc::now(),
        });
        self.pairing_attempts += 1;
        self.state = SessionState::AwaitingPairing;
    }

    pub fn clear_pairing(&mut self) {
        self.pairing = None;
        self.pairing_attempts = 0;
    }

    pub fn transport(&self) -> Option<Arc<dyn ProtocolSession>> {
        self.transport.clone()
    }

    pub fn take_transport(&mut self) -> Option<Arc<dyn ProtocolSession>> {
        self.transport.take()
    }

    pub fn replace_transport(&mut self, transport: Arc<dyn ProtocolSession>) {
        self.transport = Some(transport);
    }

    /// 会话生命周期令牌：释放时取消，驱动任务与定时器随之结束
    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    /// 挂上一个可取消的延迟登出；返回其令牌（旧的会被取消）
    pub fn arm_sign_out(&mut self) -> CancellationToken {
        self.cancel_pending_sign_out();
        let token = self.lifetime.child_token();
        self.pending_sign_out = Some(token.clone());
        token
    }

    pub fn cancel_pending_sign_out(&mut self) {
        if let Some(token) = self.pending_sign_out.take() {
            token.cancel();
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            temp_id: self.temp_id.clone(),
            real_id: self.real_id.clone(),
            class: self.class,
            state: self.state,
            ready: self.is_ready(),
            display_name: self.display_name.clone(),
            pairing_code: self.pairing.as_ref().map(|p| p.code.clone()),
            pairing_issued_at: self.pairing.as_ref().map(|p| p.issued_at_utc),
            pairing_attempts: self.pairing_attempts,
            ephemeral: self.ephemeral,
            created_at: self.created_at,
        }
    }
}

/// 会话状态快照（对外展示）
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub temp_id: String,
    pub real_id: Option<String>,
    pub class: SessionClass,
    pub state: SessionState,
    pub ready: bool,
    pub display_name: Option<String>,
    pub pairing_code: Option<String>,
    pub pairing_issued_at: Option<DateTime<Utc>>,
    pub pairing_attempts: u32,
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
}
