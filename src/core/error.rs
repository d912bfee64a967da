//! 引擎错误类型
//!
//! 与控制面配合：每个 EngineError 给出稳定的 code() 与可选的 retry_after()，
//! 由 control 模块翻译为可操作的提示（剩余容量、冷却秒数、重试方式）。

use std::time::Duration;

use thiserror::Error;

use crate::pool::SessionClass;
use crate::store::{MessageErrorKind, StoreError};

/// 会话池、生命周期与调度器对外暴露的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No capacity for a new {class} session ({current}/{max} in use)")]
    CapacityExceeded {
        class: SessionClass,
        current: usize,
        max: usize,
    },

    /// 等待配对码超时；会话仍在后台初始化，调用方可重新轮询
    #[error("Timed out after {waited_secs}s waiting for a pairing code for {id}; poll again")]
    PairingTimeout { id: String, waited_secs: u64 },

    #[error("A pairing code for {id} is still fresh; wait {remaining_secs}s before requesting a new one")]
    PairingCooldownActive { id: String, remaining_secs: u64 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Initialization already in progress for {0}")]
    InitInProgress(String),

    #[error("Account {real_id} is already bound to another live session")]
    DuplicateIdentity { real_id: String },

    #[error("A delivery batch is already running; retry later")]
    BatchAlreadyRunning,

    #[error("Invalid send policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// 稳定的机器可读错误码（控制面信封使用）
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::PairingTimeout { .. } => "pairing_timeout",
            EngineError::PairingCooldownActive { .. } => "pairing_cooldown",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::InitInProgress(_) => "init_in_progress",
            EngineError::DuplicateIdentity { .. } => "duplicate_identity",
            EngineError::BatchAlreadyRunning => "batch_in_progress",
            EngineError::InvalidPolicy(_) => "invalid_policy",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::Protocol(_) => "protocol_error",
            EngineError::Store(_) => "store_error",
        }
    }

    /// 可恢复错误：调用方稍后重试即可
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::CapacityExceeded { .. }
                | EngineError::PairingTimeout { .. }
                | EngineError::PairingCooldownActive { .. }
                | EngineError::InitInProgress(_)
                | EngineError::BatchAlreadyRunning
        )
    }

    /// 建议的等待时间（仅冷却类错误有确定值）
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::PairingCooldownActive { remaining_secs, .. } => {
                Some(Duration::from_secs(*remaining_secs))
            }
            _ => None,
        }
    }
}

/// 协议层单条发送失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// 协议报告目标号码不在网络中（永久失败）
    #[error("Destination {0} is not registered on the network")]
    NotOnNetwork(String),

    #[error("Transient send failure: {0}")]
    Transient(String),

    #[error("Session is not connected")]
    NotConnected,
}

impl SendError {
    /// 将发送错误归类为消息的错误种类
    pub fn kind(&self) -> MessageErrorKind {
        match self {
            SendError::NotOnNetwork(_) => MessageErrorKind::DestinationUnreachable,
            SendError::Transient(_) | SendError::NotConnected => {
                MessageErrorKind::TransientSendFailure
            }
        }
    }
}
