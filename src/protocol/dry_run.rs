//! Dry-run 协议实现：不连接真实网络，只记录发送
//!
//! 用于守护进程的演练模式与测试。行为可编排：自动认证、身份映射、
//! 不可达号码、临时失败号码、登出失败或卡住，并可随时向某个会话注入事件。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{CloseReason, Connection, MessageRef, ProtocolSession, SessionConnector, TransportEvent};
use crate::core::SendError;

const EVENT_BUFFER: usize = 32;

/// 一条已"发送"的记录
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub session_id: String,
    pub to: String,
    pub body: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Script {
    auto_authenticate: bool,
    /// temp id -> (real id, display name)
    identities: HashMap<String, (String, String)>,
    unreachable: HashSet<String>,
    transient: HashSet<String>,
    failing_sign_out: HashSet<String>,
    stalled_sign_out: HashSet<String>,
}

#[derive(Default)]
struct DryRunState {
    script: Mutex<Script>,
    senders: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<SentRecord>>,
    signed_out: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn digits_of(destination: &str) -> String {
    destination
        .split('@')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

/// Dry-run 连接器
#[derive(Clone, Default)]
pub struct DryRunConnector {
    state: Arc<DryRunState>,
}

impl DryRunConnector {
    /// 连接后立即以会话 id（或映射的身份）认证
    pub fn new() -> Self {
        let connector = Self::default();
        locked(&connector.state.script).auto_authenticate = true;
        connector
    }

    /// 不自动产生任何事件，由调用方通过 [`emit`](Self::emit) 驱动
    pub fn manual() -> Self {
        Self::default()
    }

    /// 自动认证时把 temp_id 映射为真实账号
    pub fn map_identity(self, temp_id: &str, real_id: &str, display_name: &str) -> Self {
        locked(&self.state.script)
            .identities
            .insert(temp_id.to_string(), (real_id.to_string(), display_name.to_string()));
        self
    }

    pub fn mark_unreachable(self, phone: &str) -> Self {
        locked(&self.state.script).unreachable.insert(digits_of(phone));
        self
    }

    pub fn mark_transient(self, phone: &str) -> Self {
        locked(&self.state.script).transient.insert(digits_of(phone));
        self
    }

    pub fn fail_sign_out(self, session_id: &str) -> Self {
        locked(&self.state.script)
            .failing_sign_out
            .insert(session_id.to_string());
        self
    }

    /// 登出调用永不返回（用于验证宽限期后的强制关闭）
    pub fn stall_sign_out(self, session_id: &str) -> Self {
        locked(&self.state.script)
            .stalled_sign_out
            .insert(session_id.to_string());
        self
    }

    /// 向会话注入一个传输事件；会话不存在或事件流已关闭时返回 false
    pub async fn emit(&self, session_id: &str, event: TransportEvent) -> bool {
        let sender = locked(&self.state.senders).get(session_id).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        locked(&self.state.sent).clone()
    }

    pub fn signed_out(&self) -> Vec<String> {
        locked(&self.state.signed_out).clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        locked(&self.state.terminated).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for DryRunConnector {
    async fn connect(&self, session_id: &str) -> anyhow::Result<Connection> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let auto_identity = {
            let script = locked(&self.state.script);
            script.auto_authenticate.then(|| {
                script
                    .identities
                    .get(session_id)
                    .cloned()
                    .unwrap_or_else(|| (session_id.to_string(), session_id.to_string()))
            })
        };
        if let Some((real_id, name)) = auto_identity {
            let _ = tx.try_send(TransportEvent::Authenticated {
                account_id: Some(real_id),
                display_name: Some(name),
            });
        }

        locked(&self.state.senders).insert(session_id.to_string(), tx);
        tracing::debug!(session = %session_id, "dry-run transport connected");

        Ok(Connection {
            session: Arc::new(DryRunSession {
                id: session_id.to_string(),
                state: Arc::clone(&self.state),
            }),
            events: rx,
        })
    }
}

struct DryRunSession {
    id: String,
    state: Arc<DryRunState>,
}

#[async_trait]
impl ProtocolSession for DryRunSession {
    async fn send(&self, destination: &str, body: &str) -> Result<MessageRef, SendError> {
        let key = digits_of(destination);
        {
            let script = locked(&self.state.script);
            if script.unreachable.contains(&key) {
                return Err(SendError::NotOnNetwork(destination.to_string()));
            }
            if script.transient.contains(&key) {
                return Err(SendError::Transient("dry-run transient failure".to_string()));
            }
        }

        let at = Utc::now();
        locked(&self.state.sent).push(SentRecord {
            session_id: self.id.clone(),
            to: destination.to_string(),
            body: body.to_string(),
            at,
        });
        tracing::info!(session = %self.id, to = %destination, "dry-run send");

        Ok(MessageRef {
            id: uuid::Uuid::new_v4().to_string(),
            to: destination.to_string(),
            sent_at: at,
        })
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        let (fails, stalls) = {
            let script = locked(&self.state.script);
            (
                script.failing_sign_out.contains(&self.id),
                script.stalled_sign_out.contains(&self.id),
            )
        };
        if stalls {
            std::future::pending::<()>().await;
        }
        if fails {
            anyhow::bail!("sign-out rejected for {}", self.id);
        }

        locked(&self.state.signed_out).push(self.id.clone());
        let sender = locked(&self.state.senders).remove(&self.id);
        if let Some(tx) = sender {
            let _ = tx.try_send(TransportEvent::TransportClosed {
                reason: CloseReason::LoggedOut,
            });
        }
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        locked(&self.state.terminated).push(self.id.clone());
        locked(&self.state.senders).remove(&self.id);
        Ok(())
    }
}
