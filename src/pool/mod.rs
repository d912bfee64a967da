//! 会话池
//!
//! 持有所有存活的协议会话，按容量类别（发送 / 配对）分别限流：
//! - 占用计数在单一互斥锁下修改，acquire_slot 对并发调用方是原子的
//! - 别名表 real_id -> temp_id，查找最多一次间接
//! - 初始化中、ready 处理中的去重集合
//!
//! 池是可注入的服务（Arc<SessionPool>），不做全局单例。

mod session;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::EngineError;
use crate::protocol::ProtocolSession;

pub use session::{PairingCode, Session, SessionClass, SessionState, SessionStatus};

pub type SessionRef = Arc<RwLock<Session>>;

/// 两个容量类别的上限
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_sending: usize,
    pub max_pairing: usize,
}

impl PoolLimits {
    pub fn max_for(&self, class: SessionClass) -> usize {
        match class {
            SessionClass::Sending => self.max_sending,
            SessionClass::Pairing => self.max_pairing,
        }
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_sending: 1,
            max_pairing: 2,
        }
    }
}

struct Entry {
    session: SessionRef,
    class: SessionClass,
    lifetime: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    /// temp_id -> 会话
    sessions: HashMap<String, Entry>,
    /// real_id -> temp_id
    aliases: HashMap<String, String>,
    /// temp_id -> real_id
    alias_of: HashMap<String, String>,
    occupancy: HashMap<SessionClass, usize>,
    initializing: HashSet<String>,
    processing_ready: HashSet<String>,
}

impl PoolState {
    fn canonical(&self, id: &str) -> Option<String> {
        if self.sessions.contains_key(id) {
            return Some(id.to_string());
        }
        self.aliases
            .get(id)
            .filter(|temp| self.sessions.contains_key(*temp))
            .cloned()
    }

    fn occupied(&self, class: SessionClass) -> usize {
        self.occupancy.get(&class).copied().unwrap_or(0)
    }

    fn free_slot(&mut self, class: SessionClass) {
        if let Some(n) = self.occupancy.get_mut(&class) {
            *n = n.saturating_sub(1);
        }
    }
}

fn locked(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// 已预留的容量槽位；未绑定到会话就被丢弃时自动归还
pub struct Reservation {
    class: SessionClass,
    state: Arc<Mutex<PoolState>>,
    armed: bool,
}

impl Reservation {
    pub fn class(&self) -> SessionClass {
        self.class
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            locked(&self.state).free_slot(self.class);
        }
    }
}

/// 被释放会话的标识
#[derive(Debug, Clone)]
pub struct Released {
    pub temp_id: String,
    pub real_id: Option<String>,
}

impl Released {
    pub fn account_id(&self) -> &str {
        self.real_id.as_deref().unwrap_or(&self.temp_id)
    }
}

/// reset_all 中单个会话的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ResetOutcome {
    SignedOut,
    /// 登出失败或超时，已强制关闭
    Terminated,
    /// 没有可用连接（例如正在重连），仅清理记录
    Released,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetEntry {
    pub session_id: String,
    pub account_id: String,
    pub outcome: ResetOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    pub total: usize,
    pub sessions: Vec<ResetEntry>,
}

impl From<Vec<ResetEntry>> for ResetReport {
    fn from(sessions: Vec<ResetEntry>) -> Self {
        Self {
            total: sessions.len(),
            sessions,
        }
    }
}

/// 登出（有宽限期），失败或卡住时退回强制关闭
pub(crate) async fn close_transport(
    transport: &Arc<dyn ProtocolSession>,
    grace: Duration,
) -> ResetOutcome {
    match tokio::time::timeout(grace, transport.sign_out()).await {
        Ok(Ok(())) => return ResetOutcome::SignedOut,
        Ok(Err(e)) => tracing::warn!("Sign-out failed, forcing termination: {}", e),
        Err(_) => tracing::warn!("Sign-out stalled for {:?}, forcing termination", grace),
    }
    match tokio::time::timeout(grace, transport.terminate()).await {
        Ok(Ok(())) => ResetOutcome::Terminated,
        Ok(Err(e)) => ResetOutcome::Failed(e.to_string()),
        Err(_) => ResetOutcome::Failed(format!("terminate stalled for {:?}", grace)),
    }
}

/// 会话池服务
pub struct SessionPool {
    limits: PoolLimits,
    state: Arc<Mutex<PoolState>>,
}

impl SessionPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// 预留一个槽位；已满时返回 CapacityExceeded（带当前/上限）
    pub fn acquire_slot(&self, class: SessionClass) -> Result<Reservation, EngineError> {
        let max = self.limits.max_for(class);
        let mut state = locked(&self.state);
        let current = state.occupied(class);
        if current >= max {
            tracing::info!(%class, current, max, "No free session slot");
            return Err(EngineError::CapacityExceeded {
                class,
                current,
                max,
            });
        }
        *state.occupancy.entry(class).or_insert(0) += 1;
        Ok(Reservation {
            class,
            state: Arc::clone(&self.state),
            armed: true,
        })
    }

    pub fn occupancy(&self, class: SessionClass) -> usize {
        locked(&self.state).occupied(class)
    }

    pub fn available_slots(&self, class: SessionClass) -> usize {
        self.limits.max_for(class).saturating_sub(self.occupancy(class))
    }

    /// 以 temp_id 登记会话，消耗预留槽位
    pub fn register(
        &self,
        mut reservation: Reservation,
        session: Session,
    ) -> Result<SessionRef, EngineError> {
        let temp_id = session.temp_id.clone();
        let lifetime = session.lifetime();
        let class = reservation.class;
        let mut state = locked(&self.state);
        if state.canonical(&temp_id).is_some() {
            return Err(EngineError::DuplicateIdentity { real_id: temp_id });
        }
        let session = Arc::new(RwLock::new(session));
        state.sessions.insert(
            temp_id.clone(),
            Entry {
                session: Arc::clone(&session),
                class,
                lifetime,
            },
        );
        reservation.armed = false;
        tracing::info!(session = %temp_id, %class, "Session registered");
        Ok(session)
    }

    /// 额外以 real_id 索引同一会话；real_id 已被其他存活会话占用时拒绝
    pub fn register_alias(&self, temp_id: &str, real_id: &str) -> Result<(), EngineError> {
        if temp_id == real_id {
            return Ok(());
        }
        let mut state = locked(&self.state);
        if !state.sessions.contains_key(temp_id) {
            return Err(EngineError::SessionNotFound(temp_id.to_string()));
        }
        if let Some(owner) = state.canonical(real_id) {
            if owner != temp_id {
                return Err(EngineError::DuplicateIdentity {
                    real_id: real_id.to_string(),
                });
            }
            return Ok(());
        }
        state.aliases.insert(real_id.to_string(), temp_id.to_string());
        state
            .alias_of
            .insert(temp_id.to_string(), real_id.to_string());
        tracing::info!(session = %temp_id, account = %real_id, "Session aliased");
        Ok(())
    }

    /// 按直接 id 或别名查找
    pub fn lookup(&self, id: &str) -> Option<SessionRef> {
        let state = locked(&self.state);
        let key = state.canonical(id)?;
        state.sessions.get(&key).map(|e| Arc::clone(&e.session))
    }

    /// 解析为登记时使用的 temp_id
    pub fn canonical_id(&self, id: &str) -> Option<String> {
        locked(&self.state).canonical(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.canonical_id(id).is_some()
    }

    /// 移除会话及其别名并归还槽位；对未知 id 无副作用
    pub fn release(&self, id: &str) -> Option<Released> {
        let mut state = locked(&self.state);
        let key = state.canonical(id)?;
        let entry = state.sessions.remove(&key)?;
        let real_id = state.alias_of.remove(&key);
        if let Some(real) = &real_id {
            state.aliases.remove(real);
        }
        state.initializing.remove(&key);
        state.processing_ready.remove(&key);
        state.free_slot(entry.class);
        entry.lifetime.cancel();
        tracing::info!(
            session = %key,
            remaining = state.sessions.len(),
            "Session released"
        );
        Some(Released {
            temp_id: key,
            real_id,
        })
    }

    /// 标记 id 正在初始化；已在初始化时返回 false
    pub fn begin_init(&self, id: &str) -> bool {
        locked(&self.state).initializing.insert(id.to_string())
    }

    pub fn finish_init(&self, id: &str) {
        locked(&self.state).initializing.remove(id);
    }

    pub fn is_initializing(&self, id: &str) -> bool {
        locked(&self.state).initializing.contains(id)
    }

    /// ready 事件去重：同一会话正在处理 ready 时返回 false
    pub fn begin_ready(&self, id: &str) -> bool {
        locked(&self.state).processing_ready.insert(id.to_string())
    }

    pub fn finish_ready(&self, id: &str) {
        locked(&self.state).processing_ready.remove(id);
    }

    pub fn len(&self) -> usize {
        locked(&self.state).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Vec<SessionRef> {
        locked(&self.state)
            .sessions
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect()
    }

    /// 账号对应的 Ready 会话的发送原语
    pub async fn ready_transport(&self, id: &str) -> Option<Arc<dyn ProtocolSession>> {
        let session = self.lookup(id)?;
        let session = session.read().await;
        if session.is_ready() {
            session.transport()
        } else {
            None
        }
    }

    /// 所有 Ready 会话的账号 id
    pub async fn ready_accounts(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for session in self.entries() {
            let session = session.read().await;
            if session.is_ready() {
                ids.push(session.account_id().to_string());
            }
        }
        ids
    }

    pub async fn snapshot(&self) -> Vec<SessionStatus> {
        let mut out = Vec::new();
        for session in self.entries() {
            out.push(session.read().await.status());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// 取出全部会话并清空所有记录与占用计数；取出的会话生命周期已取消
    pub(crate) fn drain(&self) -> Vec<SessionRef> {
        let drained: Vec<Entry> = {
            let mut state = locked(&self.state);
            let drained = state.sessions.drain().map(|(_, e)| e).collect();
            state.aliases.clear();
            state.alias_of.clear();
            state.occupancy.clear();
            state.initializing.clear();
            state.processing_ready.clear();
            drained
        };
        tracing::info!("Draining {} session(s) from the pool", drained.len());
        drained
            .into_iter()
            .map(|entry| {
                entry.lifetime.cancel();
                entry.session
            })
            .collect()
    }
}

/// 关闭一个已从池中取出的会话：宽限期内登出，失败或卡住时强制关闭
pub(crate) async fn close_drained(session: SessionRef, grace: Duration) -> ResetEntry {
    let (session_id, account_id, transport) = {
        let mut guard = session.write().await;
        guard.state = SessionState::Closing;
        guard.cancel_pending_sign_out();
        (
            guard.temp_id.clone(),
            guard.account_id().to_string(),
            guard.take_transport(),
        )
    };

    let outcome = match transport {
        Some(transport) => close_transport(&transport, grace).await,
        None => ResetOutcome::Released,
    };
    session.write().await.state = SessionState::Closed;

    tracing::info!(session = %session_id, ?outcome, "Session reset");
    ResetEntry {
        session_id,
        account_id,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DryRunConnector, SessionConnector};

    async fn session(temp_id: &str, class: SessionClass) -> Session {
        let conn = DryRunConnector::manual().connect(temp_id).await.unwrap();
        Session::new(temp_id, class, None, false, conn.session)
    }

    #[test]
    fn test_acquire_respects_limits() {
        let pool = SessionPool::new(PoolLimits {
            max_sending: 2,
            max_pairing: 1,
        });
        let a = pool.acquire_slot(SessionClass::Sending).unwrap();
        let _b = pool.acquire_slot(SessionClass::Sending).unwrap();
        match pool.acquire_slot(SessionClass::Sending) {
            Err(EngineError::CapacityExceeded { current, max, .. }) => {
                assert_eq!((current, max), (2, 2));
            }
            _ => panic!("expected CapacityExceeded"),
        }
        let _p = pool.acquire_slot(SessionClass::Pairing).unwrap();
        assert!(pool.acquire_slot(SessionClass::Pairing).is_err());

        drop(a);
        assert_eq!(pool.occupancy(SessionClass::Sending), 1);
        assert!(pool.acquire_slot(SessionClass::Sending).is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = SessionPool::new(PoolLimits::default());
        let slot = pool.acquire_slot(SessionClass::Sending).unwrap();
        pool.register(slot, session("temp", SessionClass::Sending).await)
            .unwrap();
        assert_eq!(pool.occupancy(SessionClass::Sending), 1);

        assert!(pool.release("temp").is_some());
        assert!(pool.release("temp").is_none());
        assert!(pool.release("unknown").is_none());
        assert_eq!(pool.occupancy(SessionClass::Sending), 0);
    }

    #[tokio::test]
    async fn test_alias_lookup_and_release() {
        let pool = SessionPool::new(PoolLimits::default());
        let slot = pool.acquire_slot(SessionClass::Sending).unwrap();
        pool.register(slot, session("temp", SessionClass::Sending).await)
            .unwrap();
        pool.register_alias("temp", "5215550001111").unwrap();

        assert!(pool.lookup("5215550001111").is_some());
        assert_eq!(pool.canonical_id("5215550001111").as_deref(), Some("temp"));

        let released = pool.release("5215550001111").unwrap();
        assert_eq!(released.account_id(), "5215550001111");
        assert!(pool.lookup("temp").is_none());
        assert!(pool.lookup("5215550001111").is_none());
    }

    #[tokio::test]
    async fn test_alias_rejects_second_owner() {
        let pool = SessionPool::new(PoolLimits {
            max_sending: 2,
            max_pairing: 0,
        });
        for id in ["a", "b"] {
            let slot = pool.acquire_slot(SessionClass::Sending).unwrap();
            pool.register(slot, session(id, SessionClass::Sending).await)
                .unwrap();
        }
        pool.register_alias("a", "real").unwrap();
        assert!(matches!(
            pool.register_alias("b", "real"),
            Err(EngineError::DuplicateIdentity { .. })
        ));
        // 同一会话重复登记别名是幂等的
        assert!(pool.register_alias("a", "real").is_ok());
    }

    #[tokio::test]
    async fn test_drain_empties_pool_and_closes_sessions() {
        let pool = SessionPool::new(PoolLimits {
            max_sending: 1,
            max_pairing: 1,
        });
        for (id, class) in [("a", SessionClass::Sending), ("p", SessionClass::Pairing)] {
            let slot = pool.acquire_slot(class).unwrap();
            pool.register(slot, session(id, class).await).unwrap();
        }
        pool.register_alias("a", "real").unwrap();

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.lookup("real").is_none());
        assert_eq!(pool.available_slots(SessionClass::Sending), 1);
        assert_eq!(pool.available_slots(SessionClass::Pairing), 1);

        for session in drained {
            let entry = close_drained(session.clone(), Duration::from_secs(1)).await;
            assert!(["a", "p"].contains(&entry.session_id.as_str()));
            assert_eq!(session.read().await.state, SessionState::Closed);
        }
    }

    #[test]
    fn test_init_guard() {
        let pool = SessionPool::new(PoolLimits::default());
        assert!(pool.begin_init("x"));
        assert!(!pool.begin_init("x"));
        pool.finish_init("x");
        assert!(pool.begin_init("x"));
    }
}
