//! 会话生命周期控制器
//!
//! 每个会话一个驱动任务，消费协议层的 [`TransportEvent`]：
//! - 配对挑战：冷却期内的新码被抑制；超过最大次数则强制关闭
//! - 认证成功：身份重映射、登记别名、账号置为 active，发布 Ready；仅登记用会话随后自动登出
//! - 传输关闭：登出为终态；其他原因清理配对状态，退避后以同一 temp_id 原地重连
//!
//! 所有状态变化以 [`LifecycleEvent`] 经 broadcast 通道发布，不使用回调。

mod events;
mod remap;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::EngineError;
use crate::pool::{
    close_drained, close_transport, ResetOutcome, ResetReport, Session, SessionClass, SessionPool,
    SessionState, SessionStatus,
};
use crate::protocol::{CloseReason, SessionConnector, TransportEvent};
use crate::store::{AccountStatus, Store};

pub use events::LifecycleEvent;

const EVENT_CAPACITY: usize = 256;

/// 生命周期参数
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub pairing_cooldown: Duration,
    pub max_pairing_attempts: u32,
    pub pairing_wait_timeout: Duration,
    /// 仅登记用会话 Ready 后自动登出的延迟
    pub ephemeral_sign_out_delay: Duration,
    pub reconnect_backoff: Duration,
    pub reconnect_attempts: u32,
    /// 登出宽限期，超时后强制关闭
    pub sign_out_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            pairing_cooldown: Duration::from_secs(60),
            max_pairing_attempts: 2,
            pairing_wait_timeout: Duration::from_secs(30),
            ephemeral_sign_out_delay: Duration::from_secs(2),
            reconnect_backoff: Duration::from_secs(3),
            reconnect_attempts: 5,
            sign_out_grace: Duration::from_secs(10),
        }
    }
}

/// 创建会话请求
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub temp_id: String,
    pub display_name: Option<String>,
    pub class: SessionClass,
    pub ephemeral: bool,
}

impl CreateSession {
    /// 发送用会话
    pub fn sending(temp_id: impl Into<String>) -> Self {
        Self {
            temp_id: temp_id.into(),
            display_name: None,
            class: SessionClass::Sending,
            ephemeral: false,
        }
    }

    /// 仅登记用会话：占用配对池，Ready 后自动登出
    pub fn registration(temp_id: impl Into<String>) -> Self {
        Self {
            temp_id: temp_id.into(),
            display_name: None,
            class: SessionClass::Pairing,
            ephemeral: true,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// 在途初始化守卫：离开作用域时清除标记
struct InitGuard<'a> {
    pool: &'a SessionPool,
    id: String,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.pool.finish_init(&self.id);
    }
}

enum PairingProgress {
    Waiting,
    Code(String),
    Ready,
}

/// 会话生命周期控制器（可注入服务）
pub struct LifecycleController {
    pool: Arc<SessionPool>,
    store: Arc<dyn Store>,
    connector: Arc<dyn SessionConnector>,
    config: LifecycleConfig,
    events: broadcast::Sender<LifecycleEvent>,
    /// 串行化身份重映射
    remap_lock: Mutex<()>,
}

impl LifecycleController {
    pub fn new(
        pool: Arc<SessionPool>,
        store: Arc<dyn Store>,
        connector: Arc<dyn SessionConnector>,
        config: LifecycleConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool,
            store,
            connector,
            config,
            events,
            remap_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle event");
        // 没有订阅者时发送失败是正常的
        let _ = self.events.send(event);
    }

    /// 创建（或返回已有的）会话并启动其驱动任务
    pub async fn create_session(
        self: &Arc<Self>,
        req: CreateSession,
    ) -> Result<SessionStatus, EngineError> {
        let temp_id = req.temp_id.trim().to_string();
        if temp_id.is_empty() {
            return Err(EngineError::SessionNotFound(req.temp_id));
        }
        if !self.pool.begin_init(&temp_id) {
            return Err(EngineError::InitInProgress(temp_id));
        }
        let _init = InitGuard {
            pool: &self.pool,
            id: temp_id.clone(),
        };

        if let Some(existing) = self.pool.lookup(&temp_id) {
            let session = existing.read().await;
            if let Some(remaining) = session.pairing_cooldown_remaining(self.config.pairing_cooldown)
            {
                return Err(EngineError::PairingCooldownActive {
                    id: temp_id,
                    remaining_secs: remaining.as_secs().max(1),
                });
            }
            tracing::info!(session = %temp_id, state = ?session.state, "Session already live");
            return Ok(session.status());
        }

        let reservation = match self.pool.acquire_slot(req.class) {
            Ok(r) => r,
            Err(e) => {
                if req.class == SessionClass::Sending {
                    self.remember_account(&temp_id, req.display_name.as_deref())
                        .await;
                }
                return Err(e);
            }
        };

        let conn = self
            .connector
            .connect(&temp_id)
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;

        let session = Session::new(
            temp_id.clone(),
            req.class,
            req.display_name.clone(),
            req.ephemeral,
            conn.session,
        );
        let lifetime = session.lifetime();
        let session = self.pool.register(reservation, session)?;
        let status = session.read().await.status();

        self.publish(LifecycleEvent::Created {
            session_id: temp_id.clone(),
            class: req.class,
            ephemeral: req.ephemeral,
        });
        tracing::info!(session = %temp_id, class = %req.class, "Session created");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(temp_id, conn.events, lifetime).await });

        Ok(status)
    }

    /// 容量不足时仍然记录账号，之后可以被认出来；已有账号只更新名称，不改状态
    async fn remember_account(&self, id: &str, display_name: Option<&str>) {
        match self.store.get_account(id).await {
            Ok(Some(existing)) => {
                let Some(name) = display_name.filter(|n| *n != existing.display_name) else {
                    return;
                };
                // 同 id 改名：保留状态、阶段与计数
                if let Err(e) = self.store.rename_account(id, id, name).await {
                    tracing::warn!(account = %id, "Failed to update display name: {}", e);
                }
            }
            Ok(None) => {
                let name = display_name.unwrap_or(id);
                let stored = self.store.upsert_account(id, name).await;
                let deactivated = self
                    .store
                    .set_account_status(id, AccountStatus::Inactive)
                    .await;
                if let Err(e) = stored.map(|_| ()).and(deactivated) {
                    tracing::warn!(account = %id, "Failed to record account: {}", e);
                }
            }
            Err(e) => tracing::warn!(account = %id, "Failed to look up account: {}", e),
        }
    }

    async fn drive(
        self: Arc<Self>,
        temp_id: String,
        mut events: mpsc::Receiver<TransportEvent>,
        lifetime: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(TransportEvent::PairingChallenge { code }) => {
                    self.on_pairing_challenge(&temp_id, code).await;
                }
                Some(TransportEvent::Authenticated {
                    account_id,
                    display_name,
                }) => {
                    self.on_authenticated(&temp_id, account_id, display_name)
                        .await;
                }
                Some(TransportEvent::TransportClosed { reason }) => {
                    match self.on_transport_closed(&temp_id, reason).await {
                        Some(next) => events = next,
                        None => break,
                    }
                }
                None => {
                    let reason = CloseReason::ConnectionLost("event stream ended".to_string());
                    match self.on_transport_closed(&temp_id, reason).await {
                        Some(next) => events = next,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(session = %temp_id, "Session driver stopped");
    }

    async fn on_pairing_challenge(&self, temp_id: &str, code: String) {
        let Some(session) = self.pool.lookup(temp_id) else {
            return;
        };
        let attempt = {
            let mut session = session.write().await;
            if !session.state.is_pairing() {
                return;
            }
            if let Some(remaining) = session.pairing_cooldown_remaining(self.config.pairing_cooldown)
            {
                tracing::debug!(
                    session = %temp_id,
                    remaining_secs = remaining.as_secs(),
                    "Pairing code suppressed during cooldown"
                );
                return;
            }
            if session.pairing_attempts >= self.config.max_pairing_attempts {
                None
            } else {
                session.record_pairing_code(code.clone());
                Some(session.pairing_attempts)
            }
        };

        match attempt {
            Some(attempt) => {
                tracing::info!(session = %temp_id, attempt, "Pairing code issued");
                self.publish(LifecycleEvent::PairingCode {
                    session_id: temp_id.to_string(),
                    code,
                    attempt,
                });
            }
            None => {
                tracing::warn!(
                    session = %temp_id,
                    max = self.config.max_pairing_attempts,
                    "Pairing attempts exhausted"
                );
                self.force_terminate(temp_id, "pairing attempts exhausted", true)
                    .await;
            }
        }
    }

    async fn on_authenticated(
        self: &Arc<Self>,
        temp_id: &str,
        account_id: Option<String>,
        display_name: Option<String>,
    ) {
        if !self.pool.begin_ready(temp_id) {
            tracing::debug!(session = %temp_id, "Ready already being processed");
            return;
        }
        let result = self.complete_ready(temp_id, account_id, display_name).await;
        self.pool.finish_ready(temp_id);
        if let Err(e) = result {
            tracing::warn!(session = %temp_id, "Failed to complete ready: {}", e);
        }
    }

    async fn complete_ready(
        self: &Arc<Self>,
        temp_id: &str,
        account_id: Option<String>,
        display_name: Option<String>,
    ) -> Result<(), EngineError> {
        let session = self
            .pool
            .lookup(temp_id)
            .ok_or_else(|| EngineError::SessionNotFound(temp_id.to_string()))?;

        let (real_id, name, already_bound, ephemeral) = {
            let mut session = session.write().await;
            if session.state.is_terminal() {
                return Ok(());
            }
            session.clear_pairing();
            let reported = account_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty());
            let real_id = match (session.real_id(), reported) {
                (Some(bound), Some(reported)) if bound != reported => {
                    tracing::warn!(
                        session = %temp_id,
                        bound = %bound,
                        reported = %reported,
                        "Ignoring different account id for a bound session"
                    );
                    bound.to_string()
                }
                (Some(bound), _) => bound.to_string(),
                (None, Some(reported)) => reported,
                (None, None) => temp_id.to_string(),
            };
            let name = display_name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| session.display_name.clone())
                .unwrap_or_else(|| real_id.clone());
            session.display_name = Some(name.clone());
            (real_id, name, session.real_id().is_some(), session.ephemeral)
        };

        if already_bound {
            self.store.upsert_account(&real_id, &name).await?;
        } else {
            if let Err(e) = self.pool.register_alias(temp_id, &real_id) {
                if matches!(e, EngineError::DuplicateIdentity { .. }) {
                    self.force_terminate(temp_id, "account already bound to another session", false)
                        .await;
                }
                return Err(e);
            }
            {
                let _guard = self.remap_lock.lock().await;
                remap::remap_identity(&*self.store, temp_id, &real_id, &name).await?;
            }
            session.write().await.bind_real_id(&real_id);
        }

        {
            let mut session = session.write().await;
            if session.state.is_terminal() {
                return Ok(());
            }
            session.state = SessionState::Ready;
        }
        tracing::info!(session = %temp_id, account = %real_id, "Session ready");
        self.publish(LifecycleEvent::Ready {
            temp_id: temp_id.to_string(),
            real_id,
            display_name: name,
        });

        if ephemeral {
            self.schedule_sign_out(temp_id).await;
        }
        Ok(())
    }

    /// 仅登记用会话：延迟后自动登出，会话释放时计时器随之取消
    async fn schedule_sign_out(self: &Arc<Self>, temp_id: &str) {
        let Some(session) = self.pool.lookup(temp_id) else {
            return;
        };
        let token = session.write().await.arm_sign_out();
        let delay = self.config.ephemeral_sign_out_delay;
        let this = Arc::clone(self);
        let id = temp_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(session = %id, "Auto sign-out cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = this.sign_out(&id).await {
                        tracing::warn!(session = %id, "Auto sign-out failed: {}", e);
                    }
                }
            }
        });
    }

    /// 返回新的事件流表示已重连；None 表示驱动任务应结束
    async fn on_transport_closed(
        &self,
        temp_id: &str,
        reason: CloseReason,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        let session = self.pool.lookup(temp_id)?;
        if session.read().await.state.is_terminal() {
            return None;
        }
        if reason.is_logout() {
            self.finalize_closed(temp_id, "logged out").await;
            return None;
        }

        let lifetime = {
            let mut session = session.write().await;
            session.clear_pairing();
            session.state = SessionState::Initializing;
            session.take_transport();
            session.lifetime()
        };
        tracing::warn!(session = %temp_id, %reason, "Transport closed, reconnecting");
        self.publish(LifecycleEvent::Reconnecting {
            session_id: temp_id.to_string(),
            reason: reason.to_string(),
        });

        for attempt in 1..=self.config.reconnect_attempts {
            tokio::select! {
                biased;
                _ = lifetime.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
            match self.connector.connect(temp_id).await {
                Ok(conn) => {
                    let mut guard = session.write().await;
                    if guard.state.is_terminal() || lifetime.is_cancelled() {
                        drop(guard);
                        let _ = conn.session.terminate().await;
                        return None;
                    }
                    guard.replace_transport(conn.session);
                    tracing::info!(session = %temp_id, attempt, "Reconnected");
                    return Some(conn.events);
                }
                Err(e) => {
                    tracing::warn!(session = %temp_id, attempt, "Reconnect failed: {}", e);
                }
            }
        }

        self.force_terminate(temp_id, "reconnect attempts exhausted", true)
            .await;
        None
    }

    /// 正常关闭：释放会话，账号置为 inactive，发布 Closed（重复调用无副作用）
    async fn finalize_closed(&self, temp_id: &str, reason: &str) {
        let session = self.pool.lookup(temp_id);
        let Some(released) = self.pool.release(temp_id) else {
            return;
        };
        if let Some(session) = session {
            let mut session = session.write().await;
            session.state = SessionState::Closed;
            session.take_transport();
        }
        let account_id = released.account_id().to_string();
        if let Err(e) = self
            .store
            .set_account_status(&account_id, AccountStatus::Inactive)
            .await
        {
            tracing::warn!(account = %account_id, "Failed to mark account inactive: {}", e);
        }
        tracing::info!(session = %temp_id, account = %account_id, reason, "Session closed");
        self.publish(LifecycleEvent::Closed {
            session_id: released.temp_id,
            account_id,
            reason: reason.to_string(),
        });
    }

    /// 强制关闭：不登出，直接终止连接
    async fn force_terminate(&self, temp_id: &str, reason: &str, mark_inactive: bool) {
        let Some(session) = self.pool.lookup(temp_id) else {
            return;
        };
        let transport = {
            let mut session = session.write().await;
            session.state = SessionState::Closing;
            session.cancel_pending_sign_out();
            session.take_transport()
        };
        let Some(released) = self.pool.release(temp_id) else {
            return;
        };
        if let Some(transport) = transport {
            match tokio::time::timeout(self.config.sign_out_grace, transport.terminate()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(session = %temp_id, "Terminate failed: {}", e),
                Err(_) => tracing::warn!(session = %temp_id, "Terminate stalled"),
            }
        }
        session.write().await.state = SessionState::Closed;

        let account_id = released.account_id().to_string();
        if mark_inactive {
            if let Err(e) = self
                .store
                .set_account_status(&account_id, AccountStatus::Inactive)
                .await
            {
                tracing::warn!(account = %account_id, "Failed to mark account inactive: {}", e);
            }
        }
        tracing::warn!(session = %temp_id, account = %account_id, reason, "Session terminated");
        self.publish(LifecycleEvent::Terminated {
            session_id: released.temp_id,
            account_id,
            reason: reason.to_string(),
        });
    }

    pub async fn status(&self, id: &str) -> Result<SessionStatus, EngineError> {
        let session = self
            .pool
            .lookup(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        let status = session.read().await.status();
        Ok(status)
    }

    /// 当前有效的配对码（没有则 None）
    pub async fn pairing_code(&self, id: &str) -> Result<Option<String>, EngineError> {
        let session = self
            .pool
            .lookup(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        let session = session.read().await;
        Ok(session.pairing.as_ref().map(|p| p.code.clone()))
    }

    async fn pairing_progress(
        &self,
        id: &str,
    ) -> Result<(String, PairingProgress), EngineError> {
        let session = self
            .pool
            .lookup(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        let session = session.read().await;
        let progress = if session.is_ready() {
            PairingProgress::Ready
        } else if let Some(pairing) = &session.pairing {
            PairingProgress::Code(pairing.code.clone())
        } else {
            PairingProgress::Waiting
        };
        Ok((session.temp_id.clone(), progress))
    }

    async fn wait_for_pairing(
        &self,
        rx: &mut broadcast::Receiver<LifecycleEvent>,
        temp_id: &str,
    ) -> Result<Option<String>, EngineError> {
        loop {
            match rx.recv().await {
                Ok(event) if event.session_id() == temp_id => match event {
                    LifecycleEvent::PairingCode { code, .. } => return Ok(Some(code)),
                    LifecycleEvent::Ready { .. } => return Ok(None),
                    LifecycleEvent::Closed { .. } | LifecycleEvent::Terminated { .. } => {
                        return Err(EngineError::SessionNotFound(temp_id.to_string()));
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    match self.pairing_progress(temp_id).await? {
                        (_, PairingProgress::Ready) => return Ok(None),
                        (_, PairingProgress::Code(code)) => return Ok(Some(code)),
                        (_, PairingProgress::Waiting) => {}
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::SessionNotFound(temp_id.to_string()));
                }
            }
        }
    }

    /// 等待配对码；会话在等待期间变为 Ready 时返回 None。
    /// 超时返回 PairingTimeout，会话继续在后台初始化。
    pub async fn await_pairing_code(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<String>, EngineError> {
        let mut rx = self.subscribe();
        let (temp_id, progress) = self.pairing_progress(id).await?;
        match progress {
            PairingProgress::Ready => return Ok(None),
            PairingProgress::Code(code) => return Ok(Some(code)),
            PairingProgress::Waiting => {}
        }

        let wait = self.wait_for_pairing(&mut rx, &temp_id);
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::PairingTimeout {
                id: id.to_string(),
                waited_secs: timeout.as_secs(),
            }),
        }
    }

    /// 以默认超时等待配对码
    pub async fn await_pairing_code_default(
        &self,
        id: &str,
    ) -> Result<Option<String>, EngineError> {
        self.await_pairing_code(id, self.config.pairing_wait_timeout)
            .await
    }

    /// 登出一个会话（宽限期内未完成则强制关闭），账号置为 inactive
    pub async fn sign_out(&self, id: &str) -> Result<ResetOutcome, EngineError> {
        let session = self
            .pool
            .lookup(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        let (temp_id, transport) = {
            let mut session = session.write().await;
            if session.state.is_terminal() {
                return Err(EngineError::SessionNotFound(id.to_string()));
            }
            session.state = SessionState::Closing;
            session.cancel_pending_sign_out();
            (session.temp_id.clone(), session.take_transport())
        };

        let outcome = match transport {
            Some(transport) => close_transport(&transport, self.config.sign_out_grace).await,
            None => ResetOutcome::Released,
        };
        tracing::info!(session = %temp_id, ?outcome, "Sign-out finished");
        self.finalize_closed(&temp_id, "signed out").await;
        Ok(outcome)
    }

    /// 关闭全部会话并清空池；账号置为 inactive。从不返回错误
    ///
    /// 各会话并发关闭，每个会话关闭完成后立即标记其账号，
    /// 总耗时不超过两个宽限期。
    pub async fn reset_all(&self) -> ResetReport {
        let grace = self.config.sign_out_grace;
        let closing = self.pool.drain().into_iter().map(|session| async move {
            let entry = close_drained(session, grace).await;
            if let Err(e) = self
                .store
                .set_account_status(&entry.account_id, AccountStatus::Inactive)
                .await
            {
                tracing::warn!(account = %entry.account_id, "Failed to mark account inactive: {}", e);
            }
            self.publish(LifecycleEvent::Closed {
                session_id: entry.session_id.clone(),
                account_id: entry.account_id.clone(),
                reason: "reset".to_string(),
            });
            entry
        });
        let report = ResetReport::from(join_all(closing).await);
        tracing::info!("Reset completed, {} session(s) processed", report.total);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolLimits;
    use crate::protocol::DryRunConnector;
    use crate::store::MemoryStore;

    fn controller(
        connector: DryRunConnector,
        store: Arc<MemoryStore>,
    ) -> Arc<LifecycleController> {
        let pool = Arc::new(SessionPool::new(PoolLimits::default()));
        Arc::new(LifecycleController::new(
            pool,
            store,
            Arc::new(connector),
            LifecycleConfig::default(),
        ))
    }

    async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_authenticated_session_is_remapped() {
        let connector = DryRunConnector::new().map_identity("temp", "5215550001111", "Ana");
        let store = Arc::new(MemoryStore::default());
        let ctl = controller(connector, store.clone());
        let mut rx = ctl.subscribe();

        ctl.create_session(CreateSession::sending("temp")).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, LifecycleEvent::Created { .. }));
        match next_event(&mut rx).await {
            LifecycleEvent::Ready { real_id, .. } => assert_eq!(real_id, "5215550001111"),
            other => panic!("unexpected event {:?}", other),
        }

        let status = ctl.status("5215550001111").await.unwrap();
        assert_eq!(status.temp_id, "temp");
        assert_eq!(status.state, SessionState::Ready);
        let account = store.get_account("5215550001111").await.unwrap().unwrap();
        assert!(account.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_code_cooldown_and_attempt_limit() {
        let connector = DryRunConnector::manual();
        let store = Arc::new(MemoryStore::default());
        let ctl = controller(connector.clone(), store);
        let mut rx = ctl.subscribe();

        ctl.create_session(CreateSession::sending("temp")).await.unwrap();
        next_event(&mut rx).await;

        let challenge = |code: &str| TransportEvent::PairingChallenge {
            code: code.to_string(),
        };
        connector.emit("temp", challenge("A")).await;
        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::PairingCode { attempt: 1, .. }
        ));

        // 冷却期内的新码被抑制
        connector.emit("temp", challenge("B")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.pairing_code("temp").await.unwrap().as_deref(), Some("A"));
        assert_eq!(ctl.status("temp").await.unwrap().pairing_attempts, 1);
        assert!(matches!(
            ctl.create_session(CreateSession::sending("temp")).await,
            Err(EngineError::PairingCooldownActive { .. })
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        connector.emit("temp", challenge("C")).await;
        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::PairingCode { attempt: 2, .. }
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        connector.emit("temp", challenge("D")).await;
        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::Terminated { .. }
        ));
        assert!(matches!(
            ctl.status("temp").await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert_eq!(ctl.pool().occupancy(SessionClass::Sending), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_pairing_code_times_out_without_killing_session() {
        let connector = DryRunConnector::manual();
        let ctl = controller(connector, Arc::new(MemoryStore::default()));
        ctl.create_session(CreateSession::sending("temp")).await.unwrap();

        let err = ctl
            .await_pairing_code("temp", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PairingTimeout { waited_secs: 30, .. }));
        assert!(ctl.status("temp").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_exceeded_still_records_account() {
        let connector = DryRunConnector::manual();
        let store = Arc::new(MemoryStore::default());
        let ctl = controller(connector, store.clone());

        ctl.create_session(CreateSession::sending("a")).await.unwrap();
        let err = ctl
            .create_session(CreateSession::sending("b").with_display_name("Bea"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded { current: 1, max: 1, .. }
        ));
        let account = store.get_account("b").await.unwrap().unwrap();
        assert_eq!(account.display_name, "Bea");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_reconnects_under_same_temp_id() {
        let connector = DryRunConnector::manual();
        let ctl = controller(connector.clone(), Arc::new(MemoryStore::default()));
        let mut rx = ctl.subscribe();
        ctl.create_session(CreateSession::sending("temp")).await.unwrap();
        next_event(&mut rx).await;

        connector
            .emit(
                "temp",
                TransportEvent::TransportClosed {
                    reason: CloseReason::ConnectionLost("stream error".into()),
                },
            )
            .await;
        assert!(matches!(
            next_event(&mut rx).await,
            LifecycleEvent::Reconnecting { .. }
        ));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(ctl.status("temp").await.unwrap().state, SessionState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_session_signs_out_after_ready() {
        let connector = DryRunConnector::new().map_identity("reg", "5215550002222", "Luis");
        let store = Arc::new(MemoryStore::default());
        let ctl = controller(connector.clone(), store.clone());
        let mut rx = ctl.subscribe();

        ctl.create_session(CreateSession::registration("reg")).await.unwrap();
        next_event(&mut rx).await;
        assert!(matches!(next_event(&mut rx).await, LifecycleEvent::Ready { .. }));
        assert!(matches!(next_event(&mut rx).await, LifecycleEvent::Closed { .. }));

        assert_eq!(connector.signed_out(), vec!["reg".to_string()]);
        let account = store.get_account("5215550002222").await.unwrap().unwrap();
        assert!(!account.is_active());
        assert_eq!(ctl.pool().occupancy(SessionClass::Pairing), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sign_out_cancels_auto_sign_out() {
        let connector = DryRunConnector::new();
        let ctl = controller(connector.clone(), Arc::new(MemoryStore::default()));
        let mut rx = ctl.subscribe();

        ctl.create_session(CreateSession::registration("reg")).await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        assert_eq!(ctl.sign_out("reg").await.unwrap(), ResetOutcome::SignedOut);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.signed_out().len(), 1);
        assert!(matches!(
            ctl.sign_out("reg").await,
            Err(EngineError::SessionNotFound(_))
        ));
    }
}
