//! 投递调度器
//!
//! 周期性 + 按需触发的批处理；进程内同一时刻最多一个批次（原子标记 + RAII 守卫），
//! 重叠调用返回 BatchAlreadyRunning，不排队。
//!
//! 每个批次：策略检查 → 加载待发消息 → 筛选可发账号 → 各账号从共享工作集领取
//! → 各账号子批次并发执行，子批次内严格顺序并按节奏等待。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pacing::{elapsed_since_midnight, plan_delays, DeliveryMode, PacingConfig};
use super::phase::{refresh_phase, PhaseChange, PhaseRefreshReport};
use super::phone::format_destination;
use super::policy::GlobalSendPolicy;
use crate::core::EngineError;
use crate::pool::SessionPool;
use crate::store::{MessageErrorKind, MessageStatus, PendingMessage, Store};

/// 调度参数
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    /// 周期批次的间隔
    pub interval: Duration,
    /// 阶段刷新与每日计数重置的检查间隔
    pub maintenance_interval: Duration,
    pub pacing: PacingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            interval: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(3600),
            pacing: PacingConfig::default(),
        }
    }
}

/// 批次结果；策略拦截不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Paused,
    DayNotAllowed,
    NoPending,
    NoSessions,
}

/// 单个账号在一个批次中的统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountTally {
    pub account_id: String,
    pub phase: u32,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// 会话中途失效，未发送、保持 pending
    pub deferred: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    pub mode: DeliveryMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    pub per_account: Vec<AccountTally>,
}

impl BatchReport {
    fn empty(outcome: BatchOutcome, mode: DeliveryMode, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            mode,
            started_at,
            finished_at: Utc::now(),
            sent: 0,
            failed: 0,
            deferred: 0,
            per_account: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub paused: bool,
    pub batch_active: bool,
    pub allowed_days: Vec<u32>,
    pub last_batch: Option<BatchReport>,
}

/// 批次守卫：持有期间标记为运行中，丢弃时复位
pub struct BatchGuard {
    flag: Arc<AtomicBool>,
}

impl BatchGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 批次内共享的待发工作集；领取在互斥锁下完成，同一消息只会被领取一次
pub struct WorkingSet {
    queue: Mutex<VecDeque<PendingMessage>>,
}

impl WorkingSet {
    pub fn new(messages: Vec<PendingMessage>) -> Self {
        Self {
            queue: Mutex::new(messages.into()),
        }
    }

    pub async fn claim(&self, max: usize) -> Vec<PendingMessage> {
        let mut queue = self.queue.lock().await;
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct Eligible {
    account_id: String,
    phase: u32,
    remaining: u32,
    window: Duration,
}

pub struct DeliveryScheduler {
    store: Arc<dyn Store>,
    pool: Arc<SessionPool>,
    policy: Arc<GlobalSendPolicy>,
    config: SchedulerConfig,
    batch_running: Arc<AtomicBool>,
    loop_token: std::sync::Mutex<Option<CancellationToken>>,
    last_report: RwLock<Option<BatchReport>>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<SessionPool>,
        policy: Arc<GlobalSendPolicy>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pool,
            policy,
            config,
            batch_running: Arc::new(AtomicBool::new(false)),
            loop_token: std::sync::Mutex::new(None),
            last_report: RwLock::new(None),
        }
    }

    pub fn policy(&self) -> &Arc<GlobalSendPolicy> {
        &self.policy
    }

    pub fn is_batch_active(&self) -> bool {
        self.batch_running.load(Ordering::Acquire)
    }

    fn claim_batch(&self) -> Result<BatchGuard, EngineError> {
        BatchGuard::try_acquire(&self.batch_running).ok_or(EngineError::BatchAlreadyRunning)
    }

    /// 立即执行一个批次并等待其结束
    pub async fn run_batch(&self, mode: DeliveryMode) -> Result<BatchReport, EngineError> {
        self.run_batch_at(mode, Local::now()).await
    }

    /// 以给定的本地时间执行批次（星期判断与窗口计算以此为准）
    pub async fn run_batch_at(
        &self,
        mode: DeliveryMode,
        now: DateTime<Local>,
    ) -> Result<BatchReport, EngineError> {
        let guard = self.claim_batch()?;
        let report = self.execute(mode, now, &CancellationToken::new()).await;
        drop(guard);
        report
    }

    /// 周期循环使用：token 取消后在两条消息之间停止，已领取未发送的消息保持 pending
    async fn run_batch_until(
        &self,
        mode: DeliveryMode,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, EngineError> {
        let guard = self.claim_batch()?;
        let report = self.execute(mode, Local::now(), cancel).await;
        drop(guard);
        report
    }

    /// 在后台启动一个批次；已有批次运行时立即返回 BatchAlreadyRunning
    pub fn trigger(self: &Arc<Self>, mode: DeliveryMode) -> Result<(), EngineError> {
        let guard = self.claim_batch()?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.execute(mode, Local::now(), &CancellationToken::new()).await {
                tracing::error!("Delivery batch failed: {}", e);
            }
        });
        Ok(())
    }

    async fn execute(
        &self,
        mode: DeliveryMode,
        now: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, EngineError> {
        let started_at = Utc::now();
        let report = self.process(mode, now, started_at, cancel).await?;
        match report.outcome {
            BatchOutcome::Completed => tracing::info!(
                sent = report.sent,
                failed = report.failed,
                deferred = report.deferred,
                accounts = report.per_account.len(),
                "Batch completed"
            ),
            outcome => tracing::info!(?outcome, "Batch skipped"),
        }
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn process(
        &self,
        mode: DeliveryMode,
        now: DateTime<Local>,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, EngineError> {
        if self.policy.is_paused().await {
            return Ok(BatchReport::empty(BatchOutcome::Paused, mode, started_at));
        }
        let weekday = now.weekday().num_days_from_sunday();
        if !self.policy.is_day_allowed(weekday).await {
            tracing::info!(weekday, "Sending not allowed today");
            return Ok(BatchReport::empty(BatchOutcome::DayNotAllowed, mode, started_at));
        }

        let pending = self
            .store
            .get_pending_messages(self.config.batch_size)
            .await?;
        if pending.is_empty() {
            tracing::debug!("No pending messages");
            return Ok(BatchReport::empty(BatchOutcome::NoPending, mode, started_at));
        }

        let eligible = self.eligible_accounts(now.date_naive()).await?;
        if eligible.is_empty() {
            tracing::info!(pending = pending.len(), "No account available to send");
            return Ok(BatchReport::empty(BatchOutcome::NoSessions, mode, started_at));
        }

        tracing::info!(
            pending = pending.len(),
            accounts = eligible.len(),
            ?mode,
            "Processing batch"
        );
        let working = WorkingSet::new(pending);
        let elapsed_today = elapsed_since_midnight(now);

        // 按优先顺序领取，高阶段账号先拿
        let mut plans = Vec::new();
        for account in eligible {
            if working.is_empty().await {
                break;
            }
            let claimed = working.claim(account.remaining as usize).await;
            if claimed.is_empty() {
                continue;
            }
            let delays = plan_delays(
                mode,
                &self.config.pacing,
                account.window,
                elapsed_today,
                claimed.len(),
                &mut rand::thread_rng(),
            );
            plans.push((account, claimed, delays));
        }

        let tallies = join_all(
            plans
                .into_iter()
                .map(|(account, claimed, delays)| self.deliver(account, claimed, delays, cancel)),
        )
        .await;

        let mut report = BatchReport::empty(BatchOutcome::Completed, mode, started_at);
        for tally in &tallies {
            report.sent += tally.sent;
            report.failed += tally.failed;
            report.deferred += tally.deferred;
        }
        report.per_account = tallies;
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// 可发送的账号：active、有阶段策略、未达上限、有 Ready 会话；
    /// 按阶段降序、剩余额度降序
    async fn eligible_accounts(&self, today: NaiveDate) -> Result<Vec<Eligible>, EngineError> {
        let mut eligible = Vec::new();
        for account in self.store.list_active_accounts().await? {
            let id = account.id.clone();
            let account = match refresh_phase(&*self.store, account, today).await {
                Ok(account) => account,
                Err(e) => {
                    tracing::warn!(account = %id, "Phase refresh failed, skipping account: {}", e);
                    continue;
                }
            };
            let Some(policy) = self.store.get_phase_policy(account.phase).await? else {
                tracing::warn!(account = %account.id, phase = account.phase, "No policy for phase");
                continue;
            };
            let remaining = policy.remaining(account.messages_sent_today);
            if remaining == 0 {
                tracing::debug!(
                    account = %account.id,
                    sent = account.messages_sent_today,
                    cap = policy.daily_cap,
                    "Daily cap reached"
                );
                continue;
            }
            if self.pool.ready_transport(&account.id).await.is_none() {
                continue;
            }
            eligible.push(Eligible {
                account_id: account.id,
                phase: account.phase,
                remaining,
                window: policy.window(),
            });
        }
        eligible.sort_by(|a, b| {
            b.phase
                .cmp(&a.phase)
                .then_with(|| b.remaining.cmp(&a.remaining))
        });
        Ok(eligible)
    }

    /// 一个账号的子批次：严格顺序，按 delays 等待
    async fn deliver(
        &self,
        account: Eligible,
        messages: Vec<PendingMessage>,
        delays: Vec<Duration>,
        cancel: &CancellationToken,
    ) -> AccountTally {
        let mut tally = AccountTally {
            account_id: account.account_id.clone(),
            phase: account.phase,
            claimed: messages.len(),
            ..Default::default()
        };
        let account_id = account.account_id.as_str();

        for (i, (message, delay)) in messages.iter().zip(delays).enumerate() {
            if !delay.is_zero() {
                tracing::debug!(account = %account_id, ?delay, "Waiting before next message");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            // 只在两条消息之间停止：发送与落库之间不可中断
            if cancel.is_cancelled() {
                tally.deferred = messages.len() - i;
                tracing::info!(
                    account = %account_id,
                    deferred = tally.deferred,
                    "Batch stopped, deferring rest of sub-batch"
                );
                break;
            }

            let Some(transport) = self.pool.ready_transport(account_id).await else {
                tally.deferred = messages.len() - i;
                tracing::warn!(
                    account = %account_id,
                    deferred = tally.deferred,
                    "Session no longer ready, deferring rest of sub-batch"
                );
                break;
            };

            let Some(destination) = message.destination().and_then(format_destination) else {
                self.record_failure(
                    message.id,
                    account_id,
                    MessageErrorKind::InvalidDestination,
                    "no usable phone number".to_string(),
                )
                .await;
                tally.failed += 1;
                continue;
            };

            match transport.send(&destination, &message.text()).await {
                Ok(_) => {
                    if let Err(e) = self
                        .store
                        .mark_message(message.id, MessageStatus::Sent, None, Some(account_id))
                        .await
                    {
                        tracing::warn!(message = message.id, "Failed to mark message sent: {}", e);
                    }
                    if let Err(e) = self.store.increment_counters(account_id, 1).await {
                        tracing::warn!(account = %account_id, "Failed to increment counters: {}", e);
                    }
                    tally.sent += 1;
                    tracing::info!(account = %account_id, message = message.id, to = %destination, "Message sent");
                }
                Err(e) => {
                    self.record_failure(message.id, account_id, e.kind(), e.to_string())
                        .await;
                    tally.failed += 1;
                }
            }
        }
        tally
    }

    async fn record_failure(
        &self,
        message_id: i64,
        account_id: &str,
        kind: MessageErrorKind,
        detail: String,
    ) {
        tracing::warn!(
            account = %account_id,
            message = message_id,
            ?kind,
            "Message failed: {}",
            detail
        );
        if let Err(e) = self
            .store
            .mark_message(
                message_id,
                MessageStatus::Failed(kind),
                Some(detail),
                Some(account_id),
            )
            .await
        {
            tracing::warn!(message = message_id, "Failed to record message failure: {}", e);
        }
    }

    /// 启动周期批次循环；已在运行时返回 false
    pub fn start(self: &Arc<Self>) -> bool {
        let token = {
            let mut slot = self.loop_token.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return false;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match this.run_batch_until(DeliveryMode::Paced, &token).await {
                    Ok(_) => {}
                    Err(EngineError::BatchAlreadyRunning) => {
                        tracing::debug!("Previous batch still running, skipping tick");
                    }
                    Err(e) => tracing::error!("Delivery batch failed: {}", e),
                }
            }
            tracing::info!("Delivery loop stopped");
        });
        tracing::info!(interval = ?self.config.interval, "Delivery loop started");
        true
    }

    /// 停止周期循环；进行中的周期批次在当前消息落库后停止，其余消息保持 pending
    pub fn stop(&self) -> bool {
        let token = self
            .loop_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.loop_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            paused: self.policy.is_paused().await,
            batch_active: self.is_batch_active(),
            allowed_days: self.policy.allowed_days().await,
            last_batch: self.last_report.read().await.clone(),
        }
    }

    /// 刷新所有 active 账号的阶段
    pub async fn refresh_all_phases(&self) -> Result<PhaseRefreshReport, EngineError> {
        self.refresh_all_phases_on(Local::now().date_naive()).await
    }

    pub async fn refresh_all_phases_on(
        &self,
        today: NaiveDate,
    ) -> Result<PhaseRefreshReport, EngineError> {
        let mut report = PhaseRefreshReport::default();
        for account in self.store.list_active_accounts().await? {
            report.checked += 1;
            let from = account.phase;
            let id = account.id.clone();
            match refresh_phase(&*self.store, account, today).await {
                Ok(refreshed) if refreshed.phase != from => {
                    report.advanced.push(PhaseChange {
                        account_id: id,
                        from,
                        to: refreshed.phase,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(account = %id, "Phase refresh failed: {}", e);
                    report.failed.push(id);
                }
            }
        }
        if !report.failed.is_empty() {
            tracing::warn!(failed = report.failed.len(), "Some phase refreshes failed");
        }
        Ok(report)
    }

    pub async fn reset_daily_counters(&self) -> Result<usize, EngineError> {
        let n = self.store.reset_daily_counters().await?;
        tracing::info!(accounts = n, "Daily counters reset");
        Ok(n)
    }

    /// 维护循环：定期刷新阶段，本地日期变化时重置每日计数
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_day = Local::now().date_naive();
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let today = Local::now().date_naive();
                if today != last_day {
                    if let Err(e) = this.reset_daily_counters().await {
                        tracing::error!("Daily counter reset failed: {}", e);
                    } else {
                        last_day = today;
                    }
                }
                match this.refresh_all_phases_on(today).await {
                    Ok(report) if !report.advanced.is_empty() || !report.failed.is_empty() => {
                        tracing::info!(
                            advanced = report.advanced.len(),
                            failed = report.failed.len(),
                            "Phases refreshed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Phase refresh failed: {}", e),
                }
            }
            tracing::debug!("Maintenance loop stopped");
        })
    }
}
