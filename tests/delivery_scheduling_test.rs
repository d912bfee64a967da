//! 投递调度集成测试：会话经生命周期控制器变为 Ready，再由调度器按批次发送

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Local, TimeZone};
    use outreach::delivery::{
        BatchOutcome, DeliveryMode, DeliveryScheduler, GlobalSendPolicy, SchedulerConfig,
    };
    use outreach::lifecycle::{CreateSession, LifecycleConfig, LifecycleController, LifecycleEvent};
    use outreach::pool::{PoolLimits, SessionPool};
    use outreach::protocol::DryRunConnector;
    use outreach::store::{
        Account, MemoryStore, MessageErrorKind, MessageStatus, PendingMessage, PhasePolicy, Store,
    };
    use outreach::EngineError;

    struct Harness {
        store: Arc<MemoryStore>,
        connector: DryRunConnector,
        lifecycle: Arc<LifecycleController>,
        scheduler: Arc<DeliveryScheduler>,
        policy: Arc<GlobalSendPolicy>,
    }

    fn harness(connector: DryRunConnector, phases: Vec<PhasePolicy>, max_sending: usize) -> Harness {
        let store = Arc::new(MemoryStore::new(phases));
        let pool = Arc::new(SessionPool::new(PoolLimits {
            max_sending,
            max_pairing: 2,
        }));
        let policy = Arc::new(GlobalSendPolicy::default());
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&pool),
            store.clone(),
            Arc::new(connector.clone()),
            LifecycleConfig::default(),
        ));
        let scheduler = Arc::new(DeliveryScheduler::new(
            store.clone(),
            pool,
            Arc::clone(&policy),
            SchedulerConfig::default(),
        ));
        Harness {
            store,
            connector,
            lifecycle,
            scheduler,
            policy,
        }
    }

    /// 创建会话并等待其 Ready
    async fn ready_session(h: &Harness, temp_id: &str) {
        let mut rx = h.lifecycle.subscribe();
        h.lifecycle
            .create_session(CreateSession::sending(temp_id))
            .await
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("session never became ready")
                .unwrap();
            if let LifecycleEvent::Ready { temp_id: t, .. } = event {
                if t == temp_id {
                    break;
                }
            }
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 10, day, hour, 0, 0)
            .single()
            .unwrap()
    }

    /// 2026-10-19 是周一
    fn monday_midnight() -> DateTime<Local> {
        at(19, 0)
    }

    async fn add_messages(store: &MemoryStore, count: i64, first_id: i64) {
        for i in 0..count {
            let id = first_id + i;
            store
                .add_message(PendingMessage::new(
                    id,
                    format!("+52 1 555 000 {:04}", id),
                    format!("mensaje {}", id),
                ))
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_messages_paced_across_window() {
        let connector = DryRunConnector::new().map_identity("temp", "5215550001111", "Ana");
        let h = harness(connector, vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "temp").await;
        add_messages(&h.store, 5, 1).await;

        let started = tokio::time::Instant::now();
        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::Paced, monday_midnight())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.sent, 5);
        assert_eq!(report.per_account.len(), 1);
        assert_eq!(report.per_account[0].claimed, 5);

        let average = Duration::from_secs(8 * 3600) / 5;
        // 计时器按毫秒取整，留一秒余量
        assert!(elapsed <= average.mul_f64(1.3) * 4 + Duration::from_secs(1));
        assert!(elapsed >= average.mul_f64(0.7) * 4);

        let sent: Vec<String> = h.connector.sent().into_iter().map(|r| r.body).collect();
        let expected: Vec<String> = (1..=5).map(|i| format!("mensaje {}", i)).collect();
        assert_eq!(sent, expected);

        let account = h.store.get_account("5215550001111").await.unwrap().unwrap();
        assert_eq!(account.messages_sent_today, 5);
        assert_eq!(account.messages_sent_total, 5);
        for message in h.store.messages().await {
            assert_eq!(message.status, MessageStatus::Sent);
            assert_eq!(message.account_id.as_deref(), Some("5215550001111"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disallowed_weekday_is_noop() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 3, 1).await;

        // 2026-10-24 是周六（6）
        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::Paced, at(24, 10))
            .await
            .unwrap();
        assert_eq!(report.outcome, BatchOutcome::DayNotAllowed);
        assert!(h.connector.sent().is_empty());
        assert!(h
            .store
            .messages()
            .await
            .iter()
            .all(|m| m.status == MessageStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_policy_is_noop() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 2, 1).await;

        h.policy.pause().await;
        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.outcome, BatchOutcome::Paused);
        assert!(h.connector.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_at_cap_is_excluded() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        let mut account = Account::new("acct", "Capped", monday_midnight().date_naive());
        account.messages_sent_today = 20;
        h.store.insert_account(account).await;
        ready_session(&h, "acct").await;
        add_messages(&h.store, 3, 1).await;

        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.outcome, BatchOutcome::NoSessions);
        assert!(h.connector.sent().is_empty());
        assert_eq!(
            h.store.get_account("acct").await.unwrap().unwrap().messages_sent_today,
            20
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_stops_at_remaining_quota() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 3, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 5, 1).await;

        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.sent, 3);
        let pending = h.store.get_pending_messages(100).await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_destination_is_permanent() {
        let connector = DryRunConnector::new().mark_unreachable("+52 1 555 000 0002");
        let h = harness(connector, vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 3, 1).await;

        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);

        let failed = h.store.message(2).await.unwrap();
        assert_eq!(
            failed.status,
            MessageStatus::Failed(MessageErrorKind::DestinationUnreachable)
        );
        assert!(failed.error_detail.is_some());
        // 只有成功的两条计入
        let account = h.store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.messages_sent_today, 2);

        // 不会被后续批次自动重试
        let again = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(again.outcome, BatchOutcome::NoPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_stays_claimable() {
        let connector = DryRunConnector::new().mark_transient("+52 1 555 000 0001");
        let h = harness(connector, vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 1, 1).await;

        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        let pending = h.store.get_pending_messages(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].status,
            MessageStatus::Failed(MessageErrorKind::TransientSendFailure)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_destination_is_invalid() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        let mut message = PendingMessage::new(1, "  ", "hola");
        message.phones.push(String::new());
        h.store.add_message(message).await;

        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            h.store.message(1).await.unwrap().status,
            MessageStatus::Failed(MessageErrorKind::InvalidDestination)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_accounts_never_send_same_message() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 2);
        ready_session(&h, "a").await;
        ready_session(&h, "b").await;
        add_messages(&h.store, 30, 1).await;

        let report = h
            .scheduler
            .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
            .await
            .unwrap();
        assert_eq!(report.sent, 30);
        assert_eq!(report.per_account.len(), 2);
        let claimed: usize = report.per_account.iter().map(|t| t.claimed).sum();
        assert_eq!(claimed, 30);

        let sent = h.connector.sent();
        let unique: HashSet<&str> = sent.iter().map(|r| r.to.as_str()).collect();
        assert_eq!(unique.len(), sent.len());
        assert_eq!(sent.len(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_batch_rejected() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 3, 1).await;
        // 后台批次使用当前时间，放开全部星期
        h.policy
            .set_allowed_days(&[0, 1, 2, 3, 4, 5, 6])
            .await
            .unwrap();

        h.scheduler.trigger(DeliveryMode::SendAllNow).unwrap();
        assert!(h.scheduler.is_batch_active());
        assert!(matches!(
            h.scheduler.run_batch(DeliveryMode::SendAllNow).await,
            Err(EngineError::BatchAlreadyRunning)
        ));
        assert!(matches!(
            h.scheduler.trigger(DeliveryMode::Paced),
            Err(EngineError::BatchAlreadyRunning)
        ));

        while h.scheduler.is_batch_active() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // 只执行了一个批次
        assert_eq!(h.connector.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_defers_rest_of_sub_batch() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 4, 1).await;

        let scheduler = Arc::clone(&h.scheduler);
        let batch = tokio::spawn(async move {
            scheduler
                .run_batch_at(DeliveryMode::SendAllNow, monday_midnight())
                .await
        });
        // 第一条立即发送，之后 2–3 秒一条；在第二条之前登出
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.lifecycle.sign_out("acct").await.unwrap();

        let report = batch.await.unwrap().unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.deferred, 3);
        assert_eq!(h.store.get_pending_messages(10).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_loop_finishes_current_message_only() {
        let h = harness(DryRunConnector::new(), vec![PhasePolicy::new(1, 20, 0, 8)], 1);
        ready_session(&h, "acct").await;
        add_messages(&h.store, 3, 1).await;
        h.policy
            .set_allowed_days(&[0, 1, 2, 3, 4, 5, 6])
            .await
            .unwrap();

        // 第一次 tick 立即触发批次：首条立即发送，下一条至少间隔 5 秒
        assert!(h.scheduler.start());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.scheduler.stop());

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert!(!h.scheduler.is_batch_active());

        // 已发送的消息都已落库，其余保持 pending
        assert_eq!(h.connector.sent().len(), 1);
        assert_eq!(h.store.message(1).await.unwrap().status, MessageStatus::Sent);
        for id in [2, 3] {
            assert_eq!(
                h.store.message(id).await.unwrap().status,
                MessageStatus::Pending
            );
        }
        let last = h.scheduler.status().await.last_batch.unwrap();
        assert_eq!(last.sent, 1);
        assert_eq!(last.deferred, 2);
        assert_eq!(
            h.store.get_account("acct").await.unwrap().unwrap().messages_sent_today,
            1
        );
    }
}
