//! 内存存储：账号、消息与阶段策略均保存在进程内

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{
    default_phases, Account, AccountStatus, MessageStatus, PendingMessage, PhasePolicy, Store,
    StoreError, StoreResult,
};

/// 内存版 Store
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    messages: RwLock<BTreeMap<i64, PendingMessage>>,
    phases: RwLock<BTreeMap<u32, PhasePolicy>>,
}

impl MemoryStore {
    pub fn new(phases: Vec<PhasePolicy>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            messages: RwLock::new(BTreeMap::new()),
            phases: RwLock::new(phases.into_iter().map(|p| (p.phase, p)).collect()),
        }
    }

    /// 直接写入账号（导入或测试预置）
    pub async fn insert_account(&self, account: Account) {
        self.accounts.write().await.insert(account.id.clone(), account);
    }

    /// 追加一条消息（上传/导入协作者的入口）
    pub async fn add_message(&self, message: PendingMessage) {
        self.messages.write().await.insert(message.id, message);
    }

    pub async fn message(&self, id: i64) -> Option<PendingMessage> {
        self.messages.read().await.get(&id).cloned()
    }

    pub async fn messages(&self) -> Vec<PendingMessage> {
        self.messages.read().await.values().cloned().collect()
    }

    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(default_phases())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut all: Vec<Account> = self.accounts.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        Ok(all)
    }

    async fn list_active_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut active: Vec<Account> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.phase
                .cmp(&a.phase)
                .then_with(|| b.registered_at.cmp(&a.registered_at))
        });
        Ok(active)
    }

    async fn upsert_account(&self, id: &str, display_name: &str) -> StoreResult<Account> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .entry(id.to_string())
            .and_modify(|a| {
                a.display_name = display_name.to_string();
                a.status = AccountStatus::Active;
                a.last_activity_at = Some(Utc::now());
            })
            .or_insert_with(|| Account::new(id, display_name, today()));
        Ok(account.clone())
    }

    async fn rename_account(
        &self,
        old_id: &str,
        new_id: &str,
        display_name: &str,
    ) -> StoreResult<Account> {
        let mut accounts = self.accounts.write().await;
        if old_id != new_id && accounts.contains_key(new_id) {
            return Err(StoreError::Conflict(new_id.to_string()));
        }
        let mut account = accounts
            .remove(old_id)
            .ok_or_else(|| StoreError::NotFound(old_id.to_string()))?;
        account.id = new_id.to_string();
        account.display_name = display_name.to_string();
        account.last_activity_at = Some(Utc::now());
        accounts.insert(new_id.to_string(), account.clone());
        Ok(account)
    }

    async fn delete_account(&self, id: &str) -> StoreResult<bool> {
        Ok(self.accounts.write().await.remove(id).is_some())
    }

    async fn set_account_status(&self, id: &str, status: AccountStatus) -> StoreResult<()> {
        if let Some(account) = self.accounts.write().await.get_mut(id) {
            account.status = status;
            account.last_activity_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_account_phase(
        &self,
        id: &str,
        phase: u32,
        started_on: NaiveDate,
    ) -> StoreResult<Account> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        account.phase = phase;
        account.phase_started_on = started_on;
        account.last_activity_at = Some(Utc::now());
        Ok(account.clone())
    }

    async fn increment_counters(&self, id: &str, n: u32) -> StoreResult<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        account.messages_sent_today += n;
        account.messages_sent_total += u64::from(n);
        account.last_activity_at = Some(Utc::now());
        Ok(())
    }

    async fn reset_daily_counters(&self) -> StoreResult<usize> {
        let mut accounts = self.accounts.write().await;
        for account in accounts.values_mut() {
            account.messages_sent_today = 0;
        }
        Ok(accounts.len())
    }

    async fn get_pending_messages(&self, limit: usize) -> StoreResult<Vec<PendingMessage>> {
        let messages = self.messages.read().await;
        let mut pending: Vec<PendingMessage> = messages
            .values()
            .filter(|m| m.status.is_claimable())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_message(
        &self,
        id: i64,
        status: MessageStatus,
        error_detail: Option<String>,
        account_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        message.status = status;
        message.error_detail = error_detail;
        if let Some(account_id) = account_id {
            message.account_id = Some(account_id.to_string());
        }
        message.sent_at = match status {
            MessageStatus::Sent => Some(Utc::now()),
            _ => None,
        };
        Ok(())
    }

    async fn get_phase_policy(&self, phase: u32) -> StoreResult<Option<PhasePolicy>> {
        Ok(self.phases.read().await.get(&phase).cloned())
    }

    async fn next_phase_policy(&self, phase: u32) -> StoreResult<Option<PhasePolicy>> {
        let Some(start) = phase.checked_add(1) else {
            return Ok(None);
        };
        Ok(self
            .phases
            .read()
            .await
            .range(start..)
            .next()
            .map(|(_, p)| p.clone()))
    }

    async fn list_phase_policies(&self) -> StoreResult<Vec<PhasePolicy>> {
        Ok(self.phases.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageErrorKind;

    #[tokio::test]
    async fn test_upsert_then_rename_keeps_counters() {
        let store = MemoryStore::default();
        store.upsert_account("temp-1", "Temp").await.unwrap();
        store.increment_counters("temp-1", 3).await.unwrap();

        let renamed = store
            .rename_account("temp-1", "5215550001111", "Ana")
            .await
            .unwrap();
        assert_eq!(renamed.id, "5215550001111");
        assert_eq!(renamed.messages_sent_today, 3);
        assert!(store.get_account("temp-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_onto_existing_conflicts() {
        let store = MemoryStore::default();
        store.upsert_account("a", "A").await.unwrap();
        store.upsert_account("b", "B").await.unwrap();
        assert!(matches!(
            store.rename_account("a", "b", "B").await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_includes_retryable_failures_only() {
        let store = MemoryStore::default();
        for id in 1..=3 {
            store.add_message(PendingMessage::new(id, "5215550000000", "hi")).await;
        }
        store
            .mark_message(
                1,
                MessageStatus::Failed(MessageErrorKind::TransientSendFailure),
                None,
                None,
            )
            .await
            .unwrap();
        store
            .mark_message(
                2,
                MessageStatus::Failed(MessageErrorKind::DestinationUnreachable),
                None,
                None,
            )
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .get_pending_messages(10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_next_phase_skips_gaps() {
        let store = MemoryStore::new(vec![PhasePolicy::new(1, 10, 3, 8), PhasePolicy::new(5, 50, 0, 8)]);
        let next = store.next_phase_policy(1).await.unwrap().unwrap();
        assert_eq!(next.phase, 5);
        assert!(store.next_phase_policy(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_highest_phase_number_has_no_successor() {
        let store = MemoryStore::new(vec![PhasePolicy::new(u32::MAX, 10, 3, 8)]);
        assert!(store.next_phase_policy(u32::MAX).await.unwrap().is_none());
        assert_eq!(
            store.next_phase_policy(0).await.unwrap().unwrap().phase,
            u32::MAX
        );
    }
}
