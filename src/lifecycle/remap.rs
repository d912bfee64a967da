//! 身份重映射：会话首次 Ready 时把临时 id 下的账号记录迁到真实账号 id
//!
//! 规则：
//! - real_id 已有记录：更新名称并置为 active，删除临时记录
//! - 只有临时记录：原地改 id（保留阶段与计数）
//! - 都没有：以 real_id 新建
//!
//! 调用方负责串行化（LifecycleController 持有 remap 锁）。

use crate::store::{Account, AccountStatus, Store, StoreError, StoreResult};

pub(crate) async fn remap_identity(
    store: &dyn Store,
    temp_id: &str,
    real_id: &str,
    display_name: &str,
) -> StoreResult<Account> {
    if temp_id == real_id {
        return store.upsert_account(real_id, display_name).await;
    }

    if store.get_account(real_id).await?.is_some() {
        return merge_into_existing(store, temp_id, real_id, display_name).await;
    }

    if store.get_account(temp_id).await?.is_some() {
        match store.rename_account(temp_id, real_id, display_name).await {
            Ok(mut account) => {
                store
                    .set_account_status(real_id, AccountStatus::Active)
                    .await?;
                account.status = AccountStatus::Active;
                tracing::info!(from = %temp_id, to = %real_id, "Account re-keyed in place");
                return Ok(account);
            }
            // 另一路径已经写入了 real_id
            Err(StoreError::Conflict(_)) => {
                return merge_into_existing(store, temp_id, real_id, display_name).await;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(account = %real_id, "Registering new account");
    store.upsert_account(real_id, display_name).await
}

async fn merge_into_existing(
    store: &dyn Store,
    temp_id: &str,
    real_id: &str,
    display_name: &str,
) -> StoreResult<Account> {
    let account = store.upsert_account(real_id, display_name).await?;
    if store.delete_account(temp_id).await? {
        tracing::info!(placeholder = %temp_id, account = %real_id, "Dropped placeholder account");
    }
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Local;

    #[tokio::test]
    async fn test_existing_real_account_absorbs_placeholder() {
        let store = MemoryStore::default();
        let today = Local::now().date_naive();
        let mut real = Account::new("5215550001111", "Old", today);
        real.phase = 3;
        real.status = AccountStatus::Inactive;
        store.insert_account(real).await;
        store.insert_account(Account::new("temp", "temp", today)).await;

        let account = remap_identity(&store, "temp", "5215550001111", "Ana")
            .await
            .unwrap();
        assert_eq!(account.phase, 3);
        assert!(account.is_active());
        assert_eq!(account.display_name, "Ana");
        assert!(store.get_account("temp").await.unwrap().is_none());
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn test_placeholder_renamed_in_place() {
        let store = MemoryStore::default();
        let today = Local::now().date_naive();
        let mut temp = Account::new("temp", "temp", today);
        temp.messages_sent_total = 12;
        temp.status = AccountStatus::Inactive;
        store.insert_account(temp).await;

        let account = remap_identity(&store, "temp", "5215550001111", "Ana")
            .await
            .unwrap();
        assert_eq!(account.id, "5215550001111");
        assert_eq!(account.messages_sent_total, 12);
        assert!(account.is_active());
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn test_fresh_account_created() {
        let store = MemoryStore::default();
        let account = remap_identity(&store, "temp", "5215550001111", "Ana")
            .await
            .unwrap();
        assert_eq!(account.phase, 1);
        assert!(store.get_account("temp").await.unwrap().is_none());
    }
}
