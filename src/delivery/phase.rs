//! 阶段推进：当前阶段已满持续天数且存在下一阶段时前进一级

use chrono::NaiveDate;
use serde::Serialize;

use crate::store::{Account, Store, StoreResult};

/// 一次阶段变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseChange {
    pub account_id: String,
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseRefreshReport {
    pub checked: usize,
    pub advanced: Vec<PhaseChange>,
    /// 刷新失败的账号（其余账号照常处理）
    pub failed: Vec<String>,
}

/// 返回刷新后的账号（未变化时原样返回）
pub async fn refresh_phase(
    store: &dyn Store,
    account: Account,
    today: NaiveDate,
) -> StoreResult<Account> {
    let Some(policy) = store.get_phase_policy(account.phase).await? else {
        return Ok(account);
    };
    if policy.is_unlimited() {
        return Ok(account);
    }
    let elapsed_days = (today - account.phase_started_on).num_days();
    if elapsed_days < i64::from(policy.duration_days) {
        return Ok(account);
    }
    let Some(next) = store.next_phase_policy(account.phase).await? else {
        return Ok(account);
    };

    tracing::info!(
        account = %account.id,
        from = account.phase,
        to = next.phase,
        elapsed_days,
        "Advancing account phase"
    );
    store.set_account_phase(&account.id, next.phase, today).await
}
