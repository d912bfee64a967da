//! SQLite 存储（sqlx，异步）
//!
//! 首次打开时建表并写入默认阶段阶梯（若阶段表为空）。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{
    default_phases, Account, AccountStatus, MessageStatus, PendingMessage, PhasePolicy, Store,
    StoreError, StoreResult,
};

/// SQLite 版 Store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                phase INTEGER NOT NULL DEFAULT 1,
                phase_started_on TEXT NOT NULL,
                messages_sent_today INTEGER NOT NULL DEFAULT 0,
                messages_sent_total INTEGER NOT NULL DEFAULT 0,
                last_activity_at TEXT,
                registered_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS phase_policies (
                phase INTEGER PRIMARY KEY,
                daily_cap INTEGER NOT NULL,
                duration_days INTEGER NOT NULL DEFAULT 0,
                distribution_window_hours INTEGER NOT NULL DEFAULT 8,
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phones TEXT NOT NULL,
                contact_name TEXT,
                company TEXT,
                body TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error_detail TEXT,
                account_id TEXT,
                created_at TEXT NOT NULL,
                sent_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status, created_at)")
            .execute(&self.pool)
            .await?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM phase_policies")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        if count == 0 {
            for policy in default_phases() {
                self.put_phase_policy(&policy).await?;
            }
            tracing::info!("Seeded default phase ladder");
        }

        Ok(())
    }

    /// 写入或覆盖一个阶段策略
    pub async fn put_phase_policy(&self, policy: &PhasePolicy) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO phase_policies
             (phase, daily_cap, duration_days, distribution_window_hours, description)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(policy.phase as i64)
        .bind(policy.daily_cap as i64)
        .bind(policy.duration_days as i64)
        .bind(policy.distribution_window_hours as i64)
        .bind(&policy.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 插入一条待发消息，返回自增 id
    pub async fn insert_message(&self, message: &PendingMessage) -> StoreResult<i64> {
        let phones = serde_json::to_string(&message.phones)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO messages (phones, contact_name, company, body, status, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(phones)
        .bind(&message.contact_name)
        .bind(&message.company)
        .bind(&message.body)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

fn account_from_row(row: &SqliteRow) -> Account {
    Account {
        id: row.get("id"),
        display_name: row.get("display_name"),
        status: AccountStatus::parse(row.get::<String, _>("status").as_str()),
        phase: row.get::<i64, _>("phase") as u32,
        phase_started_on: row.get::<NaiveDate, _>("phase_started_on"),
        messages_sent_today: row.get::<i64, _>("messages_sent_today") as u32,
        messages_sent_total: row.get::<i64, _>("messages_sent_total") as u64,
        last_activity_at: row.get::<Option<DateTime<Utc>>, _>("last_activity_at"),
        registered_at: row.get::<DateTime<Utc>, _>("registered_at"),
    }
}

fn policy_from_row(row: &SqliteRow) -> PhasePolicy {
    PhasePolicy {
        phase: row.get::<i64, _>("phase") as u32,
        daily_cap: row.get::<i64, _>("daily_cap") as u32,
        duration_days: row.get::<i64, _>("duration_days") as u32,
        distribution_window_hours: row.get::<i64, _>("distribution_window_hours") as u32,
        description: row.get("description"),
    }
}

/// 解析失败的行（空/未知状态）返回 None，由调用方跳过并告警
fn message_from_row(row: &SqliteRow) -> Option<PendingMessage> {
    let raw_status: Option<String> = row.get("status");
    let status = MessageStatus::parse(raw_status.as_deref().unwrap_or(""))?;
    let phones: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("phones")).unwrap_or_default();
    Some(PendingMessage {
        id: row.get("id"),
        phones,
        contact_name: row.get("contact_name"),
        company: row.get("company"),
        body: row.get("body"),
        status,
        error_detail: row.get("error_detail"),
        account_id: row.get("account_id"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        sent_at: row.get::<Option<DateTime<Utc>>, _>("sent_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY registered_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(account_from_row).collect())
    }

    async fn list_active_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT * FROM accounts WHERE status = 'active' ORDER BY phase DESC, registered_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(account_from_row).collect())
    }

    async fn upsert_account(&self, id: &str, display_name: &str) -> StoreResult<Account> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO accounts (id, display_name, status, phase, phase_started_on, last_activity_at, registered_at)
             VALUES (?, ?, 'active', 1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                status = 'active',
                last_activity_at = excluded.last_activity_at",
        )
        .bind(id)
        .bind(display_name)
        .bind(Local::now().date_naive())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_account(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn rename_account(
        &self,
        old_id: &str,
        new_id: &str,
        display_name: &str,
    ) -> StoreResult<Account> {
        if old_id != new_id && self.get_account(new_id).await?.is_some() {
            return Err(StoreError::Conflict(new_id.to_string()));
        }
        let result = sqlx::query(
            "UPDATE accounts SET id = ?, display_name = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(new_id)
        .bind(display_name)
        .bind(Utc::now())
        .bind(old_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(old_id.to_string()));
        }
        self.get_account(new_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(new_id.to_string()))
    }

    async fn delete_account(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_account_status(&self, id: &str, status: AccountStatus) -> StoreResult<()> {
        sqlx::query("UPDATE accounts SET status = ?, last_activity_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_account_phase(
        &self,
        id: &str,
        phase: u32,
        started_on: NaiveDate,
    ) -> StoreResult<Account> {
        sqlx::query(
            "UPDATE accounts SET phase = ?, phase_started_on = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(phase as i64)
        .bind(started_on)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_account(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn increment_counters(&self, id: &str, n: u32) -> StoreResult<()> {
        sqlx::query(
            "UPDATE accounts
             SET messages_sent_today = messages_sent_today + ?,
                 messages_sent_total = messages_sent_total + ?,
                 last_activity_at = ?
             WHERE id = ?",
        )
        .bind(n as i64)
        .bind(n as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_daily_counters(&self) -> StoreResult<usize> {
        let result = sqlx::query("UPDATE accounts SET messages_sent_today = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_pending_messages(&self, limit: usize) -> StoreResult<Vec<PendingMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE status IN ('pending', 'transient_send_failure')
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(message_from_row).collect())
    }

    async fn mark_message(
        &self,
        id: i64,
        status: MessageStatus,
        error_detail: Option<String>,
        account_id: Option<&str>,
    ) -> StoreResult<()> {
        let sent_at = match status {
            MessageStatus::Sent => Some(Utc::now()),
            _ => None,
        };
        sqlx::query(
            "UPDATE messages
             SET status = ?, error_detail = ?, sent_at = ?, account_id = COALESCE(?, account_id)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_detail)
        .bind(sent_at)
        .bind(account_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_phase_policy(&self, phase: u32) -> StoreResult<Option<PhasePolicy>> {
        let row = sqlx::query("SELECT * FROM phase_policies WHERE phase = ?")
            .bind(phase as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(policy_from_row))
    }

    async fn next_phase_policy(&self, phase: u32) -> StoreResult<Option<PhasePolicy>> {
        let row = sqlx::query(
            "SELECT * FROM phase_policies WHERE phase > ? ORDER BY phase ASC LIMIT 1",
        )
        .bind(phase as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(policy_from_row))
    }

    async fn list_phase_policies(&self) -> StoreResult<Vec<PhasePolicy>> {
        let rows = sqlx::query("SELECT * FROM phase_policies ORDER BY phase ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(policy_from_row).collect())
    }
}
