//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OUTREACH__*` 覆盖（双下划线表示嵌套，如 `OUTREACH__POOL__MAX_SENDING=3`）。
//! 允许的星期可用逗号分隔：`OUTREACH__POLICY__ALLOWED_DAYS=1,2,3`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::delivery::{PacingConfig, SchedulerConfig};
use crate::lifecycle::LifecycleConfig;
use crate::pool::PoolLimits;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub pairing: PairingSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 演练模式：协议层只记录发送，不真正投递
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// 启动时是否开启周期批次
    #[serde(default = "default_autostart")]
    pub autostart_scheduler: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            dry_run: default_dry_run(),
            autostart_scheduler: default_autostart(),
        }
    }
}

fn default_dry_run() -> bool {
    true
}

fn default_autostart() -> bool {
    true
}

/// [pool] 段：两个容量池的上限
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_sending")]
    pub max_sending: usize,
    #[serde(default = "default_max_pairing")]
    pub max_pairing: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_sending: default_max_sending(),
            max_pairing: default_max_pairing(),
        }
    }
}

fn default_max_sending() -> usize {
    1
}

fn default_max_pairing() -> usize {
    2
}

/// [pairing] 段：配对码冷却、次数、等待超时、登记会话自动登出延迟
#[derive(Debug, Clone, Deserialize)]
pub struct PairingSection {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_auto_sign_out_delay_ms")]
    pub auto_sign_out_delay_ms: u64,
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            max_attempts: default_max_attempts(),
            wait_timeout_secs: default_wait_timeout_secs(),
            auto_sign_out_delay_ms: default_auto_sign_out_delay_ms(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    2
}

fn default_wait_timeout_secs() -> u64 {
    30
}

fn default_auto_sign_out_delay_ms() -> u64 {
    2000
}

/// [session] 段：重连退避与登出宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_sign_out_grace_secs")]
    pub sign_out_grace_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            sign_out_grace_secs: default_sign_out_grace_secs(),
        }
    }
}

fn default_reconnect_backoff_ms() -> u64 {
    3000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_sign_out_grace_secs() -> u64 {
    10
}

/// [delivery] 段：批次大小、周期、间隔与抖动
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_maintenance_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_min_spacing_secs")]
    pub min_spacing_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_send_all_min_ms")]
    pub send_all_min_ms: u64,
    #[serde(default = "default_send_all_max_ms")]
    pub send_all_max_ms: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_secs: default_interval_secs(),
            maintenance_interval_secs: default_maintenance_secs(),
            min_spacing_secs: default_min_spacing_secs(),
            jitter: default_jitter(),
            send_all_min_ms: default_send_all_min_ms(),
            send_all_max_ms: default_send_all_max_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_interval_secs() -> u64 {
    300
}

fn default_maintenance_secs() -> u64 {
    3600
}

fn default_min_spacing_secs() -> u64 {
    5
}

fn default_jitter() -> f64 {
    0.3
}

fn default_send_all_min_ms() -> u64 {
    2000
}

fn default_send_all_max_ms() -> u64 {
    3000
}

/// [policy] 段：允许的星期（0 = 周日）与初始暂停状态
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "crate::delivery::policy::default_allowed_days")]
    pub allowed_days: Vec<u32>,
    #[serde(default)]
    pub paused: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            allowed_days: crate::delivery::policy::default_allowed_days(),
            paused: false,
        }
    }
}

/// [storage] 段：设置 sqlite_path 且启用 async-sqlite 时使用 SQLite，否则用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    pub sqlite_path: Option<PathBuf>,
}

impl AppConfig {
    /// 拒绝会让周期任务无法运行的取值（间隔为 0 时 tokio::time::interval 会 panic）
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let d = &self.delivery;
        let zero = [
            ("delivery.interval_secs", d.interval_secs == 0),
            ("delivery.maintenance_interval_secs", d.maintenance_interval_secs == 0),
            ("delivery.batch_size", d.batch_size == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((key, _)) => Err(config::ConfigError::Message(format!(
                "{} must be greater than 0",
                key
            ))),
            None => Ok(()),
        }
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_sending: self.pool.max_sending,
            max_pairing: self.pool.max_pairing,
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            pairing_cooldown: Duration::from_secs(self.pairing.cooldown_secs),
            max_pairing_attempts: self.pairing.max_attempts,
            pairing_wait_timeout: Duration::from_secs(self.pairing.wait_timeout_secs),
            ephemeral_sign_out_delay: Duration::from_millis(self.pairing.auto_sign_out_delay_ms),
            reconnect_backoff: Duration::from_millis(self.session.reconnect_backoff_ms),
            reconnect_attempts: self.session.reconnect_attempts,
            sign_out_grace: Duration::from_secs(self.session.sign_out_grace_secs),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        let d = &self.delivery;
        SchedulerConfig {
            batch_size: d.batch_size,
            interval: Duration::from_secs(d.interval_secs),
            maintenance_interval: Duration::from_secs(d.maintenance_interval_secs),
            pacing: PacingConfig {
                min_spacing: Duration::from_secs(d.min_spacing_secs),
                jitter: d.jitter.clamp(0.0, 1.0),
                send_all_min: Duration::from_millis(d.send_all_min_ms),
                send_all_max: Duration::from_millis(d.send_all_max_ms.max(d.send_all_min_ms)),
            },
        }
    }
}

/// 从 config 目录加载配置，环境变量 OUTREACH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OUTREACH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OUTREACH")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("policy.allowed_days")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pool.max_sending, 1);
        assert_eq!(cfg.pool.max_pairing, 2);
        assert_eq!(cfg.policy.allowed_days, vec![1, 2, 3, 4, 5]);

        let lifecycle = cfg.lifecycle();
        assert_eq!(lifecycle.pairing_cooldown, Duration::from_secs(60));
        assert_eq!(lifecycle.reconnect_backoff, Duration::from_secs(3));

        let scheduler = cfg.scheduler();
        assert_eq!(scheduler.batch_size, 1000);
        assert_eq!(scheduler.interval, Duration::from_secs(300));
        assert_eq!(scheduler.pacing.min_spacing, Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pool]\nmax_sending = 4\n\n[policy]\nallowed_days = [0, 6]\npaused = true"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.pool.max_sending, 4);
        assert_eq!(cfg.pool.max_pairing, 2);
        assert_eq!(cfg.policy.allowed_days, vec![0, 6]);
        assert!(cfg.policy.paused);
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[delivery]\ninterval_secs = 0").unwrap();
        let err = load_config(Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("delivery.interval_secs"));

        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.delivery.maintenance_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
