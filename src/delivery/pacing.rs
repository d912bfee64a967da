//! 发送节奏：把账号的剩余分配窗口均摊到子批次的每条消息上
//!
//! 窗口以本地午夜为起点：remaining = window - min(今日已过时长, window)，
//! 平均间隔 = remaining / n，每个间隔在平均值上做 ±jitter 抖动，且不低于最小间隔。
//! 第一条消息立即发送。

use std::time::Duration;

use chrono::{DateTime, Local, Timelike};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 批次模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// 按阶段窗口均摊，带抖动
    Paced,
    /// 固定短间隔，仍遵守星期、暂停与每日上限
    SendAllNow,
}

#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub min_spacing: Duration,
    /// 相对抖动幅度（0.3 = ±30%）
    pub jitter: f64,
    pub send_all_min: Duration,
    pub send_all_max: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(5),
            jitter: 0.3,
            send_all_min: Duration::from_secs(2),
            send_all_max: Duration::from_secs(3),
        }
    }
}

pub fn elapsed_since_midnight(now: DateTime<Local>) -> Duration {
    Duration::from_secs(u64::from(now.time().num_seconds_from_midnight()))
}

/// 剩余窗口均摊后的平均间隔
pub fn average_spacing(window: Duration, elapsed_today: Duration, count: usize) -> Duration {
    let remaining = window.saturating_sub(elapsed_today.min(window));
    remaining / count.max(1) as u32
}

/// 每条消息发送前的等待时长；第一个恒为零
pub fn plan_delays<R: Rng + ?Sized>(
    mode: DeliveryMode,
    config: &PacingConfig,
    window: Duration,
    elapsed_today: Duration,
    count: usize,
    rng: &mut R,
) -> Vec<Duration> {
    let average = average_spacing(window, elapsed_today, count);
    (0..count)
        .map(|i| {
            if i == 0 {
                return Duration::ZERO;
            }
            match mode {
                DeliveryMode::Paced => {
                    let factor = if config.jitter > 0.0 {
                        1.0 + rng.gen_range(-config.jitter..=config.jitter)
                    } else {
                        1.0
                    };
                    average.mul_f64(factor.max(0.0)).max(config.min_spacing)
                }
                DeliveryMode::SendAllNow => {
                    if config.send_all_max > config.send_all_min {
                        rng.gen_range(config.send_all_min..=config.send_all_max)
                    } else {
                        config.send_all_min
                    }
                }
            }
        })
        .collect()
}
