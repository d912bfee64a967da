//! outreach - 外呼会话池与定时投递引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、引擎装配、优雅关闭
//! - **control**: 操作面（成功/失败信封，供外部 HTTP 层调用）
//! - **delivery**: 发送策略、节奏、阶段推进与批次调度
//! - **lifecycle**: 会话状态机、身份重映射、生命周期事件
//! - **observability**: tracing 初始化
//! - **pool**: 有界会话池（发送 / 配对两个容量类别）与别名表
//! - **protocol**: 聊天协议边界与 dry-run 实现
//! - **store**: 账号、阶段策略与待发消息的持久化边界

pub mod config;
pub mod control;
pub mod core;
pub mod delivery;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod store;

pub use crate::core::{Engine, EngineBuilder, EngineError};
