//! 核心层：错误类型、引擎装配、优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{open_store, Engine, EngineBuilder};
pub use error::{EngineError, SendError};
pub use shutdown::{
    run_with_graceful_shutdown, SchedulerStopCleanup, SessionResetCleanup, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
