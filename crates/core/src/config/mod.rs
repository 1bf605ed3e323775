//! 配置管理
//!
//! 配置按以下顺序合并：内置默认值 → TOML 配置文件 → `SCHEDULER_` 前缀的环境变量。
//! 每个配置段都实现了 `validate()`，加载完成后统一校验。
//!
//! ```rust,no_run
//! use scheduler_core::config::AppConfig;
//!
//! let config = AppConfig::load(Some("config/scheduler.toml")).unwrap();
//! println!("misfire grace: {}s", config.scheduler.misfire_grace_time_seconds);
//! ```

pub mod models;

pub use models::{
    AppConfig, DatabaseConfig, ExecutorConfig, ObservabilityConfig, ScheduleTimezone,
    SchedulerConfig,
};
