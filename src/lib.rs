// App Monitoring Core Library
// 应用监控核心库：事件循环卡顿跟踪 + 异步结果缓存

// 公共模块（时钟）
pub mod common;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 卡顿跟踪模块
pub mod stall;

// 异步缓存模块
pub mod cache;

// 导出常用类型
pub use cache::{CacheLookup, ExpiringAsyncCache, ExpiringCacheConfig, PendingValue};
pub use common::{Clock, MonotonicClock};
pub use config::AppConfig;
pub use error::ConfigError;
pub use stall::{
    AppState, AppStateChannel, AppStateProvider, Measurements, SpanFinisher, StallStats,
    StallTracker, StallTrackerConfig,
};
