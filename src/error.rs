// 错误类型

use thiserror::Error;

/// 配置校验错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// 可接受繁忙时间过小
    #[error("可接受繁忙时间过小: {actual}ms（至少 {min}ms，否则 tick 间隔为 0）")]
    BusyTimeTooSmall { min: u64, actual: u64 },

    /// 最大跟踪数为 0
    #[error("最大跟踪 span 数不能为 0")]
    NoTrackedSpans,

    /// 过期时间为 0
    #[error("缓存过期时间不能为 0")]
    ZeroTtl,

    #[error("缓存清理间隔不能为 0")]
    ZeroCleanupInterval,
}
