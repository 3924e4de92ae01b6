// 配置管理模块

use crate::cache::ExpiringCacheConfig;
use crate::error::ConfigError;
use crate::stall::StallTrackerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 可接受繁忙时间的下限（毫秒），低于此值 tick 间隔为 0
pub const MIN_ACCEPTABLE_BUSY_TIME_MS: u64 = 5;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 卡顿跟踪配置
    #[serde(default)]
    pub stall: StallConfig,
    /// 异步缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 卡顿跟踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    /// 可接受的繁忙时间（毫秒），tick 间隔为其 1/5
    #[serde(default = "default_acceptable_busy_time_ms")]
    pub acceptable_busy_time_ms: u64,

    /// 最大同时跟踪的 span 数
    #[serde(default = "default_max_tracked_spans")]
    pub max_tracked_spans: usize,

    /// span 结束时间误差范围（毫秒）
    #[serde(default = "default_margin_of_error_ms")]
    pub margin_of_error_ms: u64,
}

fn default_acceptable_busy_time_ms() -> u64 {
    crate::stall::DEFAULT_ACCEPTABLE_BUSY_TIME_MS
}

fn default_max_tracked_spans() -> usize {
    crate::stall::DEFAULT_MAX_TRACKED_SPANS
}

fn default_margin_of_error_ms() -> u64 {
    crate::stall::DEFAULT_MARGIN_OF_ERROR_MS
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            acceptable_busy_time_ms: default_acceptable_busy_time_ms(),
            max_tracked_spans: default_max_tracked_spans(),
            margin_of_error_ms: default_margin_of_error_ms(),
        }
    }
}

impl StallConfig {
    /// 转换为 StallTrackerConfig
    pub fn to_tracker_config(&self) -> StallTrackerConfig {
        StallTrackerConfig {
            acceptable_busy_time_ms: self.acceptable_busy_time_ms,
            max_tracked_spans: self.max_tracked_spans,
            margin_of_error_ms: self.margin_of_error_ms,
        }
    }
}

/// 异步缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 计算完成后的存活时间（毫秒）
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    /// 后台清理间隔（毫秒）
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_cache_ttl_ms() -> u64 {
    2000
}

fn default_cleanup_interval_ms() -> u64 {
    5000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl CacheConfig {
    /// 转换为 ExpiringCacheConfig
    pub fn to_expiring_cache_config(&self) -> ExpiringCacheConfig {
        ExpiringCacheConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stall.acceptable_busy_time_ms < MIN_ACCEPTABLE_BUSY_TIME_MS {
            return Err(ConfigError::BusyTimeTooSmall {
                min: MIN_ACCEPTABLE_BUSY_TIME_MS,
                actual: self.stall.acceptable_busy_time_ms,
            });
        }
        if self.stall.max_tracked_spans == 0 {
            return Err(ConfigError::NoTrackedSpans);
        }
        if self.cache.ttl_ms == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.cache.cleanup_interval_ms == 0 {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载配置，失败时使用默认配置（不写回文件）
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
