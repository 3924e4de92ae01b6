//! 毫秒时钟
//!
//! 卡顿检测和 span 结束时间戳共用同一个时间域（UNIX 纪元毫秒）
//!
//! 核心机制：
//! 1. 创建时读取一次系统时间作为基准
//! 2. 之后只累加单调时钟流逝的时间，避免系统时钟跳变被误判为卡顿
//! 3. 单调部分基于 `tokio::time::Instant`，测试中 `tokio::time::pause()` 后可以精确推进

use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// 时间源
pub trait Clock: Send + Sync + Debug {
    /// 当前时间（UNIX 纪元毫秒，带小数部分）
    fn now_ms(&self) -> f64;
}

/// 单调时钟
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    /// 创建时刻的系统时间（毫秒）
    base_unix_ms: f64,
    /// 创建时刻的单调时间点
    origin: Instant,
}

impl MonotonicClock {
    /// 以当前系统时间为基准创建时钟
    pub fn new() -> Self {
        let base_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        Self {
            base_unix_ms,
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.base_unix_ms + self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_close_to_system_time() {
        let clock = MonotonicClock::new();
        let system_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as f64;

        // 刚创建时与系统时间的差距应在 1 秒以内
        assert!((clock.now_ms() - system_ms).abs() < 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = MonotonicClock::new();
        let before = clock.now_ms();

        tokio::time::advance(Duration::from_millis(250)).await;

        let elapsed = clock.now_ms() - before;
        assert!((elapsed - 250.0).abs() < 0.001);
    }
}
