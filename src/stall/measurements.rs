//! 卡顿度量
//!
//! `StallStats` 是某一时刻的计数器快照，`Measurements` 是两次快照之间的差值，
//! 最终附加到上报的 span / transaction 上

use serde::Serialize;

/// 计数器快照
///
/// 全局计数 + 某个 span 自身的最长卡顿
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StallStats {
    /// 卡顿次数
    pub stall_count: u64,
    /// 卡顿总时长（毫秒）
    pub total_stall_time_ms: f64,
    /// 最长一次卡顿（毫秒），只对所属 span 有意义
    pub longest_stall_ms: f64,
}

/// 度量单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementUnit {
    /// 无单位（计数）
    None,
    /// 毫秒
    Millisecond,
}

/// 单项度量
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: MeasurementUnit,
}

impl Measurement {
    fn count(value: u64) -> Self {
        Self {
            value: value as f64,
            unit: MeasurementUnit::None,
        }
    }

    fn millis(value: f64) -> Self {
        Self {
            value,
            unit: MeasurementUnit::Millisecond,
        }
    }
}

/// 一个 span 生命周期内的卡顿度量
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurements {
    pub stall_count: Measurement,
    pub stall_total_time: Measurement,
    pub stall_longest_time: Measurement,
}

impl Measurements {
    /// 根据注册时和结束时的快照计算差值
    ///
    /// 最长卡顿直接取结束快照中该 span 自己记录的值
    pub fn between(start: &StallStats, finish: &StallStats) -> Self {
        Self {
            stall_count: Measurement::count(finish.stall_count.saturating_sub(start.stall_count)),
            stall_total_time: Measurement::millis(
                (finish.total_stall_time_ms - start.total_stall_time_ms).max(0.0),
            ),
            stall_longest_time: Measurement::millis(finish.longest_stall_ms),
        }
    }

    /// 卡顿次数
    pub fn count(&self) -> u64 {
        self.stall_count.value as u64
    }

    /// 卡顿总时长（毫秒）
    pub fn total_time_ms(&self) -> f64 {
        self.stall_total_time.value
    }

    /// 最长卡顿（毫秒）
    pub fn longest_time_ms(&self) -> f64 {
        self.stall_longest_time.value
    }

    /// 转为 JSON，供上报层直接合并进 measurements 字段
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "stall_count": self.stall_count,
            "stall_total_time": self.stall_total_time,
            "stall_longest_time": self.stall_longest_time,
        })
    }
}
