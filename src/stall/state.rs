//! 卡顿跟踪状态
//!
//! 所有计数器和 span 注册表都归 `StallState` 独占，只在持锁的同步代码中修改，
//! 定时器任务和结束回调都通过 `StallTracker` 间接访问

use super::measurements::StallStats;
use std::collections::HashMap;
use tokio::task::JoinHandle;

/// 时间戳快照的匹配容差（毫秒）
///
/// 生产方与消费方的浮点时间戳可能有微小误差，1 微秒以内视为同一时刻
pub(crate) const TIMESTAMP_TOLERANCE_MS: f64 = 0.001;

/// 带时间戳的计数器快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TimestampedStats {
    pub timestamp_ms: f64,
    pub stats: StallStats,
}

/// 单个 span 的注册信息
#[derive(Debug, Clone)]
pub(crate) struct SpanRegistration {
    /// 注册序号，越小越早
    pub seq: u64,
    /// 注册以来的最长卡顿（毫秒）
    pub longest_stall_ms: f64,
    /// 注册时的计数器快照
    pub at_start: StallStats,
    /// 最近一次子 span 结束时的快照
    pub at_timestamp: Option<TimestampedStats>,
}

/// 子 span 结束记录结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpanEndOutcome {
    /// 已记录快照
    Recorded,
    /// 结束时间偏离当前时间过多，未记录
    OutsideMargin {
        /// 是否同时丢弃了更早的旧快照
        dropped_snapshot: bool,
    },
    /// 根 span 未被跟踪
    NotTracked,
}

/// 卡顿跟踪状态
#[derive(Debug, Default)]
pub(crate) struct StallState {
    /// 卡顿次数
    pub stall_count: u64,
    /// 卡顿总时长（毫秒）
    pub total_stall_time_ms: f64,
    /// 跟踪器生命周期内的最长卡顿（毫秒）
    pub longest_stall_ms: f64,
    /// 上次 tick 的时间（毫秒）
    pub last_interval_ms: f64,
    /// 应用是否处于后台
    pub is_backgrounded: bool,
    /// tick 定时任务，未运行时为 None
    pub timeout_handle: Option<JoinHandle<()>>,
    /// 前后台状态监听任务
    pub app_state_task: Option<JoinHandle<()>>,
    /// span_id -> 注册信息
    registrations: HashMap<String, SpanRegistration>,
    /// 下一个注册序号
    next_seq: u64,
}

impl StallState {
    /// 执行一次 tick
    ///
    /// # 返回
    /// - `Some(stall_time)`: 本次 tick 判定为卡顿
    /// - `None`: 正常，或处于后台
    pub fn tick(&mut self, now_ms: f64, acceptable_busy_time_ms: f64) -> Option<f64> {
        let busy_time = now_ms - self.last_interval_ms;
        self.last_interval_ms = now_ms;

        // 后台时应用线程被系统冻结，间隔没有参考价值
        if self.is_backgrounded {
            return None;
        }

        if busy_time < acceptable_busy_time_ms {
            return None;
        }

        let stall_time = busy_time - acceptable_busy_time_ms;
        self.stall_count += 1;
        self.total_stall_time_ms += stall_time;
        self.longest_stall_ms = self.longest_stall_ms.max(stall_time);

        for registration in self.registrations.values_mut() {
            registration.longest_stall_ms = registration.longest_stall_ms.max(stall_time);
        }

        Some(stall_time)
    }

    /// 把上次 tick 时间重置为当前时间
    pub fn resync(&mut self, now_ms: f64) {
        self.last_interval_ms = now_ms;
    }

    fn snapshot(&self, longest_stall_ms: f64) -> StallStats {
        StallStats {
            stall_count: self.stall_count,
            total_stall_time_ms: self.total_stall_time_ms,
            longest_stall_ms,
        }
    }

    /// 全局快照
    pub fn global_stats(&self) -> StallStats {
        self.snapshot(self.longest_stall_ms)
    }

    /// 某个注册项在当前时刻的快照
    pub fn current_stats(&self, registration: &SpanRegistration) -> StallStats {
        self.snapshot(registration.longest_stall_ms)
    }

    pub fn is_registered(&self, span_id: &str) -> bool {
        self.registrations.contains_key(span_id)
    }

    pub fn tracked_span_count(&self) -> usize {
        self.registrations.len()
    }

    /// 注册 span，返回注册序号
    ///
    /// 调用方需先用 `is_registered` 排除重复注册
    pub fn register(&mut self, span_id: String) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let registration = SpanRegistration {
            seq,
            longest_stall_ms: 0.0,
            at_start: self.snapshot(0.0),
            at_timestamp: None,
        };
        self.registrations.insert(span_id, registration);
        seq
    }

    /// 注册数超过上限时淘汰最早的注册项
    ///
    /// # 返回
    /// 被淘汰的 span_id 列表（按注册先后）
    pub fn evict_oldest(&mut self, max_tracked_spans: usize) -> Vec<String> {
        if self.registrations.len() <= max_tracked_spans {
            return Vec::new();
        }

        let overflow = self.registrations.len() - max_tracked_spans;
        let mut by_age: Vec<(u64, String)> = self
            .registrations
            .iter()
            .map(|(id, r)| (r.seq, id.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(seq, _)| *seq);

        by_age
            .into_iter()
            .take(overflow)
            .map(|(_, id)| {
                self.registrations.remove(&id);
                id
            })
            .collect()
    }

    /// 记录根 span 下某个子 span 的结束快照
    pub fn record_span_end(
        &mut self,
        root_span_id: &str,
        end_timestamp_ms: f64,
        now_ms: f64,
        margin_of_error_ms: f64,
    ) -> SpanEndOutcome {
        let (stall_count, total_stall_time_ms) = (self.stall_count, self.total_stall_time_ms);
        let Some(registration) = self.registrations.get_mut(root_span_id) else {
            return SpanEndOutcome::NotTracked;
        };

        if (now_ms - end_timestamp_ms).abs() > margin_of_error_ms {
            // 根 span 会被裁剪到这个更晚的结束时间，旧快照已不能代表那一刻
            let dropped_snapshot = matches!(
                registration.at_timestamp,
                Some(snapshot) if snapshot.timestamp_ms < end_timestamp_ms
            );
            if dropped_snapshot {
                registration.at_timestamp = None;
            }
            return SpanEndOutcome::OutsideMargin { dropped_snapshot };
        }

        registration.at_timestamp = Some(TimestampedStats {
            timestamp_ms: end_timestamp_ms,
            stats: StallStats {
                stall_count,
                total_stall_time_ms,
                longest_stall_ms: registration.longest_stall_ms,
            },
        });
        SpanEndOutcome::Recorded
    }

    /// 移除注册项，序号不匹配（已被淘汰后重新注册）时不移除
    pub fn take_registration(&mut self, span_id: &str, seq: u64) -> Option<SpanRegistration> {
        match self.registrations.get(span_id) {
            Some(registration) if registration.seq == seq => self.registrations.remove(span_id),
            _ => None,
        }
    }

    /// 选出结束时使用的快照
    ///
    /// - 未指定结束时间：当前计数
    /// - 结束时间与记录的快照一致：使用该快照
    /// - 结束时间在当前时间误差范围内：当前计数
    /// - 其他情况无法确定，返回 None
    pub fn finish_stats(
        &self,
        registration: &SpanRegistration,
        end_timestamp_ms: Option<f64>,
        now_ms: f64,
        margin_of_error_ms: f64,
    ) -> Option<StallStats> {
        let live = self.current_stats(registration);
        let Some(end_ms) = end_timestamp_ms else {
            return Some(live);
        };

        if let Some(snapshot) = registration.at_timestamp {
            if (snapshot.timestamp_ms - end_ms).abs() <= TIMESTAMP_TOLERANCE_MS {
                return Some(snapshot.stats);
            }
        }

        if (now_ms - end_ms).abs() <= margin_of_error_ms {
            return Some(live);
        }

        None
    }
}
