//! 卡顿跟踪器
//!
//! 检测事件循环卡顿，并把卡顿时间归属到当时活跃的 span
//!
//! 核心机制：
//! 1. 自重调度的定时任务，每 `acceptable_busy_time_ms / 5` 毫秒 tick 一次
//! 2. 两次 tick 的实际间隔超过阈值即为一次卡顿，超出部分计为卡顿时长
//! 3. span 注册时保存计数器快照，结束时取差值得到该 span 的卡顿度量
//! 4. 应用进入后台时暂停统计，回到前台时重新对齐时间，后台时长不计入卡顿
//! 5. 没有活跃 span 时停止定时任务

use super::app_state::{AppState, AppStateProvider};
use super::measurements::{Measurements, StallStats};
use super::state::{SpanEndOutcome, StallState};
use crate::common::{Clock, MonotonicClock};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 默认可接受的繁忙时间（毫秒）
pub const DEFAULT_ACCEPTABLE_BUSY_TIME_MS: u64 = 100;
/// 默认最大同时跟踪的 span 数
pub const DEFAULT_MAX_TRACKED_SPANS: usize = 10;
/// 默认结束时间误差范围（毫秒）
pub const DEFAULT_MARGIN_OF_ERROR_MS: u64 = 50;

/// 卡顿跟踪配置
#[derive(Clone, Debug)]
pub struct StallTrackerConfig {
    /// 可接受的繁忙时间（毫秒）- 两次 tick 间隔达到此值视为卡顿
    pub acceptable_busy_time_ms: u64,
    /// 最大同时跟踪的 span 数 - 超过时淘汰最早注册的
    pub max_tracked_spans: usize,
    /// 结束时间误差范围（毫秒）- span 结束时间与当前时间的差超过此值时不采用当前计数
    pub margin_of_error_ms: u64,
}

impl Default for StallTrackerConfig {
    fn default() -> Self {
        Self {
            acceptable_busy_time_ms: DEFAULT_ACCEPTABLE_BUSY_TIME_MS,
            max_tracked_spans: DEFAULT_MAX_TRACKED_SPANS,
            margin_of_error_ms: DEFAULT_MARGIN_OF_ERROR_MS,
        }
    }
}

impl StallTrackerConfig {
    /// tick 间隔：阈值的 1/5，最小 1ms
    pub fn tick_interval(&self) -> Duration {
        (Duration::from_millis(self.acceptable_busy_time_ms) / 5).max(Duration::from_millis(1))
    }
}

/// 跟踪器共享状态
struct TrackerShared {
    config: StallTrackerConfig,
    clock: Arc<dyn Clock>,
    app_state: Option<Arc<dyn AppStateProvider>>,
    state: Mutex<StallState>,
    /// 缺少 tokio 运行时的警告只打印一次
    warned_no_runtime: AtomicBool,
    /// 缺少前后台通知的警告只打印一次
    warned_no_app_state: AtomicBool,
}

impl TrackerShared {
    fn tick(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if let Some(stall_time) = state.tick(now, self.config.acceptable_busy_time_ms as f64) {
            debug!(
                "检测到卡顿: {:.1}ms (累计 {} 次, 共 {:.1}ms)",
                stall_time, state.stall_count, state.total_stall_time_ms
            );
        }
    }

    /// 启动 tick 任务（需持有状态锁）
    fn start_locked(self: &Arc<Self>, state: &mut StallState) {
        if state.timeout_handle.is_some() {
            return;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                if !self.warned_no_runtime.swap(true, Ordering::SeqCst) {
                    warn!("[StallTracking] 当前不在 tokio 运行时中，卡顿检测不可用");
                }
                return;
            }
        };

        state.last_interval_ms = self.clock.now_ms();
        state.timeout_handle = Some(runtime.spawn(run_tick_loop(
            Arc::downgrade(self),
            self.config.tick_interval(),
        )));

        if state.app_state_task.is_none() {
            state.app_state_task = self.subscribe_app_state(&runtime);
        }

        debug!(
            "[StallTracking] 开始跟踪, tick 间隔 {:?}",
            self.config.tick_interval()
        );
    }

    /// 停止 tick 任务并退订前后台通知（需持有状态锁）
    ///
    /// `is_backgrounded` 保持不变
    fn stop_locked(&self, state: &mut StallState) {
        if let Some(handle) = state.timeout_handle.take() {
            handle.abort();
            debug!("[StallTracking] 停止跟踪");
        }
        if let Some(handle) = state.app_state_task.take() {
            handle.abort();
        }
        // 前后台状态归宿主所有，停止跟踪不改变它
    }

    fn subscribe_app_state(self: &Arc<Self>, runtime: &Handle) -> Option<JoinHandle<()>> {
        let receiver = self.app_state.as_ref().and_then(|provider| provider.subscribe());
        match receiver {
            Some(receiver) => Some(runtime.spawn(run_app_state_listener(
                Arc::downgrade(self),
                receiver,
            ))),
            None => {
                if !self.warned_no_app_state.swap(true, Ordering::SeqCst) {
                    warn!("[StallTracking] 宿主未提供前后台状态通知，后台期间的卡顿无法排除");
                }
                None
            }
        }
    }

    fn apply_app_state(&self, app_state: AppState) {
        let mut state = self.state.lock();
        if app_state.is_foreground() {
            if !state.is_backgrounded {
                return;
            }
            state.is_backgrounded = false;
            // 后台时长不算卡顿
            let now = self.clock.now_ms();
            state.resync(now);
            debug!("[StallTracking] 离开后台({:?})，重新对齐 tick 时间", app_state);
        } else if !state.is_backgrounded {
            state.is_backgrounded = true;
            debug!("[StallTracking] 进入后台({:?})，暂停统计", app_state);
        }
    }

    fn finish_span(
        &self,
        span_id: &str,
        seq: u64,
        end_timestamp_ms: Option<f64>,
    ) -> Option<Measurements> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let Some(registration) = state.take_registration(span_id, seq) else {
            debug!(
                "[StallTracking] span {} 已不在跟踪列表中（超过最大跟踪数被淘汰），不附加卡顿度量",
                span_id
            );
            if state.tracked_span_count() == 0 {
                self.stop_locked(&mut state);
            }
            return None;
        };

        let finish_stats = state.finish_stats(
            &registration,
            end_timestamp_ms,
            now,
            self.config.margin_of_error_ms as f64,
        );

        if state.tracked_span_count() == 0 {
            self.stop_locked(&mut state);
        }
        drop(state);

        match finish_stats {
            Some(finish) => Some(Measurements::between(&registration.at_start, &finish)),
            None => {
                debug!(
                    "[StallTracking] span {} 的结束时间 {:?} 无对应快照，不附加卡顿度量",
                    span_id, end_timestamp_ms
                );
                None
            }
        }
    }

    fn discard_span(&self, span_id: &str, seq: u64) {
        let mut state = self.state.lock();
        if state.take_registration(span_id, seq).is_some() {
            debug!("[StallTracking] span {} 未结束即被丢弃", span_id);
        }
        if state.tracked_span_count() == 0 {
            self.stop_locked(&mut state);
        }
    }
}

impl Drop for TrackerShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(handle) = state.timeout_handle.take() {
            handle.abort();
        }
        if let Some(handle) = state.app_state_task.take() {
            handle.abort();
        }
    }
}

/// tick 循环
///
/// 每次 tick 结束后才开始下一次等待，长时间阻塞会自然推迟下一次 tick，
/// 这个推迟正是被测量的卡顿
async fn run_tick_loop(weak: Weak<TrackerShared>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match weak.upgrade() {
            Some(shared) => shared.tick(),
            None => break,
        }
    }
}

/// 前后台状态监听
async fn run_app_state_listener(weak: Weak<TrackerShared>, mut receiver: watch::Receiver<AppState>) {
    // 订阅时应用可能已在后台
    let initial = *receiver.borrow_and_update();
    match weak.upgrade() {
        Some(shared) => shared.apply_app_state(initial),
        None => return,
    }

    while receiver.changed().await.is_ok() {
        let next = *receiver.borrow_and_update();
        match weak.upgrade() {
            Some(shared) => shared.apply_app_state(next),
            None => break,
        }
    }
}

/// 卡顿跟踪器
///
/// 克隆得到的是同一个跟踪器的句柄
#[derive(Clone)]
pub struct StallTracker {
    shared: Arc<TrackerShared>,
}

impl StallTracker {
    /// 使用默认时钟创建跟踪器，不区分前后台
    pub fn new(config: StallTrackerConfig) -> Self {
        Self::with_parts(config, Arc::new(MonotonicClock::new()), None)
    }

    /// 指定时钟与前后台状态来源创建跟踪器
    pub fn with_parts(
        config: StallTrackerConfig,
        clock: Arc<dyn Clock>,
        app_state: Option<Arc<dyn AppStateProvider>>,
    ) -> Self {
        info!(
            "卡顿跟踪器已创建: 阈值={}ms, 最大跟踪数={}, 误差范围={}ms",
            config.acceptable_busy_time_ms, config.max_tracked_spans, config.margin_of_error_ms
        );
        Self {
            shared: Arc::new(TrackerShared {
                config,
                clock,
                app_state,
                state: Mutex::new(StallState::default()),
                warned_no_runtime: AtomicBool::new(false),
                warned_no_app_state: AtomicBool::new(false),
            }),
        }
    }

    /// 开始跟踪（已在跟踪时无操作）
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        self.shared.start_locked(&mut state);
    }

    /// 停止跟踪（未在跟踪时无操作）
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        self.shared.stop_locked(&mut state);
    }

    /// 注册 span 开始
    ///
    /// 同一个 span_id 在结束前重复注册时记录错误日志，返回空操作的结束器，
    /// 已有注册的统计不受影响
    pub fn register_span_start(&self, span_id: impl Into<String>) -> SpanFinisher {
        let span_id = span_id.into();
        let mut state = self.shared.state.lock();

        if state.is_registered(&span_id) {
            error!(
                "[StallTracking] span {} 已在跟踪中，忽略重复注册，卡顿度量可能丢失",
                span_id
            );
            return SpanFinisher::noop(span_id);
        }

        self.shared.start_locked(&mut state);
        let seq = state.register(span_id.clone());

        let evicted = state.evict_oldest(self.shared.config.max_tracked_spans);
        if !evicted.is_empty() {
            warn!(
                "[StallTracking] 同时跟踪的 span 超过 {} 个，淘汰最早注册的: {:?}",
                self.shared.config.max_tracked_spans, evicted
            );
        }

        SpanFinisher {
            span_id,
            seq,
            tracker: Some(Arc::downgrade(&self.shared)),
        }
    }

    /// 记录根 span 下某个子 span 的结束时间
    ///
    /// 根 span 之后若以该时间戳结束（如被裁剪到最后一个子 span），
    /// 结束器会采用这一刻的快照
    pub fn record_span_end(&self, root_span_id: &str, end_timestamp_ms: f64) {
        let now = self.shared.clock.now_ms();
        let mut state = self.shared.state.lock();
        match state.record_span_end(
            root_span_id,
            end_timestamp_ms,
            now,
            self.shared.config.margin_of_error_ms as f64,
        ) {
            SpanEndOutcome::Recorded | SpanEndOutcome::NotTracked => {}
            SpanEndOutcome::OutsideMargin { dropped_snapshot } => {
                debug!(
                    "[StallTracking] 子 span 结束时间 {:.3} 偏离当前时间 {:.3} 超过误差范围，未记录快照 (丢弃旧快照: {})",
                    end_timestamp_ms, now, dropped_snapshot
                );
            }
        }
    }

    /// 处理前后台切换
    pub fn on_app_state_change(&self, app_state: AppState) {
        self.shared.apply_app_state(app_state);
    }

    /// 当前时间（与 span 时间戳同一时间域）
    pub fn now_ms(&self) -> f64 {
        self.shared.clock.now_ms()
    }

    /// 是否正在跟踪
    pub fn is_tracking(&self) -> bool {
        self.shared.state.lock().timeout_handle.is_some()
    }

    /// 是否处于后台
    pub fn is_backgrounded(&self) -> bool {
        self.shared.state.lock().is_backgrounded
    }

    /// 全局计数器快照
    pub fn stats(&self) -> StallStats {
        self.shared.state.lock().global_stats()
    }

    /// 全局卡顿次数
    pub fn stall_count(&self) -> u64 {
        self.shared.state.lock().stall_count
    }

    /// 全局卡顿总时长（毫秒）
    pub fn total_stall_time_ms(&self) -> f64 {
        self.shared.state.lock().total_stall_time_ms
    }

    /// 当前跟踪的 span 数
    pub fn tracked_span_count(&self) -> usize {
        self.shared.state.lock().tracked_span_count()
    }

    pub fn config(&self) -> &StallTrackerConfig {
        &self.shared.config
    }
}

impl fmt::Debug for StallTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StallTracker")
            .field("config", &self.shared.config)
            .field("is_tracking", &state.timeout_handle.is_some())
            .field("is_backgrounded", &state.is_backgrounded)
            .field("stall_count", &state.stall_count)
            .field("total_stall_time_ms", &state.total_stall_time_ms)
            .field("tracked_spans", &state.tracked_span_count())
            .finish()
    }
}

/// span 结束器（RAII）
///
/// 调用 `finish` 取得度量；未调用就被 drop 时直接丢弃注册，不产生度量
pub struct SpanFinisher {
    span_id: String,
    seq: u64,
    /// None 表示重复注册得到的空操作结束器
    tracker: Option<Weak<TrackerShared>>,
}

impl SpanFinisher {
    fn noop(span_id: String) -> Self {
        Self {
            span_id,
            seq: 0,
            tracker: None,
        }
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// 是否为重复注册得到的空操作结束器
    pub fn is_noop(&self) -> bool {
        self.tracker.is_none()
    }

    /// 结束 span 并计算卡顿度量
    ///
    /// # 参数
    /// * `end_timestamp_ms` - span 结束时间，None 表示此刻结束
    ///
    /// # 返回
    /// - `Some(Measurements)`: 注册到结束之间的卡顿度量
    /// - `None`: 空操作结束器、已被淘汰，或无法确定结束时刻的计数
    pub fn finish(mut self, end_timestamp_ms: Option<f64>) -> Option<Measurements> {
        let shared = self.tracker.take()?.upgrade()?;
        shared.finish_span(&self.span_id, self.seq, end_timestamp_ms)
    }
}

impl Drop for SpanFinisher {
    fn drop(&mut self) {
        if let Some(shared) = self.tracker.take().and_then(|weak| weak.upgrade()) {
            shared.discard_span(&self.span_id, self.seq);
        }
    }
}

impl fmt::Debug for SpanFinisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanFinisher")
            .field("span_id", &self.span_id)
            .field("noop", &self.is_noop())
            .finish()
    }
}
