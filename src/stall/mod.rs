// 卡顿跟踪模块

mod app_state;
mod measurements;
mod state;
mod tracker;

pub use app_state::{AppState, AppStateChannel, AppStateProvider};
pub use measurements::{Measurement, MeasurementUnit, Measurements, StallStats};
pub use tracker::{
    SpanFinisher, StallTracker, StallTrackerConfig, DEFAULT_ACCEPTABLE_BUSY_TIME_MS,
    DEFAULT_MARGIN_OF_ERROR_MS, DEFAULT_MAX_TRACKED_SPANS,
};
