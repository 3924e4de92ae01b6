//! 应用前后台状态
//!
//! 宿主应用通过 `AppStateProvider` 暴露前后台切换通知，
//! 卡顿跟踪器在开始跟踪时订阅，停止跟踪时退订

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// 应用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// 前台活跃
    Active,
    /// 前台但不可交互（如 iOS 来电、下拉通知中心），代码仍在运行
    Inactive,
    /// 后台
    Background,
}

impl AppState {
    /// 只有 Background 暂停卡顿统计
    pub fn is_foreground(&self) -> bool {
        !matches!(self, AppState::Background)
    }
}

/// 前后台状态来源
pub trait AppStateProvider: Send + Sync {
    /// 订阅状态变化
    ///
    /// 宿主环境不支持状态通知时返回 None，跟踪器会降级为不区分前后台
    fn subscribe(&self) -> Option<watch::Receiver<AppState>>;
}

/// 基于 watch 通道的状态来源
///
/// 宿主在收到系统通知时调用 `set`
#[derive(Debug)]
pub struct AppStateChannel {
    sender: watch::Sender<AppState>,
}

impl AppStateChannel {
    pub fn new(initial: AppState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// 更新状态，与当前状态相同时不通知订阅者
    pub fn set(&self, state: AppState) {
        self.sender.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// 当前状态
    pub fn current(&self) -> AppState {
        *self.sender.borrow()
    }
}

impl Default for AppStateChannel {
    fn default() -> Self {
        Self::new(AppState::Active)
    }
}

impl AppStateProvider for AppStateChannel {
    fn subscribe(&self) -> Option<watch::Receiver<AppState>> {
        Some(self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreground_states() {
        assert!(AppState::Active.is_foreground());
        assert!(AppState::Inactive.is_foreground());
        assert!(!AppState::Background.is_foreground());
    }

    #[tokio::test]
    async fn test_channel_notifies_only_on_change() {
        let channel = AppStateChannel::default();
        let mut rx = channel.subscribe().unwrap();

        channel.set(AppState::Active);
        assert!(!rx.has_changed().unwrap());

        channel.set(AppState::Background);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AppState::Background);
        assert_eq!(channel.current(), AppState::Background);
    }

    #[test]
    fn test_app_state_serde() {
        let json = serde_json::to_string(&AppState::Background).unwrap();
        assert_eq!(json, "\"background\"");

        let state: AppState = serde_json::from_str("\"inactive\"").unwrap();
        assert_eq!(state, AppState::Inactive);
    }
}
