//! 外部媒体会话 API 的抽象层。
//!
//! 会话管理器只通过这里定义的 trait 与操作系统交互。所有方法都假定在同一个
//! 工作线程上被调用；只有通过 `add_handler` 注册的回调会在外部 API 自己的
//! 线程上被触发。

use std::{fmt, rc::Rc, sync::Arc};

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod simulated;
#[cfg(windows)]
pub mod smtc;

/// 外部 API 使用的时间单位（100 纳秒）与毫秒之间的换算系数。
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// 外部 API 调用失败时的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// 无法获取外部会话管理器。
    #[error("无法获取媒体会话管理器: {0}")]
    Unavailable(String),

    /// 一次外部调用抛出了错误。
    #[error("外部 API 调用失败: {0}")]
    Call(String),

    /// 令牌不属于执行注销的对象实例。
    #[error("事件令牌 {0:?} 不属于该对象")]
    InvalidToken(EventToken),
}

#[cfg(windows)]
impl From<windows::core::Error> for BackendError {
    fn from(err: windows::core::Error) -> Self {
        BackendError::Call(format!("{err:?}"))
    }
}

/// 后端调用的 `Result` 类型别名。
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// 外部 API 在任意线程上调用的变更回调。
pub type EventHandler = Arc<dyn Fn() + Send + Sync>;

/// 订阅事件时返回的不透明令牌，注销时必须交还给签发它的同一个对象。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(pub i64);

/// 会话管理器级别的事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerEvent {
    /// 可用会话列表发生变化。
    SessionsChanged,
    /// “当前会话”被替换。
    CurrentSessionChanged,
}

/// 单个会话级别的事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// 标题、艺术家、专辑或封面变化。
    MediaPropertiesChanged,
    /// 播放状态或播放速率变化。
    PlaybackInfoChanged,
    /// 时间轴（进度、时长）变化。
    TimelinePropertiesChanged,
}

/// 以 100 纳秒为单位的时间跨度，与外部 API 的原生单位一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeSpan(pub i64);

impl TimeSpan {
    /// 由毫秒构造。
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms.saturating_mul(TICKS_PER_MILLISECOND))
    }

    /// 转换为毫秒，向零取整。
    pub const fn as_millis(self) -> i64 {
        self.0 / TICKS_PER_MILLISECOND
    }
}

/// 外部 API 报告的原始播放状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPlaybackStatus {
    /// 会话已关闭。
    #[default]
    Closed,
    /// 会话已打开但尚未播放。
    Opened,
    /// 正在切换（缓冲、加载下一首）。
    Changing,
    /// 已停止。
    Stopped,
    /// 播放中。
    Playing,
    /// 已暂停。
    Paused,
}

/// 媒体属性。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaProperties {
    /// 曲目标题。
    pub title: String,
    /// 艺术家。
    pub artist: String,
    /// 专辑标题。
    pub album_title: String,
}

/// 播放信息。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackInfo {
    /// 播放状态。
    pub status: SessionPlaybackStatus,
    /// 外部 API 报告的播放速率；部分应用不提供。
    pub playback_rate: Option<f64>,
}

/// 时间轴属性。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineProperties {
    /// 上次报告的播放位置。
    pub position: TimeSpan,
    /// 可播放范围的起点。
    pub start_time: TimeSpan,
    /// 可播放范围的终点，即曲目时长。
    pub end_time: TimeSpan,
    /// `position` 被报告时的挂钟时间。
    pub last_updated: DateTime<Utc>,
}

/// 一个媒体会话对象。
///
/// 实例可能在任何时刻过期（当前会话被替换），因此调用方不应长期缓存它，
/// 注册在某个实例上的事件令牌也只能在该实例上注销。
pub trait MediaSession {
    /// 会话来源应用的标识符（如 AUMID）。
    fn source_app_id(&self) -> BackendResult<String>;
    /// 读取媒体属性。会阻塞直到外部异步操作完成。
    fn media_properties(&self) -> BackendResult<MediaProperties>;
    /// 读取封面原始字节，超过 `max_bytes` 时返回 `None`。会阻塞。
    fn thumbnail(&self, max_bytes: usize) -> BackendResult<Option<Vec<u8>>>;
    fn playback_info(&self) -> BackendResult<PlaybackInfo>;
    fn timeline_properties(&self) -> BackendResult<TimelineProperties>;

    fn add_handler(&self, event: SessionEvent, handler: EventHandler) -> BackendResult<EventToken>;
    fn remove_handler(&self, event: SessionEvent, token: EventToken) -> BackendResult<()>;

    fn try_toggle_play_pause(&self) -> BackendResult<bool>;
    fn try_skip_next(&self) -> BackendResult<bool>;
    fn try_skip_previous(&self) -> BackendResult<bool>;
    fn try_stop(&self) -> BackendResult<bool>;
    fn try_change_playback_position(&self, position: TimeSpan) -> BackendResult<bool>;
}

/// 外部会话管理器。
pub trait SessionSource {
    /// 查询当前会话；没有会话时返回 `Ok(None)`。
    fn current_session(&self) -> BackendResult<Option<Box<dyn MediaSession>>>;
    fn add_handler(&self, event: ManagerEvent, handler: EventHandler) -> BackendResult<EventToken>;
    fn remove_handler(&self, event: ManagerEvent, token: EventToken) -> BackendResult<()>;
}

/// 工作线程环境的 RAII 守卫，在 drop 时撤销 `prepare_thread` 所做的初始化。
pub struct ThreadScope {
    leave: Option<Box<dyn FnOnce()>>,
}

impl ThreadScope {
    /// 不需要任何清理的空守卫。
    pub fn empty() -> Self {
        Self { leave: None }
    }

    /// 在 drop 时执行 `leave`。
    pub fn new(leave: impl FnOnce() + 'static) -> Self {
        Self {
            leave: Some(Box::new(leave)),
        }
    }
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        if let Some(leave) = self.leave.take() {
            leave();
        }
    }
}

impl fmt::Debug for ThreadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScope")
            .field("has_teardown", &self.leave.is_some())
            .finish()
    }
}

/// 外部 API 的入口。由调用方线程构造，随后被移动到工作线程上使用。
pub trait MediaBackend: Send + 'static {
    /// 在工作线程上调用一次，建立外部 API 要求的线程环境。
    fn prepare_thread(&self) -> BackendResult<ThreadScope> {
        Ok(ThreadScope::empty())
    }

    /// 获取外部会话管理器句柄。在工作线程上调用。
    fn connect(&self) -> BackendResult<Rc<dyn SessionSource>>;
}

/// 返回当前平台的默认后端。
///
/// Windows 上使用 SMTC；其他平台上返回一个没有任何会话的模拟后端，
/// 此时所有查询都返回空结果。
pub fn platform_backend() -> Box<dyn MediaBackend> {
    #[cfg(windows)]
    {
        Box::new(smtc::SmtcBackend)
    }
    #[cfg(not(windows))]
    {
        Box::new(simulated::SimulatedBackend::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_time_span_conversion() {
        assert_eq!(TimeSpan::from_millis(1500).0, 15_000_000);
        assert_eq!(TimeSpan(15_009_999).as_millis(), 1500);
        assert_eq!(TimeSpan::from_millis(i64::MAX).0, i64::MAX);
    }

    #[test]
    fn test_thread_scope_runs_teardown_once() {
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        drop(ThreadScope::new(move || c.set(c.get() + 1)));
        assert_eq!(counter.get(), 1);
        drop(ThreadScope::empty());
        assert_eq!(counter.get(), 1);
    }
}
