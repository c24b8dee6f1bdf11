use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::backend::{SessionPlaybackStatus, TimelineProperties};

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlaybackState {
    /// 播放中
    Playing,
    /// 已暂停
    Paused,
    /// 已停止
    Stopped,
    /// 正在缓冲或切换曲目
    Buffering,
    #[default]
    /// 没有可用的媒体
    None,
}

impl From<SessionPlaybackStatus> for PlaybackState {
    fn from(status: SessionPlaybackStatus) -> Self {
        match status {
            SessionPlaybackStatus::Playing => Self::Playing,
            SessionPlaybackStatus::Paused => Self::Paused,
            SessionPlaybackStatus::Stopped => Self::Stopped,
            SessionPlaybackStatus::Changing => Self::Buffering,
            SessionPlaybackStatus::Closed | SessionPlaybackStatus::Opened => Self::None,
        }
    }
}

fn serialize_album_art<S>(art: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match art {
        Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

/// “当前正在播放什么”的一份完整快照。
///
/// 没有当前会话或查询失败时，所有字段都为空，`state` 为 [`PlaybackState::None`]。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    /// 曲目标题。
    pub title: Option<String>,
    /// 艺术家名称。
    pub artist: Option<String>,
    /// 专辑标题。
    pub album: Option<String>,
    /// 会话来源应用的标识符。
    #[serde(rename = "packageName")]
    pub source_app_id: Option<String>,
    /// 封面图片的原始字节数据，序列化为 base64 字符串。
    #[serde(serialize_with = "serialize_album_art")]
    pub album_art: Option<Vec<u8>>,
    /// 当前的播放状态。
    pub state: PlaybackState,
    /// 等价于 `state == PlaybackState::Playing`。
    pub is_playing: bool,
}

impl PlaybackSnapshot {
    /// 判断两份快照是否指向同一首曲目（只比较标题、艺术家和专辑）。
    pub fn same_track(&self, other: &Self) -> bool {
        self.title == other.title && self.artist == other.artist && self.album == other.album
    }
}

/// 媒体流的负载。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaEvent {
    /// 最新的快照。
    #[serde(flatten)]
    pub snapshot: PlaybackSnapshot,
    /// 与同一订阅中上一次发出的快照相比，曲目是否发生了变化。
    #[serde(rename = "songChanged")]
    pub track_changed: bool,
}

/// 播放进度的一份快照。
///
/// 只要 `duration_ms > 0`，就保证 `0 <= position_ms <= duration_ms`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    /// 估算的当前播放位置（毫秒）。
    #[serde(rename = "position")]
    pub position_ms: i64,
    /// 曲目总时长（毫秒），未知时为 0。
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    /// 外推时使用的播放速率。
    #[serde(rename = "playbackSpeed")]
    pub playback_rate: f64,
    /// 当前的播放状态。
    pub state: PlaybackState,
    /// 本快照的计算时间。
    pub as_of: Option<DateTime<Utc>>,
}

/// 从外部 API 读取的一次时间轴报告，用于外推实时进度。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineSample {
    /// 报告时的播放位置（毫秒）。
    pub position_ms: i64,
    /// 曲目总时长（毫秒）。
    pub duration_ms: i64,
    /// `position_ms` 被报告的时间点。
    pub reported_at: DateTime<Utc>,
    /// 外部 API 报告的播放速率。
    pub rate: Option<f64>,
    /// 报告时的播放状态。
    pub state: PlaybackState,
}

impl TimelineSample {
    /// 由外部 API 的时间轴属性构造。
    ///
    /// 位置和时长都以 `start_time` 为原点：时长为 `end_time - start_time`。
    pub fn from_timeline(
        timeline: &TimelineProperties,
        rate: Option<f64>,
        state: PlaybackState,
    ) -> Self {
        let origin = timeline.start_time.0;
        Self {
            position_ms: timeline.position.0.saturating_sub(origin)
                / crate::backend::TICKS_PER_MILLISECOND,
            duration_ms: timeline.end_time.0.saturating_sub(origin).max(0)
                / crate::backend::TICKS_PER_MILLISECOND,
            reported_at: timeline.last_updated,
            rate,
            state,
        }
    }

    /// 实际用于外推的播放速率。缺失或非正数时视为 1.0。
    pub fn effective_rate(&self) -> f64 {
        match self.rate {
            Some(rate) if rate > 0.0 && rate.is_finite() => rate,
            _ => 1.0,
        }
    }

    /// 估算 `now` 时刻的播放位置（毫秒）。
    ///
    /// 非播放状态下不推进，直接使用报告值；播放中则按经过的时间和速率推进。
    /// 两种情况的结果都限制在 `[0, duration]` 内（时长未知时只保证非负）。
    pub fn extrapolate(&self, now: DateTime<Utc>) -> i64 {
        let estimated = if self.state == PlaybackState::Playing {
            let elapsed_ms = (now - self.reported_at).num_milliseconds() as f64;
            (self.position_ms as f64 + elapsed_ms * self.effective_rate()) as i64
        } else {
            self.position_ms
        };

        if self.duration_ms > 0 {
            estimated.clamp(0, self.duration_ms)
        } else {
            estimated.max(0)
        }
    }

    /// 计算 `now` 时刻的进度快照。
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> PositionSnapshot {
        PositionSnapshot {
            position_ms: self.extrapolate(now),
            duration_ms: self.duration_ms.max(0),
            playback_rate: self.effective_rate(),
            state: self.state,
            as_of: Some(now),
        }
    }
}

/// 队列流的负载。当前平台无法读取播放队列，该流从不发出数据。
pub type QueueSnapshot = Vec<serde_json::Value>;

/// 解析方法调用时可能出现的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodCallError {
    /// 未知的方法名。
    #[error("未实现的方法: {0}")]
    NotImplemented(String),

    /// 参数缺失或类型错误。
    #[error("{0}")]
    InvalidArgument(String),
}

/// 消费端可以调用的所有方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodCall {
    /// 获取当前媒体快照。
    GetCurrentMedia,
    /// 切换播放/暂停。
    PlayPause,
    /// 下一首。
    SkipToNext,
    /// 上一首。
    SkipToPrevious,
    /// 停止播放。
    Stop,
    /// 跳转到指定位置（毫秒）。
    SeekTo(i64),
    /// 获取播放队列。
    GetQueue,
    /// 查询是否拥有读取媒体会话的权限。
    HasPermission,
    /// 打开系统的权限设置页面。
    OpenSettings,
}

impl MethodCall {
    /// 由方法名和参数解析出一次调用。
    ///
    /// `seekTo` 要求参数中包含数值类型的 `position` 字段，小数会被截断。
    pub fn parse(name: &str, args: Option<&serde_json::Value>) -> Result<Self, MethodCallError> {
        let call = match name {
            "getCurrentMedia" => Self::GetCurrentMedia,
            "playPause" => Self::PlayPause,
            "skipToNext" => Self::SkipToNext,
            "skipToPrevious" => Self::SkipToPrevious,
            "stop" => Self::Stop,
            "seekTo" => {
                let position = args
                    .and_then(|args| args.get("position"))
                    .and_then(|p| p.as_i64().or_else(|| p.as_f64().map(|f| f as i64)))
                    .ok_or_else(|| {
                        MethodCallError::InvalidArgument("Position must not be null".to_string())
                    })?;
                Self::SeekTo(position)
            }
            "getQueue" => Self::GetQueue,
            "hasPermission" => Self::HasPermission,
            "openSettings" => Self::OpenSettings,
            other => return Err(MethodCallError::NotImplemented(other.to_string())),
        };
        Ok(call)
    }
}

/// 方法调用的结果。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum MethodResponse {
    /// 当前媒体快照。
    Media(PlaybackSnapshot),
    /// 命令是否成功。
    Bool(bool),
    /// 播放队列（始终为空）。
    Queue(QueueSnapshot),
    /// 方法名未知。
    NotImplemented,
    /// 调用参数有误。
    Error {
        /// 错误码，如 `INVALID_ARGUMENT`。
        code: String,
        /// 描述信息。
        message: String,
    },
}

impl From<MethodCallError> for MethodResponse {
    fn from(err: MethodCallError) -> Self {
        match err {
            MethodCallError::NotImplemented(_) => Self::NotImplemented,
            MethodCallError::InvalidArgument(message) => Self::Error {
                code: "INVALID_ARGUMENT".to_string(),
                message,
            },
        }
    }
}
