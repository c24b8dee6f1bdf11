use std::time::Duration;

/// 进度流默认的轮询间隔，与移动端实现保持一致。
pub const DEFAULT_POSITION_INTERVAL: Duration = Duration::from_millis(100);

/// 允许获取的封面图片的最大字节数，防止过大的图片消耗过多内存。
pub const DEFAULT_MAX_ALBUM_ART_BYTES: usize = 20_971_520; // 20 MB

/// 服务的运行参数。
///
/// 所有字段都有合理的默认值，通常只需要 `ServiceConfig::default()`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// 工作线程的名称，便于在调试器和日志中辨认。
    pub worker_thread_name: String,
    /// 进度计时器的触发间隔。
    pub position_interval: Duration,
    /// 封面数据的大小上限（字节），超出时快照中不包含封面。
    pub max_album_art_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: "media_session_worker".to_string(),
            position_interval: DEFAULT_POSITION_INTERVAL,
            max_album_art_bytes: DEFAULT_MAX_ALBUM_ART_BYTES,
        }
    }
}

impl ServiceConfig {
    /// 设置工作线程名称。
    #[must_use]
    pub fn with_worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    /// 设置进度计时器间隔。零间隔会被提升为 1 毫秒。
    #[must_use]
    pub fn with_position_interval(mut self, interval: Duration) -> Self {
        self.position_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// 设置封面数据的大小上限。
    #[must_use]
    pub fn with_max_album_art_bytes(mut self, max_bytes: usize) -> Self {
        self.max_album_art_bytes = max_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_is_raised() {
        let config = ServiceConfig::default().with_position_interval(Duration::ZERO);
        assert_eq!(config.position_interval, Duration::from_millis(1));
    }
}
