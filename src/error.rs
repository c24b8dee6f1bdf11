use thiserror::Error;

use crate::backend::BackendError;

/// 定义库的统一错误枚举。
#[derive(Debug, Error)]
pub enum ServiceError {
    /// 无法启动后台线程。
    ///
    /// 这通常发生在 `std::thread::Builder::spawn` 失败时。
    #[error("无法启动后台线程 '{name}': {source}")]
    ThreadSpawn {
        /// 线程名称。
        name: String,
        /// 底层的 IO 错误。
        source: std::io::Error,
    },

    /// 任务队列已关闭，不再接受新任务。
    ///
    /// 在 `WorkerThread::stop()` 之后入队，或工作线程已意外退出时返回。
    #[error("任务队列已关闭，无法再提交任务")]
    QueueClosed,

    /// 工作线程在返回结果之前丢弃了任务（通常意味着它已退出）。
    #[error("工作线程未返回结果")]
    NoReply,

    /// 外部媒体会话 API 初始化失败。
    #[error("媒体会话后端不可用: {0}")]
    Backend(#[from] BackendError),

    /// 锁已被毒化。
    #[error("锁已被毒化: {0}")]
    MutexPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for ServiceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ServiceError::MutexPoisoned(err.to_string())
    }
}

/// 本库统一的 `Result` 类型别名。
pub type Result<T> = std::result::Result<T, ServiceError>;
