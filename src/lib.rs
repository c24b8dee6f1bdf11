#![warn(missing_docs)]

//! 将线程亲和、回调驱动的系统媒体会话 API 桥接为线程安全的“正在播放”快照与实时进度流。
//!
//! 在 Windows 上，本库通过系统媒体传输控件 (SMTC) 获取当前媒体会话；在其他平台上，
//! 默认使用一个没有任何会话的进程内模拟后端。
//!
//! ## 核心功能
//!
//! * **单一工作线程**: 所有与外部 API 的交互（查询、注册/注销回调、控制命令）
//!   都在同一个专用线程上按提交顺序串行执行。
//! * **会话切换**: 当前会话被替换时，自动在旧会话上注销回调、在新会话上重新注册，
//!   不会残留或重复订阅。
//! * **实时进度**: 根据最后一次报告的位置、报告时间和播放速率外推当前进度，
//!   并在播放期间以固定间隔推送。
//! * **跨线程事件投递**: 外部回调可以发生在任意线程上，事件按产生顺序交给唯一的消费端。
//!
//! ## 使用方法
//!
//! 1.  调用 [`MediaNotificationService::start_default()`]（或 [`MediaNotificationService::start()`]
//!     并传入自定义后端与 [`ServiceConfig`]）启动服务。
//! 2.  通过 [`MediaNotificationService::media_stream()`] 和
//!     [`MediaNotificationService::position_stream()`] 订阅事件流。
//! 3.  通过类型化的异步方法或 [`MediaNotificationService::handle_method_call()`] 发送命令。
//! 4.  应用退出前调用 [`MediaNotificationService::shutdown()`]（drop 时也会自动调用）。
//!
//! ## 示例
//!
//! ```no_run
//! use media_notification_service::MediaNotificationService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = MediaNotificationService::start_default()?;
//!
//!     let mut media = service.media_stream(None);
//!     if let Some(event) = media.recv().await {
//!         println!(
//!             "正在播放: {} - {}",
//!             event.snapshot.artist.unwrap_or_default(),
//!             event.snapshot.title.unwrap_or_default()
//!         );
//!     }
//!
//!     service.play_pause().await?;
//!     service.shutdown();
//!     Ok(())
//! }
//! ```

mod api;
pub mod backend;
mod config;
mod error;
mod service;
mod session_manager;
mod stream;
mod timer;
mod worker;

pub use api::{
    MediaEvent, MethodCall, MethodCallError, MethodResponse, PlaybackSnapshot, PlaybackState,
    PositionSnapshot, QueueSnapshot, TimelineSample,
};
pub use config::{DEFAULT_MAX_ALBUM_ART_BYTES, DEFAULT_POSITION_INTERVAL, ServiceConfig};
pub use error::{Result, ServiceError};
pub use service::MediaNotificationService;
pub use session_manager::{ChangeCallback, ListenerGroup, ManagerTask, Scheduler, SessionManager};
pub use stream::{EventStream, StreamController, StreamHook};
pub use timer::PeriodicTimer;
pub use worker::{Task, WorkerHandle, WorkerState, WorkerThread};
