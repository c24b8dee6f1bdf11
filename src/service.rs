use std::sync::Arc;

use crate::{
    api::{
        MediaEvent, MethodCall, MethodResponse, PlaybackSnapshot, PositionSnapshot, QueueSnapshot,
    },
    backend::{MediaBackend, ThreadScope, platform_backend},
    config::ServiceConfig,
    error::{Result, ServiceError},
    session_manager::{ChangeCallback, ListenerGroup, ManagerTask, Scheduler, SessionManager},
    stream::{EventStream, StreamController},
    timer::PeriodicTimer,
    worker::{WorkerHandle, WorkerState, WorkerThread},
};

/// 只存在于工作线程上的全部状态。
///
/// 字段按声明顺序销毁：先注销所有外部订阅，再停止计时器，最后撤销线程环境。
struct ServiceContext {
    sessions: SessionManager,
    position_timer: PeriodicTimer,
    position_interval: std::time::Duration,
    media: Arc<StreamController<MediaEvent>>,
    position: Arc<StreamController<PositionSnapshot>>,
    worker: WorkerHandle<ServiceContext>,
    _scope: ThreadScope,
}

impl ServiceContext {
    fn start_media_updates(&mut self) {
        let media = self.media.clone();
        let mut last_emitted: Option<PlaybackSnapshot> = None;
        let callback: ChangeCallback = Box::new(move |sessions: &SessionManager| {
            let snapshot = sessions.current_snapshot();
            let track_changed = last_emitted
                .as_ref()
                .is_none_or(|previous| !previous.same_track(&snapshot));
            last_emitted = Some(snapshot.clone());
            media.send(MediaEvent {
                snapshot,
                track_changed,
            });
        });

        self.sessions.start_listening(ListenerGroup::Media, callback);
        self.sessions.notify(ListenerGroup::Media);
    }

    fn stop_media_updates(&mut self) {
        self.sessions.stop_listening(ListenerGroup::Media);
    }

    fn start_position_updates(&mut self) {
        let position = self.position.clone();
        let callback: ChangeCallback = Box::new(move |sessions: &SessionManager| {
            position.send(sessions.current_position());
        });
        self.sessions.start_listening(ListenerGroup::Position, callback);
        self.sessions.notify(ListenerGroup::Position);

        let worker = self.worker.clone();
        let started = self.position_timer.start(self.position_interval, move || {
            if worker
                .enqueue(|context: &mut ServiceContext| context.on_position_tick())
                .is_err()
            {
                log::trace!("[Service] 工作线程已关闭，忽略进度节拍。");
            }
        });
        if let Err(e) = started {
            log::error!("[Service] 启动进度计时器失败: {e}");
        }
    }

    fn stop_position_updates(&mut self) {
        self.position_timer.stop();
        self.sessions.stop_listening(ListenerGroup::Position);
    }

    fn on_position_tick(&mut self) {
        if self.sessions.is_listening(ListenerGroup::Position) && self.sessions.is_playing() {
            self.position.send(self.sessions.current_position());
        }
    }
}

/// 媒体通知服务的唯一入口。
///
/// 所有与外部媒体会话 API 的交互都在一个专用的工作线程上串行执行；
/// 本结构体的方法可以在任意线程上调用。
pub struct MediaNotificationService {
    worker: WorkerThread<ServiceContext>,
    media: Arc<StreamController<MediaEvent>>,
    position: Arc<StreamController<PositionSnapshot>>,
    queue: Arc<StreamController<QueueSnapshot>>,
}

impl MediaNotificationService {
    /// 使用当前平台的默认后端和默认配置启动服务。
    pub fn start_default() -> Result<Self> {
        Self::start(platform_backend(), ServiceConfig::default())
    }

    /// 启动服务。
    ///
    /// 外部 API 的初始化在工作线程上进行；初始化失败不会导致本函数失败，
    /// 服务会以“空状态”运行（查询返回空值，命令返回 `false`）。
    ///
    /// # 返回
    /// - `Err(ServiceError::ThreadSpawn)`: 如果无法创建工作线程。
    pub fn start(backend: Box<dyn MediaBackend>, config: ServiceConfig) -> Result<Self> {
        log::info!("[Service] 正在启动媒体通知服务...");

        let media = Arc::new(StreamController::new("media"));
        let position = Arc::new(StreamController::new("position"));
        let queue = Arc::new(StreamController::new("queue"));

        let timer_name = format!("{}_position", config.worker_thread_name);
        let (context_media, context_position) = (media.clone(), position.clone());
        let ServiceConfig {
            worker_thread_name,
            position_interval,
            max_album_art_bytes,
        } = config;

        let worker = WorkerThread::start(&worker_thread_name, move |handle| {
            let scope = match backend.prepare_thread() {
                Ok(scope) => Some(scope),
                Err(e) => {
                    log::error!("[Service] 初始化工作线程环境失败: {e}");
                    None
                }
            };

            let scheduler_handle = handle.clone();
            let scheduler: Scheduler = Arc::new(move |task: ManagerTask| {
                if scheduler_handle
                    .enqueue(move |context: &mut ServiceContext| task(&mut context.sessions))
                    .is_err()
                {
                    log::trace!("[Service] 工作线程已关闭，丢弃会话事件。");
                }
            });

            let mut sessions = SessionManager::new(scheduler, max_album_art_bytes);
            if scope.is_some()
                && let Err(e) = sessions.initialize(backend.as_ref())
            {
                log::error!("[Service] 媒体会话后端初始化失败，将以空状态运行: {e}");
            }

            ServiceContext {
                sessions,
                position_timer: PeriodicTimer::new(timer_name),
                position_interval,
                media: context_media,
                position: context_position,
                worker: handle,
                _scope: scope.unwrap_or_else(ThreadScope::empty),
            }
        })?;

        let service = Self {
            worker,
            media,
            position,
            queue,
        };
        service.install_stream_hooks();
        log::info!("[Service] 媒体通知服务已启动。");
        Ok(service)
    }

    fn install_stream_hooks(&self) {
        let start_handle = self.worker.handle();
        let stop_handle = self.worker.handle();
        self.media.install_hooks(
            Box::new(move |_: Option<&serde_json::Value>| {
                enqueue_or_log(&start_handle, "media", ServiceContext::start_media_updates);
            }),
            Box::new(move |_: Option<&serde_json::Value>| {
                enqueue_or_log(&stop_handle, "media", ServiceContext::stop_media_updates);
            }),
        );

        let start_handle = self.worker.handle();
        let stop_handle = self.worker.handle();
        self.position.install_hooks(
            Box::new(move |_: Option<&serde_json::Value>| {
                enqueue_or_log(
                    &start_handle,
                    "position",
                    ServiceContext::start_position_updates,
                );
            }),
            Box::new(move |_: Option<&serde_json::Value>| {
                enqueue_or_log(
                    &stop_handle,
                    "position",
                    ServiceContext::stop_position_updates,
                );
            }),
        );

        self.queue.install_hooks(
            Box::new(|_: Option<&serde_json::Value>| {
                log::debug!("[Service] 当前平台不支持播放队列，队列流不会发出数据。");
            }),
            Box::new(|_: Option<&serde_json::Value>| {}),
        );
    }

    /// 订阅媒体流。订阅后会立即收到一次当前快照。
    pub fn media_stream(&self, args: Option<&serde_json::Value>) -> EventStream<MediaEvent> {
        self.media.on_listen(args)
    }

    /// 取消媒体流订阅。
    pub fn cancel_media_stream(&self, args: Option<&serde_json::Value>) {
        self.media.on_cancel(args);
    }

    /// 订阅进度流。订阅后会立即收到一次当前进度，之后播放期间周期性更新。
    pub fn position_stream(
        &self,
        args: Option<&serde_json::Value>,
    ) -> EventStream<PositionSnapshot> {
        self.position.on_listen(args)
    }

    /// 取消进度流订阅。
    pub fn cancel_position_stream(&self, args: Option<&serde_json::Value>) {
        self.position.on_cancel(args);
    }

    /// 订阅队列流。该流从不发出数据。
    pub fn queue_stream(&self, args: Option<&serde_json::Value>) -> EventStream<QueueSnapshot> {
        self.queue.on_listen(args)
    }

    /// 取消队列流订阅。
    pub fn cancel_queue_stream(&self, args: Option<&serde_json::Value>) {
        self.queue.on_cancel(args);
    }

    async fn run_on_worker<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce(&mut SessionManager) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.worker
            .submit(move |context: &mut ServiceContext| task(&mut context.sessions))?
            .await
            .map_err(|_| ServiceError::NoReply)
    }

    /// 获取当前媒体快照（包括封面）。
    pub async fn get_current_media(&self) -> Result<PlaybackSnapshot> {
        self.run_on_worker(|sessions| sessions.current_snapshot()).await
    }

    /// 获取当前的外推进度。
    pub async fn get_position(&self) -> Result<PositionSnapshot> {
        self.run_on_worker(|sessions| sessions.current_position()).await
    }

    /// 切换播放/暂停。
    pub async fn play_pause(&self) -> Result<bool> {
        self.run_on_worker(|sessions| sessions.play_pause()).await
    }

    /// 下一首。
    pub async fn skip_to_next(&self) -> Result<bool> {
        self.run_on_worker(|sessions| sessions.skip_to_next()).await
    }

    /// 上一首。
    pub async fn skip_to_previous(&self) -> Result<bool> {
        self.run_on_worker(|sessions| sessions.skip_to_previous()).await
    }

    /// 停止播放（不是关闭服务，关闭服务见 [`Self::shutdown`]）。
    pub async fn stop_playback(&self) -> Result<bool> {
        self.run_on_worker(|sessions| sessions.stop()).await
    }

    /// 跳转到指定位置（毫秒）。负数视为 0。
    pub async fn seek_to(&self, position_ms: i64) -> Result<bool> {
        self.run_on_worker(move |sessions| sessions.seek_to(position_ms)).await
    }

    /// 播放队列。当前平台不支持，始终为空。
    pub fn get_queue(&self) -> QueueSnapshot {
        QueueSnapshot::new()
    }

    /// 桌面平台不需要额外授权，始终为 `true`。
    pub fn has_permission(&self) -> bool {
        true
    }

    /// 桌面平台没有对应的设置页面，什么也不做并返回 `true`。
    pub fn open_settings(&self) -> bool {
        log::debug!("[Service] openSettings 在当前平台上无操作。");
        true
    }

    /// 按方法名分发一次调用。
    ///
    /// 未知方法返回 [`MethodResponse::NotImplemented`]；服务已关闭时，
    /// 查询返回空快照，命令返回 `false`。
    pub async fn handle_method_call(
        &self,
        name: &str,
        args: Option<&serde_json::Value>,
    ) -> MethodResponse {
        let call = match MethodCall::parse(name, args) {
            Ok(call) => call,
            Err(e) => {
                log::debug!("[Service] 无法处理方法调用 '{name}': {e}");
                return e.into();
            }
        };

        let command = match call {
            MethodCall::GetCurrentMedia => {
                let snapshot = self.get_current_media().await.unwrap_or_else(|e| {
                    log::warn!("[Service] getCurrentMedia 失败: {e}");
                    PlaybackSnapshot::default()
                });
                return MethodResponse::Media(snapshot);
            }
            MethodCall::GetQueue => return MethodResponse::Queue(self.get_queue()),
            MethodCall::HasPermission => return MethodResponse::Bool(self.has_permission()),
            MethodCall::OpenSettings => return MethodResponse::Bool(self.open_settings()),
            MethodCall::PlayPause => self.play_pause().await,
            MethodCall::SkipToNext => self.skip_to_next().await,
            MethodCall::SkipToPrevious => self.skip_to_previous().await,
            MethodCall::Stop => self.stop_playback().await,
            MethodCall::SeekTo(position_ms) => self.seek_to(position_ms).await,
        };

        MethodResponse::Bool(command.unwrap_or_else(|e| {
            log::warn!("[Service] 命令 '{name}' 未能执行: {e}");
            false
        }))
    }

    /// 服务是否仍在运行。
    pub fn is_running(&self) -> bool {
        self.worker.state() == WorkerState::Running
    }

    /// 关闭服务：执行完已排队的任务，注销全部外部订阅，回收所有线程，
    /// 并结束所有消费端的流。可以重复调用。
    pub fn shutdown(&self) {
        if self.worker.state() == WorkerState::Stopped {
            return;
        }
        log::info!("[Service] 正在关闭媒体通知服务...");
        self.worker.stop();
        self.media.close();
        self.position.close();
        self.queue.close();
        log::info!("[Service] 媒体通知服务已关闭。");
    }
}

fn enqueue_or_log(
    handle: &WorkerHandle<ServiceContext>,
    stream: &str,
    action: fn(&mut ServiceContext),
) {
    if let Err(e) = handle.enqueue(action) {
        log::warn!("[Stream:{stream}] 无法通知工作线程: {e}");
    }
}

impl Drop for MediaNotificationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
