//! 进程内的模拟媒体会话后端。
//!
//! 在没有系统媒体会话 API 的平台上作为默认后端使用，同时也是测试和演示程序
//! 驱动整个服务的方式：持有 [`SimulatedBackend`] 的一份克隆即可打开、关闭、
//! 修改会话，并在调用线程上触发已注册的回调（相当于外部 API 的“任意线程”）。

use std::{
    rc::Rc,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use chrono::{DateTime, Utc};

use super::{
    BackendError, BackendResult, EventHandler, EventToken, ManagerEvent, MediaBackend,
    MediaProperties, MediaSession, PlaybackInfo, SessionEvent, SessionPlaybackStatus,
    SessionSource, TimeSpan, TimelineProperties,
};

/// 模拟会话收到的传输控制命令。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    /// 切换播放/暂停。
    TogglePlayPause,
    /// 下一首。
    SkipNext,
    /// 上一首。
    SkipPrevious,
    /// 停止。
    Stop,
    /// 跳转目标（外部 API 的原生单位）。
    ChangePosition(TimeSpan),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // 模拟器中的锁只保护普通数据，毒化后继续使用内部值即可。
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn fire_all(handlers: Vec<EventHandler>) {
    for handler in handlers {
        handler();
    }
}

struct HandlerTable<E> {
    entries: Vec<(E, EventToken, EventHandler)>,
}

impl<E> Default for HandlerTable<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E: Copy + PartialEq> HandlerTable<E> {
    fn add(&mut self, event: E, token: EventToken, handler: EventHandler) {
        self.entries.push((event, token, handler));
    }

    fn remove(&mut self, event: E, token: EventToken) -> BackendResult<()> {
        let before = self.entries.len();
        self.entries.retain(|(e, t, _)| !(*e == event && *t == token));
        if self.entries.len() == before {
            Err(BackendError::InvalidToken(token))
        } else {
            Ok(())
        }
    }

    fn handlers_for(&self, event: E) -> Vec<EventHandler> {
        self.entries
            .iter()
            .filter(|(e, _, _)| *e == event)
            .map(|(_, _, h)| h.clone())
            .collect()
    }

    fn count(&self, event: E) -> usize {
        self.entries.iter().filter(|(e, _, _)| *e == event).count()
    }
}

struct SessionData {
    app_id: String,
    properties: MediaProperties,
    album_art: Option<Vec<u8>>,
    status: SessionPlaybackStatus,
    playback_rate: Option<f64>,
    position: TimeSpan,
    end_time: TimeSpan,
    last_updated: DateTime<Utc>,
    failing: bool,
    handlers: HandlerTable<SessionEvent>,
    commands: Vec<TransportCommand>,
}

struct SessionShared {
    instance_id: u64,
    data: Mutex<SessionData>,
    tokens: Arc<AtomicU64>,
    registration_threads: Arc<Mutex<Vec<Option<String>>>>,
}

impl SessionShared {
    fn fire(&self, event: SessionEvent) {
        let handlers = lock(&self.data).handlers.handlers_for(event);
        fire_all(handlers);
    }

    fn check(&self) -> BackendResult<MutexGuard<'_, SessionData>> {
        let data = lock(&self.data);
        if data.failing {
            return Err(BackendError::Call(format!(
                "模拟会话 '{}' 处于故障状态",
                data.app_id
            )));
        }
        Ok(data)
    }
}

/// 对某个模拟会话实例的控制句柄（测试/演示侧）。
#[derive(Clone)]
pub struct SimulatedSessionHandle {
    shared: Arc<SessionShared>,
}

impl SimulatedSessionHandle {
    /// 该会话实例的唯一编号。
    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    /// 修改曲目信息并触发 `MediaPropertiesChanged`。
    pub fn set_track(&self, title: &str, artist: &str, album: &str) {
        {
            let mut data = lock(&self.shared.data);
            data.properties = MediaProperties {
                title: title.to_string(),
                artist: artist.to_string(),
                album_title: album.to_string(),
            };
        }
        self.shared.fire(SessionEvent::MediaPropertiesChanged);
    }

    /// 修改封面数据（不触发事件）。
    pub fn set_album_art(&self, art: Option<Vec<u8>>) {
        lock(&self.shared.data).album_art = art;
    }

    /// 修改播放状态并触发 `PlaybackInfoChanged`。
    pub fn set_status(&self, status: SessionPlaybackStatus) {
        lock(&self.shared.data).status = status;
        self.shared.fire(SessionEvent::PlaybackInfoChanged);
    }

    /// 修改外部报告的播放速率（不触发事件）。
    pub fn set_playback_rate(&self, rate: Option<f64>) {
        lock(&self.shared.data).playback_rate = rate;
    }

    /// 以当前时间为报告时间更新时间轴，并触发 `TimelinePropertiesChanged`。
    pub fn set_timeline(&self, position_ms: i64, duration_ms: i64) {
        self.set_timeline_at(position_ms, duration_ms, Utc::now());
    }

    /// 以指定的报告时间更新时间轴，并触发 `TimelinePropertiesChanged`。
    pub fn set_timeline_at(&self, position_ms: i64, duration_ms: i64, reported_at: DateTime<Utc>) {
        {
            let mut data = lock(&self.shared.data);
            data.position = TimeSpan::from_millis(position_ms);
            data.end_time = TimeSpan::from_millis(duration_ms);
            data.last_updated = reported_at;
        }
        self.shared.fire(SessionEvent::TimelinePropertiesChanged);
    }

    /// 让后续所有查询和命令返回错误。
    pub fn set_failing(&self, failing: bool) {
        lock(&self.shared.data).failing = failing;
    }

    /// 手动触发一个会话事件。
    pub fn fire(&self, event: SessionEvent) {
        self.shared.fire(event);
    }

    /// 当前注册在此实例上的某类回调数量。
    pub fn handler_count(&self, event: SessionEvent) -> usize {
        lock(&self.shared.data).handlers.count(event)
    }

    /// 当前注册在此实例上的回调总数。
    pub fn total_handler_count(&self) -> usize {
        lock(&self.shared.data).handlers.entries.len()
    }

    /// 此实例收到的所有传输控制命令。
    pub fn commands(&self) -> Vec<TransportCommand> {
        lock(&self.shared.data).commands.clone()
    }
}

struct HubState {
    current: Option<Arc<SessionShared>>,
    sessions: Vec<Arc<SessionShared>>,
    handlers: HandlerTable<ManagerEvent>,
    connect_failure: Option<String>,
}

struct Hub {
    state: Mutex<HubState>,
    tokens: Arc<AtomicU64>,
    instances: AtomicU64,
    registration_threads: Arc<Mutex<Vec<Option<String>>>>,
}

impl Hub {
    fn fire(&self, event: ManagerEvent) {
        let handlers = lock(&self.state).handlers.handlers_for(event);
        fire_all(handlers);
    }
}

fn record_thread(threads: &Mutex<Vec<Option<String>>>) {
    lock(threads).push(thread::current().name().map(str::to_string));
}

/// 进程内的模拟后端。克隆共享同一份状态。
#[derive(Clone)]
pub struct SimulatedBackend {
    hub: Arc<Hub>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// 创建一个没有任何会话的模拟后端。
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState {
                    current: None,
                    sessions: Vec::new(),
                    handlers: HandlerTable::default(),
                    connect_failure: None,
                }),
                tokens: Arc::new(AtomicU64::new(1)),
                instances: AtomicU64::new(1),
                registration_threads: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// 打开一个新的会话实例并将其设为当前会话。
    ///
    /// 依次触发 `SessionsChanged` 与 `CurrentSessionChanged`。
    pub fn open_session(&self, app_id: &str) -> SimulatedSessionHandle {
        let shared = Arc::new(SessionShared {
            instance_id: self.hub.instances.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(SessionData {
                app_id: app_id.to_string(),
                properties: MediaProperties::default(),
                album_art: None,
                status: SessionPlaybackStatus::Opened,
                playback_rate: Some(1.0),
                position: TimeSpan::default(),
                end_time: TimeSpan::default(),
                last_updated: Utc::now(),
                failing: false,
                handlers: HandlerTable::default(),
                commands: Vec::new(),
            }),
            tokens: self.hub.tokens.clone(),
            registration_threads: self.hub.registration_threads.clone(),
        });
        {
            let mut state = lock(&self.hub.state);
            state.sessions.push(shared.clone());
            state.current = Some(shared.clone());
        }
        self.hub.fire(ManagerEvent::SessionsChanged);
        self.hub.fire(ManagerEvent::CurrentSessionChanged);
        SimulatedSessionHandle { shared }
    }

    /// 将一个已存在的会话实例重新设为当前会话，并触发 `CurrentSessionChanged`。
    pub fn make_current(&self, session: &SimulatedSessionHandle) {
        lock(&self.hub.state).current = Some(session.shared.clone());
        self.hub.fire(ManagerEvent::CurrentSessionChanged);
    }

    /// 关闭当前会话，之后“没有当前会话”。
    pub fn close_current_session(&self) {
        {
            let mut state = lock(&self.hub.state);
            if let Some(current) = state.current.take() {
                state.sessions.retain(|s| !Arc::ptr_eq(s, &current));
            }
        }
        self.hub.fire(ManagerEvent::SessionsChanged);
        self.hub.fire(ManagerEvent::CurrentSessionChanged);
    }

    /// 手动触发一个管理器事件。
    pub fn fire(&self, event: ManagerEvent) {
        self.hub.fire(event);
    }

    /// 当前注册在管理器上的某类回调数量。
    pub fn manager_handler_count(&self, event: ManagerEvent) -> usize {
        lock(&self.hub.state).handlers.count(event)
    }

    /// 让之后的 `connect` 失败。
    pub fn set_connect_failure(&self, reason: Option<&str>) {
        lock(&self.hub.state).connect_failure = reason.map(str::to_string);
    }

    /// 每一次注册/注销调用发生时所在线程的名称。
    pub fn registration_threads(&self) -> Vec<Option<String>> {
        lock(&self.hub.registration_threads).clone()
    }
}

impl MediaBackend for SimulatedBackend {
    fn connect(&self) -> BackendResult<Rc<dyn SessionSource>> {
        if let Some(reason) = lock(&self.hub.state).connect_failure.clone() {
            return Err(BackendError::Unavailable(reason));
        }
        Ok(Rc::new(SimulatedSource {
            hub: self.hub.clone(),
        }))
    }
}

struct SimulatedSource {
    hub: Arc<Hub>,
}

impl SessionSource for SimulatedSource {
    fn current_session(&self) -> BackendResult<Option<Box<dyn MediaSession>>> {
        Ok(lock(&self.hub.state)
            .current
            .clone()
            .map(|shared| Box::new(SimulatedSession { shared }) as Box<dyn MediaSession>))
    }

    fn add_handler(&self, event: ManagerEvent, handler: EventHandler) -> BackendResult<EventToken> {
        record_thread(&self.hub.registration_threads);
        let token = EventToken(self.hub.tokens.fetch_add(1, Ordering::Relaxed) as i64);
        lock(&self.hub.state).handlers.add(event, token, handler);
        Ok(token)
    }

    fn remove_handler(&self, event: ManagerEvent, token: EventToken) -> BackendResult<()> {
        record_thread(&self.hub.registration_threads);
        lock(&self.hub.state).handlers.remove(event, token)
    }
}

struct SimulatedSession {
    shared: Arc<SessionShared>,
}

impl SimulatedSession {
    fn command(&self, command: TransportCommand) -> BackendResult<bool> {
        let event = {
            let mut data = self.shared.check()?;
            data.commands.push(command);
            match command {
                TransportCommand::TogglePlayPause => {
                    data.status = if data.status == SessionPlaybackStatus::Playing {
                        SessionPlaybackStatus::Paused
                    } else {
                        SessionPlaybackStatus::Playing
                    };
                    Some(SessionEvent::PlaybackInfoChanged)
                }
                TransportCommand::Stop => {
                    data.status = SessionPlaybackStatus::Stopped;
                    Some(SessionEvent::PlaybackInfoChanged)
                }
                TransportCommand::ChangePosition(position) => {
                    data.position = position;
                    data.last_updated = Utc::now();
                    Some(SessionEvent::TimelinePropertiesChanged)
                }
                TransportCommand::SkipNext | TransportCommand::SkipPrevious => None,
            }
        };
        // 真实 API 的事件在其他线程上异步到达，这里同样不能在调用线程上同步回调。
        if let Some(event) = event {
            let shared = self.shared.clone();
            thread::spawn(move || shared.fire(event));
        }
        Ok(true)
    }
}

impl MediaSession for SimulatedSession {
    fn source_app_id(&self) -> BackendResult<String> {
        Ok(self.shared.check()?.app_id.clone())
    }

    fn media_properties(&self) -> BackendResult<MediaProperties> {
        Ok(self.shared.check()?.properties.clone())
    }

    fn thumbnail(&self, max_bytes: usize) -> BackendResult<Option<Vec<u8>>> {
        let data = self.shared.check()?;
        Ok(data
            .album_art
            .as_ref()
            .filter(|art| !art.is_empty() && art.len() <= max_bytes)
            .cloned())
    }

    fn playback_info(&self) -> BackendResult<PlaybackInfo> {
        let data = self.shared.check()?;
        Ok(PlaybackInfo {
            status: data.status,
            playback_rate: data.playback_rate,
        })
    }

    fn timeline_properties(&self) -> BackendResult<TimelineProperties> {
        let data = self.shared.check()?;
        Ok(TimelineProperties {
            position: data.position,
            start_time: TimeSpan::default(),
            end_time: data.end_time,
            last_updated: data.last_updated,
        })
    }

    fn add_handler(&self, event: SessionEvent, handler: EventHandler) -> BackendResult<EventToken> {
        record_thread(&self.shared.registration_threads);
        let token = EventToken(self.shared.tokens.fetch_add(1, Ordering::Relaxed) as i64);
        self.shared.check()?.handlers.add(event, token, handler);
        Ok(token)
    }

    fn remove_handler(&self, event: SessionEvent, token: EventToken) -> BackendResult<()> {
        record_thread(&self.shared.registration_threads);
        lock(&self.shared.data).handlers.remove(event, token)
    }

    fn try_toggle_play_pause(&self) -> BackendResult<bool> {
        self.command(TransportCommand::TogglePlayPause)
    }

    fn try_skip_next(&self) -> BackendResult<bool> {
        self.command(TransportCommand::SkipNext)
    }

    fn try_skip_previous(&self) -> BackendResult<bool> {
        self.command(TransportCommand::SkipPrevious)
    }

    fn try_stop(&self) -> BackendResult<bool> {
        self.command(TransportCommand::Stop)
    }

    fn try_change_playback_position(&self, position: TimeSpan) -> BackendResult<bool> {
        self.command(TransportCommand::ChangePosition(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler() -> (EventHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_token_only_valid_on_issuing_instance() {
        let backend = SimulatedBackend::new();
        let source = backend.connect().unwrap();

        let _first = backend.open_session("first.exe");
        let old = source.current_session().unwrap().unwrap();
        let (handler, _) = counting_handler();
        let token = old
            .add_handler(SessionEvent::MediaPropertiesChanged, handler)
            .unwrap();

        let _second = backend.open_session("second.exe");
        let new = source.current_session().unwrap().unwrap();

        assert_eq!(
            new.remove_handler(SessionEvent::MediaPropertiesChanged, token),
            Err(BackendError::InvalidToken(token))
        );
        assert_eq!(
            old.remove_handler(SessionEvent::MediaPropertiesChanged, token),
            Ok(())
        );
    }

    #[test]
    fn test_session_events_reach_handlers() {
        let backend = SimulatedBackend::new();
        let source = backend.connect().unwrap();
        let handle = backend.open_session("player.exe");
        let session = source.current_session().unwrap().unwrap();

        let (handler, count) = counting_handler();
        session
            .add_handler(SessionEvent::TimelinePropertiesChanged, handler)
            .unwrap();

        handle.set_timeline(1000, 5000);
        handle.set_track("a", "b", "c");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let timeline = session.timeline_properties().unwrap();
        assert_eq!(timeline.position.as_millis(), 1000);
        assert_eq!(timeline.end_time.as_millis(), 5000);
    }

    #[test]
    fn test_failing_session_reports_errors() {
        let backend = SimulatedBackend::new();
        let source = backend.connect().unwrap();
        let handle = backend.open_session("player.exe");
        handle.set_failing(true);
        let session = source.current_session().unwrap().unwrap();
        assert!(session.media_properties().is_err());
        assert!(session.try_skip_next().is_err());
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn test_connect_failure() {
        let backend = SimulatedBackend::new();
        backend.set_connect_failure(Some("offline"));
        assert!(matches!(
            backend.connect(),
            Err(BackendError::Unavailable(reason)) if reason == "offline"
        ));
    }
}
