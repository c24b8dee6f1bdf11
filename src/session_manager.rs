//! 当前媒体会话的跟踪与事件订阅管理。
//!
//! [`SessionManager`] 只能在工作线程上使用：它持有的外部 API 对象不是
//! 线程安全的，所有注册/注销也必须发生在同一个线程上。外部回调只会通过
//! [`Scheduler`] 把任务重新排回工作线程。

use std::{fmt, rc::Rc, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    api::{PlaybackSnapshot, PlaybackState, PositionSnapshot, TimelineSample},
    backend::{
        BackendResult, EventHandler, EventToken, ManagerEvent, MediaBackend, MediaSession,
        SessionEvent, SessionSource, TimeSpan,
    },
    error::Result,
};

/// 排回工作线程执行的会话管理任务。
pub type ManagerTask = Box<dyn FnOnce(&mut SessionManager) + Send>;

/// 把任务排回工作线程的入口。可在任意线程上调用。
pub type Scheduler = Arc<dyn Fn(ManagerTask) + Send + Sync>;

/// 监听组收到变更时调用的回调。在工作线程上执行。
pub type ChangeCallback = Box<dyn FnMut(&SessionManager) + Send>;

/// 两组彼此独立的监听。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerGroup {
    /// 媒体信息（标题、封面、播放状态）。
    Media,
    /// 播放进度。
    Position,
}

impl ListenerGroup {
    fn session_events(self) -> &'static [SessionEvent] {
        match self {
            Self::Media => &[
                SessionEvent::MediaPropertiesChanged,
                SessionEvent::PlaybackInfoChanged,
            ],
            Self::Position => &[
                SessionEvent::TimelinePropertiesChanged,
                SessionEvent::PlaybackInfoChanged,
                SessionEvent::MediaPropertiesChanged,
            ],
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Media => 0,
            Self::Position => 1,
        }
    }
}

/// 在管理器上注册的 `SessionsChanged` / `CurrentSessionChanged` 订阅。
///
/// drop 时在注册时的同一个管理器对象上注销。
struct ManagerSubscription {
    source: Rc<dyn SessionSource>,
    tokens: Vec<(ManagerEvent, EventToken)>,
}

impl ManagerSubscription {
    fn new(
        source: Rc<dyn SessionSource>,
        group: ListenerGroup,
        epoch: u64,
        scheduler: &Scheduler,
    ) -> BackendResult<Self> {
        let mut subscription = Self {
            source,
            tokens: Vec::with_capacity(2),
        };

        let scheduler_current = scheduler.clone();
        let on_current: EventHandler = Arc::new(move || {
            scheduler_current(Box::new(move |manager: &mut SessionManager| {
                manager.handle_current_session_changed(group, epoch);
            }));
        });
        let token = subscription
            .source
            .add_handler(ManagerEvent::CurrentSessionChanged, on_current)?;
        subscription
            .tokens
            .push((ManagerEvent::CurrentSessionChanged, token));

        let scheduler_sessions = scheduler.clone();
        let on_sessions: EventHandler = Arc::new(move || {
            scheduler_sessions(Box::new(move |manager: &mut SessionManager| {
                manager.handle_change_notification(group, epoch);
            }));
        });
        // 如果这里失败，已注册的令牌会随 subscription 的 drop 一起注销。
        let token = subscription
            .source
            .add_handler(ManagerEvent::SessionsChanged, on_sessions)?;
        subscription
            .tokens
            .push((ManagerEvent::SessionsChanged, token));

        Ok(subscription)
    }
}

impl Drop for ManagerSubscription {
    fn drop(&mut self) {
        for (event, token) in self.tokens.drain(..) {
            if let Err(e) = self.source.remove_handler(event, token) {
                log::warn!("[SessionManager] 注销管理器事件 {event:?} 失败: {e}");
            }
        }
    }
}

/// 在某个会话实例上注册的订阅。
///
/// 持有的正是注册时的那个会话对象，所以即使“当前会话”已经换了，
/// drop 时也会在旧实例上注销。
struct SessionSubscription {
    session: Box<dyn MediaSession>,
    tokens: Vec<(SessionEvent, EventToken)>,
}

impl SessionSubscription {
    fn new(
        session: Box<dyn MediaSession>,
        group: ListenerGroup,
        epoch: u64,
        scheduler: &Scheduler,
    ) -> BackendResult<Self> {
        let events = group.session_events();
        let mut subscription = Self {
            session,
            tokens: Vec::with_capacity(events.len()),
        };
        for &event in events {
            let scheduler = scheduler.clone();
            let handler: EventHandler = Arc::new(move || {
                scheduler(Box::new(move |manager: &mut SessionManager| {
                    manager.handle_change_notification(group, epoch);
                }));
            });
            let token = subscription.session.add_handler(event, handler)?;
            subscription.tokens.push((event, token));
        }
        Ok(subscription)
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        for (event, token) in self.tokens.drain(..) {
            if let Err(e) = self.session.remove_handler(event, token) {
                log::warn!("[SessionManager] 注销会话事件 {event:?} 失败: {e}");
            }
        }
    }
}

#[derive(Default)]
struct GroupState {
    callback: Option<ChangeCallback>,
    manager_subscription: Option<ManagerSubscription>,
    session_subscription: Option<SessionSubscription>,
    /// 每次开始/停止监听都会递增，旧订阅排入的任务据此被忽略。
    epoch: u64,
}

impl GroupState {
    fn is_listening(&self) -> bool {
        self.callback.is_some()
    }
}

/// 外部会话管理器的持有者。
pub struct SessionManager {
    source: Option<Rc<dyn SessionSource>>,
    scheduler: Scheduler,
    groups: [GroupState; 2],
    max_album_art_bytes: usize,
}

impl SessionManager {
    /// 创建一个尚未连接外部 API 的管理器。
    pub fn new(scheduler: Scheduler, max_album_art_bytes: usize) -> Self {
        Self {
            source: None,
            scheduler,
            groups: [GroupState::default(), GroupState::default()],
            max_album_art_bytes,
        }
    }

    /// 获取外部会话管理器。
    ///
    /// 失败时管理器保持“无外部管理器”状态：所有查询返回空值，所有命令返回 `false`。
    pub fn initialize(&mut self, backend: &dyn MediaBackend) -> Result<()> {
        self.source = None;
        let source = backend.connect()?;
        log::info!("[SessionManager] 已获取媒体会话管理器。");
        self.source = Some(source);
        Ok(())
    }

    /// 是否已成功获取外部会话管理器。
    pub fn is_initialized(&self) -> bool {
        self.source.is_some()
    }

    fn group(&self, group: ListenerGroup) -> &GroupState {
        &self.groups[group.index()]
    }

    fn group_mut(&mut self, group: ListenerGroup) -> &mut GroupState {
        &mut self.groups[group.index()]
    }

    fn current_session(&self) -> Option<Box<dyn MediaSession>> {
        let source = self.source.as_ref()?;
        match source.current_session() {
            Ok(session) => session,
            Err(e) => {
                log::warn!("[SessionManager] 查询当前会话失败: {e}");
                None
            }
        }
    }

    /// 在当前会话上执行一次外部调用。没有会话或调用失败时返回 `None`。
    fn with_session<R>(
        &self,
        action: &str,
        f: impl FnOnce(&dyn MediaSession) -> BackendResult<R>,
    ) -> Option<R> {
        let session = self.current_session()?;
        match f(session.as_ref()) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("[SessionManager] {action} 失败: {e}");
                None
            }
        }
    }

    /// 查询当前会话的完整快照（包括封面）。会阻塞直到外部调用完成。
    pub fn current_snapshot(&self) -> PlaybackSnapshot {
        self.with_session("读取媒体快照", |session| {
            let properties = session.media_properties()?;
            let info = session.playback_info()?;
            let album_art = session
                .thumbnail(self.max_album_art_bytes)
                .unwrap_or_else(|e| {
                    log::warn!("[SessionManager] 获取封面失败: {e}");
                    None
                });
            let state = PlaybackState::from(info.status);
            Ok(PlaybackSnapshot {
                title: non_empty(properties.title),
                artist: non_empty(properties.artist),
                album: non_empty(properties.album_title),
                source_app_id: session.source_app_id().ok().and_then(non_empty),
                album_art,
                state,
                is_playing: state == PlaybackState::Playing,
            })
        })
        .unwrap_or_default()
    }

    /// 计算当前时刻的外推进度。
    pub fn current_position(&self) -> PositionSnapshot {
        self.position_at(Utc::now())
    }

    /// 计算 `now` 时刻的外推进度。
    pub fn position_at(&self, now: DateTime<Utc>) -> PositionSnapshot {
        self.with_session("读取播放进度", |session| {
            let timeline = session.timeline_properties()?;
            let info = session.playback_info()?;
            let sample =
                TimelineSample::from_timeline(&timeline, info.playback_rate, info.status.into());
            Ok(sample.snapshot_at(now))
        })
        .unwrap_or_default()
    }

    /// 当前会话是否正在播放。
    pub fn is_playing(&self) -> bool {
        self.with_session("读取播放状态", |session| session.playback_info())
            .is_some_and(|info| PlaybackState::from(info.status) == PlaybackState::Playing)
    }

    /// 切换播放/暂停。
    pub fn play_pause(&self) -> bool {
        log::debug!("[SessionManager] 执行命令: playPause");
        self.with_session("playPause", |s| s.try_toggle_play_pause())
            .unwrap_or(false)
    }

    /// 下一首。
    pub fn skip_to_next(&self) -> bool {
        log::debug!("[SessionManager] 执行命令: skipToNext");
        self.with_session("skipToNext", |s| s.try_skip_next())
            .unwrap_or(false)
    }

    /// 上一首。
    pub fn skip_to_previous(&self) -> bool {
        log::debug!("[SessionManager] 执行命令: skipToPrevious");
        self.with_session("skipToPrevious", |s| s.try_skip_previous())
            .unwrap_or(false)
    }

    /// 停止播放。
    pub fn stop(&self) -> bool {
        log::debug!("[SessionManager] 执行命令: stop");
        self.with_session("stop", |s| s.try_stop()).unwrap_or(false)
    }

    /// 跳转到 `position_ms`。负数视为 0。
    pub fn seek_to(&self, position_ms: i64) -> bool {
        let offset = TimeSpan::from_millis(position_ms.max(0));
        log::debug!("[SessionManager] 执行命令: seekTo({position_ms}ms)");
        self.with_session("seekTo", |s| {
            // 上报的位置以 start_time 为原点，跳转前换算回外部 API 的绝对位置。
            let origin = s.timeline_properties().map_or(0, |t| t.start_time.0);
            s.try_change_playback_position(TimeSpan(origin.saturating_add(offset.0)))
        })
        .unwrap_or(false)
    }

    /// 开始监听某一组事件。`callback` 会在每次相关变更后于工作线程上调用。
    ///
    /// 如果该组已在监听，旧的订阅会先被撤销。返回外部订阅是否成功建立；
    /// 即使失败，回调仍然保留，以便调用方手动触发通知。
    pub fn start_listening(&mut self, group: ListenerGroup, callback: ChangeCallback) -> bool {
        self.stop_listening(group);

        let state = self.group_mut(group);
        state.epoch += 1;
        state.callback = Some(callback);
        let epoch = state.epoch;

        let Some(source) = self.source.clone() else {
            log::warn!("[SessionManager] 没有媒体会话管理器，{group:?} 组无法订阅外部事件。");
            return false;
        };

        match ManagerSubscription::new(source, group, epoch, &self.scheduler) {
            Ok(subscription) => self.group_mut(group).manager_subscription = Some(subscription),
            Err(e) => {
                log::warn!("[SessionManager] 注册 {group:?} 组的管理器事件失败: {e}");
                return false;
            }
        }
        self.bind_current_session(group);
        log::debug!("[SessionManager] {group:?} 组开始监听。");
        true
    }

    /// 停止监听某一组事件，注销其全部外部订阅。
    pub fn stop_listening(&mut self, group: ListenerGroup) {
        let state = self.group_mut(group);
        if !state.is_listening() {
            return;
        }
        state.epoch += 1;
        state.callback = None;
        // 先注销会话级订阅，再注销管理器级订阅。
        state.session_subscription = None;
        state.manager_subscription = None;
        log::debug!("[SessionManager] {group:?} 组已停止监听。");
    }

    /// 该组当前是否在监听。
    pub fn is_listening(&self, group: ListenerGroup) -> bool {
        self.group(group).is_listening()
    }

    /// 立即调用该组的回调。没有在监听时什么也不做。
    pub fn notify(&mut self, group: ListenerGroup) {
        let Some(mut callback) = self.group_mut(group).callback.take() else {
            return;
        };
        callback(&*self);
        // 回调期间不可能有人替换它：回调只拿到了共享引用。
        self.group_mut(group).callback = Some(callback);
    }

    /// 撤销旧会话上的订阅，并在新的当前会话上重新注册。
    fn bind_current_session(&mut self, group: ListenerGroup) {
        let state = self.group_mut(group);
        let epoch = state.epoch;
        // 必须在旧实例上注销，所以先销毁旧的订阅，再查询新会话。
        state.session_subscription = None;

        let Some(session) = self.current_session() else {
            log::debug!("[SessionManager] 当前没有媒体会话，{group:?} 组等待新的会话。");
            return;
        };
        let app_id = session.source_app_id().unwrap_or_default();
        match SessionSubscription::new(session, group, epoch, &self.scheduler) {
            Ok(subscription) => {
                log::info!("[SessionManager] {group:?} 组已绑定到会话 '{app_id}'。");
                self.group_mut(group).session_subscription = Some(subscription);
            }
            Err(e) => {
                log::warn!("[SessionManager] 在会话 '{app_id}' 上注册 {group:?} 组事件失败: {e}");
            }
        }
    }

    fn is_current_epoch(&self, group: ListenerGroup, epoch: u64) -> bool {
        let state = self.group(group);
        if state.is_listening() && state.epoch == epoch {
            true
        } else {
            log::trace!("[SessionManager] 忽略 {group:?} 组过期订阅的事件。");
            false
        }
    }

    fn handle_current_session_changed(&mut self, group: ListenerGroup, epoch: u64) {
        if !self.is_current_epoch(group, epoch) {
            return;
        }
        log::debug!("[SessionManager] 当前会话已改变，正在为 {group:?} 组重新绑定。");
        self.bind_current_session(group);
        self.notify(group);
    }

    fn handle_change_notification(&mut self, group: ListenerGroup, epoch: u64) {
        if self.is_current_epoch(group, epoch) {
            self.notify(group);
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_listening(ListenerGroup::Media);
        self.stop_listening(ListenerGroup::Position);
        if self.source.take().is_some() {
            log::debug!("[SessionManager] 已释放媒体会话管理器。");
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("initialized", &self.is_initialized())
            .field("media_listening", &self.is_listening(ListenerGroup::Media))
            .field(
                "position_listening",
                &self.is_listening(ListenerGroup::Position),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        SessionPlaybackStatus,
        simulated::{SimulatedBackend, TransportCommand},
    };
    use chrono::TimeDelta;
    use crossbeam_channel::{Receiver, unbounded};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// 测试线程扮演工作线程：排入的任务在 `pump` 时执行。
    fn manager() -> (SessionManager, Receiver<ManagerTask>) {
        let (tx, rx) = unbounded::<ManagerTask>();
        let scheduler: Scheduler = Arc::new(move |task: ManagerTask| {
            let _ = tx.send(task);
        });
        (SessionManager::new(scheduler, 1024), rx)
    }

    fn pump(manager: &mut SessionManager, rx: &Receiver<ManagerTask>) {
        while let Ok(task) = rx.try_recv() {
            task(manager);
        }
    }

    fn counting_callback() -> (ChangeCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            Box::new(move |_: &SessionManager| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_uninitialized_manager_is_fail_safe() {
        let backend = SimulatedBackend::new();
        backend.set_connect_failure(Some("no api"));
        let _session = backend.open_session("player.exe");

        let (mut manager, _rx) = manager();
        assert!(matches!(
            manager.initialize(&backend),
            Err(crate::error::ServiceError::Backend(_))
        ));
        assert_eq!(manager.current_snapshot(), PlaybackSnapshot::default());
        assert_eq!(manager.current_position().position_ms, 0);
        assert!(!manager.is_playing());
        assert!(!manager.play_pause());
        assert!(!manager.seek_to(1000));

        let (callback, _) = counting_callback();
        assert!(!manager.start_listening(ListenerGroup::Media, callback));
        assert!(manager.is_listening(ListenerGroup::Media));
    }

    #[test]
    fn test_snapshot_reflects_current_session() {
        let backend = SimulatedBackend::new();
        let session = backend.open_session("player.exe");
        session.set_track("Song", "Artist", "");
        session.set_album_art(Some(vec![9; 16]));
        session.set_status(SessionPlaybackStatus::Playing);

        let (mut manager, _rx) = manager();
        manager.initialize(&backend).unwrap();
        let snapshot = manager.current_snapshot();
        assert_eq!(snapshot.title.as_deref(), Some("Song"));
        assert_eq!(snapshot.artist.as_deref(), Some("Artist"));
        assert_eq!(snapshot.album, None);
        assert_eq!(snapshot.source_app_id.as_deref(), Some("player.exe"));
        assert_eq!(snapshot.album_art, Some(vec![9; 16]));
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert!(snapshot.is_playing);

        session.set_album_art(Some(vec![0; 4096]));
        assert_eq!(manager.current_snapshot().album_art, None, "超出上限的封面应被省略");

        session.set_failing(true);
        assert_eq!(manager.current_snapshot(), PlaybackSnapshot::default());
    }

    #[test]
    fn test_position_is_extrapolated() {
        let backend = SimulatedBackend::new();
        let session = backend.open_session("player.exe");
        let reported_at = Utc::now();
        session.set_timeline_at(5000, 60_000, reported_at);
        session.set_status(SessionPlaybackStatus::Playing);

        let (mut manager, _rx) = manager();
        manager.initialize(&backend).unwrap();
        let position = manager.position_at(reported_at + TimeDelta::seconds(2));
        assert_eq!(position.position_ms, 7000);
        assert_eq!(position.duration_ms, 60_000);

        session.set_playback_rate(Some(0.0));
        assert_eq!(
            manager
                .position_at(reported_at + TimeDelta::seconds(2))
                .position_ms,
            7000
        );

        session.set_status(SessionPlaybackStatus::Paused);
        assert_eq!(
            manager
                .position_at(reported_at + TimeDelta::seconds(2))
                .position_ms,
            5000
        );
    }

    #[test]
    fn test_session_swap_moves_listeners_to_new_instance() {
        let backend = SimulatedBackend::new();
        let (mut manager, rx) = manager();
        manager.initialize(&backend).unwrap();

        let (callback, notified) = counting_callback();
        assert!(manager.start_listening(ListenerGroup::Media, callback));
        assert_eq!(backend.manager_handler_count(ManagerEvent::CurrentSessionChanged), 1);
        assert_eq!(backend.manager_handler_count(ManagerEvent::SessionsChanged), 1);

        let first = backend.open_session("first.exe");
        pump(&mut manager, &rx);
        assert_eq!(first.total_handler_count(), 2);
        assert_eq!(first.handler_count(SessionEvent::MediaPropertiesChanged), 1);
        assert_eq!(first.handler_count(SessionEvent::PlaybackInfoChanged), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        let second = backend.open_session("second.exe");
        pump(&mut manager, &rx);
        assert_eq!(first.total_handler_count(), 0, "旧会话上不应残留回调");
        assert_eq!(second.total_handler_count(), 2);

        // 反复切换不应产生重复注册。
        backend.make_current(&first);
        pump(&mut manager, &rx);
        backend.make_current(&first);
        pump(&mut manager, &rx);
        assert_eq!(first.total_handler_count(), 2);
        assert_eq!(second.total_handler_count(), 0);
        assert_eq!(backend.manager_handler_count(ManagerEvent::CurrentSessionChanged), 1);

        notified.store(0, Ordering::SeqCst);
        first.set_track("a", "b", "c");
        second.set_track("x", "y", "z");
        pump(&mut manager, &rx);
        assert_eq!(notified.load(Ordering::SeqCst), 1, "只有当前会话的事件才会触发通知");

        backend.close_current_session();
        pump(&mut manager, &rx);
        assert_eq!(first.total_handler_count(), 0);
    }

    #[test]
    fn test_groups_are_independent() {
        let backend = SimulatedBackend::new();
        let session = backend.open_session("player.exe");
        let (mut manager, rx) = manager();
        manager.initialize(&backend).unwrap();

        let (media_cb, media_count) = counting_callback();
        let (position_cb, position_count) = counting_callback();
        manager.start_listening(ListenerGroup::Media, media_cb);
        manager.start_listening(ListenerGroup::Position, position_cb);
        assert_eq!(session.total_handler_count(), 5);
        assert_eq!(backend.manager_handler_count(ManagerEvent::SessionsChanged), 2);

        session.set_timeline(1000, 2000);
        pump(&mut manager, &rx);
        assert_eq!(media_count.load(Ordering::SeqCst), 0);
        assert_eq!(position_count.load(Ordering::SeqCst), 1);

        manager.stop_listening(ListenerGroup::Position);
        assert_eq!(session.total_handler_count(), 2);
        assert_eq!(
            session.handler_count(SessionEvent::TimelinePropertiesChanged),
            0
        );
        assert_eq!(backend.manager_handler_count(ManagerEvent::SessionsChanged), 1);

        session.set_status(SessionPlaybackStatus::Playing);
        pump(&mut manager, &rx);
        assert_eq!(media_count.load(Ordering::SeqCst), 1);
        assert_eq!(position_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_queued_before_stop_are_ignored() {
        let backend = SimulatedBackend::new();
        let session = backend.open_session("player.exe");
        let (mut manager, rx) = manager();
        manager.initialize(&backend).unwrap();

        let (callback, count) = counting_callback();
        manager.start_listening(ListenerGroup::Media, callback);
        session.set_track("a", "b", "c");
        manager.stop_listening(ListenerGroup::Media);

        let (callback, restarted) = counting_callback();
        manager.start_listening(ListenerGroup::Media, callback);
        pump(&mut manager, &rx);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(restarted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_commands_reach_current_session() {
        let backend = SimulatedBackend::new();
        let session = backend.open_session("player.exe");
        let (mut manager, _rx) = manager();
        manager.initialize(&backend).unwrap();

        assert!(manager.play_pause());
        assert!(manager.skip_to_next());
        assert!(manager.skip_to_previous());
        assert!(manager.stop());
        assert!(manager.seek_to(1500));
        assert!(manager.seek_to(-20));
        assert_eq!(
            session.commands(),
            vec![
                TransportCommand::TogglePlayPause,
                TransportCommand::SkipNext,
                TransportCommand::SkipPrevious,
                TransportCommand::Stop,
                TransportCommand::ChangePosition(TimeSpan(15_000_000)),
                TransportCommand::ChangePosition(TimeSpan(0)),
            ]
        );

        session.set_failing(true);
        assert!(!manager.skip_to_next());

        backend.close_current_session();
        assert!(!manager.play_pause());
    }

    #[test]
    fn test_transport_events_arrive_asynchronously() {
        let backend = SimulatedBackend::new();
        let _session = backend.open_session("player.exe");
        let (mut manager, rx) = manager();
        manager.initialize(&backend).unwrap();

        let (callback, count) = counting_callback();
        manager.start_listening(ListenerGroup::Media, callback);
        assert!(manager.play_pause());

        let task = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("PlaybackInfoChanged 应当排回任务");
        task(&mut manager);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.is_playing());
    }

    #[test]
    fn test_drop_unregisters_everything() {
        let backend = SimulatedBackend::new();
        let session = backend.open_session("player.exe");
        let (mut manager, _rx) = manager();
        manager.initialize(&backend).unwrap();

        let (media_cb, _) = counting_callback();
        let (position_cb, _) = counting_callback();
        manager.start_listening(ListenerGroup::Media, media_cb);
        manager.start_listening(ListenerGroup::Position, position_cb);
        drop(manager);

        assert_eq!(session.total_handler_count(), 0);
        assert_eq!(backend.manager_handler_count(ManagerEvent::SessionsChanged), 0);
        assert_eq!(
            backend.manager_handler_count(ManagerEvent::CurrentSessionChanged),
            0
        );
    }
}
