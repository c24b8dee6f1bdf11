//! 基于 Windows 系统媒体传输控件 (SMTC) 的后端。

use std::rc::Rc;

use chrono::{DateTime, Utc};
use windows::{
    Foundation::TypedEventHandler,
    Media::Control::{
        GlobalSystemMediaTransportControlsSession as SmtcSession,
        GlobalSystemMediaTransportControlsSessionManager as SmtcManager,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus as SmtcPlaybackStatus,
    },
    Storage::Streams::{Buffer, DataReader, InputStreamOptions},
    Win32::System::WinRT::{RO_INIT_MULTITHREADED, RoInitialize, RoUninitialize},
    core::{HSTRING, Result as WinResult},
};
use windows_future::IAsyncOperation;

use super::{
    BackendError, BackendResult, EventHandler, EventToken, ManagerEvent, MediaBackend,
    MediaProperties, MediaSession, PlaybackInfo, SessionEvent, SessionPlaybackStatus,
    SessionSource, ThreadScope, TimeSpan, TimelineProperties,
};

/// 1601-01-01 (Windows 纪元) 到 1970-01-01 (Unix 纪元) 之间的 100 纳秒数。
const WINDOWS_TO_UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;

/// 阻塞等待一个 `WinRT` 异步操作完成。
///
/// 只能在 MTA 线程上调用，否则 `get()` 会失败。
fn wait<T>(operation: WinResult<IAsyncOperation<T>>) -> BackendResult<T>
where
    T: windows::core::RuntimeType + 'static,
{
    Ok(operation?.get()?)
}

fn hstring_to_string(hstr: &HSTRING) -> String {
    if hstr.is_empty() {
        String::new()
    } else {
        hstr.to_string_lossy()
    }
}

fn datetime_from_winrt(universal_time: i64) -> DateTime<Utc> {
    let unix_ms = (universal_time - WINDOWS_TO_UNIX_EPOCH_TICKS) / super::TICKS_PER_MILLISECOND;
    DateTime::from_timestamp_millis(unix_ms).unwrap_or_else(Utc::now)
}

/// SMTC 后端。
pub struct SmtcBackend;

impl MediaBackend for SmtcBackend {
    fn prepare_thread(&self) -> BackendResult<ThreadScope> {
        unsafe { RoInitialize(RO_INIT_MULTITHREADED)? };
        log::trace!("[SMTC] 工作线程已进入 MTA。");
        Ok(ThreadScope::new(|| {
            unsafe { RoUninitialize() };
            log::trace!("[SMTC] 工作线程已离开 MTA。");
        }))
    }

    fn connect(&self) -> BackendResult<Rc<dyn SessionSource>> {
        let manager = wait(SmtcManager::RequestAsync())
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        log::debug!("[SMTC] SMTC 管理器已就绪。");
        Ok(Rc::new(SmtcSessionSource { manager }))
    }
}

struct SmtcSessionSource {
    manager: SmtcManager,
}

impl SessionSource for SmtcSessionSource {
    fn current_session(&self) -> BackendResult<Option<Box<dyn MediaSession>>> {
        match self.manager.GetCurrentSession() {
            Ok(session) => Ok(Some(Box::new(SmtcMediaSession { session }))),
            // 没有当前会话时返回的是空对象，而不是失败的 HRESULT。
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn add_handler(&self, event: ManagerEvent, handler: EventHandler) -> BackendResult<EventToken> {
        let token = match event {
            ManagerEvent::SessionsChanged => {
                self.manager
                    .SessionsChanged(&TypedEventHandler::new(move |_, _| {
                        handler();
                        Ok(())
                    }))?
            }
            ManagerEvent::CurrentSessionChanged => {
                self.manager
                    .CurrentSessionChanged(&TypedEventHandler::new(move |_, _| {
                        handler();
                        Ok(())
                    }))?
            }
        };
        Ok(EventToken(token))
    }

    fn remove_handler(&self, event: ManagerEvent, token: EventToken) -> BackendResult<()> {
        match event {
            ManagerEvent::SessionsChanged => self.manager.RemoveSessionsChanged(token.0)?,
            ManagerEvent::CurrentSessionChanged => {
                self.manager.RemoveCurrentSessionChanged(token.0)?;
            }
        }
        Ok(())
    }
}

struct SmtcMediaSession {
    session: SmtcSession,
}

impl MediaSession for SmtcMediaSession {
    fn source_app_id(&self) -> BackendResult<String> {
        Ok(hstring_to_string(&self.session.SourceAppUserModelId()?))
    }

    fn media_properties(&self) -> BackendResult<MediaProperties> {
        let props = wait(self.session.TryGetMediaPropertiesAsync())?;
        Ok(MediaProperties {
            title: hstring_to_string(&props.Title()?),
            artist: hstring_to_string(&props.Artist()?),
            album_title: hstring_to_string(&props.AlbumTitle()?),
        })
    }

    fn thumbnail(&self, max_bytes: usize) -> BackendResult<Option<Vec<u8>>> {
        let props = wait(self.session.TryGetMediaPropertiesAsync())?;
        let Ok(thumb_ref) = props.Thumbnail() else {
            return Ok(None);
        };
        let stream = wait(thumb_ref.OpenReadAsync())?;
        let stream_size = stream.Size()?;
        if stream_size == 0 {
            return Ok(None);
        }
        if stream_size > max_bytes as u64 {
            log::warn!(
                "[SMTC] 封面数据 ({stream_size} 字节) 超出上限 ({max_bytes} 字节)，已丢弃。"
            );
            return Ok(None);
        }

        let buffer = Buffer::Create(stream_size as u32)?;
        let bytes_buffer = stream
            .ReadAsync(&buffer, buffer.Capacity()?, InputStreamOptions::None)?
            .get()?;
        let reader = DataReader::FromBuffer(&bytes_buffer)?;
        let mut bytes = vec![0u8; bytes_buffer.Length()? as usize];
        reader.ReadBytes(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn playback_info(&self) -> BackendResult<PlaybackInfo> {
        let info = self.session.GetPlaybackInfo()?;
        let status = match info.PlaybackStatus()? {
            SmtcPlaybackStatus::Opened => SessionPlaybackStatus::Opened,
            SmtcPlaybackStatus::Changing => SessionPlaybackStatus::Changing,
            SmtcPlaybackStatus::Stopped => SessionPlaybackStatus::Stopped,
            SmtcPlaybackStatus::Playing => SessionPlaybackStatus::Playing,
            SmtcPlaybackStatus::Paused => SessionPlaybackStatus::Paused,
            _ => SessionPlaybackStatus::Closed,
        };
        let playback_rate = info.PlaybackRate().and_then(|r| r.Value()).ok();
        Ok(PlaybackInfo {
            status,
            playback_rate,
        })
    }

    fn timeline_properties(&self) -> BackendResult<TimelineProperties> {
        let props = self.session.GetTimelineProperties()?;
        Ok(TimelineProperties {
            position: TimeSpan(props.Position()?.Duration),
            start_time: TimeSpan(props.StartTime()?.Duration),
            end_time: TimeSpan(props.EndTime()?.Duration),
            last_updated: datetime_from_winrt(props.LastUpdatedTime()?.UniversalTime),
        })
    }

    fn add_handler(&self, event: SessionEvent, handler: EventHandler) -> BackendResult<EventToken> {
        let token = match event {
            SessionEvent::MediaPropertiesChanged => {
                self.session
                    .MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
                        handler();
                        Ok(())
                    }))?
            }
            SessionEvent::PlaybackInfoChanged => {
                self.session
                    .PlaybackInfoChanged(&TypedEventHandler::new(move |_, _| {
                        handler();
                        Ok(())
                    }))?
            }
            SessionEvent::TimelinePropertiesChanged => {
                self.session
                    .TimelinePropertiesChanged(&TypedEventHandler::new(move |_, _| {
                        handler();
                        Ok(())
                    }))?
            }
        };
        Ok(EventToken(token))
    }

    fn remove_handler(&self, event: SessionEvent, token: EventToken) -> BackendResult<()> {
        match event {
            SessionEvent::MediaPropertiesChanged => {
                self.session.RemoveMediaPropertiesChanged(token.0)?;
            }
            SessionEvent::PlaybackInfoChanged => self.session.RemovePlaybackInfoChanged(token.0)?,
            SessionEvent::TimelinePropertiesChanged => {
                self.session.RemoveTimelinePropertiesChanged(token.0)?;
            }
        }
        Ok(())
    }

    fn try_toggle_play_pause(&self) -> BackendResult<bool> {
        wait(self.session.TryTogglePlayPauseAsync())
    }

    fn try_skip_next(&self) -> BackendResult<bool> {
        wait(self.session.TrySkipNextAsync())
    }

    fn try_skip_previous(&self) -> BackendResult<bool> {
        wait(self.session.TrySkipPreviousAsync())
    }

    fn try_stop(&self) -> BackendResult<bool> {
        wait(self.session.TryStopAsync())
    }

    fn try_change_playback_position(&self, position: TimeSpan) -> BackendResult<bool> {
        wait(self.session.TryChangePlaybackPositionAsync(position.0))
    }
}
