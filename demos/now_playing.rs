use std::{
    io::{BufRead, stdin},
    sync::Arc,
};

use log::{error, info, warn};
use media_notification_service::{
    MediaNotificationService, MethodResponse, ServiceConfig, backend::MediaBackend,
};
use serde_json::json;

#[cfg(windows)]
fn demo_backend() -> Box<dyn MediaBackend> {
    media_notification_service::backend::platform_backend()
}

/// 非 Windows 平台上没有系统媒体会话，打开一个模拟的播放器以便观察事件。
#[cfg(not(windows))]
fn demo_backend() -> Box<dyn MediaBackend> {
    use media_notification_service::backend::{
        SessionPlaybackStatus, simulated::SimulatedBackend,
    };

    let backend = SimulatedBackend::new();
    let player = backend.open_session("demo.player");
    player.set_track("Solaris", "Stellardrone", "Light Years");
    player.set_timeline(0, 215_000);
    player.set_status(SessionPlaybackStatus::Playing);
    Box::new(backend)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let service = match MediaNotificationService::start(demo_backend(), ServiceConfig::default()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("媒体通知服务启动失败: {e}");
            return Err(e.into());
        }
    };

    let mut media = service.media_stream(None);
    let media_task = tokio::spawn(async move {
        while let Some(event) = media.recv().await {
            let snapshot = &event.snapshot;
            info!(
                "[媒体{}] {} - {} ({:?}, 封面 {} 字节)",
                if event.track_changed { "·新曲目" } else { "" },
                snapshot.artist.as_deref().unwrap_or("未知艺术家"),
                snapshot.title.as_deref().unwrap_or("未知标题"),
                snapshot.state,
                snapshot.album_art.as_ref().map_or(0, Vec::len),
            );
        }
        info!("媒体流已结束。");
    });

    let mut position = service.position_stream(None);
    let position_task = tokio::spawn(async move {
        let mut last_second = -1;
        while let Some(snapshot) = position.recv().await {
            // 每秒只打印一次，避免刷屏。
            let second = snapshot.position_ms / 1000;
            if second != last_second {
                last_second = second;
                info!(
                    "[进度] {:02}:{:02} / {:02}:{:02}",
                    second / 60,
                    second % 60,
                    snapshot.duration_ms / 60_000,
                    snapshot.duration_ms / 1000 % 60
                );
            }
        }
        info!("进度流已结束。");
    });

    info!("输入命令: p=播放/暂停, n=下一首, b=上一首, s=停止, seek <毫秒>, q=退出");

    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let mut parts = line.split_whitespace();
        let response = match (parts.next(), parts.next()) {
            (Some("q"), _) => break,
            (Some("p"), _) => service.handle_method_call("playPause", None).await,
            (Some("n"), _) => service.handle_method_call("skipToNext", None).await,
            (Some("b"), _) => service.handle_method_call("skipToPrevious", None).await,
            (Some("s"), _) => service.handle_method_call("stop", None).await,
            (Some("seek"), Some(ms)) => {
                let args = ms.parse::<i64>().map_or(json!({}), |ms| json!({ "position": ms }));
                service.handle_method_call("seekTo", Some(&args)).await
            }
            (Some(other), _) => service.handle_method_call(other, None).await,
            (None, _) => continue,
        };
        match response {
            MethodResponse::NotImplemented => warn!("未知命令: {line}"),
            other => info!("结果: {}", serde_json::to_string(&other)?),
        }
    }

    service.shutdown();
    media_task.await?;
    position_task.await?;

    Ok(())
}
