use std::{
    fmt,
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender as CrossbeamSender};

use crate::error::{Result, ServiceError};

struct RunningTimer {
    /// 发送或销毁都会唤醒计时器线程并使其退出。
    stop_tx: CrossbeamSender<()>,
    join_handle: JoinHandle<()>,
    thread_id: ThreadId,
}

/// 固定间隔的回调发生器。
///
/// 第 k 次回调安排在 `t0 + k * interval`，其中 `t0` 是启动时刻，
/// 所以回调本身的耗时不会累积成漂移。回调超时导致错过的节拍会被直接跳过，
/// 而不是在之后连续补发。
pub struct PeriodicTimer {
    name: String,
    running: Option<RunningTimer>,
}

impl PeriodicTimer {
    /// 创建一个尚未启动的计时器。`name` 用作线程名。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: None,
        }
    }

    /// 以 `interval` 为间隔启动计时器，第一次回调立即发生。
    ///
    /// 如果计时器已在运行，会先将其停止。
    pub fn start<F>(&mut self, interval: Duration, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.stop();

        let interval = interval.max(Duration::from_millis(1));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let name = self.name.clone();

        let join_handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut callback = callback;
                let t0 = Instant::now();
                let mut tick: u32 = 0;
                log::trace!("[Timer] '{name}' 已启动，间隔 {interval:?}。");

                loop {
                    let Some(deadline) = interval.checked_mul(tick).and_then(|o| t0.checked_add(o))
                    else {
                        log::warn!("[Timer] '{name}' 的节拍计数已溢出，计时器退出。");
                        break;
                    };

                    match stop_rx.recv_deadline(deadline) {
                        Err(RecvTimeoutError::Timeout) => {
                            callback();
                            // 跳过回调期间已经错过的节拍。
                            let elapsed_ticks = t0.elapsed().as_nanos() / interval.as_nanos();
                            let next = u32::try_from(elapsed_ticks + 1).unwrap_or(u32::MAX);
                            tick = next.max(tick.saturating_add(1));
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::trace!("[Timer] '{name}' 已结束。");
            })
            .map_err(|source| ServiceError::ThreadSpawn {
                name: self.name.clone(),
                source,
            })?;

        self.running = Some(RunningTimer {
            stop_tx,
            thread_id: join_handle.thread().id(),
            join_handle,
        });
        Ok(())
    }

    /// 停止计时器。返回后回调不会再被调用，且回调已被销毁。
    ///
    /// 在回调内部调用时只会发出停止信号，不会等待。
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.stop_tx.try_send(());
        drop(running.stop_tx);

        if thread::current().id() == running.thread_id {
            log::warn!("[Timer] 在计时器线程 '{}' 内部调用了 stop()。", self.name);
            return;
        }
        if let Err(e) = running.join_handle.join() {
            log::error!("[Timer] 计时器线程 '{}' 异常退出: {e:?}", self.name);
        }
    }

    /// 计时器是否正在运行。
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn test_fires_immediately_then_at_fixed_cadence() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let started = Instant::now();

        let mut timer = PeriodicTimer::new("test_cadence");
        timer
            .start(Duration::from_millis(20), move || {
                recorded.lock().unwrap().push(Instant::now());
            })
            .unwrap();
        thread::sleep(Duration::from_millis(210));
        timer.stop();

        let calls = calls.lock().unwrap();
        assert!(
            calls[0].duration_since(started) < Duration::from_millis(15),
            "第一次回调应当立即发生"
        );
        assert!(
            (6..=12).contains(&calls.len()),
            "210ms 内应有约 11 次回调，实际为 {}",
            calls.len()
        );
    }

    #[test]
    fn test_callback_duration_does_not_drift_schedule() {
        let interval = Duration::from_millis(50);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();

        let mut timer = PeriodicTimer::new("test_drift");
        timer
            .start(interval, move || {
                recorded.lock().unwrap().push(Instant::now());
                // 每次回调占用 60% 的间隔。
                thread::sleep(Duration::from_millis(30));
            })
            .unwrap();
        thread::sleep(Duration::from_millis(420));
        timer.stop();

        let calls = calls.lock().unwrap();
        assert!(calls.len() >= 7, "应有约 9 次回调，实际为 {}", calls.len());

        // 第一次回调在 t0 立即发生，以它为基准。
        let t0 = calls[0];
        let tolerance = Duration::from_millis(15);
        for (k, call) in calls.iter().enumerate() {
            let expected = t0 + interval * k as u32;
            let offset = if *call >= expected {
                call.duration_since(expected)
            } else {
                expected.duration_since(*call)
            };
            assert!(offset < tolerance, "第 {k} 次回调偏离预定时刻 {offset:?}");
        }
    }

    #[test]
    fn test_overrun_ticks_are_skipped() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = starts.clone();

        let mut timer = PeriodicTimer::new("test_overrun");
        timer
            .start(Duration::from_millis(20), move || {
                recorded.lock().unwrap().push(Instant::now());
                thread::sleep(Duration::from_millis(45));
            })
            .unwrap();
        thread::sleep(Duration::from_millis(250));
        timer.stop();

        let starts = starts.lock().unwrap();
        assert!(starts.len() >= 2);
        for pair in starts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap >= Duration::from_millis(52),
                "错过的节拍不应被连续补发，间隔仅为 {gap:?}"
            );
        }
    }

    #[test]
    fn test_no_invocation_after_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let mut timer = PeriodicTimer::new("test_stop");
        timer
            .start(Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        timer.stop();
        assert!(!timer.is_running());

        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
        assert_eq!(Arc::strong_count(&count), 1, "回调应当在 stop() 后被销毁");

        timer.stop();
    }

    #[test]
    fn test_restart_replaces_previous_callback() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut timer = PeriodicTimer::new("test_restart");
        let c = first.clone();
        timer
            .start(Duration::from_millis(5), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let c = second.clone();
        timer
            .start(Duration::from_millis(5), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let first_count = first.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        drop(timer);

        assert_eq!(first.load(Ordering::SeqCst), first_count);
        assert!(second.load(Ordering::SeqCst) >= 1);
    }
}
