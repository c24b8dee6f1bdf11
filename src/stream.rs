use std::{
    fmt,
    sync::{Mutex, OnceLock, PoisonError},
};

use tokio::sync::mpsc::{
    UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel,
};

/// 订阅开始或结束时调用的钩子，参数是消费端传入的订阅参数。
pub type StreamHook = Box<dyn Fn(Option<&serde_json::Value>) + Send + Sync>;

/// 消费端持有的事件流。
///
/// 当控制器换上新的接收端、服务关闭或 [`StreamController::on_cancel`] 被调用后，
/// `recv` 会在取完剩余数据后返回 `None`。
#[derive(Debug)]
pub struct EventStream<T> {
    rx: UnboundedReceiver<T>,
}

impl<T> EventStream<T> {
    /// 异步等待下一个事件。
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// 非阻塞地尝试取出一个事件。流已结束或暂时为空时返回 `None`。
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// 在非异步上下文中阻塞等待下一个事件。不能在 Tokio 运行时内调用。
    pub fn blocking_recv(&mut self) -> Option<T> {
        self.rx.blocking_recv()
    }
}

struct Hooks {
    on_start: StreamHook,
    on_stop: StreamHook,
}

/// 把任意线程上产生的事件转交给唯一的活动消费端。
///
/// 同一时刻最多只有一个接收端，注册新的接收端会让旧的结束。
/// 没有接收端时发送的值会被直接丢弃，不做缓存。
pub struct StreamController<T> {
    name: &'static str,
    sink: Mutex<Option<UnboundedSender<T>>>,
    hooks: OnceLock<Hooks>,
}

impl<T: Send + 'static> StreamController<T> {
    /// 创建一个没有接收端、也没有钩子的控制器。
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sink: Mutex::new(None),
            hooks: OnceLock::new(),
        }
    }

    /// 安装订阅钩子。只能安装一次，重复安装会被忽略并返回 `false`。
    pub fn install_hooks(&self, on_start: StreamHook, on_stop: StreamHook) -> bool {
        let installed = self.hooks.set(Hooks { on_start, on_stop }).is_ok();
        if !installed {
            log::warn!("[Stream:{}] 钩子已安装，忽略重复安装。", self.name);
        }
        installed
    }

    /// 注册新的接收端（替换旧的），然后调用开始钩子。
    pub fn on_listen(&self, args: Option<&serde_json::Value>) -> EventStream<T> {
        let (tx, rx) = unbounded_channel();
        let replaced = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tx)
            .is_some();
        log::debug!(
            "[Stream:{}] 接收端已注册{}。",
            self.name,
            if replaced { "（替换了旧的接收端）" } else { "" }
        );

        if let Some(hooks) = self.hooks.get() {
            (hooks.on_start)(args);
        }
        EventStream { rx }
    }

    /// 清除接收端，然后调用结束钩子。
    pub fn on_cancel(&self, args: Option<&serde_json::Value>) {
        let had_sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        log::debug!(
            "[Stream:{}] 订阅已取消 (之前{}接收端)。",
            self.name,
            if had_sink { "有" } else { "无" }
        );

        if let Some(hooks) = self.hooks.get() {
            (hooks.on_stop)(args);
        }
    }

    /// 把一个值交给当前接收端。可在任意线程上调用，不会阻塞。
    pub fn send(&self, value: T) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sink.as_ref() else {
            log::trace!("[Stream:{}] 没有接收端，丢弃事件。", self.name);
            return;
        };
        if tx.send(value).is_err() {
            log::trace!("[Stream:{}] 接收端已被丢弃，清除之。", self.name);
            *sink = None;
        }
    }

    /// 当前是否有活动的接收端。
    pub fn has_listener(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// 丢弃接收端而不调用钩子。用于服务关闭，使消费端的流结束。
    pub(crate) fn close(&self) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<T> fmt::Debug for StreamController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{sync::Arc, thread};

    #[test]
    fn test_values_from_one_thread_arrive_in_order() {
        let controller = Arc::new(StreamController::<(usize, usize)>::new("test"));
        let mut stream = controller.on_listen(None);

        let producers: Vec<_> = (0..3)
            .map(|producer| {
                let controller = controller.clone();
                thread::spawn(move || {
                    for seq in 0..100 {
                        controller.send((producer, seq));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut received = Vec::new();
        while let Some(value) = stream.try_recv() {
            received.push(value);
        }
        assert_eq!(received.len(), 300);
        for producer in 0..3 {
            let order: Vec<usize> = received
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_values_without_sink_are_dropped() {
        let controller = StreamController::new("test");
        controller.send(1);
        assert!(!controller.has_listener());

        let mut stream = controller.on_listen(None);
        controller.send(2);
        assert_eq!(stream.try_recv(), Some(2));
        assert_eq!(stream.try_recv(), None);
    }

    #[test]
    fn test_new_listener_retires_previous() {
        let controller = StreamController::new("test");
        let mut first = controller.on_listen(None);
        controller.send("a");
        let mut second = controller.on_listen(None);
        controller.send("b");

        assert_eq!(first.blocking_recv(), Some("a"));
        assert_eq!(first.blocking_recv(), None);
        assert_eq!(second.try_recv(), Some("b"));
    }

    #[test]
    fn test_dropped_consumer_clears_sink() {
        let controller = StreamController::new("test");
        let stream = controller.on_listen(None);
        drop(stream);
        assert!(!controller.has_listener());
        controller.send(1);
        assert!(controller.sink.lock().unwrap().is_none());
    }

    #[test]
    fn test_hooks_run_with_arguments() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let controller = StreamController::<u8>::new("test");
        let (start_calls, stop_calls) = (calls.clone(), calls.clone());
        assert!(controller.install_hooks(
            Box::new(move |args: Option<&serde_json::Value>| start_calls
                .lock()
                .unwrap()
                .push(("start", args.cloned()))),
            Box::new(move |args: Option<&serde_json::Value>| stop_calls
                .lock()
                .unwrap()
                .push(("stop", args.cloned()))),
        ));
        let noop = || -> StreamHook { Box::new(|_: Option<&serde_json::Value>| {}) };
        assert!(!controller.install_hooks(noop(), noop()));

        let args = json!({ "interval": 100 });
        let mut stream = controller.on_listen(Some(&args));
        controller.on_cancel(None);
        assert_eq!(stream.blocking_recv(), None);

        assert_eq!(
            *calls.lock().unwrap(),
            vec![("start", Some(args)), ("stop", None)]
        );
    }
}
