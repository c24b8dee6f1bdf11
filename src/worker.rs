use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle, ThreadId},
};

use crossbeam_channel::{Receiver as CrossbeamReceiver, Sender as CrossbeamSender};
use tokio::sync::oneshot;

use crate::error::{Result, ServiceError};

/// 在工作线程上执行的任务。
///
/// 任务可以访问只存在于工作线程上的上下文 `C`（例如外部 API 的句柄），
/// 因此上下文本身不需要是 `Send` 的。
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// 工作线程的生命周期状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// 已创建，线程尚未启动。
    Created,
    /// 正在运行，接受新任务。
    Running,
    /// 已请求停止，不再接受新任务。
    StopRequested,
    /// 正在执行停止前已入队的剩余任务。
    Draining,
    /// 线程已退出。
    Stopped,
}

struct QueueState<C> {
    /// 唯一的发送端。取走它即关闭队列，工作线程会在排空后退出。
    sender: Option<CrossbeamSender<Task<C>>>,
    state: WorkerState,
}

struct Shared<C> {
    queue: Mutex<QueueState<C>>,
}

/// 向工作线程提交任务的句柄，可以在任意线程上克隆和使用。
pub struct WorkerHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for WorkerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> fmt::Debug for WorkerHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl<C> WorkerHandle<C> {
    /// 将任务追加到队列末尾，立即返回。
    ///
    /// 任务会在所有先前入队的任务之后、所有之后入队的任务之前执行，
    /// 且任意两个任务不会并发执行。
    ///
    /// # 返回
    /// - `Err(ServiceError::QueueClosed)`: 已请求停止，或工作线程已意外退出。
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let queue = self.shared.queue.lock()?;
        let Some(sender) = queue.sender.as_ref() else {
            return Err(ServiceError::QueueClosed);
        };
        // 无界通道的发送永远不会阻塞，只有接收端已被销毁时才会失败。
        sender
            .send(Box::new(task))
            .map_err(|_| ServiceError::QueueClosed)
    }

    /// 入队一个有返回值的任务，并返回一个用于接收结果的 `oneshot` 接收端。
    pub fn submit<F, R>(&self, task: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(move |context| {
            // 调用方可能已经不再等待结果。
            let _ = reply_tx.send(task(context));
        })?;
        Ok(reply_rx)
    }

    /// 当前的生命周期状态。
    pub fn state(&self) -> WorkerState {
        self.shared
            .queue
            .lock()
            .map_or(WorkerState::Stopped, |queue| queue.state)
    }

    fn set_state(&self, state: WorkerState) {
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.state = state;
    }
}

/// 单一的后台执行上下文，串行执行所有必须在同一个线程上运行的任务。
///
/// 上下文 `C` 由 `setup` 在工作线程内部创建，并在线程退出前于同一线程上销毁，
/// 因此外部 API 要求的线程环境（如 COM 套间）可以放在 `C` 中随其建立和撤销。
pub struct WorkerThread<C> {
    handle: WorkerHandle<C>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl<C: 'static> WorkerThread<C> {
    /// 启动工作线程。
    ///
    /// `setup` 在新线程上运行一次，其参数是一个指向本队列的句柄，
    /// 便于上下文内部的回调重新入队任务。任何任务都在 `setup` 返回之后才执行，
    /// 但 `setup` 中入队的任务与调用方在此期间提交的任务之间没有先后保证。
    ///
    /// # 返回
    /// - `Err(ServiceError::ThreadSpawn)`: 如果创建线程失败。
    pub fn start<F>(name: &str, setup: F) -> Result<Self>
    where
        F: FnOnce(WorkerHandle<C>) -> C + Send + 'static,
    {
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<Task<C>>();
        let handle = WorkerHandle {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    sender: Some(task_tx),
                    state: WorkerState::Created,
                }),
            }),
        };

        let thread_handle = handle.clone();
        let thread_name = name.to_string();
        let join_handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || Self::run(&thread_name, thread_handle, task_rx, setup))
            .map_err(|source| ServiceError::ThreadSpawn {
                name: name.to_string(),
                source,
            })?;

        handle.set_state(WorkerState::Running);
        log::debug!("[Worker] 工作线程 '{name}' 已启动。");

        Ok(Self {
            thread_id: join_handle.thread().id(),
            handle,
            join_handle: Mutex::new(Some(join_handle)),
            name: name.to_string(),
        })
    }

    fn run<F>(name: &str, handle: WorkerHandle<C>, task_rx: CrossbeamReceiver<Task<C>>, setup: F)
    where
        F: FnOnce(WorkerHandle<C>) -> C,
    {
        log::trace!("[Worker] '{name}' 正在初始化线程上下文...");
        let mut context = setup(handle);

        // 发送端被取走后，recv 会先返回所有剩余任务，然后才返回 Err。
        while let Ok(task) = task_rx.recv() {
            task(&mut context);
        }

        log::trace!("[Worker] '{name}' 队列已排空，正在销毁线程上下文...");
        drop(context);
        log::debug!("[Worker] 工作线程 '{name}' 已退出。");
    }
}

impl<C> WorkerThread<C> {
    /// 返回一个可克隆的任务提交句柄。
    pub fn handle(&self) -> WorkerHandle<C> {
        self.handle.clone()
    }

    /// 见 [`WorkerHandle::enqueue`]。
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.handle.enqueue(task)
    }

    /// 见 [`WorkerHandle::submit`]。
    pub fn submit<F, R>(&self, task: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.submit(task)
    }

    /// 当前的生命周期状态。
    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// 关闭队列，等待所有已入队的任务执行完毕，然后回收线程。
    ///
    /// 可以重复调用。在工作线程自身（即某个任务内部）调用时只会关闭队列，
    /// 不会等待，否则会死锁。
    pub fn stop(&self) {
        let sender = {
            let mut queue = self
                .handle
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if queue.state == WorkerState::Running || queue.state == WorkerState::Created {
                queue.state = WorkerState::StopRequested;
            }
            queue.sender.take()
        };
        if sender.is_some() {
            log::debug!("[Worker] '{}' 收到停止请求，不再接受新任务。", self.name);
        }
        // 1. 销毁唯一的发送端，唤醒工作线程。
        drop(sender);

        if thread::current().id() == self.thread_id {
            log::warn!(
                "[Worker] 在工作线程 '{}' 内部调用了 stop()，将在当前任务结束后退出。",
                self.name
            );
            return;
        }

        // 2. 持有锁进行 join，使并发的 stop() 调用同样等待线程退出。
        let mut join_guard = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(join_handle) = join_guard.take() {
            self.handle.set_state(WorkerState::Draining);
            log::debug!("[Worker] 正在等待 '{}' 执行剩余任务并退出...", self.name);
            if let Err(e) = join_handle.join() {
                log::error!("[Worker] 工作线程 '{}' 异常退出: {e:?}", self.name);
            }
            self.handle.set_state(WorkerState::Stopped);
        }
    }
}

impl<C> Drop for WorkerThread<C> {
    fn drop(&mut self) {
        if self.state() != WorkerState::Stopped {
            log::trace!("[Worker] '{}' 在 drop 时自动停止。", self.name);
            self.stop();
        }
    }
}

impl<C> fmt::Debug for WorkerThread<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
