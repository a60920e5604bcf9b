// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use super::{BaseHandler, Handler};
use crate::network::Request;
use crate::service::WorkerPoolConfig;
use crate::{AppError, AppResult, Shutdown};

/// One bounded queue, drained by exactly one worker.
#[derive(Debug)]
struct TaskQueue {
    sender: async_channel::Sender<Request>,
    receiver: async_channel::Receiver<Request>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

pub struct Router {
    apis: Mutex<HashMap<u32, Arc<dyn Handler>>>,
    default_handler: Arc<dyn Handler>,
    pool_config: WorkerPoolConfig,
    task_queues: Vec<TaskQueue>,
    started: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Queues are allocated up front; workers only run after `start_worker_pool`.
    pub fn new(pool_config: WorkerPoolConfig) -> Router {
        let task_queues = (0..pool_config.size)
            .map(|_| {
                let (sender, receiver) = async_channel::bounded(pool_config.max_task_len.max(1));
                TaskQueue { sender, receiver }
            })
            .collect();

        Router {
            apis: Mutex::new(HashMap::new()),
            default_handler: Arc::new(BaseHandler),
            pool_config,
            task_queues,
            started: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    /// Registers `handler` for `msg_id`. A second registration for the same id is a
    /// configuration error.
    pub fn add_router(&self, msg_id: u32, handler: Arc<dyn Handler>) -> AppResult<()> {
        let mut apis = self.apis.lock();
        if apis.contains_key(&msg_id) {
            return Err(AppError::DuplicateRoute(msg_id));
        }
        apis.insert(msg_id, handler);
        debug!("handler registered for msg id {}", msg_id);
        Ok(())
    }

    /// Unknown ids resolve to a no-op handler so peers speaking a newer protocol do not
    /// bring the connection down.
    pub fn get_handler(&self, msg_id: u32) -> Arc<dyn Handler> {
        self.apis
            .lock()
            .get(&msg_id)
            .cloned()
            .unwrap_or_else(|| self.default_handler.clone())
    }

    pub async fn do_handler(&self, request: Request) {
        let handler = self.get_handler(request.msg_id());

        handler.pre_handle(&request).await;
        handler.handle(&request).await;
        handler.post_handle(&request).await;
    }

    pub fn worker_pool_size(&self) -> usize {
        self.task_queues.len()
    }

    pub fn is_worker_pool_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Hands the request to a worker when the pool runs, otherwise to a fresh task.
    ///
    /// The task-per-request path has no backpressure at all; a peer can make the process
    /// spawn as many tasks as it sends frames.
    pub async fn dispatch(self: &Arc<Self>, request: Request) -> AppResult<()> {
        if self.is_worker_pool_started() {
            return self.send_msg_to_task_queue(request).await;
        }
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.do_handler(request).await;
        });
        Ok(())
    }

    /// Queues the request on worker `msg_id % pool_size`, waiting while that queue is full.
    pub async fn send_msg_to_task_queue(&self, request: Request) -> AppResult<()> {
        if self.task_queues.is_empty() {
            return Err(AppError::IllegalStateError(
                "worker pool is disabled".to_string(),
            ));
        }
        let worker_id = request.msg_id() as usize % self.task_queues.len();
        trace!(
            "add request msg_id={} to worker_id={}",
            request.msg_id(),
            worker_id
        );
        self.task_queues[worker_id]
            .sender
            .send(request)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }

    /// Spawns one worker per queue plus a monitor that restarts workers killed by a
    /// panicking handler. Calling it again is a no-op.
    pub fn start_worker_pool(self: &Arc<Self>, notify_shutdown: &broadcast::Sender<()>) {
        if self.task_queues.is_empty() {
            debug!("worker pool size is 0, requests run on their own tasks");
            return;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("worker pool already started");
            return;
        }

        let workers = (0..self.task_queues.len())
            .map(|id| self.spawn_worker(id, notify_shutdown))
            .collect();
        self.spawn_monitor(workers, notify_shutdown);
    }

    fn spawn_worker(self: &Arc<Self>, id: usize, notify_shutdown: &broadcast::Sender<()>) -> Worker {
        let router = Arc::clone(self);
        let receiver = self.task_queues[id].receiver.clone();
        let mut shutdown = Shutdown::new(notify_shutdown);

        let handle = tokio::spawn(async move {
            info!("Worker ID = {} is started", id);
            loop {
                tokio::select! {
                    request = receiver.recv() => match request {
                        Ok(request) => router.do_handler(request).await,
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("Worker {} shutting down", id);
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor(self: &Arc<Self>, mut workers: Vec<Worker>, notify_shutdown: &broadcast::Sender<()>) {
        let router = Arc::clone(self);
        let notify_shutdown = notify_shutdown.clone();
        let monitor_interval = Duration::from_millis(self.pool_config.monitor_interval_ms.max(1));

        let monitor = tokio::spawn(async move {
            let mut interval = time::interval(monitor_interval);
            let mut shutdown = Shutdown::new(&notify_shutdown);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let mut index = 0;
                        while index < workers.len() {
                            let worker = &mut workers[index];
                            if !worker.handle.is_finished() {
                                trace!("Worker {} is running", worker.id);
                                index += 1;
                                continue;
                            }
                            match (&mut worker.handle).await {
                                // clean exit: shutdown or closed queue, the handle is done
                                Ok(()) => {
                                    debug!("Worker {} exited, retired", worker.id);
                                    workers.swap_remove(index);
                                    continue;
                                }
                                Err(err) if err.is_panic() => log_worker_panic(worker.id, err),
                                Err(_) => error!("Worker {} was cancelled", worker.id),
                            }
                            warn!("Worker {} failed, restarting...", worker.id);
                            *worker = router.spawn_worker(worker.id, &notify_shutdown);
                            index += 1;
                        }
                    }
                }
            }
            debug!("Worker monitor exiting");
        });
        *self.monitor.lock() = Some(monitor);
    }
}

fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("Worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("Worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            "Worker {worker_id} panicked with an unknown type: {}",
            type_name_of(&payload)
        );
    }
}

#[inline]
fn type_name_of<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::network::{test_connection, Message};
    use crate::router::HandlerFuture;

    /// Records `(phase, payload)` for every call.
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Recorder {
        fn pre_handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.calls.lock().push(format!("pre:{}", request.msg_id()));
            })
        }

        fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                let payload = String::from_utf8_lossy(request.data()).to_string();
                self.calls.lock().push(payload);
            })
        }

        fn post_handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.calls.lock().push(format!("post:{}", request.msg_id()));
            })
        }
    }

    struct Payloads {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Payloads {
        fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                // yield so that out-of-order processing would actually show up
                tokio::task::yield_now().await;
                let payload = String::from_utf8_lossy(request.data()).to_string();
                self.seen.lock().push(payload);
            })
        }
    }

    /// Never completes.
    struct Stuck;

    impl Handler for Stuck {
        fn handle<'a>(&'a self, _request: &'a Request) -> HandlerFuture<'a> {
            Box::pin(std::future::pending::<()>())
        }
    }

    struct PanicOnce {
        calls: Arc<AtomicUsize>,
    }

    impl Handler for PanicOnce {
        fn handle<'a>(&'a self, _request: &'a Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("handler blew up");
                }
            })
        }
    }

    fn pool_config(size: usize, max_task_len: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size,
            max_task_len,
            monitor_interval_ms: 20,
        }
    }

    fn request(msg_id: u32, payload: &str) -> Request {
        Request::new(test_connection(), Message::new(msg_id, payload.to_string()))
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let router = Router::new(pool_config(0, 0));
        router.add_router(1, Arc::new(BaseHandler)).unwrap();
        let err = router.add_router(1, Arc::new(BaseHandler)).unwrap_err();
        assert!(matches!(err, AppError::DuplicateRoute(1)));
        // other ids are unaffected
        router.add_router(2, Arc::new(BaseHandler)).unwrap();
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new(pool_config(0, 0));
        router
            .add_router(3, Arc::new(Recorder { calls: calls.clone() }))
            .unwrap();

        router.do_handler(request(3, "body")).await;
        assert_eq!(*calls.lock(), vec!["pre:3", "body", "post:3"]);
    }

    #[tokio::test]
    async fn test_unknown_msg_id_is_absorbed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new(pool_config(0, 0));
        router
            .add_router(3, Arc::new(Recorder { calls: calls.clone() }))
            .unwrap();

        router.do_handler(request(404, "lost")).await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_direct_dispatch_without_pool() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new(pool_config(0, 0)));
        router
            .add_router(1, Arc::new(Payloads { seen: seen.clone() }))
            .unwrap();
        assert!(!router.is_worker_pool_started());

        router.dispatch(request(1, "a")).await.unwrap();
        wait_until(|| seen.lock().len() == 1).await;
        assert!(router.send_msg_to_task_queue(request(1, "b")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_msg_id_is_fifo_on_its_worker() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new(pool_config(3, 8)));
        router
            .add_router(4, Arc::new(Payloads { seen: seen.clone() }))
            .unwrap();
        router.start_worker_pool(&notify_shutdown);
        assert!(router.is_worker_pool_started());

        let expected: Vec<String> = (0..50).map(|i| format!("m{}", i)).collect();
        for payload in &expected {
            router.dispatch(request(4, payload)).await.unwrap();
        }

        wait_until(|| seen.lock().len() == expected.len()).await;
        assert_eq!(*seen.lock(), expected);
        notify_shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_stuck_handler_blocks_only_its_worker() {
        // a handler without timeout holds its worker forever, messages routed to the
        // same worker wait behind it while other workers keep going
        let (notify_shutdown, _) = broadcast::channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new(pool_config(2, 8)));
        router.add_router(0, Arc::new(Stuck)).unwrap();
        router
            .add_router(2, Arc::new(Payloads { seen: seen.clone() }))
            .unwrap();
        router
            .add_router(1, Arc::new(Payloads { seen: seen.clone() }))
            .unwrap();
        router.start_worker_pool(&notify_shutdown);

        router.dispatch(request(0, "stuck")).await.unwrap();
        router.dispatch(request(2, "same worker")).await.unwrap();
        router.dispatch(request(1, "other worker")).await.unwrap();

        wait_until(|| seen.lock().len() == 1).await;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec!["other worker"]);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let router = Arc::new(Router::new(pool_config(1, 1)));
        router.add_router(0, Arc::new(Stuck)).unwrap();
        router.start_worker_pool(&notify_shutdown);

        // the worker takes the first request and never returns
        router.dispatch(request(0, "1")).await.unwrap();
        wait_until(|| router.task_queues[0].receiver.is_empty()).await;
        // the second one fills the queue
        router.dispatch(request(0, "2")).await.unwrap();
        // the third has nowhere to go
        let blocked = time::timeout(Duration::from_millis(50), router.dispatch(request(0, "3"))).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_panicked_worker_is_restarted() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Arc::new(Router::new(pool_config(1, 4)));
        router
            .add_router(0, Arc::new(PanicOnce { calls: calls.clone() }))
            .unwrap();
        router.start_worker_pool(&notify_shutdown);

        router.dispatch(request(0, "boom")).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;

        router.dispatch(request(0, "fine")).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
        notify_shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_worker_exiting_cleanly_is_retired() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(Router::new(pool_config(2, 4)));
        router
            .add_router(1, Arc::new(Payloads { seen: seen.clone() }))
            .unwrap();
        router.start_worker_pool(&notify_shutdown);

        // worker 0 loses its queue and returns without a shutdown
        router.task_queues[0].receiver.close();
        // several monitor ticks pass over the finished worker
        time::sleep(Duration::from_millis(150)).await;
        let monitor = router.monitor.lock().take().unwrap();
        assert!(!monitor.is_finished());

        router.dispatch(request(1, "still served")).await.unwrap();
        wait_until(|| seen.lock().len() == 1).await;

        notify_shutdown.send(()).unwrap();
        time::timeout(Duration::from_secs(5), monitor)
            .await
            .unwrap()
            .unwrap();
    }
}
