//! Executors that run consumer handlers away from the transport task.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Produces a fresh executor; invoked once per connect/recovery cycle.
pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn Executor> + Send + Sync>;

/// Runs submitted tasks, typically on a pool of worker threads.
pub trait Executor: Send + Sync {
    /// Queue `task` for execution. A task submitted after `shutdown` is
    /// dropped without running.
    fn submit(&self, task: Task);

    /// Stop accepting work. Tasks already queued may still run.
    fn shutdown(&self) {}
}

/// Creates raw worker threads, for environments that restrict thread creation.
pub trait ThreadFactory: Send + Sync {
    fn new_thread(&self, name: String, body: Task) -> io::Result<JoinHandle<()>>;
}

/// Spawns named threads with `std::thread::Builder`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(&self, name: String, body: Task) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new().name(name).spawn(body)
    }
}

/// Runs tasks on tokio's blocking thread pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }
}

static POOL_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// A fixed-size pool of worker threads fed from a shared queue.
pub struct ThreadPool {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Start `size` workers with the default thread factory.
    pub fn new(size: usize) -> io::Result<Self> {
        Self::with_thread_factory(size, &DefaultThreadFactory)
    }

    /// Start `size` workers, each created by `factory`.
    pub fn with_thread_factory(size: usize, factory: &dyn ThreadFactory) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread pool size must be at least 1",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let pool_id = POOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let rx = rx.clone();
            let body: Task = Box::new(move || {
                loop {
                    // The guard is released before the task runs.
                    let task = match rx.lock() {
                        Ok(mut rx) => rx.blocking_recv(),
                        Err(poisoned) => poisoned.into_inner().blocking_recv(),
                    };
                    match task {
                        Some(task) => task(),
                        None => break,
                    }
                }
            });
            workers.push(factory.new_thread(format!("warren-pool-{pool_id}-{n}"), body)?);
        }
        debug!(pool = pool_id, size, "thread pool started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Task>> {
        match self.tx.lock() {
            Ok(tx) => tx.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Executor for ThreadPool {
    fn submit(&self, task: Task) {
        match self.sender() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    warn!("thread pool workers are gone, task dropped");
                }
            }
            None => warn!("thread pool is shut down, task dropped"),
        }
    }

    fn shutdown(&self) {
        // Dropping the sender lets workers drain the queue and exit.
        let tx = match self.tx.lock() {
            Ok(mut tx) => tx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);
        // Workers are detached rather than joined: shutdown may run on one of them.
        if let Ok(mut workers) = self.workers.lock() {
            workers.clear();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The executor in use for one connect/recovery cycle.
#[derive(Clone)]
pub(crate) struct ActiveExecutor {
    pub(crate) executor: Arc<dyn Executor>,
    /// Created by the session, so the session shuts it down.
    pub(crate) owned: bool,
}

impl ActiveExecutor {
    pub(crate) fn release(self) {
        if self.owned {
            self.executor.shutdown();
        }
    }
}
