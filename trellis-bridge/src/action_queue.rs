//! Single-flight task queues.
//!
//! An [`ActionQueue`] is one logical thread of execution: tasks dispatched to
//! it run one at a time, in submission order, and a panicking task is caught
//! at the queue boundary and reported to the queue's error handler instead of
//! taking the host down. Native-module and view-manager code relies on these
//! guarantees to touch non-thread-safe state without locks.
//!
//! Four backings are available:
//!
//! - [`ActionQueue::spawn`] — a dedicated worker thread owned by the queue.
//! - [`ActionQueue::bound_to`] — an externally supplied UI [`Dispatcher`];
//!   dispatch posts onto that loop rather than spawning new concurrency.
//! - [`ActionQueue::layout`] — a queue owning its own UI-capable loop, kept
//!   off the main dispatcher so layout work never competes with input.
//! - [`ActionQueue::pooled`] — the shared rayon pool, still limited to one
//!   in-flight task at a time.

use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

use crate::{
    dispatcher::{Dispatcher, EventLoopDispatcher},
    error::BridgeError,
};

/// A unit of work submitted to a queue. FIFO by submission order, no other
/// identity.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handler invoked exactly once per failing task. Shared by all queues of a
/// [`crate::QueueConfiguration`] so failures surface through one channel.
pub type ErrorHandler = Arc<dyn Fn(TaskError) + Send + Sync>;

/// The error delivered to an [`ErrorHandler`] when a dispatched task panics.
#[derive(Debug, Clone, Error)]
#[error("queue task panicked: {message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self { message }
    }

    /// The panic message, as well as it could be recovered from the payload.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a [`TaskHandle`] resolved without a value.
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    /// The task panicked. The panic is delivered here, to the waiter, not to
    /// the queue's [`ErrorHandler`].
    #[error(transparent)]
    Panicked(TaskError),
    /// The queue was disposed before the task ran.
    #[error("task dropped before running")]
    Dropped,
}

/// Completion handle returned by [`ActionQueue::run`].
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task completes.
    pub fn wait(self) -> Result<T, JoinError> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(JoinError::Panicked(err)),
            Err(_) => Err(JoinError::Dropped),
        }
    }

    /// Blocks until the task completes or the timeout elapses. Returns
    /// `None` on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, JoinError>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(value)) => Some(Ok(value)),
            Ok(Err(err)) => Some(Err(JoinError::Panicked(err))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(JoinError::Dropped)),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
        }
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Ids of the queues whose tasks are on the current thread's call stack.
    // Pool-backed queues have no stable OS thread, so this marker is the
    // only way to answer `is_on_queue` for them.
    static ACTIVE_QUEUES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct Shared {
    id: u64,
    on_error: ErrorHandler,
    disposed: AtomicBool,
    exec: Mutex<bool>,
    idle: Condvar,
}

impl Shared {
    fn new(on_error: ErrorHandler) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            on_error,
            disposed: AtomicBool::new(false),
            exec: Mutex::new(false),
            idle: Condvar::new(),
        })
    }

    /// Runs one task with panic containment. Tasks reaching this after
    /// disposal are dropped; the flag is re-checked under the exec lock so a
    /// concurrent `dispose` either sees the task running and waits for it,
    /// or wins and the task never starts.
    fn run_task(&self, task: Task) {
        {
            let mut running = self.exec.lock();
            if self.disposed.load(Ordering::Acquire) {
                return;
            }
            *running = true;
        }
        ACTIVE_QUEUES.with(|stack| stack.borrow_mut().push(self.id));
        let outcome = panic::catch_unwind(AssertUnwindSafe(task));
        ACTIVE_QUEUES.with(|stack| {
            stack.borrow_mut().pop();
        });
        *self.exec.lock() = false;
        self.idle.notify_all();
        if let Err(payload) = outcome {
            (self.on_error)(TaskError::from_panic(payload));
        }
    }

    fn is_in_task(&self) -> bool {
        ACTIVE_QUEUES.with(|stack| stack.borrow().contains(&self.id))
    }

    fn wait_until_idle(&self) {
        let mut running = self.exec.lock();
        while *running {
            self.idle.wait(&mut running);
        }
    }
}

struct WorkerBackend {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

struct PoolQueue {
    shared: Arc<Shared>,
    state: Mutex<PoolState>,
}

struct PoolState {
    pending: VecDeque<Task>,
    pumping: bool,
}

impl PoolQueue {
    fn enqueue(self: &Arc<Self>, task: Task) {
        let mut state = self.state.lock();
        state.pending.push_back(task);
        if !state.pumping {
            state.pumping = true;
            let queue = Arc::clone(self);
            rayon::spawn(move || queue.pump());
        }
    }

    // Drains pending tasks one at a time on a pool thread. Only one pump is
    // ever in flight, which is what keeps the queue single-flight.
    fn pump(self: Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(task) => task,
                    None => {
                        state.pumping = false;
                        return;
                    }
                }
            };
            self.shared.run_task(task);
        }
    }
}

enum Backend {
    Worker(WorkerBackend),
    Dispatcher {
        handle: Arc<dyn Dispatcher>,
        owned: Option<Arc<EventLoopDispatcher>>,
    },
    Pool(Arc<PoolQueue>),
}

/// A single logical thread of execution. See the module docs for the
/// contract; see [`ActionQueue::dispose`] for the disposal contract.
pub struct ActionQueue {
    shared: Arc<Shared>,
    backend: Backend,
}

impl ActionQueue {
    /// Creates a queue backed by a dedicated worker thread with the given
    /// name. The thread is owned by the queue and released on dispose.
    pub fn spawn(name: &str, on_error: ErrorHandler) -> Result<Self, BridgeError> {
        let shared = Shared::new(on_error);
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver {
                    worker_shared.run_task(task);
                }
            })?;
        let thread_id = join.thread().id();
        trace!(queue = shared.id, name, "spawned worker queue");
        Ok(Self {
            shared,
            backend: Backend::Worker(WorkerBackend {
                sender: Mutex::new(Some(sender)),
                join: Mutex::new(Some(join)),
                thread_id,
            }),
        })
    }

    /// Creates a queue bound to an existing UI dispatch loop. Dispatch posts
    /// onto that loop, preserving FIFO order; the loop itself already
    /// serializes execution. The loop is not owned and keeps running after
    /// the queue is disposed.
    pub fn bound_to(dispatcher: Arc<dyn Dispatcher>, on_error: ErrorHandler) -> Self {
        Self {
            shared: Shared::new(on_error),
            backend: Backend::Dispatcher {
                handle: dispatcher,
                owned: None,
            },
        }
    }

    /// Creates a queue owning a dedicated UI-capable loop for layout work,
    /// isolated from the main dispatcher so expensive layout never blocks
    /// input handling. The loop is shut down on dispose.
    pub fn layout(on_error: ErrorHandler) -> Result<Self, BridgeError> {
        let event_loop = Arc::new(EventLoopDispatcher::new("trellis-layout")?);
        Ok(Self {
            shared: Shared::new(on_error),
            backend: Backend::Dispatcher {
                handle: Arc::clone(&event_loop) as Arc<dyn Dispatcher>,
                owned: Some(event_loop),
            },
        })
    }

    /// Creates a queue that borrows threads from the shared rayon pool while
    /// still running at most one task at a time.
    pub fn pooled(on_error: ErrorHandler) -> Self {
        let shared = Shared::new(on_error);
        let pool = Arc::new(PoolQueue {
            shared: Arc::clone(&shared),
            state: Mutex::new(PoolState {
                pending: VecDeque::new(),
                pumping: false,
            }),
        });
        Self {
            shared,
            backend: Backend::Pool(pool),
        }
    }

    /// Enqueues a task and returns immediately. Tasks dispatched from the
    /// same caller run in dispatch order; no task ever runs concurrently
    /// with another task of this queue. After [`dispose`](Self::dispose)
    /// this is a silent no-op.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        self.dispatch_boxed(Box::new(task));
    }

    fn dispatch_boxed(&self, task: Task) {
        if self.shared.disposed.load(Ordering::Acquire) {
            trace!(queue = self.shared.id, "dispatch after dispose dropped");
            return;
        }
        match &self.backend {
            Backend::Worker(worker) => {
                if let Some(sender) = worker.sender.lock().as_ref() {
                    let _ = sender.send(task);
                }
            }
            Backend::Dispatcher { handle, .. } => {
                let shared = Arc::clone(&self.shared);
                handle.post(Box::new(move || shared.run_task(task)));
            }
            Backend::Pool(pool) => pool.enqueue(task),
        }
    }

    /// Dispatches `f` and returns a handle to its result. A panic inside `f`
    /// resolves the handle with [`JoinError::Panicked`] instead of going to
    /// the queue's error handler; the waiter asked for the outcome, so the
    /// waiter gets the failure.
    pub fn run<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        self.dispatch(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::from_panic);
            let _ = sender.send(outcome);
        });
        TaskHandle { receiver }
    }

    /// Whether the caller is on this queue's execution context.
    ///
    /// Worker-backed queues compare thread identity; dispatcher-backed
    /// queues answer true anywhere on the loop's thread (which is what the
    /// synchronous view-update escape hatch relies on); pool-backed queues
    /// answer true only from within one of their own tasks, since the OS
    /// thread underneath them is not stable.
    pub fn is_on_queue(&self) -> bool {
        match &self.backend {
            Backend::Worker(worker) => thread::current().id() == worker.thread_id,
            Backend::Dispatcher { handle, .. } => handle.is_current(),
            Backend::Pool(_) => self.shared.is_in_task(),
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn error_handler(&self) -> ErrorHandler {
        Arc::clone(&self.shared.on_error)
    }

    /// Stops the queue. Idempotent.
    ///
    /// Contract: dispose waits for the currently executing task to finish
    /// before returning, unless it is called from within a task on this same
    /// queue, in which case it marks the queue disposed and returns so the
    /// task can unwind normally. Pending not-yet-started tasks are dropped.
    /// Owned threads and loops are released. Dispatching afterwards is a
    /// silent no-op, never an error; teardown may race harmlessly with late
    /// native-module dispatches.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(queue = self.shared.id, "queue disposed");
        match &self.backend {
            Backend::Worker(worker) => {
                // Dropping the sender ends the worker loop once the (now
                // dropped) backlog has drained.
                worker.sender.lock().take();
                let join = if thread::current().id() == worker.thread_id {
                    None
                } else {
                    worker.join.lock().take()
                };
                if let Some(join) = join {
                    let _ = join.join();
                }
            }
            Backend::Dispatcher { handle, owned } => {
                if !handle.is_current() {
                    self.shared.wait_until_idle();
                }
                if let Some(event_loop) = owned {
                    event_loop.shutdown();
                }
            }
            Backend::Pool(pool) => {
                pool.state.lock().pending.clear();
                if !self.shared.is_in_task() {
                    self.shared.wait_until_idle();
                }
            }
        }
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}
