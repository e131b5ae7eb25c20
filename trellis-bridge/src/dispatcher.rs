//! UI-affine dispatch loops.
//!
//! A [`Dispatcher`] is the seam between an [`crate::ActionQueue`] and an
//! OS-provided UI message loop. The handle for the main UI loop is passed
//! into [`crate::QueueConfiguration::create`] explicitly; the bridge never
//! reads ambient process-wide dispatcher state.

use std::{
    sync::mpsc,
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::BridgeError;

/// A unit of work posted onto a dispatch loop.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded, FIFO message loop that UI-bound queues post onto.
///
/// Implementations wrap whatever the platform calls its UI thread. `post`
/// must preserve submission order and must not block the caller.
pub trait Dispatcher: Send + Sync {
    /// Posts a job onto the loop. Jobs run one at a time, in post order.
    fn post(&self, job: Job);

    /// Whether the calling thread is the loop's thread.
    fn is_current(&self) -> bool;
}

/// An owned message-loop thread standing in for a UI-affine dispatcher.
///
/// The loop drains an unbounded FIFO channel on a dedicated named thread.
/// It serves as the main dispatcher in headless hosts and tests, and as the
/// dedicated layout loop behind [`crate::ActionQueue::layout`].
///
/// Jobs posted here must not panic; a panicking job takes the loop thread
/// down with it, the same way an unhandled exception kills a native UI loop.
/// Queues never post raw tasks, only panic-contained wrappers.
pub struct EventLoopDispatcher {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl EventLoopDispatcher {
    /// Spawns the loop thread. Fails fast if the platform refuses to
    /// provide one.
    pub fn new(name: &str) -> Result<Self, BridgeError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })?;
        let thread_id = join.thread().id();
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            join: Mutex::new(Some(join)),
            thread_id,
        })
    }

    /// Stops accepting jobs and waits for the loop thread to exit.
    ///
    /// Already-posted jobs still drain before the thread exits. Idempotent,
    /// and safe to call from the loop itself (the join is skipped there).
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            trace!(thread = ?self.thread_id, "dispatch loop shut down");
        }
        let join = if self.is_current() {
            None
        } else {
            self.join.lock().take()
        };
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl Dispatcher for EventLoopDispatcher {
    fn post(&self, job: Job) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(job);
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for EventLoopDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
