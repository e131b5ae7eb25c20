//! trellis-bridge is the cross-thread execution engine of the trellis UI
//! bridge: the queues that let script-driven component updates and native
//! module calls cooperate with the platform UI thread without data races.
//!
//! # Queues
//!
//! Everything runs on an [`ActionQueue`]: one logical thread of execution
//! with strict FIFO order, at most one task in flight, and panic containment
//! at the queue boundary. A [`QueueConfiguration`] owns the four queues of a
//! running bridge instance — UI dispatcher, layout, native modules, script —
//! and deduplicates roles configured to share the UI thread down to a single
//! queue instance, so the mutual-exclusion guarantee holds across them.
//!
//! ```
//! use std::sync::Arc;
//!
//! use trellis_bridge::{
//!     Dispatcher, EventLoopDispatcher, QueueConfigSpec, QueueConfiguration,
//! };
//!
//! let main_loop: Arc<dyn Dispatcher> = Arc::new(EventLoopDispatcher::new("ui").unwrap());
//! let config = QueueConfiguration::create(
//!     QueueConfigSpec::default(),
//!     main_loop,
//!     Arc::new(|err| eprintln!("bridge task failed: {err}")),
//! )
//! .unwrap();
//!
//! config.native_modules_queue().dispatch(|| {
//!     // runs on the native-modules queue, one task at a time
//! });
//! config.dispose();
//! ```
//!
//! # View operations
//!
//! Native module code never touches the view tree directly. It records
//! mutations on a [`ViewOperationQueue`], and a completed update cycle
//! flushes them as one ordered batch onto the UI queue; partial states are
//! never rendered. See the [`view_ops`] module docs.

pub mod action_queue;
pub mod dispatcher;
mod error;
pub mod queue_config;
pub mod view_ops;

pub use action_queue::{ActionQueue, ErrorHandler, JoinError, Task, TaskError, TaskHandle};
pub use dispatcher::{Dispatcher, EventLoopDispatcher, Job};
pub use error::BridgeError;
pub use queue_config::{QueueConfigSpec, QueueConfiguration, QueueRole, ThreadSpec};
pub use view_ops::{Completion, Props, UiBlock, ViewHost, ViewOperationQueue, ViewTag};
