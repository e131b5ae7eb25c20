//! Per-application-instance queue aggregation.
//!
//! One [`QueueConfiguration`] is created per running bridge instance at
//! startup and disposed exactly once at shutdown. It owns the four role
//! queues and enforces the sharing rule: roles configured to run on the UI
//! dispatcher resolve to the *same* queue instance as the UI role, so the
//! mutual-exclusion guarantee extends across the sharing roles.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::debug;

use crate::{
    action_queue::{ActionQueue, ErrorHandler},
    dispatcher::Dispatcher,
    error::BridgeError,
};

/// The four logical roles a queue serves for one running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// The main UI dispatcher queue; all view mutations land here.
    Dispatcher,
    /// The dedicated layout queue, off the main dispatcher.
    Layout,
    /// Where native module methods run.
    NativeModules,
    /// Where the script engine runs.
    JavaScript,
}

/// Thread backing for a configurable role. Compared by value when deciding
/// whether a role shares the UI queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSpec {
    /// Share the main UI dispatcher (and its queue instance).
    Dispatcher,
    /// A fresh worker thread owned by the queue.
    #[default]
    Dedicated,
    /// The shared rayon pool, single-flight.
    Pooled,
}

/// Thread specification for the configurable roles. The Dispatcher and
/// Layout roles always get fresh queues and are not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueConfigSpec {
    pub native_modules: ThreadSpec,
    pub javascript: ThreadSpec,
}

/// The role-to-queue mapping for one bridge instance. Read-only after
/// construction; see [`QueueConfiguration::dispose`] for teardown.
pub struct QueueConfiguration {
    dispatcher: Arc<ActionQueue>,
    layout: Arc<ActionQueue>,
    native_modules: Arc<ActionQueue>,
    javascript: Arc<ActionQueue>,
    disposed: AtomicBool,
}

impl QueueConfiguration {
    /// Builds the four role queues against the supplied main UI dispatcher.
    ///
    /// All queues share the one `on_error` handler, so a task failure on any
    /// role surfaces through a single channel. Roles whose spec is
    /// [`ThreadSpec::Dispatcher`] reuse the UI queue instance itself rather
    /// than a merely equivalent one.
    pub fn create(
        spec: QueueConfigSpec,
        main_dispatcher: Arc<dyn Dispatcher>,
        on_error: ErrorHandler,
    ) -> Result<Self, BridgeError> {
        let dispatcher = Arc::new(ActionQueue::bound_to(
            main_dispatcher,
            Arc::clone(&on_error),
        ));
        let layout = Arc::new(ActionQueue::layout(Arc::clone(&on_error))?);
        let native_modules = Self::role_queue(
            "trellis-native-modules",
            spec.native_modules,
            &dispatcher,
            &on_error,
        )?;
        let javascript =
            Self::role_queue("trellis-js", spec.javascript, &dispatcher, &on_error)?;
        debug!(?spec, "queue configuration created");
        Ok(Self {
            dispatcher,
            layout,
            native_modules,
            javascript,
            disposed: AtomicBool::new(false),
        })
    }

    fn role_queue(
        name: &str,
        spec: ThreadSpec,
        ui: &Arc<ActionQueue>,
        on_error: &ErrorHandler,
    ) -> Result<Arc<ActionQueue>, BridgeError> {
        match spec {
            ThreadSpec::Dispatcher => Ok(Arc::clone(ui)),
            ThreadSpec::Dedicated => Ok(Arc::new(ActionQueue::spawn(name, Arc::clone(on_error))?)),
            ThreadSpec::Pooled => Ok(Arc::new(ActionQueue::pooled(Arc::clone(on_error)))),
        }
    }

    pub fn dispatcher_queue(&self) -> &Arc<ActionQueue> {
        &self.dispatcher
    }

    pub fn layout_queue(&self) -> &Arc<ActionQueue> {
        &self.layout
    }

    pub fn native_modules_queue(&self) -> &Arc<ActionQueue> {
        &self.native_modules
    }

    pub fn javascript_queue(&self) -> &Arc<ActionQueue> {
        &self.javascript
    }

    /// The queue serving `role`.
    pub fn queue(&self, role: QueueRole) -> &Arc<ActionQueue> {
        match role {
            QueueRole::Dispatcher => &self.dispatcher,
            QueueRole::Layout => &self.layout,
            QueueRole::NativeModules => &self.native_modules,
            QueueRole::JavaScript => &self.javascript,
        }
    }

    /// Disposes every unique underlying queue exactly once. Disposal is
    /// deduplicated by instance identity, not role: a queue shared between
    /// roles is disposed a single time. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("queue configuration disposed");
        let mut unique: Vec<&Arc<ActionQueue>> = Vec::with_capacity(4);
        for queue in [
            &self.dispatcher,
            &self.layout,
            &self.native_modules,
            &self.javascript,
        ] {
            if !unique.iter().any(|seen| Arc::ptr_eq(seen, queue)) {
                unique.push(queue);
            }
        }
        for queue in unique {
            queue.dispose();
        }
    }
}

impl Drop for QueueConfiguration {
    fn drop(&mut self) {
        self.dispose();
    }
}
