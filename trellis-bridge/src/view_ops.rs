//! Batched view operation application.
//!
//! [`ViewOperationQueue`] buffers the view mutations requested by native
//! module code (create view, update props, remove root view, arbitrary UI
//! blocks) instead of executing them immediately. When a script-driven
//! update cycle completes, [`ViewOperationQueue::dispatch_view_updates`]
//! flushes everything accumulated since the previous flush as one ordered
//! task on the UI queue, so intermediate states are never visible on screen.
//!
//! The live view tree sits behind the [`ViewHost`] seam and is mutated only
//! from the UI queue. The one documented bypass is
//! [`ViewOperationQueue::synchronously_update_view`], which asserts the
//! caller is already on that queue.

use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug_span, trace};

use crate::action_queue::{ActionQueue, TaskError};

/// Identifier the script side assigns to each view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewTag(pub u32);

impl std::fmt::Display for ViewTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// View property payload, as produced by the script side.
pub type Props = Value;

/// The native view tree, as seen by the operation queue.
///
/// Implementations are exercised only from the UI queue, inside a flushed
/// batch (or the synchronous bypass). An operation targeting a tag that was
/// never created is a defect of the calling layer; implementations may panic,
/// which surfaces through the UI queue's error handler without halting later
/// batches.
pub trait ViewHost: Send {
    fn create_view(&mut self, tag: ViewTag, class_name: &str, initial_props: &Props);
    fn update_props(&mut self, tag: ViewTag, props: &Props);
    fn remove_root_view(&mut self, tag: ViewTag);
    fn view_exists(&self, tag: ViewTag) -> bool;

    /// Called after every flushed batch, including empty ones.
    fn on_batch_complete(&mut self) {}
}

/// An arbitrary host mutation enqueued as part of a batch.
pub type UiBlock = Box<dyn FnOnce(&mut dyn ViewHost) + Send + 'static>;

enum ViewOperation {
    CreateView {
        tag: ViewTag,
        class_name: String,
        initial_props: Props,
    },
    UpdateProps {
        tag: ViewTag,
        props: Props,
    },
    RemoveRootView {
        tag: ViewTag,
        ack: Option<mpsc::Sender<()>>,
    },
    UiBlock(UiBlock),
}

impl ViewOperation {
    fn apply(self, host: &mut dyn ViewHost) {
        match self {
            Self::CreateView {
                tag,
                class_name,
                initial_props,
            } => host.create_view(tag, &class_name, &initial_props),
            Self::UpdateProps { tag, props } => host.update_props(tag, &props),
            Self::RemoveRootView { tag, ack } => {
                host.remove_root_view(tag);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Self::UiBlock(block) => block(host),
        }
    }
}

/// Resolves once the operation it acknowledges has been processed on the UI
/// queue. Returned by [`ViewOperationQueue::remove_root_view_acked`].
pub struct Completion {
    receiver: mpsc::Receiver<()>,
}

impl Completion {
    /// Blocks until the operation has run. Returns `false` if the operation
    /// was dropped instead (UI queue disposed before its batch ran).
    pub fn wait(self) -> bool {
        self.receiver.recv().is_ok()
    }

    /// Like [`wait`](Self::wait) with a timeout; `false` also on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> bool {
        self.receiver.recv_timeout(timeout).is_ok()
    }
}

/// The batching buffer between native-module code and the UI queue.
pub struct ViewOperationQueue {
    ui_queue: Arc<ActionQueue>,
    host: Arc<Mutex<Box<dyn ViewHost>>>,
    pending: Mutex<Vec<ViewOperation>>,
}

impl ViewOperationQueue {
    pub fn new(ui_queue: Arc<ActionQueue>, host: Box<dyn ViewHost>) -> Self {
        Self {
            ui_queue,
            host: Arc::new(Mutex::new(host)),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Whether no operations are waiting for the next flush.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Records a create-view operation; the native control is not created
    /// until the batch flushes.
    pub fn enqueue_create_view(
        &self,
        tag: ViewTag,
        class_name: impl Into<String>,
        initial_props: Props,
    ) {
        self.pending.lock().push(ViewOperation::CreateView {
            tag,
            class_name: class_name.into(),
            initial_props,
        });
    }

    /// Records a prop update for an existing view.
    pub fn enqueue_update_props(&self, tag: ViewTag, props: Props) {
        self.pending
            .lock()
            .push(ViewOperation::UpdateProps { tag, props });
    }

    /// Records a root view teardown.
    pub fn enqueue_remove_root_view(&self, tag: ViewTag) {
        self.pending
            .lock()
            .push(ViewOperation::RemoveRootView { tag, ack: None });
    }

    /// Records a root view teardown and returns a handle that resolves once
    /// the teardown has been processed in its batch on the UI queue.
    pub fn remove_root_view_acked(&self, tag: ViewTag) -> Completion {
        let (sender, receiver) = mpsc::channel();
        self.pending.lock().push(ViewOperation::RemoveRootView {
            tag,
            ack: Some(sender),
        });
        Completion { receiver }
    }

    /// Appends an arbitrary host mutation to the current batch.
    pub fn enqueue_ui_block(&self, block: impl FnOnce(&mut dyn ViewHost) + Send + 'static) {
        self.pending
            .lock()
            .push(ViewOperation::UiBlock(Box::new(block)));
    }

    /// Inserts an arbitrary host mutation at the front of the current batch.
    pub fn prepend_ui_block(&self, block: impl FnOnce(&mut dyn ViewHost) + Send + 'static) {
        self.pending
            .lock()
            .insert(0, ViewOperation::UiBlock(Box::new(block)));
    }

    /// Batching bypass for latency-sensitive callers such as animation
    /// drivers. Applies the update immediately iff the view already exists
    /// and returns whether it was found; a pending batched create for the
    /// same tag is invisible here, which is the race such callers accept.
    ///
    /// # Panics
    ///
    /// Asserts that the caller is on the UI queue; calling this anywhere
    /// else is a bug in the calling native module.
    pub fn synchronously_update_view(&self, tag: ViewTag, props: &Props) -> bool {
        assert!(
            self.ui_queue.is_on_queue(),
            "synchronously_update_view called off the dispatcher queue"
        );
        let mut host = self.host.lock();
        if !host.view_exists(tag) {
            trace!(%tag, "synchronous update skipped, view not found");
            return false;
        }
        host.update_props(tag, props);
        true
    }

    /// Closes the current batch and posts it onto the UI queue as one
    /// ordered task. Operations execute in exact submission order, then
    /// [`ViewHost::on_batch_complete`] fires; no operation of a later batch
    /// runs before this one finishes. A panicking operation is reported
    /// through the UI queue's error handler and the batch continues with the
    /// remaining operations.
    pub fn dispatch_view_updates(&self, batch_id: u64) {
        let operations = std::mem::take(&mut *self.pending.lock());
        let host = Arc::clone(&self.host);
        let on_error = self.ui_queue.error_handler();
        self.ui_queue.dispatch(move || {
            let _span = debug_span!("dispatch_ui", batch_id).entered();
            let mut host = host.lock();
            for operation in operations {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    operation.apply(host.as_mut());
                }));
                if let Err(payload) = outcome {
                    on_error(TaskError::from_panic(payload));
                }
            }
            host.on_batch_complete();
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::action_queue::ErrorHandler;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Created(ViewTag, String),
        Updated(ViewTag, Props),
        RemovedRoot(ViewTag),
        Block(&'static str),
        BatchComplete,
    }

    struct RecordingHost {
        events: Arc<Mutex<Vec<Event>>>,
        views: Vec<ViewTag>,
    }

    impl RecordingHost {
        fn new() -> (Box<dyn ViewHost>, Arc<Mutex<Vec<Event>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            let host = Box::new(Self {
                events: Arc::clone(&events),
                views: Vec::new(),
            });
            (host, events)
        }
    }

    impl ViewHost for RecordingHost {
        fn create_view(&mut self, tag: ViewTag, class_name: &str, _initial_props: &Props) {
            self.views.push(tag);
            self.events
                .lock()
                .push(Event::Created(tag, class_name.to_string()));
        }

        fn update_props(&mut self, tag: ViewTag, props: &Props) {
            assert!(self.view_exists(tag), "update for unknown view {tag}");
            self.events.lock().push(Event::Updated(tag, props.clone()));
        }

        fn remove_root_view(&mut self, tag: ViewTag) {
            self.views.retain(|&t| t != tag);
            self.events.lock().push(Event::RemovedRoot(tag));
        }

        fn view_exists(&self, tag: ViewTag) -> bool {
            self.views.contains(&tag)
        }

        fn on_batch_complete(&mut self) {
            self.events.lock().push(Event::BatchComplete);
        }
    }

    fn noop_handler() -> ErrorHandler {
        Arc::new(|_| {})
    }

    fn ui_queue(on_error: ErrorHandler) -> Arc<ActionQueue> {
        Arc::new(ActionQueue::spawn("test-ui", on_error).unwrap())
    }

    fn sync(queue: &Arc<ActionQueue>) {
        queue
            .run(|| {})
            .wait_timeout(Duration::from_secs(5))
            .expect("ui queue stalled")
            .unwrap();
    }

    #[test]
    fn operations_flush_in_submission_order() {
        let queue = ui_queue(noop_handler());
        let (host, events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        ops.enqueue_create_view(ViewTag(1), "Label", json!({"text": "hi"}));
        ops.enqueue_update_props(ViewTag(1), json!({"x": 10}));
        ops.enqueue_ui_block(|host| {
            assert!(host.view_exists(ViewTag(1)));
        });
        assert!(!ops.is_empty());
        ops.dispatch_view_updates(1);
        assert!(ops.is_empty());
        sync(&queue);

        let events = events.lock();
        assert_eq!(events[0], Event::Created(ViewTag(1), "Label".to_string()));
        assert_eq!(events[1], Event::Updated(ViewTag(1), json!({"x": 10})));
        assert_eq!(*events.last().unwrap(), Event::BatchComplete);
    }

    #[test]
    fn prepended_blocks_run_first() {
        let queue = ui_queue(noop_handler());
        let (host, events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        ops.enqueue_create_view(ViewTag(1), "View", json!({}));
        ops.prepend_ui_block(|host| {
            host.create_view(ViewTag(99), "Overlay", &json!({}));
        });
        ops.dispatch_view_updates(1);
        sync(&queue);

        let events = events.lock();
        assert_eq!(
            events[0],
            Event::Created(ViewTag(99), "Overlay".to_string())
        );
        assert_eq!(events[1], Event::Created(ViewTag(1), "View".to_string()));
    }

    #[test]
    fn a_batch_completes_before_the_next_one_starts() {
        let queue = ui_queue(noop_handler());
        let (host, events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ops.enqueue_ui_block(move |host| {
            gate_rx.recv().unwrap();
            host.create_view(ViewTag(1), "First", &json!({}));
        });
        ops.dispatch_view_updates(1);

        ops.enqueue_create_view(ViewTag(2), "Second", json!({}));
        ops.dispatch_view_updates(2);

        // Batch 2 is queued behind batch 1 and cannot run until the gate
        // opens.
        std::thread::sleep(Duration::from_millis(100));
        assert!(events.lock().is_empty());
        gate_tx.send(()).unwrap();
        sync(&queue);

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                Event::Created(ViewTag(1), "First".to_string()),
                Event::BatchComplete,
                Event::Created(ViewTag(2), "Second".to_string()),
                Event::BatchComplete,
            ]
        );
    }

    #[test]
    fn empty_flush_still_completes_a_batch() {
        let queue = ui_queue(noop_handler());
        let (host, events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        ops.dispatch_view_updates(1);
        sync(&queue);
        assert_eq!(*events.lock(), vec![Event::BatchComplete]);
    }

    #[test]
    fn acked_remove_resolves_after_processing() {
        let queue = ui_queue(noop_handler());
        let (host, events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        ops.enqueue_create_view(ViewTag(1), "Root", json!({}));
        ops.dispatch_view_updates(1);

        let completion = ops.remove_root_view_acked(ViewTag(1));
        ops.dispatch_view_updates(2);

        assert!(completion.wait_timeout(Duration::from_secs(5)));
        assert!(events.lock().contains(&Event::RemovedRoot(ViewTag(1))));
    }

    #[test]
    fn acked_remove_reports_dropped_when_queue_disposed_first() {
        let queue = ui_queue(noop_handler());
        let (host, _events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        let completion = ops.remove_root_view_acked(ViewTag(1));
        queue.dispose();
        ops.dispatch_view_updates(1);
        assert!(!completion.wait_timeout(Duration::from_millis(200)));
    }

    #[test]
    fn synchronous_update_applies_only_to_existing_views() {
        let queue = ui_queue(noop_handler());
        let (host, events) = RecordingHost::new();
        let ops = Arc::new(ViewOperationQueue::new(Arc::clone(&queue), host));

        ops.enqueue_create_view(ViewTag(1), "View", json!({}));
        ops.dispatch_view_updates(1);
        sync(&queue);

        let on_queue_ops = Arc::clone(&ops);
        let (found, missing) = queue
            .run(move || {
                let found =
                    on_queue_ops.synchronously_update_view(ViewTag(1), &json!({"opacity": 0.5}));
                let missing =
                    on_queue_ops.synchronously_update_view(ViewTag(2), &json!({"opacity": 0.5}));
                (found, missing)
            })
            .wait_timeout(Duration::from_secs(5))
            .expect("ui queue stalled")
            .unwrap();

        assert!(found);
        assert!(!missing);
        assert!(
            events
                .lock()
                .contains(&Event::Updated(ViewTag(1), json!({"opacity": 0.5})))
        );
    }

    #[test]
    #[should_panic(expected = "off the dispatcher queue")]
    fn synchronous_update_off_queue_is_a_programmer_error() {
        let queue = ui_queue(noop_handler());
        let (host, _events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(queue, host);
        ops.synchronously_update_view(ViewTag(1), &json!({}));
    }

    #[test]
    fn a_panicking_operation_reports_and_the_batch_continues() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let handler: ErrorHandler = {
            let errors = Arc::clone(&errors);
            Arc::new(move |err: TaskError| errors.lock().push(err.message().to_string()))
        };
        let queue = ui_queue(handler);
        let (host, events) = RecordingHost::new();
        let ops = ViewOperationQueue::new(Arc::clone(&queue), host);

        ops.enqueue_create_view(ViewTag(1), "View", json!({}));
        ops.enqueue_ui_block(|_host| panic!("bad block"));
        ops.enqueue_update_props(ViewTag(1), json!({"y": 1}));
        ops.dispatch_view_updates(1);
        sync(&queue);

        assert_eq!(*errors.lock(), vec!["bad block".to_string()]);
        let events = events.lock();
        assert!(events.contains(&Event::Updated(ViewTag(1), json!({"y": 1}))));
        assert_eq!(*events.last().unwrap(), Event::BatchComplete);
    }
}
