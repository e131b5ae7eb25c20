//! Drives the bridge queues against a logging view host: two batched update
//! cycles followed by an acknowledged root teardown.

use std::sync::Arc;

use serde_json::json;
use tracing::info;
use trellis_bridge::{
    Dispatcher, EventLoopDispatcher, Props, QueueConfigSpec, QueueConfiguration, ThreadSpec,
    ViewHost, ViewOperationQueue, ViewTag,
};

struct LoggingHost {
    views: Vec<ViewTag>,
}

impl ViewHost for LoggingHost {
    fn create_view(&mut self, tag: ViewTag, class_name: &str, initial_props: &Props) {
        info!(%tag, class_name, %initial_props, "create view");
        self.views.push(tag);
    }

    fn update_props(&mut self, tag: ViewTag, props: &Props) {
        info!(%tag, %props, "update props");
    }

    fn remove_root_view(&mut self, tag: ViewTag) {
        info!(%tag, "remove root view");
        self.views.retain(|&t| t != tag);
    }

    fn view_exists(&self, tag: ViewTag) -> bool {
        self.views.contains(&tag)
    }

    fn on_batch_complete(&mut self) {
        info!(view_count = self.views.len(), "batch complete");
    }
}

fn init_tracing() {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::new("info"),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() {
    init_tracing();

    let main_loop: Arc<dyn Dispatcher> =
        Arc::new(EventLoopDispatcher::new("trellis-main").expect("no UI loop available"));
    let config = QueueConfiguration::create(
        QueueConfigSpec {
            native_modules: ThreadSpec::Dedicated,
            javascript: ThreadSpec::Dedicated,
        },
        main_loop,
        Arc::new(|err| tracing::error!("bridge task failed: {err}")),
    )
    .expect("failed to create queue configuration");

    let ops = Arc::new(ViewOperationQueue::new(
        Arc::clone(config.dispatcher_queue()),
        Box::new(LoggingHost { views: Vec::new() }),
    ));

    // A script-driven update cycle: native module code records mutations
    // from the native-modules queue, then flushes them as one batch.
    let cycle = Arc::clone(&ops);
    config
        .native_modules_queue()
        .run(move || {
            cycle.enqueue_create_view(ViewTag(1), "RootView", json!({}));
            cycle.enqueue_create_view(ViewTag(2), "Label", json!({ "text": "hello" }));
            cycle.enqueue_update_props(ViewTag(2), json!({ "text": "hello trellis" }));
            cycle.dispatch_view_updates(1);
        })
        .wait()
        .expect("update cycle failed");

    let cycle = Arc::clone(&ops);
    config
        .native_modules_queue()
        .run(move || {
            cycle.enqueue_ui_block(|host| {
                if host.view_exists(ViewTag(2)) {
                    host.update_props(ViewTag(2), &json!({ "opacity": 0.5 }));
                }
            });
            cycle.dispatch_view_updates(2);
        })
        .wait()
        .expect("update cycle failed");

    let teardown = ops.remove_root_view_acked(ViewTag(1));
    ops.dispatch_view_updates(3);
    if teardown.wait() {
        info!("root view torn down");
    }

    config.dispose();
}
