use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;

use crate::scheduler::{AllAtOnceScheduler, Scheduler};

pub use crate::error::set_max_exc_infos;

/// A boxed, type-erased task body, as seen by an [`add_auto_wrapper`] hook: the wrapper receives
/// the whole task (already folded down to settling its own result and notifying its context) and
/// returns a future of the same shape to run in its place.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

type SchedulerFactory = Box<dyn Fn() -> Box<dyn Scheduler> + Send + Sync>;
type AutoWrapper = Box<dyn Fn(TaskFuture) -> TaskFuture + Send + Sync>;

struct RuntimeConfig {
    scheduler_factory: SchedulerFactory,
    auto_wrappers: Vec<AutoWrapper>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler_factory: Box::new(|| Box::new(AllAtOnceScheduler::new()) as Box<dyn Scheduler>),
            auto_wrappers: Vec::new(),
        }
    }
}

static CONFIG: Mutex<Option<RuntimeConfig>> = Mutex::new(None);

/// Register a task-body wrapper applied to every task spawned from this point on (not
/// retroactively to tasks already running). Wrappers compose in registration order, the first
/// registered wrapper ending up outermost. Intended for cross-cutting, process-wide task concerns
/// — tracing spans, panic capture — the same role `add_auto_wrapper` plays in the reference
/// library this crate is modeled on.
pub fn add_auto_wrapper<F>(wrapper: F)
where
    F: Fn(TaskFuture) -> TaskFuture + Send + Sync + 'static,
{
    CONFIG
        .lock()
        .get_or_insert_with(RuntimeConfig::default)
        .auto_wrappers
        .push(Box::new(wrapper));
}

/// Replace the factory used to build each new [`crate::Context`]'s [`Scheduler`]. Takes effect for
/// contexts created after this call; contexts already running keep whatever scheduler they were
/// built with.
pub fn set_default_scheduler<F, S>(factory: F)
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Scheduler + 'static,
{
    CONFIG.lock().get_or_insert_with(RuntimeConfig::default).scheduler_factory =
        Box::new(move || Box::new(factory()) as Box<dyn Scheduler>);
}

pub(crate) fn new_default_scheduler() -> Box<dyn Scheduler> {
    (CONFIG.lock().get_or_insert_with(RuntimeConfig::default).scheduler_factory)()
}

pub(crate) fn apply_auto_wrappers(mut future: TaskFuture) -> TaskFuture {
    let guard = CONFIG.lock();
    if let Some(cfg) = guard.as_ref() {
        for wrapper in &cfg.auto_wrappers {
            future = wrapper(future);
        }
    }
    future
}
