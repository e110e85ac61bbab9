use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as PollContext, Poll};

use crate::context::Context;
use crate::dispatcher;
use crate::error::Error;
use crate::future::BatchFuture;

/// An opaque label attachable to a spawned task, surfaced in diagnostic logging. There is no
/// multi-threaded work-stealing scheduler here to prioritize dispatch by label — the label exists
/// purely to make `log` output legible when many tasks are in flight.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskLabel(u64);

impl TaskLabel {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskLabel {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct TaskHandle {
    pub(crate) context: Context,
    blocked: Cell<bool>,
    label: Option<TaskLabel>,
}

impl TaskHandle {
    /// Flip blocked->true and notify the context, unless already blocked. Called whenever a
    /// future this task is polling returns `Pending` (a `BatchFuture`, a `may_block` scope) —
    /// never for a plain cooperative yield like [`dispatcher::sleep`].
    pub(crate) fn mark_blocked(&self) {
        if !self.blocked.replace(true) {
            self.context.on_task_blocked();
        }
    }

    /// Flip blocked->false and notify the context, unless already runnable. Called
    /// unconditionally by the dispatcher immediately before running a task's `Runnable`,
    /// regardless of why it was woken.
    pub(crate) fn mark_runnable(&self) {
        if self.blocked.replace(false) {
            self.context.on_task_runnable();
        }
    }

    pub(crate) fn label(&self) -> Option<TaskLabel> {
        self.label
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Rc<TaskHandle>>> = RefCell::new(None);
}

pub(crate) fn set_current(handle: Option<Rc<TaskHandle>>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = handle);
}

pub(crate) fn current_context() -> Option<Context> {
    CURRENT_TASK.with(|c| c.borrow().as_ref().map(|h| h.context.clone()))
}

/// Mark the currently polling task blocked. A no-op if nothing is currently polling (e.g. a
/// future driven directly from [`dispatcher::block_on`] outside any task).
pub(crate) fn suspend_current_task() {
    CURRENT_TASK.with(|c| {
        if let Some(handle) = c.borrow().as_ref() {
            handle.mark_blocked();
        }
    });
}

/// Spawn `body` as a child task. If a task is currently running, the child inherits its
/// [`Context`]; otherwise a fresh root context is created for it — the same fallback
/// [`crate::batch_context`] uses.
pub fn spawn<F, T>(body: F) -> BatchFuture<T>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    spawn_labeled_in(current_context().unwrap_or_else(Context::new_root), None, body)
}

/// Like [`spawn`], attaching `label` to the task for diagnostics.
pub fn spawn_labeled<F, T>(label: TaskLabel, body: F) -> BatchFuture<T>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    spawn_labeled_in(
        current_context().unwrap_or_else(Context::new_root),
        Some(label),
        body,
    )
}

/// Spawn `body` into a specific, already-constructed context. Used by [`dispatcher::run`] and
/// [`crate::batch_context`] to seed a context's root task.
pub(crate) fn spawn_in<F, T>(context: Context, body: F) -> BatchFuture<T>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    spawn_labeled_in(context, None, body)
}

fn spawn_labeled_in<F, T>(context: Context, label: Option<TaskLabel>, body: F) -> BatchFuture<T>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    context.on_task_created();
    let result = BatchFuture::pending();
    let handle = Rc::new(TaskHandle {
        context: context.clone(),
        blocked: Cell::new(true),
        label,
    });

    let result_for_body = result.clone();
    let context_for_body = context.clone();
    let wrapped = async move {
        match body.await {
            Ok(v) => {
                let _ = result_for_body.set(v);
            }
            Err(e) => {
                let _ = result_for_body.set_error(e);
            }
        }
        context_for_body.on_task_finished();
    };
    let wrapped = crate::config::apply_auto_wrappers(Box::pin(wrapped));

    let runnable = dispatcher::spawn_runnable(handle, wrapped);
    runnable.schedule();
    result
}

/// Wrap `future` so that any `Poll::Pending` bubbling out of it while this scope is active marks
/// the current task blocked, exactly as an unsettled [`BatchFuture`] would. Use this around calls
/// that suspend for a reason other than awaiting a `BatchFuture` (a blocking queue, a semaphore)
/// but that should still be able to trigger a batch fire while every other task is waiting on
/// them.
pub async fn may_block<F: Future>(future: F) -> F::Output {
    MayBlock { inner: future }.await
}

struct MayBlock<F> {
    inner: F,
}

impl<F: Future> Future for MayBlock<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        match inner.poll(cx) {
            Poll::Ready(v) => Poll::Ready(v),
            Poll::Pending => {
                suspend_current_task();
                Poll::Pending
            }
        }
    }
}
