use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

use crate::config;
use crate::dispatcher;
use crate::error::Error;
use crate::future::BatchFuture;
use crate::scheduler::Scheduler;
use crate::task;

struct ContextInner {
    live: Cell<usize>,
    blocked: Cell<usize>,
    armed: Cell<bool>,
    scheduler: Box<dyn Scheduler>,
}

/// The unit of cooperative scheduling: a set of tasks sharing one [`Scheduler`], all live on the
/// same OS thread. A context has no cross-thread coordination of its own — running many of them
/// concurrently just means running many single-threaded event loops, one per thread, each with
/// its own `Context`.
///
/// The runtime fires a context's scheduler exactly when every one of its live tasks is blocked —
/// awaiting a [`crate::Batched`] call, a [`crate::wait`]/[`crate::pget`], or a
/// [`task::may_block`] scope. A plain cooperative yield ([`dispatcher::sleep`]) does not count,
/// since a sleeping task isn't actually waiting on the scheduler to do anything.
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

impl Context {
    pub(crate) fn new_root() -> Self {
        Self(Rc::new(ContextInner {
            live: Cell::new(0),
            blocked: Cell::new(0),
            armed: Cell::new(false),
            scheduler: config::new_default_scheduler(),
        }))
    }

    pub(crate) fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.0.scheduler.as_ref()
    }

    pub(crate) fn on_task_created(&self) {
        self.0.live.set(self.0.live.get() + 1);
        self.0.blocked.set(self.0.blocked.get() + 1);
        self.arm_if_fully_blocked();
    }

    pub(crate) fn on_task_blocked(&self) {
        self.0.blocked.set(self.0.blocked.get() + 1);
        debug_assert!(self.0.blocked.get() <= self.0.live.get());
        self.arm_if_fully_blocked();
    }

    pub(crate) fn on_task_runnable(&self) {
        self.0.blocked.set(self.0.blocked.get() - 1);
    }

    pub(crate) fn on_task_finished(&self) {
        self.0.live.set(self.0.live.get() - 1);
        self.arm();
    }

    fn arm_if_fully_blocked(&self) {
        if self.0.live.get() > 0 && self.0.blocked.get() == self.0.live.get() {
            self.arm();
        }
    }

    /// Idempotently schedule a `fire` check on the dispatcher. Multiple calls before the deferred
    /// check actually runs collapse into a single check of the then-current counts, so redundant
    /// arming from several tasks blocking in quick succession is harmless.
    fn arm(&self) {
        if self.0.armed.replace(true) {
            return;
        }
        let this = self.clone();
        dispatcher::defer(move || this.fire());
    }

    fn fire(&self) {
        self.0.armed.set(false);
        if self.0.live.get() == 0 {
            log::debug!("batchy: context {:#x} torn down", self.id());
            return;
        }
        if self.0.blocked.get() == self.0.live.get() && self.0.scheduler.has_work() {
            log::debug!("batchy: context {:#x} firing scheduler", self.id());
            self.0.scheduler.run_next();
        }
    }
}

/// Run `body` to completion as the root task of a fresh [`Context`], blocking the calling thread
/// until it settles. This is the entry point for "outside any existing context" callers — a
/// request handler's top level, a test — the same role `gb.run`/`Context()` play in the reference
/// library.
pub fn batch_context<F, T>(body: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    let context = Context::new_root();
    let result: BatchFuture<T> = task::spawn_in(context, body);
    dispatcher::block_on(async move { result.get(None).await })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_blocked_context_fires_exactly_once_per_batch() {
        use crate::batched::Batched;
        use crate::combinators::pmap;
        use std::cell::RefCell;

        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        let adder: Rc<Batched<i32, i32>> = Batched::new(move |args: Vec<i32>| {
            *calls2.borrow_mut() += 1;
            async move { Ok(args.into_iter().map(|x| Ok(x + 1)).collect()) }
        });

        let out = batch_context(async move {
            let adder = adder.clone();
            pmap(0..5, move |x| {
                let adder = adder.clone();
                async move { adder.call(x).await }
            })
            .await
        })
        .unwrap();

        assert_eq!(out, vec![1, 2, 3, 4, 5]);
        assert_eq!(*calls.borrow(), 1);
    }
}
