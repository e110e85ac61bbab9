use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as PollContext, Poll, Waker};
use std::time::{Duration, Instant};

use async_task::{Builder, Runnable};

use crate::context::Context;
use crate::error::Error;
use crate::future::BatchFuture;
use crate::task::TaskHandle;

type TaskMeta = Rc<TaskHandle>;

enum WorkItem {
    Task(Runnable<TaskMeta>),
    Callback(Box<dyn FnOnce()>),
}

struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// The single-threaded run loop. Every operation that suspends (a `BatchFuture`, a timer, a
/// `may_block` scope) eventually routes a wakeup back through this one FIFO queue, so that
/// "every task that was runnable before a context-blocked edge actually got to run" before the
/// edge's deferred scheduler fire is processed — splitting wakeups into separate
/// tasks-vs-callbacks priority queues would reorder that and fire batches too early.
#[derive(Default)]
struct Dispatcher {
    queue: RefCell<VecDeque<WorkItem>>,
    timers: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
}

thread_local! {
    static DISPATCHER: Dispatcher = Dispatcher::default();
}

pub(crate) fn push_ready(runnable: Runnable<TaskMeta>) {
    DISPATCHER.with(|d| d.queue.borrow_mut().push_back(WorkItem::Task(runnable)));
}

/// Defer `f` to run on the dispatcher, after everything already queued ahead of it. Used to
/// deliver `BatchFuture` links/wakers and context "fire" checks without ever running them inline
/// under the call that triggered them.
pub(crate) fn defer(f: impl FnOnce() + 'static) {
    DISPATCHER.with(|d| d.queue.borrow_mut().push_back(WorkItem::Callback(Box::new(f))));
}

pub(crate) fn spawn_runnable<F>(handle: TaskMeta, future: F) -> Runnable<TaskMeta>
where
    F: Future<Output = ()> + 'static,
{
    let schedule = |runnable: Runnable<TaskMeta>| push_ready(runnable);
    let (runnable, task) = Builder::new()
        .metadata(handle)
        .spawn_local(move |_meta| future, schedule);
    task.detach();
    runnable
}

fn pop_one() -> bool {
    let item = DISPATCHER.with(|d| d.queue.borrow_mut().pop_front());
    match item {
        Some(WorkItem::Callback(cb)) => {
            cb();
            true
        }
        Some(WorkItem::Task(runnable)) => {
            let handle = runnable.metadata().clone();
            handle.mark_runnable();
            crate::task::set_current(Some(handle));
            runnable.run();
            crate::task::set_current(None);
            true
        }
        None => false,
    }
}

fn next_deadline() -> Option<Instant> {
    DISPATCHER.with(|d| d.timers.borrow().peek().map(|Reverse(t)| t.deadline))
}

fn fire_expired_timers() -> bool {
    DISPATCHER.with(|d| {
        let mut fired = false;
        let now = Instant::now();
        let mut timers = d.timers.borrow_mut();
        while matches!(timers.peek(), Some(Reverse(t)) if t.deadline <= now) {
            let Reverse(entry) = timers.pop().unwrap();
            entry.waker.wake();
            fired = true;
        }
        fired
    })
}

fn register_timer(deadline: Instant, waker: Waker) {
    DISPATCHER.with(|d| d.timers.borrow_mut().push(Reverse(TimerEntry { deadline, waker })));
}

/// Run every currently queued task and callback to exhaustion, without waiting on timers.
/// Returns once the dispatcher has nothing left that is immediately runnable.
pub fn run_until_parked() {
    while pop_one() {}
}

/// Drive the dispatcher until `future` resolves, sleeping the calling thread when the only
/// outstanding work is a timer. Panics if the dispatcher ever runs dry (nothing ready, no
/// timers pending) while `future` is still pending — that indicates a deadlock, e.g. a task
/// awaiting a batch that nothing will ever fire.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    futures_lite::pin!(future);
    let waker = waker_fn::waker_fn(|| {});
    let mut cx = PollContext::from_waker(&waker);
    loop {
        if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
            return v;
        }
        if pop_one() {
            continue;
        }
        if fire_expired_timers() {
            continue;
        }
        match next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
            }
            None => panic!(
                "batchy: deadlocked — nothing left to run and the awaited future never settled"
            ),
        }
    }
}

/// Spawn `body` as the root task of a brand-new [`Context`] and drive the dispatcher until it
/// settles. This is what the `batched` wrapper falls back to when called outside any context, and
/// what [`crate::batch_context`] uses directly.
pub fn run<F, T>(body: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    let context = Context::new_root();
    let result: BatchFuture<T> = crate::task::spawn_in(context, body);
    block_on(async move { result.get(None).await })
}

/// A future that resolves once `duration` has elapsed. Unlike awaiting a [`BatchFuture`], this
/// does *not* mark the current task blocked — per the spec, a plain timer is a cooperative yield,
/// not "awaiting a batch", so it must never cause a premature scheduler fire.
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            Poll::Ready(())
        } else {
            register_timer(self.deadline, cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Suspend the current task for `duration` without marking it blocked for batching purposes.
pub async fn sleep(duration: Duration) {
    Timer::new(duration).await
}

/// Race `future` against a timer; returns `Err(Timeout)` if the timer elapses first. The
/// underlying `future`, if it eventually settles anyway, is simply dropped without effect —
/// consistent with `get(timeout=t)` leaving the future itself unaffected for other awaiters.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, Error> {
    futures_lite::pin!(future);
    let mut timer = Timer::new(duration);
    std::future::poll_fn(move |cx| {
        if let Poll::Ready(v) = future.as_mut().poll(cx) {
            return Poll::Ready(Ok(v));
        }
        if Pin::new(&mut timer).poll(cx).is_ready() {
            return Poll::Ready(Err(Error::timeout()));
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn run_drives_a_simple_task_to_completion() {
        let out = run(async { Ok::<_, Error>(42) }).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn sleep_advances_and_resolves() {
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        run(async move {
            sleep(Duration::from_millis(1)).await;
            ran2.set(true);
            Ok::<_, Error>(())
        })
        .unwrap();
        assert!(ran.get());
    }

    #[test]
    fn timeout_fires_before_a_future_that_never_settles() {
        let result: Result<(), Error> = run(async move {
            let pending = BatchFuture::<()>::pending();
            timeout(Duration::from_millis(1), async move {
                pending.get(None).await
            })
            .await?
        });
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Timeout);
    }
}
