use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as PollContext, Poll};

use crate::error::Error;
use crate::future::BatchFuture;
use crate::task;

/// Run `f` over every item concurrently and collect the results in input order. Tasks are spawned
/// up front so calls to the same [`crate::Batched`] operation from different items have a chance
/// to coalesce; the first error encountered (in input order) short-circuits the rest.
pub async fn pmap<I, F, Fut, Out>(iter: I, f: F) -> Result<Vec<Out>, Error>
where
    I: IntoIterator,
    I::Item: 'static,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<Out, Error>> + 'static,
    Out: Clone + 'static,
{
    let handles: Vec<BatchFuture<Out>> = iter.into_iter().map(|item| task::spawn(f(item))).collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.get(None).await?);
    }
    Ok(results)
}

struct Unordered<Out: Clone + 'static> {
    pending: Vec<BatchFuture<Out>>,
    completed: Vec<Out>,
}

impl<Out: Clone + 'static> Future for Unordered<Out> {
    type Output = Result<Vec<Out>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut i = 0;
        while i < this.pending.len() {
            match Pin::new(&mut this.pending[i]).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    this.completed.push(value);
                    this.pending.remove(i);
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => i += 1,
            }
        }
        if this.pending.is_empty() {
            Poll::Ready(Ok(std::mem::take(&mut this.completed)))
        } else {
            Poll::Pending
        }
    }
}

/// Like [`pmap`], but results are collected in completion order rather than input order.
pub async fn pmap_unordered<I, F, Fut, Out>(iter: I, f: F) -> Result<Vec<Out>, Error>
where
    I: IntoIterator,
    I::Item: 'static,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<Out, Error>> + 'static,
    Out: Clone + 'static,
{
    let pending: Vec<BatchFuture<Out>> = iter.into_iter().map(|item| task::spawn(f(item))).collect();
    Unordered {
        pending,
        completed: Vec::new(),
    }
    .await
}

/// Await every future in `futures`, in order, returning their values. Since the futures were
/// already spawned independently, this only dictates the order results are *collected* in, not
/// the order the underlying work runs in.
pub async fn pget<I, T>(futures: I) -> Result<Vec<T>, Error>
where
    I: IntoIterator<Item = BatchFuture<T>>,
    T: Clone + 'static,
{
    let mut out = Vec::new();
    for future in futures {
        out.push(future.get(None).await?);
    }
    Ok(out)
}

/// Await every future in `futures`, ignoring whatever value or error each one settles with.
/// Equivalent to calling [`BatchFuture::wait`] on each in turn.
pub async fn wait<I, T>(futures: I)
where
    I: IntoIterator<Item = BatchFuture<T>>,
    T: Clone + 'static,
{
    for future in futures {
        let _ = future.wait(None).await;
    }
}

struct IWait<T: Clone + 'static> {
    pending: Vec<BatchFuture<T>>,
    completed: Vec<BatchFuture<T>>,
}

impl<T: Clone + 'static> Future for IWait<T> {
    type Output = Vec<BatchFuture<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut i = 0;
        while i < this.pending.len() {
            if Pin::new(&mut this.pending[i]).poll(cx).is_ready() {
                this.completed.push(this.pending.remove(i));
            } else {
                i += 1;
            }
        }
        if this.pending.is_empty() {
            Poll::Ready(std::mem::take(&mut this.completed))
        } else {
            Poll::Pending
        }
    }
}

/// Return `futures` reordered to the sequence in which they actually settle, without unwrapping
/// their values — the caller decides whether/how to observe each one's result.
pub async fn iwait<T: Clone + 'static>(futures: Vec<BatchFuture<T>>) -> Vec<BatchFuture<T>> {
    IWait {
        pending: futures,
        completed: Vec::new(),
    }
    .await
}

/// Run `predicate` over every item concurrently, returning the items it kept, in input order.
pub async fn pfilter<I, F, Fut>(iter: I, predicate: F) -> Result<Vec<I::Item>, Error>
where
    I: IntoIterator,
    I::Item: Clone + 'static,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<bool, Error>> + 'static,
{
    let items: Vec<I::Item> = iter.into_iter().collect();
    let checks = pmap(items.clone(), predicate).await?;
    Ok(items
        .into_iter()
        .zip(checks)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect())
}

struct FilterUnordered<T: 'static> {
    pending: Vec<(T, BatchFuture<bool>)>,
    kept: Vec<T>,
}

impl<T: 'static> Future for FilterUnordered<T> {
    type Output = Result<Vec<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut i = 0;
        while i < this.pending.len() {
            match Pin::new(&mut this.pending[i].1).poll(cx) {
                Poll::Ready(Ok(keep)) => {
                    let (item, _) = this.pending.remove(i);
                    if keep {
                        this.kept.push(item);
                    }
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => i += 1,
            }
        }
        if this.pending.is_empty() {
            Poll::Ready(Ok(std::mem::take(&mut this.kept)))
        } else {
            Poll::Pending
        }
    }
}

/// Like [`pfilter`], but the surviving items are returned in the order their predicate calls
/// settled in, rather than input order.
pub async fn pfilter_unordered<I, F, Fut>(iter: I, predicate: F) -> Result<Vec<I::Item>, Error>
where
    I: IntoIterator,
    I::Item: Clone + 'static,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<bool, Error>> + 'static,
{
    let pending: Vec<(I::Item, BatchFuture<bool>)> = iter
        .into_iter()
        .map(|item| {
            let check = task::spawn(predicate(item.clone()));
            (item, check)
        })
        .collect();
    FilterUnordered {
        pending,
        kept: Vec::new(),
    }
    .await
}

/// Apply a synchronous transform to a future's eventual value, producing a new future.
pub fn transform<T, U, F>(future: BatchFuture<T>, f: F) -> BatchFuture<U>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnOnce(T) -> U + 'static,
{
    task::spawn(async move { Ok(f(future.get(None).await?)) })
}

/// Await `future`, then feed its value into `f` to produce the next future. The chained future
/// runs in its own task, same as [`task::spawn`].
pub fn chain<T, U, F, Fut>(future: BatchFuture<T>, f: F) -> BatchFuture<U>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnOnce(T) -> Fut + 'static,
    Fut: Future<Output = Result<U, Error>> + 'static,
{
    task::spawn(async move {
        let value = future.get(None).await?;
        f(value).await
    })
}

enum ProxyState<T: Clone + 'static> {
    NotStarted(Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<T, Error>>>>>),
    Started(BatchFuture<T>),
}

/// Handle returned by [`spawn_proxy`]. Unlike [`task::spawn`], nothing runs until the first
/// [`get`](Self::get) call — building the proxy only captures the work to be done.
pub struct Proxy<T: Clone + 'static> {
    state: RefCell<ProxyState<T>>,
}

impl<T: Clone + 'static> Proxy<T> {
    fn started(&self) -> BatchFuture<T> {
        let mut state = self.state.borrow_mut();
        if matches!(&*state, ProxyState::NotStarted(_)) {
            let ProxyState::NotStarted(build) =
                std::mem::replace(&mut *state, ProxyState::Started(BatchFuture::pending()))
            else {
                unreachable!("just matched NotStarted above");
            };
            *state = ProxyState::Started(task::spawn(async move { build().await }));
        }
        match &*state {
            ProxyState::Started(future) => future.clone(),
            ProxyState::NotStarted(_) => unreachable!("replaced with Started above"),
        }
    }

    /// Read the proxied value, starting the underlying task on first access. Subsequent calls
    /// (including concurrent ones) share the same running task.
    pub async fn get(&self) -> Result<T, Error> {
        self.started().get(None).await
    }
}

/// Build a proxy whose underlying task is produced lazily by `f` and only actually spawned the
/// first time its value is read via [`Proxy::get`] — constructing the proxy itself does no work.
pub fn spawn_proxy<F, Fut, T>(f: F) -> Rc<Proxy<T>>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Error>> + 'static,
    T: Clone + 'static,
{
    Rc::new(Proxy {
        state: RefCell::new(ProxyState::NotStarted(Box::new(move || Box::pin(f())))),
    })
}

/// A bound on the number of concurrently in-flight calls to [`Pool::run`]. Callers beyond the
/// bound queue (FIFO-ish; a task that becomes runnable for an unrelated reason between a release
/// and a waiter's resumption may opportunistically take the freed slot first) until a slot frees
/// up.
pub struct Pool {
    capacity: usize,
    in_use: Cell<usize>,
    waiters: RefCell<VecDeque<BatchFuture<()>>>,
}

impl Pool {
    pub fn new(capacity: usize) -> Rc<Self> {
        Rc::new(Self {
            capacity,
            in_use: Cell::new(0),
            waiters: RefCell::new(VecDeque::new()),
        })
    }

    async fn acquire(self: &Rc<Self>) {
        loop {
            if self.in_use.get() < self.capacity {
                self.in_use.set(self.in_use.get() + 1);
                return;
            }
            let waiter = BatchFuture::pending();
            self.waiters.borrow_mut().push_back(waiter.clone());
            let _ = task::may_block(waiter.get(None)).await;
        }
    }

    fn release(&self) {
        self.in_use.set(self.in_use.get() - 1);
        if let Some(waiter) = self.waiters.borrow_mut().pop_front() {
            let _ = waiter.set(());
        }
    }

    /// Run `f` once a permit is available, releasing it again once `f`'s future settles
    /// (regardless of success or failure).
    pub async fn run<F, Fut, T>(self: &Rc<Self>, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.acquire().await;
        let result = f().await;
        self.release();
        result
    }

    /// Spawn `f` as its own task, gated by this pool, and return a handle to it immediately —
    /// unlike [`run`](Self::run), the caller doesn't wait for a permit before getting a handle
    /// back.
    pub fn spawn<F, Fut, T>(self: &Rc<Self>, f: F) -> BatchFuture<T>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: Clone + 'static,
    {
        let this = self.clone();
        task::spawn(async move { this.run(f).await })
    }

    /// Resolve once a permit is available, without taking it — lets a caller hold off starting
    /// more work until the pool has room, without committing to run anything in particular.
    pub async fn wait_available(self: &Rc<Self>) {
        while self.in_use.get() >= self.capacity {
            let waiter = BatchFuture::pending();
            self.waiters.borrow_mut().push_back(waiter.clone());
            let _ = task::may_block(waiter.get(None)).await;
        }
    }

    /// Map `f` over every item in `iter`, gated by this pool's concurrency, returning results in
    /// input order. Every item's task is spawned up front (each individually waits its turn on
    /// the pool), same as [`pmap`] but routed through this pool's permits.
    pub async fn pmap<I, F, Fut, Out>(self: &Rc<Self>, iter: I, f: F) -> Result<Vec<Out>, Error>
    where
        I: IntoIterator,
        I::Item: 'static,
        F: Fn(I::Item) -> Fut + 'static,
        Fut: Future<Output = Result<Out, Error>> + 'static,
        Out: Clone + 'static,
    {
        let pool = self.clone();
        let f = Rc::new(f);
        pmap(iter, move |item| {
            let pool = pool.clone();
            let f = f.clone();
            async move { pool.run(move || f(item)).await }
        })
        .await
    }

    /// Like [`pmap`](Self::pmap), but only keeps as many tasks in flight as the pool has
    /// capacity for, pulling the next item from `iter` as an earlier one completes, rather than
    /// spawning every item's task up front. Preferable when `iter` is expensive to fully drain
    /// (or unbounded) and the pool's own capacity is the real limiter. Results are in input
    /// order.
    pub async fn imap<I, F, Fut, Out>(self: &Rc<Self>, iter: I, f: F) -> Result<Vec<Out>, Error>
    where
        I: IntoIterator,
        I::Item: 'static,
        F: Fn(I::Item) -> Fut + 'static,
        Fut: Future<Output = Result<Out, Error>> + 'static,
        Out: Clone + 'static,
    {
        let mut items = iter.into_iter();
        let window = self.capacity.max(1);
        let f = Rc::new(f);
        let mut in_flight: VecDeque<BatchFuture<Out>> = VecDeque::new();
        let mut results = Vec::new();
        loop {
            while in_flight.len() < window {
                let Some(item) = items.next() else { break };
                let f = f.clone();
                in_flight.push_back(self.spawn(move || f(item)));
            }
            let Some(handle) = in_flight.pop_front() else {
                break;
            };
            results.push(handle.get(None).await?);
        }
        Ok(results)
    }

    /// Like [`imap`](Self::imap), but results are returned in the order their tasks actually
    /// settle in, rather than input order.
    pub async fn imap_unordered<I, F, Fut, Out>(
        self: &Rc<Self>,
        iter: I,
        f: F,
    ) -> Result<Vec<Out>, Error>
    where
        I: IntoIterator,
        I::Item: 'static,
        F: Fn(I::Item) -> Fut + 'static,
        Fut: Future<Output = Result<Out, Error>> + 'static,
        Out: Clone + 'static,
    {
        let mut items = iter.into_iter();
        let window = self.capacity.max(1);
        let f = Rc::new(f);
        let mut in_flight: Vec<BatchFuture<Out>> = Vec::new();
        let mut results = Vec::new();
        loop {
            while in_flight.len() < window {
                let Some(item) = items.next() else { break };
                let f = f.clone();
                in_flight.push(self.spawn(move || f(item)));
            }
            if in_flight.is_empty() {
                break;
            }
            results.push(
                NextSettled {
                    pending: &mut in_flight,
                }
                .await?,
            );
        }
        Ok(results)
    }
}

struct NextSettled<'a, Out: Clone + 'static> {
    pending: &'a mut Vec<BatchFuture<Out>>,
}

impl<'a, Out: Clone + 'static> Future for NextSettled<'a, Out> {
    type Output = Result<Out, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for i in 0..this.pending.len() {
            if let Poll::Ready(result) = Pin::new(&mut this.pending[i]).poll(cx) {
                this.pending.remove(i);
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}

/// Shorthand for [`Pool::new`].
pub fn pool(capacity: usize) -> Rc<Pool> {
    Pool::new(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::batch_context;

    #[test]
    fn pmap_preserves_input_order() {
        let out = batch_context(async move {
            pmap(0..5, |x| async move { Ok::<_, Error>(x * x) }).await
        })
        .unwrap();
        assert_eq!(out, vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn pmap_short_circuits_on_first_error() {
        let out: Result<Vec<i32>, Error> = batch_context(async move {
            pmap(0..3, |x| async move {
                if x == 1 {
                    Err(Error::user(std::io::Error::other("bad")))
                } else {
                    Ok(x)
                }
            })
            .await
        });
        assert!(out.is_err());
    }

    #[test]
    fn pfilter_keeps_matching_items_in_order() {
        let out = batch_context(async move {
            pfilter(0..6, |x| async move { Ok::<_, Error>(x % 2 == 0) }).await
        })
        .unwrap();
        assert_eq!(out, vec![0, 2, 4]);
    }

    #[test]
    fn spawn_proxy_does_not_run_until_first_get() {
        let started = Rc::new(Cell::new(false));
        let started2 = started.clone();

        let out = batch_context(async move {
            let proxy = spawn_proxy(move || async move {
                started2.set(true);
                Ok::<_, Error>(9)
            });
            let not_started_yet = !started.get();
            let value = proxy.get().await?;
            Ok::<_, Error>((not_started_yet, value))
        })
        .unwrap();

        assert_eq!(out, (true, 9));
    }

    #[test]
    fn pool_spawn_respects_capacity() {
        let peak = Rc::new(Cell::new(0usize));
        let current = Rc::new(Cell::new(0usize));
        let peak2 = peak.clone();
        let current2 = current.clone();

        let out = batch_context(async move {
            let pool = pool(2);
            let handles: Vec<BatchFuture<()>> = (0..5)
                .map(|_| {
                    let current = current2.clone();
                    let peak = peak2.clone();
                    pool.spawn(move || async move {
                        current.set(current.get() + 1);
                        peak.set(peak.get().max(current.get()));
                        let yield_point = BatchFuture::<()>::pending();
                        let _ = task::may_block(
                            yield_point.wait(Some(std::time::Duration::from_millis(0))),
                        )
                        .await;
                        current.set(current.get() - 1);
                        Ok(())
                    })
                })
                .collect();
            pget(handles).await
        });

        assert!(out.is_ok());
        assert!(peak.get() <= 2);
    }

    #[test]
    fn wait_available_resolves_once_a_permit_frees() {
        let out = batch_context(async move {
            let pool = pool(1);
            let gate: BatchFuture<()> = BatchFuture::pending();
            let gate2 = gate.clone();
            let held = pool.spawn(move || async move {
                let _ = task::may_block(gate2.get(None)).await;
                Ok(())
            });
            let pool2 = pool.clone();
            let waiter = task::spawn(async move {
                pool2.wait_available().await;
                Ok(())
            });
            gate.set(()).unwrap();
            pget([held, waiter]).await
        });

        assert!(out.is_ok());
    }

    #[test]
    fn pool_imap_and_imap_unordered_visit_every_item() {
        let out = batch_context(async move {
            let pool = pool(2);
            let ordered = pool.imap(0..5, |x| async move { Ok::<_, Error>(x * 2) }).await?;
            let mut unordered = pool
                .imap_unordered(0..5, |x| async move { Ok::<_, Error>(x * 2) })
                .await?;
            unordered.sort_unstable();
            Ok::<_, Error>((ordered, unordered))
        })
        .unwrap();

        assert_eq!(out.0, vec![0, 2, 4, 6, 8]);
        assert_eq!(out.1, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn pool_limits_concurrency() {
        let peak = Rc::new(Cell::new(0usize));
        let current = Rc::new(Cell::new(0usize));

        let out = batch_context(async move {
            let pool = pool(2);
            let peak = peak.clone();
            let current = current.clone();
            pmap(0..6, move |_| {
                let pool = pool.clone();
                let peak = peak.clone();
                let current = current.clone();
                async move {
                    pool.run(|| async move {
                        current.set(current.get() + 1);
                        peak.set(peak.get().max(current.get()));
                        let yield_point = BatchFuture::<()>::pending();
                        let _ = task::may_block(
                            yield_point.wait(Some(std::time::Duration::from_millis(0))),
                        )
                        .await;
                        current.set(current.get() - 1);
                        Ok::<_, Error>(())
                    })
                    .await
                }
            })
            .await
        });
        assert!(out.is_ok());
        assert!(peak.get() <= 2);
    }
}
