use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use crate::context::Context;
use crate::error::Error;
use crate::future::BatchFuture;
use crate::scheduler::{OneResult, PendingBatch, Raise};
use crate::task;

type BulkFn<Args, Out> =
    dyn Fn(Vec<Args>) -> Pin<Box<dyn Future<Output = Result<Vec<OneResult<Out>>, Error>>>>;

struct Slot<Args, Out> {
    arg: Args,
    future: BatchFuture<Out>,
}

struct PendingEntry<Args, Out> {
    bulk_fn: Rc<BulkFn<Args, Out>>,
    context: Context,
    slots: RefCell<Vec<Slot<Args, Out>>>,
    fired: Cell<bool>,
}

impl<Args: 'static, Out: Clone + 'static> PendingEntry<Args, Out> {
    fn push(&self, arg: Args) -> (BatchFuture<Out>, usize) {
        let future = BatchFuture::pending();
        let mut slots = self.slots.borrow_mut();
        slots.push(Slot {
            arg,
            future: future.clone(),
        });
        (future, slots.len())
    }
}

impl<Args: 'static, Out: Clone + 'static> PendingBatch for PendingEntry<Args, Out> {
    fn fire(self: Rc<Self>) {
        // Idempotent: the eager max_size path and the context's own scheduler fire can both
        // reach the same entry (the scheduler doesn't know a max_size fire already happened).
        if self.fired.replace(true) {
            return;
        }
        // Detach from the scheduler so a later same-context call can't resurrect this entry
        // through `Batched::entry_for`'s weak lookup once it's already spoken for. `run_next`
        // already drained the queue before calling here, so this is a no-op on that path.
        let erased: Rc<dyn PendingBatch> = self.clone();
        self.context.scheduler().dequeue(&erased);
        let slots = self.slots.take();
        let bulk_fn = self.bulk_fn.clone();
        let context = self.context.clone();
        let running: BatchFuture<()> = task::spawn_in(context, async move {
            let (args, futures): (Vec<Args>, Vec<BatchFuture<Out>>) =
                slots.into_iter().map(|s| (s.arg, s.future)).unzip();
            let expected = args.len();
            match bulk_fn(args).await {
                Ok(results) if results.len() == expected => {
                    for (future, result) in futures.into_iter().zip(results) {
                        match result {
                            Ok(value) => {
                                let _ = future.set(value);
                            }
                            Err(Raise(error)) => {
                                let _ = future.set_error(error);
                            }
                        }
                    }
                }
                Ok(results) => {
                    let error = Error::invariant_violation(format!(
                        "bulk function returned {} results for {} inputs",
                        results.len(),
                        expected
                    ));
                    for future in futures {
                        let _ = future.set_error(error.clone());
                    }
                }
                Err(error) => {
                    for future in futures {
                        let _ = future.set_error(error.clone());
                    }
                }
            }
            Ok(())
        });
        // Nothing awaits completion directly; the context's own live/blocked bookkeeping (bumped
        // by spawning this as a task) is what keeps the runtime from tearing down early.
        drop(running);
    }
}

/// Coalesces many single-argument calls, made while a context is filling up with blocked tasks,
/// into one bulk invocation of `bulk_fn`.
///
/// Construct one `Batched` per logical operation (typically held in a `static`/`Rc` shared across
/// every task that might call it) and share it with `.clone()` — cloning the `Rc` is cheap and is
/// exactly what lets independent tasks coalesce into the same pending batch. A single `Batched`
/// can be called concurrently from multiple, unrelated [`Context`]s: each context gets its own
/// independent pending batch, keyed internally by context identity, so unrelated contexts never
/// coalesce into each other's bulk calls.
pub struct Batched<Args, Out> {
    bulk_fn: Rc<BulkFn<Args, Out>>,
    max_size: Option<usize>,
    pending: RefCell<Vec<(usize, Weak<PendingEntry<Args, Out>>)>>,
}

impl<Args: 'static, Out: Clone + 'static> Batched<Args, Out> {
    /// Build a `Batched` with no cap on how many calls coalesce into one bulk invocation.
    pub fn new<F, Fut>(bulk_fn: F) -> Rc<Self>
    where
        F: Fn(Vec<Args>) -> Fut + 'static,
        Fut: Future<Output = Result<Vec<OneResult<Out>>, Error>> + 'static,
    {
        Self::with_max_size(bulk_fn, None)
    }

    /// Build a `Batched` that fires eagerly, without waiting for the context to go fully blocked,
    /// as soon as `max_size` calls have coalesced into the same pending batch. Other pending
    /// batches on the same context are unaffected and keep waiting for their normal fire point.
    pub fn with_max_size<F, Fut>(bulk_fn: F, max_size: Option<usize>) -> Rc<Self>
    where
        F: Fn(Vec<Args>) -> Fut + 'static,
        Fut: Future<Output = Result<Vec<OneResult<Out>>, Error>> + 'static,
    {
        Rc::new(Self {
            bulk_fn: Rc::new(move |args| Box::pin(bulk_fn(args))),
            max_size,
            pending: RefCell::new(Vec::new()),
        })
    }

    fn entry_for(&self, context: &Context) -> Rc<PendingEntry<Args, Out>> {
        let ctx_id = context.id();
        let mut pending = self.pending.borrow_mut();
        pending.retain(|(_, weak)| weak.strong_count() > 0);
        if let Some((_, weak)) = pending.iter().find(|(id, _)| *id == ctx_id) {
            if let Some(entry) = weak.upgrade() {
                return entry;
            }
        }
        let entry = Rc::new(PendingEntry {
            bulk_fn: self.bulk_fn.clone(),
            context: context.clone(),
            slots: RefCell::new(Vec::new()),
            fired: Cell::new(false),
        });
        context.scheduler().enqueue(entry.clone());
        pending.push((ctx_id, Rc::downgrade(&entry)));
        entry
    }

    /// Enqueue `arg` and return a [`BatchFuture`] for its result immediately, without awaiting
    /// it — the `as_future` entry point from the wrapper's configuration surface (§4.E, §6),
    /// for callers that want to keep doing other work before reading the result.
    pub fn as_future(self: &Rc<Self>, arg: Args) -> BatchFuture<Out> {
        let context = task::current_context().unwrap_or_else(Context::new_root);
        let entry = self.entry_for(&context);
        let (future, len) = entry.push(arg);
        if matches!(self.max_size, Some(max) if len >= max) {
            log::debug!("batchy: batch reached max_size ({len}), firing eagerly");
            entry.fire();
        }
        future
    }

    /// Call the batched operation with `arg`, coalescing with any other call to the same
    /// `Batched` made on the same context before it fires. Resolves once the bulk call this
    /// argument ended up in has run and settled this slot's result.
    pub async fn call(self: &Rc<Self>, arg: Args) -> Result<Out, Error> {
        self.as_future(arg).get(None).await
    }
}

/// A [`Batched`] operation scoped to a receiver value, for coalescing method-shaped calls (`self`
/// plus an argument) across many different receivers into one bulk invocation — e.g. loading a
/// field for many different model instances with one query. Equivalent to a
/// `Batched<(Recv, Args), Out>` with a two-argument [`call`](Self::call).
pub struct ClassBatched<Recv, Args, Out> {
    inner: Rc<Batched<(Recv, Args), Out>>,
}

impl<Recv: 'static, Args: 'static, Out: Clone + 'static> ClassBatched<Recv, Args, Out> {
    pub fn new<F, Fut>(bulk_fn: F) -> Rc<Self>
    where
        F: Fn(Vec<(Recv, Args)>) -> Fut + 'static,
        Fut: Future<Output = Result<Vec<OneResult<Out>>, Error>> + 'static,
    {
        Rc::new(Self {
            inner: Batched::new(bulk_fn),
        })
    }

    pub async fn call(self: &Rc<Self>, receiver: Recv, arg: Args) -> Result<Out, Error> {
        self.inner.call((receiver, arg)).await
    }

    /// As [`Batched::as_future`], scoped to a receiver.
    pub fn as_future(self: &Rc<Self>, receiver: Recv, arg: Args) -> BatchFuture<Out> {
        self.inner.as_future((receiver, arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::{pget, pmap};
    use crate::context::batch_context;

    #[test]
    fn concurrent_calls_coalesce_into_one_bulk_invocation() {
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        let double = Batched::new(move |args: Vec<i32>| {
            calls2.set(calls2.get() + 1);
            async move { Ok(args.into_iter().map(|x| Ok(x * 2)).collect()) }
        });

        let out = batch_context(async move {
            let double = double.clone();
            pmap(0..4, move |x| {
                let double = double.clone();
                async move { double.call(x).await }
            })
            .await
        })
        .unwrap();

        assert_eq!(out, vec![0, 2, 4, 6]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn whole_batch_error_propagates_to_every_caller() {
        let op: Rc<Batched<i32, i32>> = Batched::new(|_args: Vec<i32>| async {
            Err(Error::user(std::io::Error::other("backend down")))
        });

        let out = batch_context(async move {
            let op = op.clone();
            pmap(0..3, move |x| {
                let op = op.clone();
                async move { op.call(x).await }
            })
            .await
        });

        assert!(out.is_err());
    }

    #[test]
    fn per_item_raise_fails_only_that_slot() {
        let op: Rc<Batched<i32, i32>> = Batched::new(|args: Vec<i32>| async move {
            Ok(args
                .into_iter()
                .map(|x| {
                    if x == 1 {
                        Err(Raise(Error::user(std::io::Error::other("bad item"))))
                    } else {
                        Ok(x)
                    }
                })
                .collect())
        });

        let out = batch_context(async move {
            let a = op.call(0).await;
            let b = op.call(1).await;
            let c = op.call(2).await;
            Ok::<_, Error>((a, b, c))
        })
        .unwrap();

        assert_eq!(out.0.unwrap(), 0);
        assert!(out.1.is_err());
        assert_eq!(out.2.unwrap(), 2);
    }

    #[test]
    fn max_size_fires_eagerly_without_waiting_for_full_block() {
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        let op = Batched::with_max_size(
            move |args: Vec<i32>| {
                calls2.set(calls2.get() + 1);
                async move { Ok(args.into_iter().map(Ok).collect()) }
            },
            Some(2),
        );

        // Sequential awaited calls can't coalesce: the first call's batch fires on the
        // all-blocked edge before the second is ever enqueued. Spawn both concurrently so they
        // land in the same pending entry and genuinely exercise the eager max_size fire.
        batch_context(async move {
            let op1 = op.clone();
            let op2 = op.clone();
            let first = task::spawn(async move { op1.call(1).await });
            let second = task::spawn(async move { op2.call(2).await });
            pget([first, second]).await
        })
        .unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn eager_fire_does_not_strand_a_later_call_in_the_same_context() {
        // Regression test: an eagerly max_size-fired entry used to stay registered in the
        // scheduler, so a later call on the same context in the same batch round would be
        // pushed onto the already-fired (dead) entry and never settle.
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        let op = Batched::with_max_size(
            move |args: Vec<i32>| {
                calls2.set(calls2.get() + 1);
                async move { Ok(args.into_iter().map(Ok).collect()) }
            },
            Some(2),
        );

        let out = batch_context(async move {
            let op1 = op.clone();
            let op2 = op.clone();
            let op3 = op.clone();
            let first = task::spawn(async move { op1.call(1).await });
            let second = task::spawn(async move { op2.call(2).await });
            let firsts = pget([first, second]).await?;
            let c = op3.call(3).await?;
            Ok::<_, Error>((firsts[0], firsts[1], c))
        })
        .unwrap();

        assert_eq!(out, (1, 2, 3));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn as_future_enqueues_without_blocking() {
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        let op: Rc<Batched<i32, i32>> = Batched::new(move |args: Vec<i32>| {
            calls2.set(calls2.get() + 1);
            async move { Ok(args.into_iter().map(|x| Ok(x * 2)).collect()) }
        });

        let out = batch_context(async move {
            let future = op.as_future(5);
            assert!(!future.ready());
            future.get(None).await
        })
        .unwrap();

        assert_eq!(out, 10);
    }
}
