use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;

/// Object-safe handle to one pending coalesced batch, owned by a [`Scheduler`] between
/// registration and firing. [`crate::Batched`] only ever holds a `Weak` to the same entry, so the
/// scheduler is the sole owner keeping it alive.
pub(crate) trait PendingBatch {
    fn fire(self: Rc<Self>);
}

/// Decides when and how a context's outstanding coalesced batches actually run.
///
/// The [`crate::Context`] that owns a scheduler calls [`Scheduler::run_next`] exactly when every
/// live task in that context is blocked and [`Scheduler::has_work`] reports `true`. Everything
/// past that point — whether to run one batch or all of them, in what order — is the scheduler's
/// call. [`AllAtOnceScheduler`] is the only scheduler this crate ships, matching the reference
/// library's default; it exists as a trait so a caller with different coalescing needs (priority
/// batches, rate limiting) can plug in their own via [`crate::set_default_scheduler`].
pub trait Scheduler: 'static {
    #[doc(hidden)]
    fn enqueue(&self, entry: Rc<dyn PendingBatch>);
    /// Detach `entry` if it is still registered. Called whenever an entry fires outside of
    /// [`run_next`](Self::run_next) (an eager `max_size` fire) so a reused, already-fired entry
    /// can't be handed back out to a later caller. A no-op if `entry` isn't present — `run_next`
    /// itself drains the whole queue before firing, so the usual path never needs this.
    #[doc(hidden)]
    fn dequeue(&self, entry: &Rc<dyn PendingBatch>);
    #[doc(hidden)]
    fn has_work(&self) -> bool;
    #[doc(hidden)]
    fn run_next(&self);
}

/// Fires every batch that coalesced while the context was filling up with blocked tasks, all at
/// once, in registration order. This is the scheduling policy the whole-batch coalescing guarantee
/// in the top-level docs assumes.
#[derive(Default)]
pub struct AllAtOnceScheduler {
    pending: RefCell<Vec<Rc<dyn PendingBatch>>>,
}

impl AllAtOnceScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for AllAtOnceScheduler {
    fn enqueue(&self, entry: Rc<dyn PendingBatch>) {
        self.pending.borrow_mut().push(entry);
    }

    fn dequeue(&self, entry: &Rc<dyn PendingBatch>) {
        self.pending.borrow_mut().retain(|e| !Rc::ptr_eq(e, entry));
    }

    fn has_work(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    fn run_next(&self) {
        let batch = std::mem::take(&mut *self.pending.borrow_mut());
        for entry in batch {
            entry.fire();
        }
    }
}

/// Marks a single item within a bulk function's result vector as failed, without failing the
/// sibling calls coalesced into the same batch. Compare a whole-batch `Err` returned by the bulk
/// function itself, which settles every call in the batch with the same error.
#[derive(Debug, Clone)]
pub struct Raise(pub Error);

impl From<Error> for Raise {
    fn from(error: Error) -> Self {
        Raise(error)
    }
}

/// The per-item outcome inside a bulk function's result vector: either the value for that input,
/// or a [`Raise`] failing just that one call.
pub type OneResult<T> = Result<T, Raise>;
