use std::cell::{Cell, RefCell};
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as PollContext, Poll, Waker};
use std::time::Duration;

use crate::dispatcher;
use crate::error::{Error, ErrorKind};
use crate::task::suspend_current_task;

enum State<T> {
    Pending,
    Value(T),
    Error(Error),
}

impl<T> State<T> {
    fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

/// Token returned by [`BatchFuture::link`], usable with [`BatchFuture::unlink`] to cancel the
/// callback before it runs. Best-effort: if the callback is already queued to run on the
/// dispatcher, `unlink` still suppresses it, but a callback already mid-execution can't be
/// interrupted.
#[derive(Clone)]
pub struct LinkToken(Rc<Cell<bool>>);

struct Inner<T> {
    state: State<T>,
    links: Vec<Waker>,
    callbacks: Vec<(Rc<Cell<bool>>, Box<dyn FnOnce(&BatchFuture<T>)>)>,
    /// Set once some caller has used `get`/`wait`/`link` on this future. An errored future
    /// that's dropped without ever being observed this way gets logged — see `Drop` below.
    observed: Cell<bool>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let State::Error(e) = &self.state {
            if !self.observed.get() {
                log::warn!(
                    "batchy: dropping a BatchFuture that settled with an unobserved error (kind: {:?})",
                    e.kind()
                );
            }
        }
    }
}

/// A settable, awaitable, shareable single-value container.
///
/// `BatchFuture` is the return type of [`crate::spawn`], of [`Batched`](crate::Batched) calls,
/// and of the combinators in [`crate::combinators`]. It can be consumed either with ordinary
/// `.await` (equivalent to `get(block = true, timeout = None)`) or with the explicit
/// [`BatchFuture::get`] / [`BatchFuture::wait`] methods, which additionally support timeouts.
///
/// Settling happens at most once; a second `set`/`set_error` call returns
/// [`ErrorKind::AlreadySet`]. Registered [`link`](BatchFuture::link) callbacks always run on the
/// dispatcher, never inline under the call to `set`/`set_error`, so settling a future can never
/// re-enter arbitrary caller code synchronously.
pub struct BatchFuture<T: Clone + 'static> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Clone + 'static> Clone for BatchFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> BatchFuture<T> {
    /// A new, unsettled future.
    pub fn pending() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                links: Vec::new(),
                callbacks: Vec::new(),
                observed: Cell::new(false),
            })),
        }
    }

    /// Settle the future with a value. Returns [`ErrorKind::AlreadySet`] if it was already
    /// settled.
    pub fn set(&self, value: T) -> Result<(), Error> {
        self.settle(State::Value(value))
    }

    /// Settle the future with an error. Returns [`ErrorKind::AlreadySet`] if it was already
    /// settled.
    pub fn set_error(&self, error: Error) -> Result<(), Error> {
        self.settle(State::Error(error))
    }

    fn settle(&self, new_state: State<T>) -> Result<(), Error> {
        let (wakers, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_pending() {
                return Err(Error::already_set());
            }
            inner.state = new_state;
            (
                std::mem::take(&mut inner.links),
                std::mem::take(&mut inner.callbacks),
            )
        };
        let this = self.clone();
        dispatcher::defer(move || {
            for waker in wakers {
                waker.wake();
            }
            for (cancelled, cb) in callbacks {
                if !cancelled.get() {
                    cb(&this);
                }
            }
        });
        Ok(())
    }

    /// Whether the future has settled (with either a value or an error).
    pub fn ready(&self) -> bool {
        !self.inner.borrow().state.is_pending()
    }

    /// Whether the future settled successfully. `false` while pending.
    pub fn successful(&self) -> bool {
        matches!(self.inner.borrow().state, State::Value(_))
    }

    /// Register a callback to run (on the dispatcher) once this future settles, receiving a
    /// clone of `self`. If already settled, the callback is still deferred to the dispatcher
    /// rather than called inline. Callbacks registered before settlement run in FIFO order.
    /// Returns a [`LinkToken`] that [`unlink`](Self::unlink) can later use to cancel it.
    pub fn link(&self, callback: impl FnOnce(&BatchFuture<T>) + 'static) -> LinkToken {
        let cancelled = Rc::new(Cell::new(false));
        let mut inner = self.inner.borrow_mut();
        inner.observed.set(true);
        if inner.state.is_pending() {
            inner.callbacks.push((cancelled.clone(), Box::new(callback)));
        } else {
            drop(inner);
            let this = self.clone();
            let flag = cancelled.clone();
            dispatcher::defer(move || {
                if !flag.get() {
                    callback(&this);
                }
            });
        }
        LinkToken(cancelled)
    }

    /// Best-effort cancel a callback registered via [`link`](Self::link). A no-op if the
    /// callback already ran, or was already unlinked.
    pub fn unlink(&self, token: &LinkToken) {
        token.0.set(true);
    }

    fn poll_value(&self, waker: &Waker) -> Poll<Result<T, Error>> {
        let mut inner = self.inner.borrow_mut();
        inner.observed.set(true);
        match &inner.state {
            State::Pending => {
                inner.links.push(waker.clone());
                Poll::Pending
            }
            State::Value(v) => Poll::Ready(Ok(v.clone())),
            State::Error(e) => Poll::Ready(Err(e.clone())),
        }
    }

    /// Suspend the current task until this future settles (or `timeout` elapses), then return
    /// its value or propagate its error. Equivalent to `.await` when `timeout` is `None`.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T, Error> {
        GetFuture {
            future: self.clone(),
            timer: timeout.map(dispatcher::Timer::new),
        }
        .await
    }

    /// Suspend the current task until this future settles (or `timeout` elapses). Unlike
    /// [`get`](Self::get), a stored error is never re-raised: `wait` only reports whether the
    /// wait itself timed out.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        WaitFuture {
            future: self.clone(),
            timer: timeout.map(dispatcher::Timer::new),
        }
        .await
    }
}

impl<T: Clone + 'static> StdFuture for BatchFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        match self.poll_value(cx.waker()) {
            Poll::Ready(r) => Poll::Ready(r),
            Poll::Pending => {
                suspend_current_task();
                Poll::Pending
            }
        }
    }
}

struct GetFuture<T: Clone + 'static> {
    future: BatchFuture<T>,
    timer: Option<dispatcher::Timer>,
}

impl<T: Clone + 'static> StdFuture for GetFuture<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        match self.future.poll_value(cx.waker()) {
            Poll::Ready(r) => return Poll::Ready(r),
            Poll::Pending => {}
        }
        if let Some(timer) = self.timer.as_mut() {
            if Pin::new(timer).poll(cx).is_ready() {
                return Poll::Ready(Err(Error::timeout()));
            }
        }
        suspend_current_task();
        Poll::Pending
    }
}

struct WaitFuture<T: Clone + 'static> {
    future: BatchFuture<T>,
    timer: Option<dispatcher::Timer>,
}

impl<T: Clone + 'static> StdFuture for WaitFuture<T> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        match self.future.poll_value(cx.waker()) {
            Poll::Ready(_) => return Poll::Ready(Ok(())),
            Poll::Pending => {}
        }
        if let Some(timer) = self.timer.as_mut() {
            if Pin::new(timer).poll(cx).is_ready() {
                return Poll::Ready(Err(Error::timeout()));
            }
        }
        suspend_current_task();
        Poll::Pending
    }
}

/// A future that is already settled with `value`. `link` still delivers through the dispatcher,
/// preserving the usual ordering guarantees.
pub fn immediate<T: Clone + 'static>(value: T) -> BatchFuture<T> {
    let future = BatchFuture::pending();
    future
        .set(value)
        .expect("a freshly created future is always settleable");
    future
}

/// A future that is already settled with `error`.
pub fn immediate_error<T: Clone + 'static>(error: Error) -> BatchFuture<T> {
    let future = BatchFuture::pending();
    future
        .set_error(error)
        .expect("a freshly created future is always settleable");
    future
}
