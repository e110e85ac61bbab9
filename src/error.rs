use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "error-trace")]
use std::collections::VecDeque;

/// The closed set of error kinds the runtime itself can raise. User code that fails inside a
/// task body or a batched function is wrapped as [`ErrorKind::User`]; the runtime never
/// constructs a `User` error itself.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `get`/`wait` timed out before the future settled.
    #[error("timed out waiting for future")]
    Timeout,
    /// A future was settled a second time.
    #[error("future was already set")]
    AlreadySet,
    /// A batched function's bulk result didn't line up with its input, or an internal assertion
    /// failed.
    #[error("invariant violation")]
    InvariantViolation,
    /// User-supplied code (a task body, a batched function, a transformer) returned an error.
    #[error("user code returned an error")]
    User,
}

/// A captured backtrace, retained only while it still has a slot in the process-wide trace ring.
#[cfg(feature = "error-trace")]
pub struct Trace(backtrace::Backtrace);

#[cfg(feature = "error-trace")]
impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

#[cfg(feature = "error-trace")]
struct TraceCell(Mutex<Option<Arc<Trace>>>);

#[cfg(feature = "error-trace")]
struct TraceRing {
    cap: usize,
    entries: VecDeque<Arc<TraceCell>>,
}

#[cfg(feature = "error-trace")]
impl TraceRing {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, cell: Arc<TraceCell>) {
        self.entries.push_back(cell);
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.cap {
            if let Some(oldest) = self.entries.pop_front() {
                *oldest.0.lock() = None;
            }
        }
    }

    fn resize(&mut self, cap: usize) {
        self.cap = cap;
        self.trim();
    }
}

#[cfg(feature = "error-trace")]
static TRACE_RING: Mutex<Option<TraceRing>> = Mutex::new(None);

#[cfg(feature = "error-trace")]
const DEFAULT_MAX_EXC_INFOS: usize = 10;

#[cfg(feature = "error-trace")]
fn trace_ring() -> parking_lot::MutexGuard<'static, Option<TraceRing>> {
    let mut guard = TRACE_RING.lock();
    if guard.is_none() {
        *guard = Some(TraceRing::new(DEFAULT_MAX_EXC_INFOS));
    }
    guard
}

/// Resize the bounded, process-wide retained-trace ring. Trimming is immediate: if the new
/// capacity is smaller than the current occupancy, the oldest traces are dropped right away.
///
/// Intended as a startup-time knob (see [`crate::config`]); changing it mid-run is well defined
/// but not the common case.
#[cfg(feature = "error-trace")]
pub fn set_max_exc_infos(n: usize) {
    let mut guard = trace_ring();
    match guard.as_mut() {
        Some(ring) => ring.resize(n),
        None => *guard = Some(TraceRing::new(n)),
    }
}

#[cfg(not(feature = "error-trace"))]
pub fn set_max_exc_infos(_n: usize) {}

/// A cheaply cloneable error carrying its [`ErrorKind`], the underlying cause, and (when the
/// `error-trace` feature is enabled) a capped reference to a captured backtrace.
///
/// Cloning is shallow (the cause and trace are reference-counted) so the *same* error can be
/// delivered verbatim to every awaiter of a failed batch, as required by the whole-batch-failure
/// propagation rule.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    cause: Arc<dyn std::error::Error + Send + Sync + 'static>,
    #[cfg(feature = "error-trace")]
    trace: Arc<TraceCell>,
}

impl Error {
    /// Build an error of the given kind wrapping `cause`, capturing a trace if the `error-trace`
    /// feature is enabled.
    pub fn new<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        #[cfg(feature = "error-trace")]
        {
            let cell = Arc::new(TraceCell(Mutex::new(Some(Arc::new(Trace(
                backtrace::Backtrace::new_unresolved(),
            ))))));
            trace_ring().as_mut().expect("ring initialized").push(cell.clone());
            Self {
                kind,
                cause: Arc::new(cause),
                trace: cell,
            }
        }
        #[cfg(not(feature = "error-trace"))]
        {
            Self {
                kind,
                cause: Arc::new(cause),
            }
        }
    }

    /// Construct a `User`-kind error from any boxed standard error, the path ordinary task
    /// bodies and batched functions use when propagating failures with `?`.
    pub fn user<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorKind::User, cause)
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        #[derive(Debug, thiserror::Error)]
        #[error("{0}")]
        struct Invariant(String);
        Self::new(ErrorKind::InvariantViolation, Invariant(message.into()))
    }

    pub fn timeout() -> Self {
        #[derive(Debug, thiserror::Error)]
        #[error("timed out")]
        struct TimeoutCause;
        Self::new(ErrorKind::Timeout, TimeoutCause)
    }

    pub fn already_set() -> Self {
        #[derive(Debug, thiserror::Error)]
        #[error("already set")]
        struct AlreadySetCause;
        Self::new(ErrorKind::AlreadySet, AlreadySetCause)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.cause
    }

    /// The captured trace, if the ring still holds it. Returns `None` once this error has aged
    /// out of the bounded trace ring — the kind and cause remain available regardless.
    #[cfg(feature = "error-trace")]
    pub fn trace(&self) -> Option<Arc<Trace>> {
        self.trace.0.lock().clone()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("cause", &self.cause.to_string())
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.cause)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn clone_shares_cause_and_kind() {
        let e1 = Error::user(Boom);
        let e2 = e1.clone();
        assert_eq!(e1.kind(), ErrorKind::User);
        assert_eq!(e2.kind(), ErrorKind::User);
        assert_eq!(e1.to_string(), e2.to_string());
    }

    #[cfg(feature = "error-trace")]
    #[test]
    fn trace_ring_bounds_retained_traces() {
        set_max_exc_infos(2);
        let e1 = Error::user(Boom);
        let _e2 = Error::user(Boom);
        let _e3 = Error::user(Boom);
        // e1's trace should have aged out once a third error pushed it out of a ring of size 2.
        assert!(e1.trace().is_none());
        set_max_exc_infos(10);
    }
}
