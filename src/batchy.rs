//! `batchy` is a cooperative, single-threaded concurrency runtime for workloads made of many
//! small tasks that each call out to an expensive backend (a database, a cache, an RPC service).
//!
//! Tasks are written as straight-line, "one call at a time" async code. Calls wrapped with
//! [`Batched`] are transparently coalesced: if several tasks are all waiting to call the same
//! operation, the runtime groups their arguments into a single bulk invocation and demultiplexes
//! the bulk result back to each caller, without changing what any individual call looks like to
//! the task that made it.
//!
//! The engine is deliberately single-threaded and cooperative within one [`Context`] — see
//! [`context`] for why that isn't a limitation for this workload shape. Multiple independent
//! contexts (e.g. one per incoming request) can coexist on the same thread, or on different
//! threads entirely; there is no cross-thread coordination in the core.

mod batched;
mod combinators;
mod config;
mod context;
mod dispatcher;
mod error;
mod future;
mod scheduler;
mod task;

pub use batched::{Batched, ClassBatched};
pub use combinators::{
    chain, iwait, pfilter, pfilter_unordered, pget, pmap, pmap_unordered, pool, spawn_proxy,
    transform, wait, Pool, Proxy,
};
pub use config::{add_auto_wrapper, set_default_scheduler, set_max_exc_infos, TaskFuture};
pub use context::{batch_context, Context};
pub use dispatcher::{run, run_until_parked, sleep, timeout};
pub use error::{Error, ErrorKind};
pub use future::{immediate, immediate_error, BatchFuture, LinkToken};
pub use scheduler::{AllAtOnceScheduler, OneResult, Raise, Scheduler};
pub use task::{may_block, spawn, spawn_labeled, TaskLabel};

/// Convenience re-exports for glob-importing the common surface, mirroring the way the reference
/// codebase offers a `prelude` for its most frequently used traits and types.
pub mod prelude {
    pub use crate::{
        batch_context, immediate, immediate_error, may_block, pfilter, pfilter_unordered, pget,
        pmap, pmap_unordered, spawn, transform, wait, BatchFuture, Batched, ClassBatched, Error,
        ErrorKind, OneResult, Raise,
    };
}
