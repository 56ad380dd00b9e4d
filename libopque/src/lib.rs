//! Deferred operations for lio clients.
//!
//! An [`Operation`] wraps one unit of remote work and resolves exactly once.
//! Operations run on a [`WorkerPool`], can be grouped in an
//! [`OperationQueue`] and drained one at a time, and the [`Pipeline`] keeps a
//! fixed window of them in flight over a long stream of work items.

pub mod error;
pub mod op;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod status;

pub use error::OpqueError;
pub use op::{FreeMode, Operation};
pub use pipeline::{IterProducer, Pipeline, PipelineEvent, Progress, WorkProducer};
pub use pool::WorkerPool;
pub use queue::OperationQueue;
pub use retry::{Backoff, RetryPolicy};
pub use status::{OpState, OpStatus};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the guard when a worker panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
