use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error, warn};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::OpqueError;
use crate::op::{OpFuture, OpShared};
use crate::status::OpStatus;

/// Executor that runs operation bodies on the tokio runtime it was created in.
///
/// An unbounded pool dispatches every operation as soon as it starts. A
/// bounded pool lets at most `limit` operation bodies run at once; the rest
/// stay `Pending` until a permit frees up.
#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    limiter: Option<Arc<Semaphore>>,
    limit: Option<usize>,
    runtime: Handle,
}

impl WorkerPool {
    pub fn unbounded(name: &str) -> Result<Self, OpqueError> {
        let runtime = Self::current_runtime(name)?;
        Ok(Self::with_runtime(name, None, runtime))
    }

    pub fn bounded(name: &str, limit: usize) -> Result<Self, OpqueError> {
        let runtime = Self::current_runtime(name)?;
        Ok(Self::with_runtime(name, Some(limit), runtime))
    }

    pub fn with_runtime(name: &str, limit: Option<usize>, runtime: Handle) -> Self {
        let limit = limit.map(|n| {
            if n == 0 {
                warn!("worker pool {name} created with limit 0, using 1");
                1
            } else {
                n
            }
        });
        Self {
            name: Arc::from(name),
            limiter: limit.map(|n| Arc::new(Semaphore::new(n))),
            limit,
            runtime,
        }
    }

    fn current_runtime(name: &str) -> Result<Handle, OpqueError> {
        Handle::try_current().map_err(|_| OpqueError::NoRuntime(name.to_owned()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concurrency cap, `None` for an unbounded pool.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn dispatch(&self, shared: Arc<OpShared>, work: OpFuture) {
        let limiter = self.limiter.clone();
        let name = self.name.clone();
        self.runtime.spawn(async move {
            let _permit = match limiter {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!("worker pool {name} closed before operation id={} ran", shared.id);
                        shared.complete(OpStatus::failure());
                        return;
                    }
                },
                None => None,
            };
            shared.mark_running();
            debug!("pool {name} running operation id={}", shared.id);
            let status = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(status) => status,
                Err(_) => {
                    error!("operation id={} panicked in pool {name}", shared.id);
                    OpStatus::failure()
                }
            };
            shared.complete(status);
        });
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::op::{FreeMode, Operation};

    #[test]
    fn test_pool_requires_runtime() {
        assert!(matches!(
            WorkerPool::unbounded("orphan"),
            Err(OpqueError::NoRuntime(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_pool_caps_concurrency() {
        let pool = WorkerPool::bounded("capped", 3).unwrap();
        assert_eq!(pool.limit(), Some(3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ops: Vec<Operation> = (0..20)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                Operation::submit(&pool, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    OpStatus::success()
                })
            })
            .collect();

        for op in ops {
            assert!(op.wait().await.is_success());
            op.free(FreeMode::Destroy);
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped() {
        let pool = WorkerPool::bounded("zero", 0).unwrap();
        assert_eq!(pool.limit(), Some(1));
        let op = Operation::submit(&pool, async { OpStatus::success() });
        assert!(op.sync_exec().await.is_success());
    }
}
