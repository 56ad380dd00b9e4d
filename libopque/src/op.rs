use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use log::warn;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::lock;
use crate::pool::WorkerPool;
use crate::status::{OpState, OpStatus};

pub(crate) type OpFuture = BoxFuture<'static, OpStatus>;
type Destructor = Box<dyn FnOnce() + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What to do with the work argument when a handle is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeMode {
    /// Release the handle only.
    Keep,
    /// Release the handle and run its destructor hook.
    Destroy,
}

pub(crate) struct OpShared {
    pub(crate) id: u64,
    my_id: AtomicI64,
    inner: Mutex<OpInner>,
    status_tx: watch::Sender<OpStatus>,
}

struct OpInner {
    status: OpStatus,
    /// Present until the operation is dispatched to its pool.
    work: Option<(WorkerPool, OpFuture)>,
    /// Completion channel of the owning queue, if any.
    completion: Option<UnboundedSender<u64>>,
}

impl OpShared {
    fn new(status: OpStatus, work: Option<(WorkerPool, OpFuture)>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(status);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            my_id: AtomicI64::new(0),
            inner: Mutex::new(OpInner {
                status,
                work,
                completion: None,
            }),
            status_tx,
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let work = lock(&self.inner).work.take();
        if let Some((pool, fut)) = work {
            pool.dispatch(self.clone(), fut);
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut inner = lock(&self.inner);
        if inner.status.state == OpState::Pending {
            inner.status.state = OpState::Running;
            self.status_tx.send_replace(inner.status);
        }
    }

    pub(crate) fn complete(&self, status: OpStatus) {
        let status = if status.is_resolved() {
            status
        } else {
            warn!(
                "operation id={} returned unresolved state {:?}, marking failed",
                self.id, status.state
            );
            OpStatus::failure_with(status.error_code)
        };
        let completion = {
            let mut inner = lock(&self.inner);
            inner.status = status;
            inner.completion.take()
        };
        self.status_tx.send_replace(status);
        if let Some(tx) = completion {
            // The queue may already be gone; nobody is left to reap us then.
            let _ = tx.send(self.id);
        }
    }

    /// Registers the completion channel of a queue. A handle that already
    /// resolved is announced immediately, so every member is reported once.
    pub(crate) fn attach(&self, tx: UnboundedSender<u64>) {
        let mut inner = lock(&self.inner);
        if inner.status.is_resolved() {
            let _ = tx.send(self.id);
        } else {
            inner.completion = Some(tx);
        }
    }

    pub(crate) fn status(&self) -> OpStatus {
        lock(&self.inner).status
    }

    pub(crate) async fn wait(&self) -> OpStatus {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(OpStatus::is_resolved).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }
}

/// Handle to a deferred unit of work.
///
/// The handle is owned by whoever submitted it until it is reaped, and it is
/// released with [`Operation::free`] once its status has been observed.
pub struct Operation {
    shared: Arc<OpShared>,
    destructor: Option<Destructor>,
}

impl Operation {
    /// Creates a pending operation that runs on `pool` once started.
    pub fn new<F>(pool: &WorkerPool, work: F) -> Self
    where
        F: Future<Output = OpStatus> + Send + 'static,
    {
        Self {
            shared: OpShared::new(OpStatus::PENDING, Some((pool.clone(), work.boxed()))),
            destructor: None,
        }
    }

    /// Creates and immediately dispatches an operation. Never blocks.
    pub fn submit<F>(pool: &WorkerPool, work: F) -> Self
    where
        F: Future<Output = OpStatus> + Send + 'static,
    {
        let op = Self::new(pool, work);
        op.start();
        op
    }

    /// An operation that is already resolved with `status`.
    pub fn completed(status: OpStatus) -> Self {
        Self {
            shared: OpShared::new(status, None),
            destructor: None,
        }
    }

    /// Hook run when the handle is freed with [`FreeMode::Destroy`].
    pub fn with_destructor<D>(mut self, destructor: D) -> Self
    where
        D: FnOnce() + Send + Sync + 'static,
    {
        self.destructor = Some(Box::new(destructor));
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn set_my_id(&self, my_id: i64) {
        self.shared.my_id.store(my_id, Ordering::Release);
    }

    pub fn my_id(&self) -> i64 {
        self.shared.my_id.load(Ordering::Acquire)
    }

    pub fn status(&self) -> OpStatus {
        self.shared.status()
    }

    /// Dispatches the operation if it has not been dispatched yet.
    pub fn start(&self) {
        self.shared.start();
    }

    /// Waits until the operation resolves, starting it if needed.
    pub async fn wait(&self) -> OpStatus {
        self.start();
        self.shared.wait().await
    }

    /// Runs the operation to completion and releases it.
    pub async fn sync_exec(self) -> OpStatus {
        let status = self.wait().await;
        self.free(FreeMode::Destroy);
        status
    }

    pub fn free(mut self, mode: FreeMode) {
        if mode == FreeMode::Destroy {
            if let Some(destructor) = self.destructor.take() {
                destructor();
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<OpShared> {
        &self.shared
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("my_id", &self.my_id())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_submit_and_wait() {
        let pool = WorkerPool::unbounded("test").unwrap();
        let op = Operation::submit(&pool, async { OpStatus::success_with(7) });
        let status = timeout(Duration::from_secs(5), op.wait()).await.unwrap();
        assert_eq!(status, OpStatus::success_with(7));
        assert_eq!(op.status(), status);
        op.free(FreeMode::Destroy);
    }

    #[tokio::test]
    async fn test_pending_until_started() {
        let pool = WorkerPool::unbounded("test").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let op = Operation::new(&pool, async move {
            flag.store(true, Ordering::SeqCst);
            OpStatus::success()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(op.status().state, OpState::Pending);

        // wait() dispatches a handle nobody started
        let status = op.sync_exec().await;
        assert!(status.is_success());
        assert!(ran.load(Ordering::SeqCst));
    }

    fn explode() -> OpStatus {
        panic!("worker blew up")
    }

    #[tokio::test]
    async fn test_panicking_work_marks_failed() {
        let pool = WorkerPool::unbounded("test").unwrap();
        let bad = Operation::submit(&pool, async { explode() });
        let good = Operation::submit(&pool, async { OpStatus::success() });
        assert_eq!(bad.wait().await.state, OpState::Failed);
        assert!(good.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_free_runs_destructor_only_on_destroy() {
        let pool = WorkerPool::unbounded("test").unwrap();
        let destroyed = Arc::new(AtomicBool::new(false));

        let flag = destroyed.clone();
        let op = Operation::submit(&pool, async { OpStatus::success() })
            .with_destructor(move || flag.store(true, Ordering::SeqCst));
        op.wait().await;
        op.free(FreeMode::Keep);
        assert!(!destroyed.load(Ordering::SeqCst));

        let flag = destroyed.clone();
        let op = Operation::submit(&pool, async { OpStatus::success() })
            .with_destructor(move || flag.store(true, Ordering::SeqCst));
        op.wait().await;
        op.free(FreeMode::Destroy);
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_completed_operation() {
        let op = Operation::completed(OpStatus::failure_with(5));
        assert_eq!(op.wait().await, OpStatus::failure_with(5));
        op.set_my_id(3);
        assert_eq!(op.my_id(), 3);
    }
}
