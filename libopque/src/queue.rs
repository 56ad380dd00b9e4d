use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::lock;
use crate::op::{FreeMode, OpShared, Operation};
use crate::status::OpStatus;

/// A set of operations that are waited on together.
///
/// Members can be added at any time, including while another task is
/// suspended in [`OperationQueue::wait_any`]; the waiter observes the new
/// arrival. Completed members are handed back one by one and are then owned
/// by the caller again.
pub struct OperationQueue {
    completed_tx: UnboundedSender<u64>,
    /// Ids of resolved members, in completion order.
    completed_rx: tokio::sync::Mutex<UnboundedReceiver<u64>>,
    members: Mutex<Members>,
}

#[derive(Default)]
struct Members {
    ops: HashMap<u64, Operation>,
    started: bool,
    /// Failures among members already handed out by `wait_any`.
    reaped_failed: usize,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            completed_tx: tx,
            completed_rx: tokio::sync::Mutex::new(rx),
            members: Mutex::new(Members::default()),
        }
    }

    /// Adds an operation. Once the queue has been started the operation is
    /// dispatched right away.
    pub fn add(&self, op: Operation) {
        let shared = op.shared().clone();
        let started = {
            let mut members = lock(&self.members);
            members.ops.insert(shared.id, op);
            // Registered while the member lock is held, so a reaper that
            // receives this id always finds the member.
            shared.attach(self.completed_tx.clone());
            members.started
        };
        if started {
            shared.start();
        }
    }

    /// Dispatches every member added so far and every member added later.
    pub fn start_execution(&self) {
        let pending: Vec<Arc<OpShared>> = {
            let mut members = lock(&self.members);
            if members.started {
                return;
            }
            members.started = true;
            members.ops.values().map(|op| op.shared().clone()).collect()
        };
        debug!("queue started with {} operations", pending.len());
        for shared in pending {
            shared.start();
        }
    }

    /// Members that have not been handed back yet.
    pub fn tasks_left(&self) -> usize {
        lock(&self.members).ops.len()
    }

    /// Waits for any member to resolve and hands it back.
    ///
    /// Returns `None` as soon as the queue holds no members; the queue has no
    /// separate notion of being closed.
    pub async fn wait_any(&self) -> Option<Operation> {
        self.start_execution();
        let mut completed = self.completed_rx.lock().await;
        loop {
            if self.tasks_left() == 0 {
                return None;
            }
            let id = completed.recv().await?;
            let reaped = {
                let mut members = lock(&self.members);
                let op = members.ops.remove(&id);
                if let Some(op) = &op {
                    if !op.status().is_success() {
                        members.reaped_failed += 1;
                    }
                }
                op
            };
            if reaped.is_some() {
                return reaped;
            }
        }
    }

    /// Waits until every member has resolved. Members stay in the queue and
    /// can still be reaped with `wait_any`.
    ///
    /// Succeeds only if every operation ever added succeeded; the failure
    /// error code is the number of failed operations.
    pub async fn wait_all(&self) -> OpStatus {
        self.start_execution();
        loop {
            let unresolved: Vec<Arc<OpShared>> = {
                let members = lock(&self.members);
                members
                    .ops
                    .values()
                    .filter(|op| !op.status().is_resolved())
                    .map(|op| op.shared().clone())
                    .collect()
            };
            if unresolved.is_empty() {
                break;
            }
            for shared in unresolved {
                shared.wait().await;
            }
        }

        let failed = {
            let members = lock(&self.members);
            members.reaped_failed
                + members
                    .ops
                    .values()
                    .filter(|op| !op.status().is_success())
                    .count()
        };
        if failed == 0 {
            OpStatus::success()
        } else {
            OpStatus::failure_with(i32::try_from(failed).unwrap_or(i32::MAX))
        }
    }

    /// Drains the queue and releases every remaining member with `mode`.
    pub async fn free(self, mode: FreeMode) -> OpStatus {
        let status = self.wait_all().await;
        while let Some(op) = self.wait_any().await {
            op.free(mode);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;
    use crate::pool::WorkerPool;
    use crate::status::OpState;

    #[tokio::test]
    async fn test_wait_any_on_empty_queue() {
        let q = OperationQueue::new();
        q.start_execution();
        let res = timeout(Duration::from_millis(200), q.wait_any()).await;
        assert!(res.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_all_aggregates_failures() {
        let pool = WorkerPool::unbounded("q").unwrap();
        let q = OperationQueue::new();
        q.add(Operation::new(&pool, async { OpStatus::success() }));
        q.add(Operation::new(&pool, async { OpStatus::failure_with(4) }));
        q.add(Operation::new(&pool, async { OpStatus::success() }));

        let status = timeout(Duration::from_secs(5), q.wait_all()).await.unwrap();
        assert_eq!(status, OpStatus::failure_with(1));
        assert_eq!(q.tasks_left(), 3);

        let mut failed = 0;
        while let Some(op) = q.wait_any().await {
            if op.status().state == OpState::Failed {
                assert_eq!(op.status().error_code, 4);
                failed += 1;
            }
            op.free(FreeMode::Destroy);
        }
        assert_eq!(failed, 1);
        // reaped failures still count
        assert_eq!(q.wait_all().await, OpStatus::failure_with(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_while_waiting() {
        let pool = WorkerPool::unbounded("q").unwrap();
        let q = Arc::new(OperationQueue::new());
        q.start_execution();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = Operation::new(&pool, async move {
            let _ = release_rx.await;
            OpStatus::success()
        });
        slow.set_my_id(1);
        q.add(slow);

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_any().await.map(|op| op.my_id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast = Operation::new(&pool, async { OpStatus::success() });
        fast.set_my_id(2);
        q.add(fast);

        let first = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(first, Some(2));

        release_tx.send(()).unwrap();
        let second = timeout(Duration::from_secs(5), q.wait_any()).await.unwrap();
        assert_eq!(second.map(|op| op.my_id()), Some(1));
        assert!(q.wait_any().await.is_none());
    }

    #[tokio::test]
    async fn test_members_wait_for_start() {
        let pool = WorkerPool::unbounded("q").unwrap();
        let q = OperationQueue::new();
        q.add(Operation::new(&pool, async { OpStatus::success() }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.wait_all().await.is_success());
        assert!(q.free(FreeMode::Destroy).await.is_success());
    }

    #[tokio::test]
    async fn test_already_resolved_member() {
        let q = OperationQueue::new();
        q.add(Operation::completed(OpStatus::success_with(9)));
        let op = timeout(Duration::from_secs(1), q.wait_any())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.status().error_code, 9);
    }
}
