use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use libopque::{
    IterProducer, OpState, OpStatus, Operation, Pipeline, PipelineEvent, Progress, WorkProducer,
    WorkerPool,
};
use tokio::time::timeout;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

fn tracked_op(pool: &WorkerPool, gauge: &Arc<Gauge>, item: usize) -> Operation {
    let gauge = gauge.clone();
    Operation::new(pool, async move {
        let now = gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis((item % 4) as u64)).await;
        gauge.running.fetch_sub(1, Ordering::SeqCst);
        if item % 5 == 4 {
            OpStatus::failure_with(item as i32)
        } else {
            OpStatus::success_with(item as i32)
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_reports_every_item_once() {
    init_logger();
    let pool = WorkerPool::unbounded("pipeline").unwrap();
    for limit in [1usize, 3, 8] {
        for total in [0usize, 1, 10, 25] {
            let gauge = Arc::new(Gauge::default());
            let producer = {
                let pool = pool.clone();
                let gauge = gauge.clone();
                IterProducer::new(0..total, move |item: &usize| {
                    tracked_op(&pool, &gauge, *item)
                })
            };
            let mut pipeline = Pipeline::new(producer, limit);
            let mut seen = HashSet::new();
            loop {
                assert!(pipeline.in_flight() <= limit);
                let event = timeout(Duration::from_secs(10), pipeline.next())
                    .await
                    .unwrap();
                match event {
                    PipelineEvent::Completed { item, status } => {
                        assert_eq!(status.error_code, item as i32);
                        if item % 5 == 4 {
                            assert_eq!(status.state, OpState::Failed);
                        }
                        assert!(seen.insert(item), "item {item} reported twice");
                    }
                    PipelineEvent::Finished => break,
                }
            }
            assert_eq!(seen.len(), total);
            assert_eq!(pipeline.completed(), total as u64);
            assert!(gauge.peak.load(Ordering::SeqCst) <= limit.min(total.max(1)));
            assert!(matches!(pipeline.next().await, PipelineEvent::Finished));
        }
    }
}

struct NeverCalled {
    pulls: Arc<AtomicUsize>,
    pool: WorkerPool,
}

#[async_trait]
impl WorkProducer for NeverCalled {
    type Item = u32;

    async fn next_item(&mut self) -> Option<u32> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Some(1)
    }

    fn launch(&self, _item: &u32) -> Operation {
        Operation::new(&self.pool, async { OpStatus::success() })
    }
}

#[tokio::test]
async fn test_zero_limit_finishes_immediately() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let producer = NeverCalled {
        pulls: pulls.clone(),
        pool: WorkerPool::unbounded("zero").unwrap(),
    };
    let mut pipeline = Pipeline::new(producer, 0);
    let event = timeout(Duration::from_millis(200), pipeline.next())
        .await
        .unwrap();
    assert!(matches!(event, PipelineEvent::Finished));
    assert_eq!(pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_producer_finishes_immediately() {
    let pool = WorkerPool::unbounded("empty").unwrap();
    let producer = IterProducer::new(std::iter::empty::<u8>(), move |_: &u8| {
        Operation::new(&pool, async { OpStatus::success() })
    });
    let mut pipeline = Pipeline::new(producer, 4);
    let event = timeout(Duration::from_millis(200), pipeline.next())
        .await
        .unwrap();
    assert!(matches!(event, PipelineEvent::Finished));
    assert_eq!(pipeline.progress(), Progress::SourceExhausted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_reaps_in_flight() {
    let pool = WorkerPool::unbounded("drain").unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let producer = {
        let finished = finished.clone();
        IterProducer::new(0..10u32, move |_: &u32| {
            let finished = finished.clone();
            Operation::new(&pool, async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                OpStatus::success()
            })
        })
    };
    let mut pipeline = Pipeline::new(producer, 4);
    assert!(matches!(
        pipeline.next().await,
        PipelineEvent::Completed { .. }
    ));
    assert_eq!(pipeline.in_flight(), 4);
    timeout(Duration::from_secs(5), pipeline.drain()).await.unwrap();
    // one reported, one refilled plus three still running when drained
    assert_eq!(finished.load(Ordering::SeqCst), 5);
}
