//! Bounded-concurrency pipeline over an [`OperationQueue`].
//!
//! A pipeline pulls work items from a [`WorkProducer`], keeps at most `limit`
//! of them in flight, and reports completions one at a time. Each in-flight
//! operation is bound to a slot; the slot index travels as the operation's
//! correlation id and is the only thing used to find the originating item
//! again.

use async_trait::async_trait;
use log::{debug, error};

use crate::op::{FreeMode, Operation};
use crate::queue::OperationQueue;
use crate::status::OpStatus;

#[async_trait]
pub trait WorkProducer: Send {
    type Item: Send + 'static;

    /// Next work item, `None` once the source is exhausted.
    async fn next_item(&mut self) -> Option<Self::Item>;

    /// Builds the (not yet started) operation that processes `item`.
    fn launch(&self, item: &Self::Item) -> Operation;
}

/// Adapts a plain iterator and a launch closure into a [`WorkProducer`].
pub struct IterProducer<I, F> {
    items: I,
    launch: F,
}

impl<I, F> IterProducer<I, F> {
    pub fn new(items: I, launch: F) -> Self {
        Self { items, launch }
    }
}

#[async_trait]
impl<I, F> WorkProducer for IterProducer<I, F>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
    F: Fn(&I::Item) -> Operation + Send,
{
    type Item = I::Item;

    async fn next_item(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn launch(&self, item: &Self::Item) -> Operation {
        (self.launch)(item)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    NotStarted,
    Running,
    SourceExhausted,
}

#[derive(Debug)]
pub enum PipelineEvent<T> {
    Completed { item: T, status: OpStatus },
    /// Producer exhausted and nothing left in flight.
    Finished,
}

pub struct Pipeline<P: WorkProducer> {
    producer: P,
    queue: OperationQueue,
    slots: Vec<Option<P::Item>>,
    free_slots: Vec<usize>,
    progress: Progress,
    completed: u64,
}

impl<P: WorkProducer> Pipeline<P> {
    pub fn new(producer: P, limit: usize) -> Self {
        Self {
            producer,
            queue: OperationQueue::new(),
            slots: (0..limit).map(|_| None).collect(),
            // popped from the back, so slot 0 is bound first
            free_slots: (0..limit).rev().collect(),
            progress: Progress::NotStarted,
            completed: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Number of items whose operation has been reaped.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Reports the next completion, refilling its slot first.
    pub async fn next(&mut self) -> PipelineEvent<P::Item> {
        if self.progress == Progress::NotStarted {
            self.progress = Progress::Running;
            self.queue.start_execution();
            self.fill().await;
        }

        loop {
            if self.in_flight() == 0 {
                return PipelineEvent::Finished;
            }
            let Some(op) = self.queue.wait_any().await else {
                return PipelineEvent::Finished;
            };
            let status = op.status();
            let slot = op.my_id();
            op.free(FreeMode::Destroy);

            let item = usize::try_from(slot)
                .ok()
                .and_then(|s| self.slots.get_mut(s).map(|entry| (s, entry.take())));
            let (slot, item) = match item {
                Some((slot, Some(item))) => (slot, item),
                _ => {
                    error!("pipeline reaped operation with unbound slot {slot}");
                    continue;
                }
            };
            self.free_slots.push(slot);
            self.completed += 1;

            if self.progress == Progress::Running {
                self.start_next().await;
            }
            return PipelineEvent::Completed { item, status };
        }
    }

    /// Waits for everything still in flight and releases the slots.
    pub async fn drain(mut self) -> P {
        while let Some(op) = self.queue.wait_any().await {
            let slot = op.my_id();
            op.free(FreeMode::Destroy);
            if let Some(entry) = usize::try_from(slot).ok().and_then(|s| self.slots.get_mut(s)) {
                entry.take();
            }
        }
        debug!("pipeline drained after {} completions", self.completed);
        self.producer
    }

    async fn fill(&mut self) {
        while !self.free_slots.is_empty() && self.progress == Progress::Running {
            self.start_next().await;
        }
    }

    async fn start_next(&mut self) {
        let Some(slot) = self.free_slots.pop() else {
            return;
        };
        match self.producer.next_item().await {
            Some(item) => {
                let op = self.producer.launch(&item);
                op.set_my_id(slot as i64);
                self.slots[slot] = Some(item);
                self.queue.add(op);
            }
            None => {
                self.progress = Progress::SourceExhausted;
                self.free_slots.push(slot);
            }
        }
    }
}
