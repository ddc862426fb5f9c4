//! Fanout Hub (component B).
//!
//! Distributes captured audio blocks to a dynamic set of subscribers with
//! bounded queueing. The capture callback runs off the async scheduler;
//! this hub's queue is only ever touched by tasks running on it, so the
//! callback posts new blocks in rather than mutating the queue itself (see
//! [`crate::capture`]).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{AudioCaptureSource, BlockSink};
use crate::config::CaptureConfig;
use crate::error::CaptureOpenError;

/// A push function invoked once per distributed block. Errors are logged
/// and swallowed; a failing subscriber never blocks the others beyond the
/// single `await` for its own push to resolve.
pub type PushFn = Box<dyn Fn(Bytes) -> futures::future::BoxFuture<'static, Result<(), ()>> + Send + Sync>;

struct Subscriber {
    push: PushFn,
}

struct Queue {
    blocks: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Drop-oldest on overflow. Only ever called from a task running on the
    /// scheduler (see [`FanoutHub::start`]'s sink closure), never from the
    /// capture driver thread.
    fn push(&self, block: Bytes) {
        let mut blocks = self.blocks.lock();
        if blocks.len() >= self.capacity {
            blocks.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(total_dropped = total, "hub queue full, dropped oldest block");
        }
        blocks.push_back(block);
        drop(blocks);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Bytes {
        loop {
            if let Some(block) = self.blocks.lock().pop_front() {
                return block;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single-producer/multi-consumer audio block distributor.
///
/// `start()`/`stop()` are idempotent. A hub either has an active capture
/// source and a running distributor, or neither.
pub struct FanoutHub {
    queue: Arc<Queue>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    running: parking_lot::Mutex<Option<RunningState>>,
}

struct RunningState {
    capture: AudioCaptureSource,
    distributor: JoinHandle<()>,
}

struct QueueSink {
    queue: Arc<Queue>,
}

impl BlockSink for QueueSink {
    fn on_block(&self, block: Bytes) {
        self.queue.push(block);
    }
}

impl FanoutHub {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            queue: Arc::new(Queue::new(config.fanout_queue_capacity as usize)),
            subscribers: Arc::new(DashMap::new()),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Opens the capture source and spawns the distributor task. Re-entry
    /// while already running is a no-op.
    pub fn start(&self, config: &CaptureConfig) -> Result<(), CaptureOpenError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let sink = Arc::new(QueueSink {
            queue: Arc::clone(&self.queue),
        });
        let handle = tokio::runtime::Handle::current();
        let capture = AudioCaptureSource::start(config, sink, handle)?;

        let queue = Arc::clone(&self.queue);
        let subscribers = Arc::clone(&self.subscribers);
        let distributor = tokio::spawn(async move {
            distribute(queue, subscribers).await;
        });

        *running = Some(RunningState {
            capture,
            distributor,
        });
        info!("fanout hub started");
        Ok(())
    }

    /// Idempotent. Stops capture, cancels the distributor, clears
    /// subscribers.
    pub fn stop(&self) {
        let mut running = self.running.lock();
        if let Some(mut state) = running.take() {
            state.capture.stop();
            state.distributor.abort();
            self.subscribers.clear();
            info!("fanout hub stopped");
        }
    }

    /// Adds or replaces the push record for `id`.
    pub fn subscribe(&self, id: u64, push: PushFn) {
        self.subscribers.insert(id, Subscriber { push });
    }

    /// Removes the record for `id`; absence is logged, not fatal.
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_none() {
            warn!(subscriber_id = id, "unsubscribe for unknown subscriber id");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

async fn distribute(queue: Arc<Queue>, subscribers: Arc<DashMap<u64, Subscriber>>) {
    loop {
        let block = queue.pop().await;
        let pushes: Vec<_> = subscribers
            .iter()
            .map(|entry| (entry.push)(block.clone()))
            .collect();
        let results = join_all(pushes).await;
        for result in results {
            if result.is_err() {
                debug!("subscriber push failed, swallowed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn push_fn_counting(counter: Arc<AtomicUsize>) -> PushFn {
        Box::new(move |_block| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn queue_never_exceeds_capacity() {
        let queue = Queue::new(4);
        for i in 0..10 {
            queue.push(Bytes::from(vec![i as u8]));
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.dropped_count(), 6);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent_blocks() {
        let queue = Queue::new(2);
        queue.push(Bytes::from_static(b"a"));
        queue.push(Bytes::from_static(b"b"));
        queue.push(Bytes::from_static(b"c"));
        assert_eq!(queue.pop().await, Bytes::from_static(b"b"));
        assert_eq!(queue.pop().await, Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn subscriber_added_after_blocks_pushed_does_not_see_stale_data() {
        let queue = Arc::new(Queue::new(16));
        let subscribers: Arc<DashMap<u64, Subscriber>> = Arc::new(DashMap::new());

        queue.push(Bytes::from_static(b"before"));

        let counter = Arc::new(AtomicUsize::new(0));
        subscribers.insert(1, Subscriber {
            push: push_fn_counting(Arc::clone(&counter)),
        });

        let distributor = {
            let queue = Arc::clone(&queue);
            let subscribers = Arc::clone(&subscribers);
            tokio::spawn(async move { distribute(queue, subscribers).await })
        };

        queue.push(Bytes::from_static(b"after"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        distributor.abort();

        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_does_not_panic() {
        let config = CaptureConfig::default();
        let hub = FanoutHub::new(&config);
        hub.unsubscribe(999);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_removes_record() {
        let config = CaptureConfig::default();
        let hub = FanoutHub::new(&config);
        hub.subscribe(1, push_fn_counting(Arc::new(AtomicUsize::new(0))));
        assert_eq!(hub.subscriber_count(), 1);
        hub.unsubscribe(1);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
