use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::limiter::RateLimiter;

struct State<T> {
    /// FIFO of items ready to be handed out. Every entry is also in `dirty`.
    queue: VecDeque<T>,
    /// Items that need processing (queued, or parked behind a processing copy).
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    /// Earliest pending delayed add per item.
    waiting: FxHashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    /// Fired by `done` whenever `processing` becomes empty.
    idle: Notify,
}

/// Cap for delayed adds, so the deadline never overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deduplicating FIFO work queue. Cheap to clone; clones share the queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    waiting: FxHashMap::default(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `item` as needing processing. No-op if it is already pending or
    /// the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut st = self.inner.state.lock();
        if st.shutting_down {
            return;
        }
        if !st.dirty.insert(item.clone()) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.inner.name.clone());
        if st.processing.contains(&item) {
            // delivered again once the current holder calls `done`
            return;
        }
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
        drop(st);
        self.inner.ready.notify_one();
    }

    /// Add `item` once `delay` has elapsed. Of several pending delayed adds
    /// for the same item only the earliest is kept.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready_at = Instant::now() + delay.min(FAR_FUTURE);
        {
            let mut st = self.inner.state.lock();
            if st.shutting_down {
                return;
            }
            if matches!(st.waiting.get(&item), Some(at) if *at <= ready_at) {
                return;
            }
            st.waiting.insert(item.clone(), ready_at);
        }
        trace!(queue = %self.inner.name, delay_ms = delay.as_millis() as u64, "delayed add");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let due = {
                let mut st = queue.inner.state.lock();
                if st.waiting.get(&item) == Some(&ready_at) {
                    st.waiting.remove(&item);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(item);
            }
        });
    }

    /// Wait for the next item. Returns `None` once the queue is shutting down
    /// and has nothing left to hand out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing `item`. If it was added again meanwhile it goes back
    /// on the queue.
    pub fn done(&self, item: &T) {
        let mut st = self.inner.state.lock();
        st.processing.remove(item);
        if st.processing.is_empty() {
            self.inner.idle.notify_waiters();
        }
        if !st.dirty.contains(item) {
            return;
        }
        st.queue.push_back(item.clone());
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
        drop(st);
        self.inner.ready.notify_one();
    }

    /// Stop accepting adds and wake every waiter. Items still queued are
    /// handed out before `get` starts returning `None`.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        debug!(queue = %self.inner.name, "work queue shutting down");
        self.inner.ready.notify_waiters();
    }

    /// [`shutdown`](Self::shutdown), then wait until no item is being
    /// processed.
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.state.lock().processing.is_empty() {
                break;
            }
            idle.await;
        }
        debug!(queue = %self.inner.name, "work queue drained");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, item: &T) -> bool {
        self.inner.state.lock().processing.contains(item)
    }
}

/// Work queue whose retries are delayed by a [`RateLimiter`].
pub struct RateLimitingQueue<T> {
    queue: WorkQueue<T>,
    limiter: Arc<dyn RateLimiter<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self { queue: self.queue.clone(), limiter: Arc::clone(&self.limiter) }
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self { queue: WorkQueue::new(name), limiter: Arc::new(limiter) }
    }

    /// Add `item` after the delay the limiter assigns to it.
    pub fn add_rate_limited(&self, item: T) {
        if self.queue.is_shutting_down() {
            return;
        }
        let delay = self.limiter.when(&item);
        counter!("workqueue_rate_limited_adds_total", 1u64, "name" => self.queue.name().to_string());
        self.queue.add_after(item, delay);
    }

    /// Clear the limiter's history for `item`. Call after a successful pass.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    pub fn add(&self, item: T) {
        self.queue.add(item)
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay)
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item)
    }

    pub fn shutdown(&self) {
        self.queue.shutdown()
    }

    pub async fn shutdown_with_drain(&self) {
        self.queue.shutdown_with_drain().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_processing(&self, item: &T) -> bool {
        self.queue.is_processing(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = WorkQueue::new("test");
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readd_while_processing_is_parked_until_done() {
        let q = WorkQueue::new("test");
        q.add("a");
        let item = q.get().await.unwrap();
        assert!(q.is_processing(&item));

        q.add("a");
        q.add("a");
        // not handed out while the first copy is held
        assert!(q.is_empty());

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert!(!q.is_processing(&"a"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = WorkQueue::new("test");
        q.add(1);
        q.add(2);
        q.shutdown();
        q.add(3);
        assert_eq!(q.get().await, Some(1));
        assert_eq!(q.get().await, Some(2));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q: WorkQueue<u32> = WorkQueue::new("test");
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.shutdown();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("getter woke").unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn drain_waits_for_held_items() {
        let q = WorkQueue::new("test");
        q.add("a");
        let item = q.get().await.unwrap();
        let drain = tokio::spawn({
            let q = q.clone();
            async move { q.shutdown_with_drain().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished(), "drain returned while an item was held");
        assert!(q.is_shutting_down());

        q.done(&item);
        tokio::time::timeout(Duration::from_secs(1), drain).await.expect("drain finished").unwrap();
    }

    #[tokio::test]
    async fn drain_of_idle_queue_returns_at_once() {
        let q: WorkQueue<u32> = WorkQueue::new("test");
        tokio::time::timeout(Duration::from_secs(1), q.shutdown_with_drain()).await.expect("idle queue drains");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_delay_does_not_overflow_the_clock() {
        let q = WorkQueue::new("test");
        q.add_after("a", Duration::MAX);
        tokio::task::yield_now().await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_becomes_visible_after_delay() {
        let q = WorkQueue::new("test");
        q.add_after("a", Duration::from_millis(100));
        tokio::task::yield_now().await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_delayed_add_wins() {
        let q = WorkQueue::new("test");
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        // the superseded 10s timer must not add it again
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(q.is_empty());
    }
}
