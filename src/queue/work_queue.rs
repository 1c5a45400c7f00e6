//! Deduplicating Rate-Limited Work Queue
//!
//! Guarantees, for every key:
//!
//! 1. It appears at most once in the pending queue
//! 2. At most one worker holds it between [`WorkQueue::get`] and
//!    [`WorkQueue::done`]
//! 3. Adding it while it is held produces exactly one follow-up delivery
//!    after `done`, however many times it was added

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::rate_limiter::{default_controller_rate_limiter, RateLimiter};

#[derive(Debug)]
struct State<T> {
    /// Keys waiting to be handed out, in FIFO order
    queue: VecDeque<T>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<T>,
    /// Keys currently held by a worker
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    name: String,
}

/// Work queue shared between the event forwarder and the workers.
///
/// Cheap to clone; all clones refer to the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a queue with the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
                name: name.into(),
            }),
        }
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            trace!(queue = %self.shared.name, ?item, "Coalesced duplicate add");
            return;
        }
        if state.processing.contains(&item) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(&item);
        trace!(queue = %self.shared.name, ?item, ?delay, "Requeue with backoff");
        self.add_after(item, delay);
    }

    /// Reset the rate limiter's backoff for `item`.
    pub fn forget(&self, item: &T) {
        self.shared.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.num_requeues(item)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shutting down and nothing is left.
    /// Every `Some(item)` must be paired with exactly one [`Self::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add cannot be missed
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `item` after processing.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stop accepting new items and wake every waiting worker.
    ///
    /// Items already queued are still handed out by [`Self::get`].
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}
