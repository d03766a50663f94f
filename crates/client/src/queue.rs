//! Bounded request queue in front of node selection.
//!
//! ```text
//! execute ──► queue empty? ──yes──► NodeSelection.maybe_execute ──Some──► call
//!                 │                          │
//!                 no                        None
//!                 ▼                          ▼
//!             enqueue (or QueueFull) ◄───────┘
//!                 │
//!                 ▼
//!         dispatch pass: pop head ──► maybe_execute ──Some──► hand call to waiter
//!                 ▲                        │
//!                 │                       None ──► head back, stop pass
//!                 │
//!   enqueue / dispatched call finished / stall timer
//! ```
//!
//! One pass runs at a time per queue. A trigger that arrives while a pass is
//! running makes that pass run again instead of starting a second one.
//!
//! Dispatched calls are handed to the waiting caller's future rather than
//! driven by the queue, so dropping the caller's future cancels the call on
//! the host.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
    time::Instant,
};

use dialogue_types::{
    CallError, Channel, Endpoint, LimitedChannel, Request, Response, ResponseFuture,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    clock::Clock,
    config::{ClientConfig, QueueFairness},
    metrics::ClientMetrics,
    refreshable::Refreshable,
};

struct QueueEntry {
    id: u64,
    endpoint: Endpoint,
    request: Request,
    slot: oneshot::Sender<ResponseFuture>,
    enqueued_at: Instant,
}

/// FIFO sub-queue. In FIFO mode there is a single lane with no key.
struct Lane {
    key: Option<Endpoint>,
    entries: VecDeque<QueueEntry>,
}

/// Waiting entries. `len` also counts the entry a dispatch pass has popped
/// and not yet settled, so capacity and the empty-queue fast path see it.
#[derive(Default)]
struct QueueState {
    lanes: VecDeque<Lane>,
    len: usize,
}

impl QueueState {
    fn push_back(&mut self, entry: QueueEntry, fairness: QueueFairness) {
        let key = match fairness {
            QueueFairness::Fifo => None,
            QueueFairness::RoundRobinByEndpoint => Some(entry.endpoint.clone()),
        };
        self.len += 1;
        if let Some(lane) = self.lanes.iter_mut().find(|lane| lane.key == key) {
            lane.entries.push_back(entry);
        } else {
            self.lanes.push_back(Lane { key, entries: VecDeque::from([entry]) });
        }
    }

    /// Pops the head of the front lane and rotates that lane to the back.
    ///
    /// The entry stays counted until [`settle`](Self::settle) or
    /// [`restore`](Self::restore).
    fn pop_front(&mut self) -> Option<QueueEntry> {
        let mut lane = self.lanes.pop_front()?;
        let entry = lane.entries.pop_front();
        if !lane.entries.is_empty() {
            self.lanes.push_back(lane);
        }
        entry
    }

    /// Stops counting a popped entry that was dispatched or abandoned.
    fn settle(&mut self) {
        self.len = self.len.saturating_sub(1);
    }

    /// Puts a rejected popped entry back at the head, undoing the lane
    /// rotation.
    fn restore(&mut self, entry: QueueEntry, fairness: QueueFairness) {
        let key = match fairness {
            QueueFairness::Fifo => None,
            QueueFairness::RoundRobinByEndpoint => Some(entry.endpoint.clone()),
        };
        let mut lane = match self.lanes.iter().position(|lane| lane.key == key) {
            Some(index) => self.lanes.remove(index).unwrap_or(Lane { key, entries: VecDeque::new() }),
            None => Lane { key, entries: VecDeque::new() },
        };
        lane.entries.push_front(entry);
        self.lanes.push_front(lane);
    }

    fn remove(&mut self, id: u64) -> bool {
        for index in 0..self.lanes.len() {
            let lane = &mut self.lanes[index];
            if let Some(position) = lane.entries.iter().position(|entry| entry.id == id) {
                lane.entries.remove(position);
                if lane.entries.is_empty() {
                    self.lanes.remove(index);
                }
                self.len -= 1;
                return true;
            }
        }
        false
    }

    fn drain(&mut self) -> Vec<QueueEntry> {
        self.len = 0;
        self.lanes.drain(..).flat_map(|lane| lane.entries).collect()
    }
}

struct QueueInner {
    delegate: Arc<dyn LimitedChannel>,
    config: Refreshable<ClientConfig>,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    /// Calls dispatched by this queue that have not finished.
    in_flight: AtomicUsize,
    running: AtomicBool,
    rerun: AtomicBool,
    stall_timer_armed: AtomicBool,
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
}

impl QueueInner {
    /// Requests a dispatch pass, running it on this thread unless another
    /// thread is already dispatching.
    fn trigger(self: &Arc<Self>) {
        self.rerun.store(true, Ordering::Release);
        loop {
            if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
                return;
            }
            while self.rerun.swap(false, Ordering::AcqRel) {
                self.pass();
            }
            self.running.store(false, Ordering::Release);
            if !self.rerun.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn pass(self: &Arc<Self>) {
        let fairness = self.config.get().queue.fairness;
        let mut stalled = false;
        loop {
            let Some(entry) = self.state.lock().pop_front() else {
                break;
            };
            if entry.slot.is_closed() || self.closed.load(Ordering::Acquire) {
                self.state.lock().settle();
                continue;
            }
            match self.delegate.maybe_execute(&entry.endpoint, &entry.request) {
                Some(call) => {
                    let waited = self.clock.now().saturating_duration_since(entry.enqueued_at);
                    tracing::debug!(
                        endpoint = %entry.endpoint,
                        waited_ms = waited.as_millis() as u64,
                        "dispatched queued call"
                    );
                    let call = self.track(call);
                    self.state.lock().settle();
                    // A waiter that went away drops the call here, which
                    // re-triggers dispatch through its guard.
                    drop(entry.slot.send(call));
                },
                None => {
                    let mut state = self.state.lock();
                    if self.closed.load(Ordering::Acquire) {
                        state.settle();
                        drop(state);
                        drop(entry);
                        break;
                    }
                    state.restore(entry, fairness);
                    stalled = true;
                    break;
                },
            }
        }
        self.metrics.record_queue_depth(self.state.lock().len);
        if stalled && self.in_flight.load(Ordering::Acquire) == 0 {
            self.arm_stall_timer();
        }
    }

    /// Schedules a pass after `stall_retry_delay` so hosts leaving the
    /// blacklist are noticed even when nothing completes.
    fn arm_stall_timer(self: &Arc<Self>) {
        if self.stall_timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.stall_timer_armed.store(false, Ordering::Release);
            tracing::debug!("queue stalled outside a tokio runtime, waiting for the next trigger");
            return;
        };
        let delay = self.config.get().queue.stall_retry_delay;
        let queue = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.stall_timer_armed.store(false, Ordering::Release);
                if !queue.closed.load(Ordering::Acquire) {
                    queue.trigger();
                }
            }
        });
    }

    fn track(self: &Arc<Self>, call: ResponseFuture) -> ResponseFuture {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Box::pin(TrackedCall { call, guard: Some(DispatchGuard { queue: Arc::downgrade(self) }) })
    }

    fn remove(&self, id: u64) {
        let mut state = self.state.lock();
        if state.remove(id) {
            tracing::debug!(id, "queued call cancelled before dispatch");
            self.metrics.record_queue_depth(state.len);
        }
    }
}

/// Triggers a dispatch pass when a dispatched call finishes or is dropped.
struct DispatchGuard {
    queue: Weak<QueueInner>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.in_flight.fetch_sub(1, Ordering::AcqRel);
            queue.trigger();
        }
    }
}

/// A dispatched call. The guard is released as soon as the call resolves, or
/// after the call itself when dropped early.
struct TrackedCall {
    call: ResponseFuture,
    guard: Option<DispatchGuard>,
}

impl Future for TrackedCall {
    type Output = Result<Response, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.call.as_mut().poll(cx));
        drop(this.guard.take());
        Poll::Ready(result)
    }
}

enum QueuedState {
    Waiting { id: u64, slot: oneshot::Receiver<ResponseFuture> },
    Running(ResponseFuture),
    Done,
}

/// Caller-side future of a queued call.
///
/// Dropping it before dispatch removes the entry from the queue.
struct QueuedCall {
    state: QueuedState,
    queue: Weak<QueueInner>,
}

impl Future for QueuedCall {
    type Output = Result<Response, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                QueuedState::Waiting { slot, .. } => match ready!(Pin::new(slot).poll(cx)) {
                    Ok(call) => this.state = QueuedState::Running(call),
                    Err(_) => {
                        this.state = QueuedState::Done;
                        return Poll::Ready(Err(CallError::Cancelled));
                    },
                },
                QueuedState::Running(call) => {
                    let result = ready!(call.as_mut().poll(cx));
                    this.state = QueuedState::Done;
                    return Poll::Ready(result);
                },
                QueuedState::Done => return Poll::Ready(Err(CallError::Cancelled)),
            }
        }
    }
}

impl Drop for QueuedCall {
    fn drop(&mut self) {
        if let QueuedState::Waiting { id, .. } = self.state
            && let Some(queue) = self.queue.upgrade()
        {
            queue.remove(id);
        }
    }
}

/// Channel that buffers calls no host can take right now.
///
/// Calls are attempted immediately while the queue is empty. Otherwise they
/// wait, in FIFO or per-endpoint round-robin order, until a dispatch pass
/// finds capacity. When the queue holds `capacity` entries further calls fail
/// with [`CallError::QueueFull`].
pub struct QueuedChannel {
    inner: Arc<QueueInner>,
}

impl QueuedChannel {
    /// Creates a queue in front of `delegate`.
    pub fn new(
        delegate: Arc<dyn LimitedChannel>,
        config: Refreshable<ClientConfig>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                delegate,
                config,
                state: Mutex::new(QueueState::default()),
                next_id: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                stall_timer_armed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                clock,
                metrics,
            }),
        }
    }

    /// Number of calls waiting for dispatch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().len
    }

    /// Returns true if no call is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls dispatched through this queue that are still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Rejects new calls and fails every waiting call with
    /// [`CallError::Cancelled`]. Calls already dispatched are unaffected.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self.inner.state.lock().drain();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelling queued calls on close");
        }
        drop(drained);
        self.inner.metrics.record_queue_depth(0);
    }
}

impl Channel for QueuedChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Box::pin(futures::future::ready(Err(CallError::Cancelled)));
        }

        let empty = inner.state.lock().len == 0;
        if empty && let Some(call) = inner.delegate.maybe_execute(endpoint, &request) {
            return inner.track(call);
        }

        let config = inner.config.get();
        let (tx, rx) = oneshot::channel();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = inner.state.lock();
            if state.len >= config.queue.capacity {
                drop(state);
                tracing::debug!(endpoint = %endpoint, capacity = config.queue.capacity, "queue full");
                let error = CallError::QueueFull { capacity: config.queue.capacity };
                return Box::pin(futures::future::ready(Err(error)));
            }
            let entry = QueueEntry {
                id,
                endpoint: endpoint.clone(),
                request,
                slot: tx,
                enqueued_at: inner.clock.now(),
            };
            state.push_back(entry, config.queue.fairness);
            inner.metrics.record_queue_depth(state.len);
        }
        tracing::debug!(endpoint = %endpoint, id, "queued call");

        let call = QueuedCall { state: QueuedState::Waiting { id, slot: rx }, queue: Arc::downgrade(inner) };
        inner.trigger();
        Box::pin(call)
    }
}

impl fmt::Debug for QueuedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedChannel")
            .field("len", &self.len())
            .field("in_flight", &self.in_flight())
            .field("delegate", &self.inner.delegate)
            .finish()
    }
}
