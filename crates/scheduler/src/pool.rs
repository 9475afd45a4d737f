//! Worker pools
//!
//! A pool owns a fixed set of native backend requests for one device group.
//! The bounded idle-index queue is the sole authority for worker
//! availability, which is what makes Bind (dispatching thread) and Finalize
//! (backend callback thread) mutually exclusive without a per-slot lock
//! around the whole inference.

use crossbeam::queue::SegQueue;
use devmux_backend::{BackendModel, BackendRequest, Blob, DeviceName};
use devmux_common::{DevMuxError, Result, METRICS};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::error;

/// Continuation stashed on a worker slot; the backend completion callback
/// invokes it exactly once.
pub(crate) type Completion = Box<dyn FnOnce() + Send>;

/// Hook a pool fires after returning a worker to the idle queue, so the
/// scheduler can drain a pending task onto the freed worker.
pub(crate) type IdleHook = Arc<dyn Fn(&DeviceName) + Send + Sync>;

/// A type-erased, exactly-once unit of work
///
/// The closure receives the worker the scheduler bound it to. Dropping an
/// unexecuted task is a bug, not a valid idle state; the drop handler makes
/// it loud.
pub struct Task {
    f: Option<Box<dyn FnOnce(WorkerHandle) + Send>>,
}

impl Task {
    pub fn new(f: impl FnOnce(WorkerHandle) + Send + 'static) -> Self {
        Self { f: Some(Box::new(f)) }
    }

    /// Consume the task, running it on the given worker
    pub fn run(mut self, worker: WorkerHandle) {
        let f = self.f.take().expect("task invoked twice");
        f(worker);
    }

    /// Deliberately discard the task without running it (teardown only)
    pub(crate) fn disarm(mut self) {
        self.f = None;
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.f.is_some() && !std::thread::panicking() {
            error!("inference task dropped without being run");
            debug_assert!(false, "inference task dropped without being run");
        }
    }
}

/// One-shot event other threads can block on
pub(crate) struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut set = self.state.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Re-arm the signal for reuse
    pub fn reset(&self) {
        *self.state.lock() = false;
    }
}

/// Bounded, closable queue of idle worker indices
///
/// Acts as a counting semaphore. Closing sets the capacity to zero so a
/// completion callback firing during teardown can never resurrect a slot.
pub(crate) struct IdleQueue {
    indices: Mutex<VecDeque<u32>>,
    capacity: AtomicUsize,
    returned: Condvar,
}

impl IdleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            indices: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
            returned: Condvar::new(),
        }
    }

    /// Returns false when the queue is full or closed
    pub fn try_push(&self, index: u32) -> bool {
        let mut indices = self.indices.lock();
        if indices.len() >= self.capacity.load(Ordering::Acquire) {
            return false;
        }
        indices.push_back(index);
        METRICS.scheduler.idle_workers.inc();
        self.returned.notify_all();
        true
    }

    pub fn try_pop(&self) -> Option<u32> {
        let index = self.indices.lock().pop_front()?;
        METRICS.scheduler.idle_workers.dec();
        Some(index)
    }

    /// Permanently close the queue; no index can be pushed afterwards
    pub fn close(&self) {
        self.capacity.store(0, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.indices.lock().len()
    }

    /// Block until an index is returned or the timeout elapses
    pub fn wait_return(&self, timeout: Duration) {
        let mut indices = self.indices.lock();
        if indices.is_empty() {
            self.returned.wait_for(&mut indices, timeout);
        }
    }

    #[cfg(test)]
    pub fn contains(&self, index: u32) -> bool {
        self.indices.lock().contains(&index)
    }
}

/// One pooled native request bound to one device
pub struct WorkerSlot {
    index: u32,
    device: DeviceName,
    request: Mutex<Box<dyn BackendRequest>>,
    completion: Mutex<Option<Completion>>,
    last_error: Mutex<Option<DevMuxError>>,
    infer_count: AtomicU64,
    busy: AtomicBool,
}

impl WorkerSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn infer_count(&self) -> u64 {
        self.infer_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_infer_count(&self) {
        self.infer_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_error(&self) -> Option<DevMuxError> {
        self.last_error.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// A worker that has been popped from the idle queue and is exclusively
/// owned by one logical request until its completion callback releases it
#[derive(Clone)]
pub struct WorkerHandle {
    slot: Arc<WorkerSlot>,
    pool: Weak<WorkerPool>,
}

impl WorkerHandle {
    pub fn device(&self) -> &DeviceName {
        &self.slot.device
    }

    pub fn blob(&self, name: &str) -> Result<Blob> {
        self.slot.request.lock().blob(name)
    }

    pub fn set_blob(&self, name: &str, blob: Blob) -> Result<()> {
        self.slot.request.lock().set_blob(name, blob)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.slot.request.lock().input_names()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.slot.request.lock().output_names()
    }

    pub fn take_error(&self) -> Option<DevMuxError> {
        self.slot.take_error()
    }

    pub fn bump_infer_count(&self) {
        self.slot.bump_infer_count();
    }

    /// Stash the completion continuation and start the backend call.
    ///
    /// On a synchronous start failure the continuation is pulled back out
    /// and the worker returns to the pool, since no callback will fire.
    pub fn execute(&self, completion: Completion) -> Result<()> {
        *self.slot.completion.lock() = Some(completion);
        let result = self.slot.request.lock().start_async();
        if result.is_err() {
            self.slot.completion.lock().take();
            self.release();
        }
        result
    }

    /// Return the worker unused (bind failure before the backend call)
    pub(crate) fn release(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(&self.slot);
        }
    }
}

/// Fixed-size collection of worker slots for one device group
pub struct WorkerPool {
    device: DeviceName,
    slots: Vec<Arc<WorkerSlot>>,
    idle: IdleQueue,
    pending: SegQueue<Task>,
    on_idle: IdleHook,
}

impl WorkerPool {
    /// Build `size` slots around native requests created from `model` and
    /// wire every request's callback back into the pool.
    pub fn new(
        device: DeviceName,
        model: &Arc<dyn BackendModel>,
        size: u32,
        on_idle: IdleHook,
    ) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(DevMuxError::internal(format!(
                "Worker pool for {} sized to zero",
                device
            )));
        }

        let mut slots = Vec::with_capacity(size as usize);
        for index in 0..size {
            let request = model.create_request()?;
            slots.push(Arc::new(WorkerSlot {
                index,
                device: device.clone(),
                request: Mutex::new(request),
                completion: Mutex::new(None),
                last_error: Mutex::new(None),
                infer_count: AtomicU64::new(0),
                busy: AtomicBool::new(false),
            }));
        }

        let pool = Arc::new(Self {
            device,
            slots,
            idle: IdleQueue::new(size as usize),
            pending: SegQueue::new(),
            on_idle,
        });

        for slot in &pool.slots {
            let callback = pool.completion_callback(slot);
            slot.request.lock().set_callback(callback);
            let pushed = pool.idle.try_push(slot.index);
            assert!(pushed, "freshly built idle queue rejected worker {}", slot.index);
        }

        Ok(pool)
    }

    /// The callback a backend fires when this slot's inference completes.
    ///
    /// Runs on the backend's own thread: it must capture the error rather
    /// than raise, hand the continuation its one invocation, and only then
    /// try to return the slot (which fails once teardown closed the queue).
    fn completion_callback(
        self: &Arc<Self>,
        slot: &Arc<WorkerSlot>,
    ) -> devmux_backend::CompletionCallback {
        let weak = Arc::downgrade(self);
        let slot = Arc::clone(slot);
        Box::new(move |err| {
            *slot.last_error.lock() = err;
            match slot.completion.lock().take() {
                Some(continuation) => continuation(),
                None => {
                    error!(
                        device = %slot.device,
                        worker = slot.index,
                        "completion fired with no continuation stashed"
                    );
                    debug_assert!(false, "completion fired with no continuation stashed");
                }
            }
            if let Some(pool) = weak.upgrade() {
                pool.recycle(&slot);
            }
        })
    }

    /// Return a slot to the idle queue and let the scheduler drain one
    /// pending task onto it. No-op once teardown closed the queue.
    pub(crate) fn recycle(&self, slot: &Arc<WorkerSlot>) {
        slot.busy.store(false, Ordering::Release);
        if self.idle.try_push(slot.index) {
            (self.on_idle)(&self.device);
        }
    }

    /// Non-blocking acquire of an idle worker
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerHandle> {
        let index = self.idle.try_pop()?;
        let slot = Arc::clone(&self.slots[index as usize]);
        let was_busy = slot.busy.swap(true, Ordering::AcqRel);
        // the idle queue is the sole authority; a busy slot in it means the
        // ownership invariant is broken and continuing would share the slot
        assert!(
            !was_busy,
            "worker {}/{} acquired while busy",
            self.device, index
        );
        Some(WorkerHandle {
            slot,
            pool: Arc::downgrade(self),
        })
    }

    pub(crate) fn push_pending(&self, task: Task) {
        self.pending.push(task);
    }

    pub(crate) fn pop_pending(&self) -> Option<Task> {
        self.pending.pop()
    }

    /// Close the idle queue; late completions can no longer re-enqueue
    pub fn shutdown(&self) {
        self.idle.close();
    }

    pub fn device(&self) -> &DeviceName {
        &self.device
    }

    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Sum of completed inferences across all slots
    pub fn total_infer_count(&self) -> u64 {
        self.slots.iter().map(|s| s.infer_count()).sum()
    }

    /// Pop every currently idle index; used by the helper reclaim task to
    /// detect that in-flight work has drained
    pub(crate) fn drain_idle(&self) -> usize {
        let mut drained = 0;
        while self.idle.try_pop().is_some() {
            drained += 1;
        }
        drained
    }

    /// Block until a worker is returned or the timeout elapses
    pub(crate) fn wait_return(&self, timeout: Duration) {
        self.idle.wait_return(timeout);
    }

    #[cfg(test)]
    pub(crate) fn slot(&self, index: u32) -> &Arc<WorkerSlot> {
        &self.slots[index as usize]
    }

    #[cfg(test)]
    pub(crate) fn idle_contains(&self, index: u32) -> bool {
        self.idle.contains(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_backend::mock::{MockCore, MockDevice};
    use devmux_backend::{BackendCore, ConfigMap};
    use std::sync::mpsc;
    use std::time::Instant;

    fn noop_hook() -> IdleHook {
        Arc::new(|_: &DeviceName| {})
    }

    fn pool_of(size: u32) -> Arc<WorkerPool> {
        let core = MockCore::new().with_device("CPU", MockDevice::new());
        let model = core.load_model("CPU", &ConfigMap::new()).unwrap();
        WorkerPool::new("CPU".to_string(), &model, size, noop_hook()).unwrap()
    }

    #[test]
    fn test_pool_starts_fully_idle() {
        let pool = pool_of(3);

        assert_eq!(pool.size(), 3);
        assert_eq!(pool.idle_len(), 3);
    }

    #[test]
    fn test_capacity_invariant_over_acquire_release() {
        let pool = pool_of(4);

        // acquire a few, checking idle + busy == size at every step
        let mut held = Vec::new();
        for _ in 0..3 {
            let worker = pool.try_acquire().unwrap();
            held.push(worker);
            let busy = (0..4).filter(|i| pool.slot(*i).is_busy()).count();
            assert_eq!(pool.idle_len() + busy, 4);
        }

        for worker in held.drain(..) {
            worker.release();
            let busy = (0..4).filter(|i| pool.slot(*i).is_busy()).count();
            assert_eq!(pool.idle_len() + busy, 4);
        }

        assert_eq!(pool.idle_len(), 4);
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let pool = pool_of(1);

        let worker = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        worker.release();
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_busy_slot_never_in_idle_queue() {
        let pool = pool_of(2);

        // randomized interleaving of acquires and releases
        let mut held: Vec<WorkerHandle> = Vec::new();
        let mut seed = 0x9e3779b9u32;
        for _ in 0..1000 {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            if seed % 2 == 0 && !held.is_empty() {
                held.swap_remove((seed as usize / 2) % held.len()).release();
            } else if let Some(worker) = pool.try_acquire() {
                held.push(worker);
            }
            for index in 0..2 {
                if pool.slot(index).is_busy() {
                    assert!(!pool.idle_contains(index));
                }
            }
        }
    }

    #[test]
    fn test_completion_runs_continuation_and_recycles() {
        let pool = pool_of(1);
        let worker = pool.try_acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        worker
            .execute(Box::new(move || {
                tx.send(()).unwrap();
            }))
            .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // the mock's callback thread recycles the worker shortly after
        let deadline = Instant::now() + Duration::from_secs(1);
        while pool.idle_len() == 0 {
            assert!(Instant::now() < deadline, "worker never returned to pool");
            pool.wait_return(Duration::from_millis(5));
        }
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn test_teardown_closes_idle_queue() {
        let pool = pool_of(1);
        let worker = pool.try_acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        worker
            .execute(Box::new(move || {
                tx.send(()).unwrap();
            }))
            .unwrap();

        // close the queue while the inference is in flight
        pool.shutdown();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // the post-shutdown completion must not resurrect the slot
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.idle_len(), 0);
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn test_captured_error_surfaces_on_fetch_not_on_callback() {
        let core = MockCore::new()
            .with_device("CPU", MockDevice::new().infer_error("bad tensor"));
        let model = core.load_model("CPU", &ConfigMap::new()).unwrap();
        let pool = WorkerPool::new("CPU".to_string(), &model, 1, noop_hook()).unwrap();

        let worker = pool.try_acquire().unwrap();
        let probe = worker.clone();
        let (tx, rx) = mpsc::channel();
        worker
            .execute(Box::new(move || {
                // Finalize stage: the error is waiting on the slot
                tx.send(probe.take_error()).unwrap();
            }))
            .unwrap();

        let stored = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(stored, Some(DevMuxError::Backend(_))));
    }
}
