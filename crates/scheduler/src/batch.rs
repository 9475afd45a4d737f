//! Request batching for the BATCH pseudo-device
//!
//! Logical requests are grouped `capacity` at a time onto one batched
//! native request; a group flushes as a single backend call when it fills.
//! A per-group timer thread executes stragglers individually when the
//! collect window expires, so a request never waits more than one window
//! beyond its arrival.

use crate::device::DeviceDescriptor;
use devmux_backend::{BackendCore, BackendModel, BackendRequest, Blob, DeviceName};
use devmux_common::config::keys;
use devmux_common::{DevMuxError, Result, METRICS};
use crossbeam::queue::SegQueue;
use devmux_backend::blob::copy_if_needed;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Continuation resolving one batch member; `None` means success
pub(crate) type BatchCompletion = Box<dyn FnOnce(Option<DevMuxError>) + Send>;

/// One logical request waiting in a batch group
pub(crate) struct BatchMember {
    pub batch_id: usize,

    /// (source, batch view) pairs copied on the full-batch path when the
    /// caller supplied a distinct buffer
    pub copy_inputs: Vec<(Blob, Blob)>,

    /// Current buffers by name, bound onto the fallback request on the
    /// timeout path
    pub bind_blobs: Vec<(String, Blob)>,

    /// The member's private batch-size-1 native request
    pub fallback: Arc<Mutex<Box<dyn BackendRequest>>>,

    pub continuation: BatchCompletion,
}

/// Handed to a freshly created logical request: its group, slot, views and
/// fallback request
pub(crate) struct BatchSlot {
    pub worker: Arc<BatchWorker>,
    pub batch_id: usize,
    pub inputs: Vec<(String, Blob)>,
    pub outputs: Vec<(String, Blob)>,
    pub fallback: Arc<Mutex<Box<dyn BackendRequest>>>,
}

/// State the collect timer and the completion callback synchronize over
struct Gate {
    /// Continuations of the batch currently in flight, in fill order
    in_flight: Vec<BatchCompletion>,
}

/// One batched native request plus the members accumulating for it
pub struct BatchWorker {
    device: DeviceName,
    capacity: usize,
    request: Mutex<Box<dyn BackendRequest>>,
    members: SegQueue<BatchMember>,
    gate: Mutex<Gate>,
    wake: Condvar,
    terminate: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWorker {
    fn new(
        device: DeviceName,
        model: &Arc<dyn BackendModel>,
        capacity: usize,
        collect_timeout: Duration,
        terminate: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let request = model.create_request()?;
        let worker = Arc::new(Self {
            device,
            capacity,
            request: Mutex::new(request),
            members: SegQueue::new(),
            gate: Mutex::new(Gate {
                in_flight: Vec::new(),
            }),
            wake: Condvar::new(),
            terminate,
            timer: Mutex::new(None),
        });

        // combined completion: resolve every member in fill order, then
        // reset the collect timeout
        let weak = Arc::downgrade(&worker);
        worker
            .request
            .lock()
            .set_callback(Box::new(move |err: Option<DevMuxError>| {
                let Some(worker) = weak.upgrade() else { return };
                let completions = std::mem::take(&mut worker.gate.lock().in_flight);
                let message = err.map(|e| e.to_string());
                for continuation in completions {
                    continuation(message.clone().map(DevMuxError::Backend));
                }
                worker.wake.notify_all();
            }));

        let timer_worker = Arc::clone(&worker);
        *worker.timer.lock() = Some(
            std::thread::Builder::new()
                .name("devmux-batch-timer".to_string())
                .spawn(move || run_timer(timer_worker, collect_timeout))
                .expect("failed to spawn batch timer thread"),
        );

        Ok(worker)
    }

    /// Park a member and flush the group if it just filled
    pub(crate) fn submit(&self, member: BatchMember) {
        self.members.push(member);
        self.try_dispatch_full();
    }

    fn try_dispatch_full(&self) {
        let mut gate = self.gate.lock();
        // the size read is racy by design; an under-count just leaves the
        // member for the timeout path
        if self.members.len() < self.capacity || !gate.in_flight.is_empty() {
            return;
        }

        for _ in 0..self.capacity {
            match self.members.pop() {
                Some(member) => {
                    for (source, view) in &member.copy_inputs {
                        copy_if_needed(source, view);
                    }
                    gate.in_flight.push(member.continuation);
                }
                None => {
                    error!(device = %self.device, "batch group under-filled during dispatch");
                    debug_assert!(false, "batch group under-filled during dispatch");
                    break;
                }
            }
        }

        let filled = gate.in_flight.len();
        METRICS.batch.fill_at_dispatch.observe(filled as f64);
        METRICS.batch.full_dispatches_total.inc_by(filled as u64);
        debug!(device = %self.device, batch = filled, "dispatching full batch");

        if let Err(e) = self.request.lock().start_async() {
            let failed = std::mem::take(&mut gate.in_flight);
            drop(gate);
            for continuation in failed {
                continuation(Some(DevMuxError::backend(e.to_string())));
            }
        }
    }

    fn join_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Collect-window timer loop
///
/// Waits on the gate condvar; a wake means either a completion (reset the
/// window) or teardown. A timeout with members still parked means the batch
/// will not fill in time: every parked member runs individually on its own
/// batch-size-1 request, without blocking the drain loop on any completion.
fn run_timer(worker: Arc<BatchWorker>, collect_timeout: Duration) {
    loop {
        let mut gate = worker.gate.lock();
        if worker.terminate.load(Ordering::Acquire) {
            break;
        }
        let result = worker.wake.wait_for(&mut gate, collect_timeout);
        if worker.terminate.load(Ordering::Acquire) {
            break;
        }
        if !result.timed_out() {
            continue;
        }

        let pending = worker.members.len();
        if pending == 0 {
            continue;
        }
        debug!(
            device = %worker.device,
            stragglers = pending,
            "collect timeout; executing members individually"
        );
        while let Some(member) = worker.members.pop() {
            dispatch_single(member);
            METRICS.batch.timeout_dispatches_total.inc();
        }
    }
}

/// Run one straggler on its private unbatched request
fn dispatch_single(member: BatchMember) {
    let continuation = Arc::new(Mutex::new(Some(member.continuation)));
    let fired = Arc::clone(&continuation);

    let mut fallback = member.fallback.lock();
    fallback.set_callback(Box::new(move |err| {
        if let Some(continuation) = fired.lock().take() {
            continuation(err);
        }
    }));
    for (name, blob) in &member.bind_blobs {
        if let Err(e) = fallback.set_blob(name, blob.clone()) {
            warn!(blob = %name, error = %e, "failed to bind blob onto fallback request");
        }
    }
    debug!(batch_id = member.batch_id, "straggler running as batch of one");
    if let Err(e) = fallback.start_async() {
        // no callback will fire; resolve the member here
        if let Some(continuation) = continuation.lock().take() {
            continuation(Some(DevMuxError::backend(e.to_string())));
        }
    }
}

/// Request creation bookkeeping: groups are created lazily, one per
/// `capacity` logical requests
struct WorkerList {
    created: usize,
    list: Vec<Arc<BatchWorker>>,
}

/// Batching front end for one `device(batch)` pair
pub struct BatchCollector {
    descriptor: DeviceDescriptor,
    capacity: usize,
    batched_model: Arc<dyn BackendModel>,
    plain_model: Arc<dyn BackendModel>,
    workers: Mutex<WorkerList>,
    collect_timeout: Duration,
    terminate: Arc<AtomicBool>,
}

impl std::fmt::Debug for BatchCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCollector")
            .field("descriptor", &self.descriptor)
            .field("capacity", &self.capacity)
            .field("collect_timeout", &self.collect_timeout)
            .finish()
    }
}

impl BatchCollector {
    /// Compile the device's model twice: once reshaped over the batch
    /// dimension and once plain, for the timeout fallback path
    pub fn new(
        core: Arc<dyn BackendCore>,
        descriptor: DeviceDescriptor,
        collect_timeout: Duration,
    ) -> Result<Self> {
        let capacity = descriptor.requested_batch.ok_or_else(|| {
            DevMuxError::config(format!(
                "Batch size must be set for BATCH device '{}'",
                descriptor.name
            ))
        })? as usize;

        let plain_model = core.load_model(&descriptor.name, &descriptor.config)?;

        let mut batched_config = descriptor.config.clone();
        batched_config.insert(keys::AUTO_BATCH_SIZE.to_string(), capacity.to_string());
        let batched_model = core.load_model(&descriptor.name, &batched_config)?;

        Ok(Self {
            descriptor,
            capacity,
            batched_model,
            plain_model,
            workers: Mutex::new(WorkerList {
                created: 0,
                list: Vec::new(),
            }),
            collect_timeout,
            terminate: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Full-blown parallel request count: the batch size multiplied by what
    /// the device itself runs best with
    pub fn optimal_requests(&self) -> u32 {
        let backend = self
            .plain_model
            .metric(devmux_backend::MetricKey::OptimalInferRequests)
            .and_then(|v| v.as_u32())
            .unwrap_or(0);
        ((self.capacity as u32) * backend).max(self.capacity as u32)
    }

    pub(crate) fn plain_model(&self) -> &Arc<dyn BackendModel> {
        &self.plain_model
    }

    /// Allocate the next batch slot, creating a new group when the previous
    /// one is fully subscribed
    pub(crate) fn create_slot(&self) -> Result<BatchSlot> {
        let mut workers = self.workers.lock();
        let num = workers.created;
        workers.created += 1;
        let batch_id = num % self.capacity;

        if batch_id == 0 {
            let worker = BatchWorker::new(
                self.descriptor.name.clone(),
                &self.batched_model,
                self.capacity,
                self.collect_timeout,
                Arc::clone(&self.terminate),
            )?;
            workers.list.push(worker);
        }
        let worker = Arc::clone(workers.list.last().expect("no batch group after creation"));
        drop(workers);

        let (inputs, outputs) = {
            let request = worker.request.lock();
            let views = |names: Vec<String>| -> Result<Vec<(String, Blob)>> {
                names
                    .into_iter()
                    .map(|name| {
                        let view = request.blob(&name)?.batch_view(batch_id, self.capacity);
                        Ok((name, view))
                    })
                    .collect()
            };
            (views(request.input_names())?, views(request.output_names())?)
        };

        let fallback = Arc::new(Mutex::new(self.plain_model.create_request()?));

        Ok(BatchSlot {
            worker,
            batch_id,
            inputs,
            outputs,
            fallback,
        })
    }

    /// Stop every group's timer thread
    pub fn shutdown(&self) {
        self.terminate.store(true, Ordering::Release);
        let workers: Vec<_> = self.workers.lock().list.clone();
        for worker in &workers {
            // take the gate so the timer is either waiting (and gets the
            // notification) or sees the flag before its next wait
            let _gate = worker.gate.lock();
            worker.wake.notify_all();
        }
        for worker in &workers {
            worker.join_timer();
        }
    }
}

impl Drop for BatchCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::resolve_target;
    use crate::request::InferRequest;
    use devmux_backend::mock::{MockCore, MockDevice, MockStats};
    use devmux_backend::ConfigMap;
    use std::time::Instant;

    fn collector(target: &str, timeout_ms: u64) -> (Arc<MockStats>, BatchCollector) {
        let core = Arc::new(
            MockCore::new().with_device("GPU", MockDevice::new().optimal_requests(2)),
        );
        let stats = core.stats();
        let resolved = resolve_target(target, &ConfigMap::new(), core.as_ref()).unwrap();
        let collector = BatchCollector::new(
            core,
            resolved.devices.into_iter().next().unwrap(),
            Duration::from_millis(timeout_ms),
        )
        .unwrap();
        (stats, collector)
    }

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) {
        let end = Instant::now() + deadline;
        while !predicate() {
            assert!(Instant::now() < end, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_full_batch_dispatches_one_backend_call() {
        let (stats, collector) = collector("BATCH:GPU(4)", 5_000);

        let requests: Vec<InferRequest> = (0..4)
            .map(|_| InferRequest::batched(collector.create_slot().unwrap()))
            .collect();

        // each member writes its own marker into its zero-copy view
        for (i, request) in requests.iter().enumerate() {
            let marker = (i + 1) as u8;
            request
                .blob("in")
                .unwrap()
                .copy_from_slice(&[marker, marker, marker, marker]);
            request.start_async().unwrap();
        }
        for request in &requests {
            request.wait().unwrap();
        }

        // exactly one batched call, zero individual calls
        assert_eq!(stats.starts_with_batch(4), 1);
        assert_eq!(stats.starts_with_batch(1), 0);

        // member data sits at the right batch offsets
        let starts = stats.starts.lock();
        let record = starts.iter().find(|r| r.batch == 4).unwrap();
        assert_eq!(
            record.inputs["in"],
            vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]
        );
    }

    #[test]
    fn test_stragglers_run_individually_after_timeout() {
        let (stats, collector) = collector("BATCH:GPU(4)", 50);

        let requests: Vec<InferRequest> = (0..3)
            .map(|_| InferRequest::batched(collector.create_slot().unwrap()))
            .collect();
        for request in &requests {
            request.start_async().unwrap();
        }
        for request in &requests {
            request.wait().unwrap();
        }

        assert_eq!(stats.starts_with_batch(4), 0);
        assert_eq!(stats.starts_with_batch(1), 3);
    }

    #[test]
    fn test_caller_buffer_copied_to_batch_offset() {
        let (stats, collector) = collector("BATCH:GPU(2)", 5_000);

        let first = InferRequest::batched(collector.create_slot().unwrap());
        let second = InferRequest::batched(collector.create_slot().unwrap());

        // the second member supplies its own buffer instead of the view
        let own = Blob::allocate(4, devmux_backend::Layout::Nchw);
        own.copy_from_slice(&[9, 9, 9, 9]);
        second.set_blob("in", own);

        first.blob("in").unwrap().copy_from_slice(&[5, 5, 5, 5]);
        first.start_async().unwrap();
        second.start_async().unwrap();

        for request in [&first, &second] {
            request.wait().unwrap();
        }

        let starts = stats.starts.lock();
        let record = starts.iter().find(|r| r.batch == 2).unwrap();
        assert_eq!(record.inputs["in"], vec![5, 5, 5, 5, 9, 9, 9, 9]);
    }

    #[test]
    fn test_fifth_request_opens_a_new_group() {
        let (stats, collector) = collector("BATCH:GPU(4)", 50);

        let requests: Vec<InferRequest> = (0..5)
            .map(|_| InferRequest::batched(collector.create_slot().unwrap()))
            .collect();
        for request in &requests {
            request.start_async().unwrap();
        }
        for request in &requests {
            request.wait().unwrap();
        }

        // four fill the first group; the fifth times out alone
        wait_until(Duration::from_secs(1), || stats.starts_with_batch(1) == 1);
        assert_eq!(stats.starts_with_batch(4), 1);
    }

    #[test]
    fn test_batch_size_is_required() {
        let core = Arc::new(MockCore::new().with_device("GPU", MockDevice::new()));
        let resolved = resolve_target("BATCH:GPU(2)", &ConfigMap::new(), core.as_ref()).unwrap();
        let mut descriptor = resolved.devices.into_iter().next().unwrap();
        descriptor.requested_batch = None;

        let err =
            BatchCollector::new(core, descriptor, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, DevMuxError::Config(_)));
    }

    #[test]
    fn test_optimal_requests_scales_with_batch() {
        let (_stats, collector) = collector("BATCH:GPU(4)", 100);

        // device optimum 2, batch 4
        assert_eq!(collector.optimal_requests(), 8);
    }
}
