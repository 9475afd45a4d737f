//! Logical inference requests
//!
//! A logical request binds user-visible blobs to whichever native request
//! the scheduler picks, runs the backend call, copies results back unless
//! they are already aliased, and resolves the caller-visible result. The
//! stages run on different threads: Select inline, Bind on the dispatching
//! thread, Finalize on the backend's callback thread.

use crate::batch::{BatchMember, BatchSlot, BatchWorker};
use crate::pool::{Completion, Signal, Task, WorkerHandle};
use crate::schedule::SchedulerShared;
use devmux_backend::blob::copy_if_needed;
use devmux_backend::{BackendRequest, Blob};
use devmux_common::{DevMuxError, Result, METRICS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Request identifier
pub type RequestId = String;

/// Callback fired once per inference with the final result
pub type ResultCallback = Box<dyn FnOnce(&Result<()>) + Send>;

/// Caller-visible completion state of one logical request
pub(crate) struct RequestState {
    id: RequestId,
    in_flight: AtomicBool,
    done: Signal,
    outcome: Mutex<Option<Result<()>>>,
    callback: Mutex<Option<ResultCallback>>,
}

impl RequestState {
    fn new(id: RequestId) -> Arc<Self> {
        let done = Signal::new();
        // an idle request is trivially "done"
        done.notify();
        Arc::new(Self {
            id,
            in_flight: AtomicBool::new(false),
            done,
            outcome: Mutex::new(None),
            callback: Mutex::new(None),
        })
    }

    fn begin(&self) -> Result<()> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(DevMuxError::busy(format!(
                "Request {} is already running",
                self.id
            )));
        }
        self.done.reset();
        *self.outcome.lock() = None;
        Ok(())
    }

    /// Resolve the request exactly once per inference; fires the user
    /// callback before waking waiters
    pub(crate) fn finish(&self, result: Result<()>) {
        if let Some(callback) = self.callback.lock().take() {
            callback(&result);
        }
        *self.outcome.lock() = Some(result);
        self.in_flight.store(false, Ordering::Release);
        self.done.notify();
    }

    /// Roll back a `begin` whose dispatch failed synchronously
    fn abort(&self) {
        self.in_flight.store(false, Ordering::Release);
        self.done.notify();
    }
}

enum Route {
    /// Served by a scheduler worker pool
    Pooled { shared: Arc<SchedulerShared> },

    /// Member of a batch group
    Batched {
        worker: Arc<BatchWorker>,
        batch_id: usize,
        inputs: Vec<(String, Blob)>,
        outputs: Vec<(String, Blob)>,
        fallback: Arc<Mutex<Box<dyn BackendRequest>>>,
    },
}

/// User-visible handle for one logical inference request
pub struct InferRequest {
    id: RequestId,
    route: Route,
    blobs: Arc<Mutex<HashMap<String, Blob>>>,
    metadata: Mutex<serde_json::Value>,
    state: Arc<RequestState>,
}

impl InferRequest {
    pub(crate) fn pooled(shared: Arc<SchedulerShared>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            state: RequestState::new(id.clone()),
            id,
            route: Route::Pooled { shared },
            blobs: Arc::new(Mutex::new(HashMap::new())),
            metadata: Mutex::new(serde_json::Value::Null),
        }
    }

    /// Build a batch-member request whose blobs are zero-copy views into
    /// the group's shared batched buffers
    pub(crate) fn batched(slot: BatchSlot) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut blobs = HashMap::new();
        for (name, view) in slot.inputs.iter().chain(slot.outputs.iter()) {
            blobs.insert(name.clone(), view.clone());
        }
        Self {
            state: RequestState::new(id.clone()),
            id,
            route: Route::Batched {
                worker: slot.worker,
                batch_id: slot.batch_id,
                inputs: slot.inputs,
                outputs: slot.outputs,
                fallback: slot.fallback,
            },
            blobs: Arc::new(Mutex::new(blobs)),
            metadata: Mutex::new(serde_json::Value::Null),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace a named buffer with a caller-supplied one
    pub fn set_blob(&self, name: &str, blob: Blob) {
        self.blobs.lock().insert(name.to_string(), blob);
    }

    /// Fetch a named buffer. Outputs appear after a successful inference
    /// at the latest.
    pub fn blob(&self, name: &str) -> Result<Blob> {
        self.blobs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DevMuxError::not_found(format!("No blob named {}", name)))
    }

    /// Attach caller metadata carried through logs
    pub fn set_metadata(&self, metadata: serde_json::Value) {
        *self.metadata.lock() = metadata;
    }

    pub fn metadata(&self) -> serde_json::Value {
        self.metadata.lock().clone()
    }

    /// Install the completion callback for the next inference
    pub fn set_callback(&self, callback: ResultCallback) {
        *self.state.callback.lock() = Some(callback);
    }

    /// Begin an asynchronous inference; completion is observed through
    /// [`InferRequest::wait`] or the installed callback
    pub fn start_async(&self) -> Result<()> {
        self.state.begin()?;
        let result = match &self.route {
            Route::Pooled { shared } => self.start_pooled(shared),
            Route::Batched {
                worker,
                batch_id,
                inputs,
                outputs,
                fallback,
            } => self.start_batched(worker, *batch_id, inputs, outputs, fallback),
        };
        if let Err(e) = result {
            self.state.abort();
            return Err(e);
        }
        Ok(())
    }

    /// Block until the running inference resolves. A stored backend error
    /// is surfaced here, never on the backend's callback thread.
    pub fn wait(&self) -> Result<()> {
        self.state.done.wait();
        self.state.outcome.lock().take().unwrap_or(Ok(()))
    }

    /// Convenience synchronous inference
    pub fn infer(&self) -> Result<()> {
        self.start_async()?;
        self.wait()
    }

    /// Select + dispatch for pool-served requests
    fn start_pooled(&self, shared: &Arc<SchedulerShared>) -> Result<()> {
        // Select: a device-resident buffer pins the request to its owner
        let preferred = {
            let blobs = self.blobs.lock();
            let mut preferred = None;
            for blob in blobs.values() {
                if let Some(device) = blob.device() {
                    if !shared.knows_device(device) {
                        return Err(DevMuxError::not_found(format!(
                            "None of the configured devices supports a buffer \
                             resident on {}",
                            device
                        )));
                    }
                    preferred = Some(device.to_string());
                    break;
                }
            }
            preferred
        };
        if let Some(device) = &preferred {
            debug!(request = %self.id, device = %device, "request pinned by device-resident buffer");
        }

        let state = Arc::clone(&self.state);
        let blobs = Arc::clone(&self.blobs);
        let task = Task::new(move |worker: WorkerHandle| {
            // Bind: alias the device-agnostic buffers onto the native request
            if let Err(e) = bind_to_worker(&worker, &blobs) {
                worker.release();
                state.finish(Err(e));
                return;
            }

            // Execute: the continuation below is the Finalize stage, run on
            // the backend's callback thread
            let finalize_worker = worker.clone();
            let finalize_state = Arc::clone(&state);
            let finalize_blobs = Arc::clone(&blobs);
            let completion: Completion = Box::new(move || {
                finalize(&finalize_worker, &finalize_state, &finalize_blobs);
            });
            if let Err(e) = worker.execute(completion) {
                state.finish(Err(e));
            }
        });

        shared.dispatch(task, preferred.as_deref())
    }

    /// Hand the request to its batch group
    fn start_batched(
        &self,
        worker: &Arc<BatchWorker>,
        batch_id: usize,
        inputs: &[(String, Blob)],
        outputs: &[(String, Blob)],
        fallback: &Arc<Mutex<Box<dyn BackendRequest>>>,
    ) -> Result<()> {
        let user = self.blobs.lock().clone();
        let view_or_user =
            |name: &str, view: &Blob| user.get(name).cloned().unwrap_or_else(|| view.clone());

        let copy_inputs: Vec<(Blob, Blob)> = inputs
            .iter()
            .map(|(name, view)| (view_or_user(name, view), view.clone()))
            .collect();
        let output_pairs: Vec<(Blob, Blob)> = outputs
            .iter()
            .map(|(name, view)| (view_or_user(name, view), view.clone()))
            .collect();
        let bind_blobs: Vec<(String, Blob)> = inputs
            .iter()
            .chain(outputs.iter())
            .map(|(name, view)| (name.clone(), view_or_user(name, view)))
            .collect();

        let state = Arc::clone(&self.state);
        let continuation = Box::new(move |err: Option<DevMuxError>| match err {
            Some(e) => state.finish(Err(e)),
            None => {
                for (user_blob, view) in &output_pairs {
                    copy_if_needed(view, user_blob);
                }
                state.finish(Ok(()));
            }
        });

        worker.submit(BatchMember {
            batch_id,
            copy_inputs,
            bind_blobs,
            fallback: Arc::clone(fallback),
            continuation,
        });
        Ok(())
    }
}

/// Bind stage: put user buffers onto the worker's native request, aliasing
/// rather than copying
fn bind_to_worker(worker: &WorkerHandle, blobs: &Arc<Mutex<HashMap<String, Blob>>>) -> Result<()> {
    let user = blobs.lock();
    for name in worker.input_names().into_iter().chain(worker.output_names()) {
        if let Some(blob) = user.get(&name) {
            let current = worker.blob(&name)?;
            if !current.same_view(blob) {
                worker.set_blob(&name, blob.clone())?;
            }
        }
    }
    Ok(())
}

/// Finalize stage: runs on the backend's callback thread after completion
fn finalize(
    worker: &WorkerHandle,
    state: &Arc<RequestState>,
    blobs: &Arc<Mutex<HashMap<String, Blob>>>,
) {
    // a stored backend error is re-raised to the logical caller only
    if let Some(err) = worker.take_error() {
        state.finish(Err(err));
        return;
    }

    {
        let mut user = blobs.lock();
        for name in worker.output_names() {
            if let Ok(result) = worker.blob(&name) {
                match user.get(&name) {
                    // caller-owned buffer on another allocation: copy back
                    Some(blob) if !blob.aliases(&result) => copy_if_needed(&result, blob),
                    Some(_) => {}
                    // no caller buffer: publish a snapshot
                    None => {
                        user.insert(name, result.deep_copy());
                    }
                }
            }
        }
    }

    worker.bump_infer_count();
    METRICS.scheduler.infer_total.inc();
    state.finish(Ok(()));
}
