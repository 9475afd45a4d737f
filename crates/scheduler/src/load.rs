//! Startup load race
//!
//! Accelerators can take many seconds to compile a model. When a CPU-class
//! device is also listed, it is loaded concurrently with a low-latency
//! config and serves requests until the accelerator is ready, at which
//! point a background task drains and reclaims the helper pool.

use crate::device::{is_cpu_class, DeviceDescriptor};
use crate::pool::Signal;
use devmux_backend::{BackendCore, BackendModel, DeviceName};
use devmux_common::config::keys;
use devmux_common::{DevMuxError, Result, METRICS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pool key for the warm-up helper, kept distinct from the CPU device's own
/// name so an `AUTO:GPU,CPU` fallback to CPU gets its own pool
pub const HELPER_POOL: &str = "cpu-helper";

/// Called on the loading thread once a context's model is compiled; builds
/// the worker pool and flips the scheduler's in-service state
pub(crate) type LoadedHook = Arc<
    dyn Fn(&LoadContext, Arc<dyn BackendModel>, &DeviceDescriptor) -> Result<()> + Send + Sync,
>;

/// Per-candidate-device load attempt
///
/// Walks `NotStarted -> Loading -> Loaded | Failed`, falling back through
/// the remaining candidate list on failure. A failed device is removed from
/// the list and never retried.
pub struct LoadContext {
    helper: bool,
    descriptor: Mutex<DeviceDescriptor>,
    candidates: Mutex<Vec<DeviceDescriptor>>,
    ready: AtomicBool,
    model: Mutex<Option<Arc<dyn BackendModel>>>,
    errors: Mutex<Vec<String>>,
    done: Signal,
}

impl LoadContext {
    fn new(descriptor: DeviceDescriptor, candidates: Vec<DeviceDescriptor>, helper: bool) -> Arc<Self> {
        Arc::new(Self {
            helper,
            descriptor: Mutex::new(descriptor),
            candidates: Mutex::new(candidates),
            ready: AtomicBool::new(false),
            model: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
            done: Signal::new(),
        })
    }

    pub fn is_helper(&self) -> bool {
        self.helper
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Key the worker pool for this context is registered under
    pub fn pool_key(&self) -> DeviceName {
        if self.helper {
            HELPER_POOL.to_string()
        } else {
            self.descriptor.lock().name.clone()
        }
    }

    /// Current (possibly fallen-back) device descriptor
    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.lock().clone()
    }

    pub fn model(&self) -> Option<Arc<dyn BackendModel>> {
        self.model.lock().clone()
    }

    /// Block until this context finished loading, successfully or not
    pub fn wait_done(&self) {
        self.done.wait();
    }

    fn failure_summary(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

/// Drives the helper and accelerator load attempts to completion
pub struct LoadRace {
    accelerator: Arc<LoadContext>,
    helper: Option<Arc<LoadContext>>,
    first_done: Arc<Signal>,
    exit: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LoadRace {
    /// Start loading. The accelerator is the highest-priority device; a
    /// CPU-class device elsewhere in the list becomes the helper, pinned to
    /// low-latency single-stream use. Without a helper the accelerator is
    /// loaded synchronously on the calling thread.
    pub fn start(
        core: Arc<dyn BackendCore>,
        devices: &[DeviceDescriptor],
        on_loaded: LoadedHook,
    ) -> Result<Arc<Self>> {
        let accelerator_device = devices
            .first()
            .cloned()
            .ok_or_else(|| DevMuxError::config("Device priority list is empty"))?;

        let helper_device = if is_cpu_class(&accelerator_device.name) {
            None
        } else {
            devices.iter().find(|d| is_cpu_class(&d.name)).map(|d| {
                let mut helper = d.clone();
                helper
                    .config
                    .insert(keys::PERFORMANCE_HINT.to_string(), keys::LATENCY.to_string());
                helper
            })
        };

        let mut accelerator_device = accelerator_device;
        if helper_device.is_some() && accelerator_device.name.contains("GPU") {
            // the helper is compiling at the same time; leave it some cores
            let threads = std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1);
            accelerator_device
                .config
                .entry(keys::COMPILE_THREADS.to_string())
                .or_insert_with(|| threads.to_string());
        }

        let accelerator = LoadContext::new(accelerator_device.clone(), devices.to_vec(), false);
        let helper = helper_device.map(|d| LoadContext::new(d, Vec::new(), true));

        let race = Arc::new(Self {
            accelerator: Arc::clone(&accelerator),
            helper: helper.clone(),
            first_done: Arc::new(Signal::new()),
            exit: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        let first_once = Arc::new(Once::new());

        match &helper {
            Some(helper_ctx) => {
                info!(
                    accelerator = %accelerator_device.name,
                    "racing CPU helper against accelerator load"
                );
                let mut threads = race.threads.lock();
                threads.push(spawn_load(
                    Arc::clone(&core),
                    Arc::clone(helper_ctx),
                    None,
                    Arc::clone(&on_loaded),
                    Arc::clone(&race.first_done),
                    Arc::clone(&first_once),
                ));
                threads.push(spawn_load(
                    core,
                    accelerator,
                    Some(Arc::clone(helper_ctx)),
                    on_loaded,
                    Arc::clone(&race.first_done),
                    first_once,
                ));
            }
            None => {
                // single arm; nothing to hide the latency behind
                load_arm(
                    core.as_ref(),
                    &accelerator,
                    None,
                    &on_loaded,
                    &race.first_done,
                    &first_once,
                );
            }
        }

        Ok(race)
    }

    /// Resolve as soon as either arm is usable; aggregate every failure
    /// message when both arms are exhausted
    pub fn wait_first_ready(&self) -> Result<()> {
        self.first_done.wait();

        // prefer the accelerator when both finished
        if self.accelerator.is_ready() {
            return Ok(());
        }
        if let Some(helper) = &self.helper {
            if helper.is_ready() {
                return Ok(());
            }
        }

        // the first arm to finish failed; wait out the rest
        self.accelerator.wait_done();
        if self.accelerator.is_ready() {
            return Ok(());
        }
        if let Some(helper) = &self.helper {
            helper.wait_done();
            if helper.is_ready() {
                return Ok(());
            }
        }

        let mut messages = self.accelerator.failure_summary();
        if let Some(helper) = &self.helper {
            messages.extend(helper.failure_summary());
        }
        Err(DevMuxError::AllDevicesFailed(messages.join("; ")))
    }

    /// Block until the accelerator arm finished (successfully or not)
    pub fn wait_accelerator_done(&self) {
        self.accelerator.wait_done();
    }

    pub fn accelerator(&self) -> &Arc<LoadContext> {
        &self.accelerator
    }

    pub fn helper(&self) -> Option<&Arc<LoadContext>> {
        self.helper.as_ref()
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub(crate) fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Join the load threads; called during teardown so no thread outlives
    /// the owning scheduler
    pub(crate) fn join(&self) {
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LoadRace {
    fn drop(&mut self) {
        self.request_exit();
        self.join();
    }
}

fn spawn_load(
    core: Arc<dyn BackendCore>,
    ctx: Arc<LoadContext>,
    helper_peer: Option<Arc<LoadContext>>,
    on_loaded: LoadedHook,
    first_done: Arc<Signal>,
    first_once: Arc<Once>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("devmux-load-{}", ctx.pool_key()))
        .spawn(move || {
            load_arm(
                core.as_ref(),
                &ctx,
                helper_peer.as_deref(),
                &on_loaded,
                &first_done,
                &first_once,
            );
        })
        .expect("failed to spawn load thread")
}

/// Load the context's device, falling back through the candidate list.
///
/// A failed device is removed from the list and never retried. CPU-class
/// failures are terminal for the arm: there is nothing faster left to try,
/// and the helper arm covers the CPU case separately.
fn load_arm(
    core: &dyn BackendCore,
    ctx: &LoadContext,
    helper_peer: Option<&LoadContext>,
    on_loaded: &LoadedHook,
    first_done: &Signal,
    first_once: &Once,
) {
    loop {
        let device = ctx.descriptor.lock().clone();
        let started = Instant::now();
        match core.load_model(&device.name, &device.config) {
            Ok(model) => {
                METRICS
                    .load
                    .load_duration
                    .observe(started.elapsed().as_secs_f64());
                match on_loaded(ctx, Arc::clone(&model), &device) {
                    Ok(()) => {
                        *ctx.model.lock() = Some(model);
                        ctx.ready.store(true, Ordering::Release);
                        info!(device = %device.name, helper = ctx.helper, "device finished loading");
                    }
                    Err(e) => {
                        warn!(device = %device.name, error = %e, "worker pool setup failed");
                        ctx.errors.lock().push(format!("{}:{}", device.name, e));
                    }
                }
                break;
            }
            Err(e) => {
                METRICS.load.load_failures_total.inc();
                warn!(device = %device.name, error = %e, "device failed to load");
                ctx.errors.lock().push(format!("{}:{}", device.name, e));

                if is_cpu_class(&device.name) {
                    break;
                }

                let next = {
                    let mut candidates = ctx.candidates.lock();
                    candidates.retain(|d| d.name != device.name);
                    candidates.first().cloned()
                };
                let Some(next) = next else { break };

                // if the next candidate is the CPU the helper arm is already
                // loading with the same config, that load covers us
                if let Some(helper) = helper_peer {
                    if is_cpu_class(&next.name) && next.config == helper.descriptor().config {
                        debug!(device = %next.name, "helper arm already loads this configuration");
                        break;
                    }
                }

                METRICS.load.fallback_total.inc();
                debug!(device = %next.name, "falling back to next candidate device");
                *ctx.descriptor.lock() = next;
            }
        }
    }
    ctx.done.notify();
    first_once.call_once(|| first_done.notify());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::resolve_priorities;
    use devmux_backend::mock::{MockCore, MockDevice};
    use devmux_backend::ConfigMap;
    use std::time::Duration;

    fn noop_hook() -> LoadedHook {
        Arc::new(|_ctx, _model, _dev| Ok(()))
    }

    #[test]
    fn test_helper_ready_before_slow_accelerator() {
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new().load_delay(Duration::from_millis(200))),
        );
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let race = LoadRace::start(core, &devices, noop_hook()).unwrap();
        race.wait_first_ready().unwrap();

        // CPU wins the race; the accelerator is still compiling
        assert!(race.helper().unwrap().is_ready());
        assert!(!race.accelerator().is_ready());

        race.wait_accelerator_done();
        assert!(race.accelerator().is_ready());
    }

    #[test]
    fn test_helper_gets_latency_hint() {
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new()),
        );
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let race = LoadRace::start(core, &devices, noop_hook()).unwrap();
        race.wait_first_ready().unwrap();

        let helper = race.helper().unwrap();
        assert_eq!(helper.pool_key(), HELPER_POOL);
        assert_eq!(
            helper.descriptor().config.get(keys::PERFORMANCE_HINT).unwrap(),
            keys::LATENCY
        );
    }

    #[test]
    fn test_failed_accelerator_falls_back() {
        let core = Arc::new(
            MockCore::new()
                .with_device("NPU", MockDevice::new().failing())
                .with_device("GPU", MockDevice::new())
                .with_device("CPU", MockDevice::new()),
        );
        let devices =
            resolve_priorities("NPU,GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let race = LoadRace::start(core, &devices, noop_hook()).unwrap();
        race.wait_first_ready().unwrap();
        race.wait_accelerator_done();

        // NPU was dropped, GPU took over the accelerator arm
        assert!(race.accelerator().is_ready());
        assert_eq!(race.accelerator().descriptor().name, "GPU");
    }

    #[test]
    fn test_all_devices_failing_aggregates_errors() {
        let core = Arc::new(
            MockCore::new()
                .with_device("GPU", MockDevice::new().failing())
                .with_device("CPU", MockDevice::new().failing()),
        );
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let race = LoadRace::start(core, &devices, noop_hook()).unwrap();
        let err = race.wait_first_ready().unwrap_err();

        let message = err.to_string();
        assert!(message.contains("GPU"));
        assert!(message.contains("CPU"));
        assert!(matches!(err, DevMuxError::AllDevicesFailed(_)));
    }

    #[test]
    fn test_cpu_accelerator_disables_helper() {
        let core = Arc::new(MockCore::new().with_device("CPU", MockDevice::new()));
        let devices = resolve_priorities("CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let race = LoadRace::start(core, &devices, noop_hook()).unwrap();
        race.wait_first_ready().unwrap();

        assert!(race.helper().is_none());
        assert!(race.accelerator().is_ready());
    }
}
