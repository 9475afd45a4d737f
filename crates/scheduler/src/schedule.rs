//! Request routing across device worker pools
//!
//! The scheduler owns one worker pool per in-service device group plus two
//! task queues: a device-agnostic queue and a per-device queue for requests
//! pinned to a device. Dispatch never blocks; a task that finds every
//! candidate busy is parked and drained by the next completion callback.

use crate::device::{DeviceDescriptor, ScheduleMode};
use crate::load::{LoadRace, LoadedHook, HELPER_POOL};
use crate::pool::{IdleHook, Task, WorkerPool};
use devmux_backend::{BackendCore, BackendModel, DeviceName, MetricKey, MetricValue};
use devmux_common::{DevMuxError, Result, METRICS};
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which pool serves device-agnostic work right now
#[derive(Default)]
struct ServiceState {
    /// Set once the accelerator arm finished loading: pool key + descriptor
    accelerator: Option<(DeviceName, DeviceDescriptor)>,

    /// True while the warm-up helper pool is in service
    helper: bool,
}

/// Shared scheduler state reachable from completion callbacks
pub(crate) struct SchedulerShared {
    mode: ScheduleMode,
    devices: Vec<DeviceDescriptor>,
    pools: RwLock<HashMap<DeviceName, Arc<WorkerPool>>>,
    models: RwLock<HashMap<DeviceName, Arc<dyn BackendModel>>>,
    agnostic: SegQueue<Task>,
    service: RwLock<ServiceState>,
}

impl SchedulerShared {
    fn new(mode: ScheduleMode, devices: Vec<DeviceDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            devices,
            pools: RwLock::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
            agnostic: SegQueue::new(),
            service: RwLock::new(ServiceState::default()),
        })
    }

    /// Whether a device-pinned buffer can be served by this configuration
    pub(crate) fn knows_device(&self, device: &str) -> bool {
        self.devices.iter().any(|d| d.name == device)
    }

    /// Ordered pool keys to try for a task
    fn candidates(&self, preferred: Option<&str>) -> Result<Vec<DeviceName>> {
        match self.mode {
            ScheduleMode::Multi => match preferred {
                Some(p) => {
                    if self.devices.iter().any(|d| d.name == p) {
                        Ok(vec![p.to_string()])
                    } else {
                        Err(DevMuxError::not_found(format!(
                            "Device {} is not part of this configuration",
                            p
                        )))
                    }
                }
                None => Ok(self.devices.iter().map(|d| d.name.clone()).collect()),
            },
            ScheduleMode::Auto => {
                let service = self.service.read();
                match preferred {
                    Some(p) => match &service.accelerator {
                        Some((key, descriptor)) if descriptor.name == p => Ok(vec![key.clone()]),
                        _ => Err(DevMuxError::not_found(
                            "The preferred device should be the selected device",
                        )),
                    },
                    None => {
                        if let Some((key, _)) = &service.accelerator {
                            Ok(vec![key.clone()])
                        } else if service.helper {
                            Ok(vec![HELPER_POOL.to_string()])
                        } else {
                            Err(DevMuxError::not_found("No device is in service"))
                        }
                    }
                }
            }
            ScheduleMode::Batch => Err(DevMuxError::internal(
                "BATCH targets are served by the batch collector",
            )),
        }
    }

    /// Route a task to an idle worker, or park it for later draining
    pub(crate) fn dispatch(&self, task: Task, preferred: Option<&str>) -> Result<()> {
        let candidates = match self.candidates(preferred) {
            Ok(candidates) => candidates,
            Err(e) => {
                task.disarm();
                return Err(e);
            }
        };

        for key in &candidates {
            let pool = self.pools.read().get(key).cloned();
            if let Some(pool) = pool {
                if let Some(worker) = pool.try_acquire() {
                    METRICS.scheduler.dispatched_total.inc();
                    task.run(worker);
                    return Ok(());
                }
            }
        }

        // no vacant worker this time; park the task on the matching queue
        METRICS.scheduler.enqueued_total.inc();
        match preferred {
            Some(_) => {
                let key = candidates
                    .into_iter()
                    .next()
                    .expect("preferred dispatch produced no candidate");
                match self.pools.read().get(&key) {
                    Some(pool) => pool.push_pending(task),
                    None => {
                        task.disarm();
                        return Err(DevMuxError::not_found(format!(
                            "Device {} has no worker pool in service",
                            key
                        )));
                    }
                }
            }
            None => self.agnostic.push(task),
        }
        Ok(())
    }

    /// Drain one parked task onto a freshly idle worker: device-agnostic
    /// first, then the device's own queue. Called from completion callbacks
    /// so a task parked moments before a worker freed is never stranded.
    pub(crate) fn redispatch(&self, device: &DeviceName) {
        if let Some(task) = self.agnostic.pop() {
            if let Err(e) = self.dispatch(task, None) {
                warn!(error = %e, "re-dispatch of a queued task failed");
            }
            return;
        }
        let pool = self.pools.read().get(device).cloned();
        if let Some(pool) = pool {
            if let Some(task) = pool.pop_pending() {
                match pool.try_acquire() {
                    Some(worker) => {
                        METRICS.scheduler.dispatched_total.inc();
                        task.run(worker);
                    }
                    // another dispatcher won the worker; put the task back
                    None => pool.push_pending(task),
                }
            }
        }
    }

    /// Build the worker pool for a freshly loaded device group
    fn generate_pool(
        self: &Arc<Self>,
        key: DeviceName,
        model: &Arc<dyn BackendModel>,
        descriptor: &DeviceDescriptor,
    ) -> Result<()> {
        let optimal = model
            .metric(MetricKey::OptimalInferRequests)
            .and_then(|v| v.as_u32())
            .map_err(|e| {
                DevMuxError::device_load(format!(
                    "Every device used with devmux must report an optimal request count; \
                     {} failed: {}",
                    descriptor.name, e
                ))
            })?;
        let size = descriptor.requested_batch.unwrap_or(optimal);

        let weak = Arc::downgrade(self);
        let on_idle: IdleHook = Arc::new(move |device: &DeviceName| {
            if let Some(shared) = weak.upgrade() {
                shared.redispatch(device);
            }
        });

        let pool = WorkerPool::new(key.clone(), model, size, on_idle)?;
        debug!(device = %key, workers = size, "worker pool in service");
        self.pools.write().insert(key.clone(), pool);
        self.models.write().insert(key, Arc::clone(model));
        Ok(())
    }
}

/// Load-balancing dispatcher for AUTO and MULTI targets
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    race: Option<Arc<LoadRace>>,
    reclaim: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// AUTO mode: load the best device, hiding its latency behind a CPU
    /// helper when one is configured. Returns once either arm can serve.
    pub fn auto(core: Arc<dyn BackendCore>, devices: Vec<DeviceDescriptor>) -> Result<Self> {
        let shared = SchedulerShared::new(ScheduleMode::Auto, devices);

        let hook_shared = Arc::clone(&shared);
        let on_loaded: LoadedHook = Arc::new(move |ctx, model, descriptor| {
            let key = ctx.pool_key();
            hook_shared.generate_pool(key.clone(), &model, descriptor)?;
            let mut service = hook_shared.service.write();
            if ctx.is_helper() {
                service.helper = true;
            } else {
                service.accelerator = Some((key, descriptor.clone()));
            }
            Ok(())
        });

        let race = LoadRace::start(core, &shared.devices, on_loaded)?;
        race.wait_first_ready()?;

        let reclaim = race
            .helper()
            .is_some()
            .then(|| spawn_reclaim(Arc::clone(&race), Arc::clone(&shared)));

        Ok(Self {
            shared,
            race: Some(race),
            reclaim: Mutex::new(reclaim),
        })
    }

    /// MULTI mode: load every listed device up front; any failure is fatal
    pub fn multi(core: Arc<dyn BackendCore>, devices: Vec<DeviceDescriptor>) -> Result<Self> {
        let shared = SchedulerShared::new(ScheduleMode::Multi, devices);

        for descriptor in shared.devices.clone() {
            let model = core
                .load_model(&descriptor.name, &descriptor.config)
                .map_err(|e| {
                    DevMuxError::device_load(format!("{}:{}", descriptor.name, e))
                })?;
            shared.generate_pool(descriptor.name.clone(), &model, &descriptor)?;
        }

        Ok(Self {
            shared,
            race: None,
            reclaim: Mutex::new(None),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    /// Route a task; see [`SchedulerShared::dispatch`]
    pub fn dispatch(&self, task: Task, preferred: Option<&str>) -> Result<()> {
        self.shared.dispatch(task, preferred)
    }

    /// Query a metric from the in-service device's model
    pub fn metric(&self, key: MetricKey) -> Result<MetricValue> {
        let pool_key = self
            .shared
            .candidates(None)?
            .into_iter()
            .next()
            .ok_or_else(|| DevMuxError::not_found("No device is in service"))?;
        let model = self
            .shared
            .models
            .read()
            .get(&pool_key)
            .cloned()
            .ok_or_else(|| DevMuxError::not_found("No model is in service"))?;
        model.metric(key)
    }

    /// Tear the scheduler down: stop the race and reclaim threads, close
    /// every idle queue so late completions cannot resurrect slots, and
    /// log what each pool served.
    pub fn shutdown(&self) {
        if let Some(race) = &self.race {
            race.request_exit();
        }
        if let Some(handle) = self.reclaim.lock().take() {
            let _ = handle.join();
        }
        if let Some(race) = &self.race {
            race.join();
        }

        let pools: Vec<_> = self.shared.pools.read().values().cloned().collect();
        for pool in &pools {
            pool.shutdown();
        }
        for pool in &pools {
            info!(
                device = %pool.device(),
                inferences = pool.total_infer_count(),
                "worker pool retired"
            );
        }

        let mut abandoned = 0;
        while let Some(task) = self.shared.agnostic.pop() {
            task.disarm();
            abandoned += 1;
        }
        for pool in &pools {
            while let Some(task) = pool.pop_pending() {
                task.disarm();
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(count = abandoned, "abandoned queued tasks at teardown");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait for the accelerator, then drain and retire the helper pool.
///
/// Draining is detected by popping idle slots until the popped count equals
/// the pool size; in-flight helper work returns its slot on completion, so
/// the count converges exactly when nothing is left in flight.
fn spawn_reclaim(race: Arc<LoadRace>, shared: Arc<SchedulerShared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("devmux-reclaim".to_string())
        .spawn(move || {
            race.wait_accelerator_done();
            if race.exit_requested() || !race.accelerator().is_ready() {
                return;
            }
            if let Some(helper) = race.helper() {
                helper.wait_done();
            }

            let pool = shared.pools.read().get(HELPER_POOL).cloned();
            let Some(pool) = pool else { return };

            let mut drained = 0u32;
            while !race.exit_requested() {
                drained += pool.drain_idle() as u32;
                if drained == pool.size() {
                    let served = pool.total_infer_count();
                    METRICS.scheduler.helper_infer_total.inc_by(served);
                    pool.shutdown();
                    shared.pools.write().remove(HELPER_POOL);
                    shared.models.write().remove(HELPER_POOL);
                    shared.service.write().helper = false;
                    info!(
                        inferences = served,
                        "reclaimed CPU helper after accelerator became ready"
                    );
                    break;
                }
                pool.wait_return(Duration::from_millis(5));
            }
        })
        .expect("failed to spawn reclaim thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::resolve_priorities;
    use crate::pool::Completion;
    use devmux_backend::mock::{MockCore, MockDevice};
    use devmux_backend::ConfigMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn counting_task(counter: Arc<AtomicUsize>) -> Task {
        Task::new(move |worker| {
            let completion: Completion = Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            worker.execute(completion).unwrap();
        })
    }

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) {
        let end = Instant::now() + deadline;
        while !predicate() {
            assert!(Instant::now() < end, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_auto_serves_from_helper_while_accelerator_loads() {
        init_logs();
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new().load_delay(Duration::from_millis(300))),
        );
        let stats = core.stats();
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let scheduler = Scheduler::auto(core, devices).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .dispatch(counting_task(Arc::clone(&counter)), None)
            .unwrap();

        wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 1);
        // the accelerator is still compiling; the helper served the request
        assert_eq!(stats.starts_on("CPU"), 1);
        assert_eq!(stats.starts_on("GPU"), 0);
    }

    #[test]
    fn test_auto_falls_back_when_accelerator_always_fails() {
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new().failing()),
        );
        let stats = core.stats();
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let scheduler = Scheduler::auto(core, devices).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .dispatch(counting_task(Arc::clone(&counter)), None)
            .unwrap();

        wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 1);
        assert_eq!(stats.starts_on("CPU"), 1);
    }

    #[test]
    fn test_auto_fails_when_every_device_fails() {
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new().failing())
                .with_device("GPU", MockDevice::new().failing()),
        );
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();

        let err = Scheduler::auto(core, devices).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("GPU"));
        assert!(message.contains("CPU"));
    }

    #[test]
    fn test_no_task_loss_under_contention() {
        // one worker, many tasks: every task must run exactly once
        let core = Arc::new(
            MockCore::new().with_device(
                "CPU",
                MockDevice::new()
                    .optimal_requests(1)
                    .infer_delay(Duration::from_millis(1)),
            ),
        );
        let devices = resolve_priorities("CPU", &ConfigMap::new(), core.as_ref()).unwrap();
        let scheduler = Scheduler::auto(core, devices).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        const TASKS: usize = 40;
        for _ in 0..TASKS {
            scheduler
                .dispatch(counting_task(Arc::clone(&counter)), None)
                .unwrap();
        }

        wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) == TASKS
        });
    }

    #[test]
    fn test_multi_pins_preferred_device() {
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new()),
        );
        let stats = core.stats();
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();
        let scheduler = Scheduler::multi(core, devices).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .dispatch(counting_task(Arc::clone(&counter)), Some("CPU"))
            .unwrap();

        wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 1);
        assert_eq!(stats.starts_on("CPU"), 1);
        assert_eq!(stats.starts_on("GPU"), 0);
    }

    #[test]
    fn test_unknown_preferred_device_is_not_found() {
        let core = Arc::new(MockCore::new().with_device("CPU", MockDevice::new()));
        let devices = resolve_priorities("CPU", &ConfigMap::new(), core.as_ref()).unwrap();
        let scheduler = Scheduler::multi(core, devices).unwrap();

        let (tx, _rx) = mpsc::channel::<()>();
        let task = Task::new(move |_worker| {
            let _ = tx;
        });
        let err = scheduler.dispatch(task, Some("NPU")).unwrap_err();

        assert!(matches!(err, DevMuxError::NotFound(_)));
    }

    #[test]
    fn test_helper_pool_reclaimed_after_accelerator_ready() {
        init_logs();
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new().load_delay(Duration::from_millis(100))),
        );
        let stats = core.stats();
        let devices = resolve_priorities("GPU,CPU", &ConfigMap::new(), core.as_ref()).unwrap();
        let scheduler = Scheduler::auto(core, devices).unwrap();

        // served by the helper during warm-up
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .dispatch(counting_task(Arc::clone(&counter)), None)
            .unwrap();
        wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 1);

        // once the accelerator is up, the helper pool disappears
        wait_until(Duration::from_secs(2), || {
            scheduler.shared().pools.read().get(HELPER_POOL).is_none()
        });

        scheduler
            .dispatch(counting_task(Arc::clone(&counter)), None)
            .unwrap();
        wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 2);
        assert_eq!(stats.starts_on("GPU"), 1);
    }
}
