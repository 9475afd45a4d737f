//! devmux scheduler
//!
//! Multi-device inference dispatching: device resolution, the warm-up load
//! race, per-device worker pools and the batching collector, fronted by
//! [`CompiledMux`].

pub mod batch;
pub mod device;
pub mod load;
pub mod pool;
pub mod request;
pub mod schedule;

pub use batch::BatchCollector;
pub use device::{
    resolve_priorities, resolve_target, DeviceDescriptor, ResolvedTarget, ScheduleMode,
};
pub use load::{LoadContext, LoadRace, HELPER_POOL};
pub use pool::{Task, WorkerHandle, WorkerPool, WorkerSlot};
pub use request::{InferRequest, RequestId, ResultCallback};
pub use schedule::Scheduler;

use devmux_backend::{BackendCore, MetricKey, MetricValue};
use devmux_common::config::keys;
use devmux_common::{MuxConfig, Result};
use std::sync::Arc;
use tracing::{debug, info};

enum Engine {
    Scheduled(Scheduler),
    Batched(BatchCollector),
}

/// A model compiled for a devmux target
///
/// The user-facing entry point: resolves the target string, brings the
/// devices into service (racing a helper for AUTO targets) and hands out
/// logical inference requests.
pub struct CompiledMux {
    engine: Engine,
    config: MuxConfig,
}

impl std::fmt::Debug for CompiledMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMux").finish_non_exhaustive()
    }
}

impl CompiledMux {
    /// Compile for a target such as `"AUTO:GPU,CPU"` or `"BATCH:GPU(4)"`.
    ///
    /// Returns a usable handle, or fails synchronously with a
    /// device-by-device failure summary.
    pub fn compile(core: Arc<dyn BackendCore>, config: &MuxConfig) -> Result<Self> {
        config.validate()?;
        let resolved = resolve_target(&config.target, &config.device_config, core.as_ref())?;
        info!(
            target = %config.target,
            mode = ?resolved.mode,
            devices = resolved.devices.len(),
            "compiling"
        );
        if config.perf_count {
            debug!("per-op timing requested; collection is delegated to the backend");
        }

        let engine = match resolved.mode {
            ScheduleMode::Auto => Engine::Scheduled(Scheduler::auto(core, resolved.devices)?),
            ScheduleMode::Multi => Engine::Scheduled(Scheduler::multi(core, resolved.devices)?),
            ScheduleMode::Batch => {
                let descriptor = resolved
                    .devices
                    .into_iter()
                    .next()
                    .expect("resolver guarantees one BATCH device");
                Engine::Batched(BatchCollector::new(
                    core,
                    descriptor,
                    config.collect_timeout(),
                )?)
            }
        };

        Ok(Self {
            engine,
            config: config.clone(),
        })
    }

    /// Look up a config value by key; asking for a key that was never set
    /// is an error, unlike the silent dropping during device resolution
    pub fn config_value(&self, key: &str) -> Result<String> {
        self.config
            .device_config
            .get(key)
            .cloned()
            .ok_or_else(|| {
                devmux_common::DevMuxError::config(format!("{} not found in the compiled config", key))
            })
    }

    /// Create a logical inference request
    pub fn create_request(&self) -> Result<InferRequest> {
        match &self.engine {
            Engine::Scheduled(scheduler) => {
                Ok(InferRequest::pooled(Arc::clone(scheduler.shared())))
            }
            Engine::Batched(collector) => Ok(InferRequest::batched(collector.create_slot()?)),
        }
    }

    /// Query a compiled-model metric
    pub fn metric(&self, key: MetricKey) -> Result<MetricValue> {
        match &self.engine {
            Engine::Scheduled(scheduler) => scheduler.metric(key),
            Engine::Batched(collector) => match key {
                MetricKey::OptimalInferRequests => {
                    Ok(MetricValue::U32(collector.optimal_requests()))
                }
                MetricKey::NetworkName => collector.plain_model().metric(key),
                MetricKey::SupportedConfigKeys => {
                    Ok(MetricValue::Keys(vec![keys::AUTO_BATCH.to_string()]))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_backend::mock::{MockCore, MockDevice};
    use devmux_backend::{Blob, Layout};
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) {
        let end = Instant::now() + deadline;
        while !predicate() {
            assert!(Instant::now() < end, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_auto_target_end_to_end() {
        let core = Arc::new(
            MockCore::new()
                .with_device("CPU", MockDevice::new())
                .with_device("GPU", MockDevice::new().load_delay(Duration::from_millis(150))),
        );
        let stats = core.stats();

        let mux =
            CompiledMux::compile(Arc::clone(&core) as _, &MuxConfig::for_target("AUTO:GPU,CPU"))
                .unwrap();

        // the first request is served while the accelerator still compiles
        let request = mux.create_request().unwrap();
        let input = Blob::allocate(4, Layout::Nchw);
        input.copy_from_slice(&[1, 2, 3, 4]);
        request.set_blob("in", input);
        request.infer().unwrap();
        assert_eq!(stats.starts_on("CPU"), 1);

        // once the accelerator is up the helper is drained and replaced
        wait_until(Duration::from_secs(2), || {
            stats.loads.lock().iter().any(|l| l.device == "GPU")
        });
        wait_until(Duration::from_secs(2), || {
            let request = mux.create_request().unwrap();
            request.infer().unwrap();
            stats.starts_on("GPU") > 0
        });
    }

    #[test]
    fn test_batch_target_end_to_end() {
        let core = Arc::new(MockCore::new().with_device("GPU", MockDevice::new()));
        let stats = core.stats();

        let mux =
            CompiledMux::compile(Arc::clone(&core) as _, &MuxConfig::for_target("BATCH:GPU(2)"))
                .unwrap();

        let first = mux.create_request().unwrap();
        let second = mux.create_request().unwrap();
        first.start_async().unwrap();
        second.start_async().unwrap();
        first.wait().unwrap();
        second.wait().unwrap();

        assert_eq!(stats.starts_with_batch(2), 1);
    }

    #[test]
    fn test_batch_target_via_config_key() {
        let core = Arc::new(MockCore::new().with_device("GPU", MockDevice::new()));

        let mut config = MuxConfig::for_target("BATCH");
        config
            .device_config
            .insert(keys::AUTO_BATCH.to_string(), "GPU(4)".to_string());

        let mux = CompiledMux::compile(core as _, &config).unwrap();
        let optimal = mux.metric(MetricKey::OptimalInferRequests).unwrap();

        // batch size 4 times the device's own optimum of 2
        assert_eq!(optimal.as_u32().unwrap(), 8);
    }

    #[test]
    fn test_metric_passthrough_on_scheduled_target() {
        let core = Arc::new(MockCore::new().with_device("CPU", MockDevice::new()));

        let mux = CompiledMux::compile(core as _, &MuxConfig::for_target("CPU")).unwrap();

        let name = mux.metric(MetricKey::NetworkName).unwrap();
        match name {
            MetricValue::Name(n) => assert!(n.contains("CPU")),
            other => panic!("unexpected metric value {:?}", other),
        }
    }

    #[test]
    fn test_config_value_lookup() {
        let core = Arc::new(MockCore::new().with_device("CPU", MockDevice::new()));

        let mut config = MuxConfig::for_target("CPU");
        config
            .device_config
            .insert(keys::PERF_COUNT.to_string(), "NO".to_string());
        let mux = CompiledMux::compile(core as _, &config).unwrap();

        assert_eq!(mux.config_value(keys::PERF_COUNT).unwrap(), "NO");
        assert!(mux.config_value("SOME_OTHER_KEY").is_err());
    }

    #[test]
    fn test_compile_failure_names_every_device() {
        let core = Arc::new(
            MockCore::new()
                .with_device("GPU", MockDevice::new().failing())
                .with_device("CPU", MockDevice::new().failing()),
        );

        let err =
            CompiledMux::compile(core as _, &MuxConfig::for_target("AUTO:GPU,CPU")).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("GPU"));
        assert!(message.contains("CPU"));
    }
}
