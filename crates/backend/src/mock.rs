//! Scriptable in-memory backend for tests
//!
//! Devices are registered with per-device load behavior (delay, failure)
//! and execution behavior (delay, error). Every `start_async` is recorded
//! together with a snapshot of the request's input bytes, and completion
//! callbacks always fire on a dedicated thread, matching how a real
//! backend reports completion from its own callback thread.

use crate::blob::{Blob, Layout};
use crate::{
    BackendCore, BackendModel, BackendRequest, CompletionCallback, ConfigMap, MetricKey,
    MetricValue,
};
use devmux_common::config::keys;
use devmux_common::{DevMuxError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tensor slot description: name, bytes per batch element, layout
pub type IoSpec = (String, usize, Layout);

/// Per-device behavior script
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// How long `load_model` blocks before returning
    pub load_delay: Duration,

    /// Whether every load attempt fails
    pub fail_loads: bool,

    /// Value returned for `OptimalInferRequests`
    pub optimal_requests: u32,

    /// Config keys the device claims to support
    pub supported_keys: Vec<String>,

    /// How long an inference runs before its callback fires
    pub infer_delay: Duration,

    /// Error message every inference completes with, if any
    pub infer_error: Option<String>,

    /// Input tensor slots
    pub inputs: Vec<IoSpec>,

    /// Output tensor slots
    pub outputs: Vec<IoSpec>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            load_delay: Duration::ZERO,
            fail_loads: false,
            optimal_requests: 2,
            supported_keys: vec![
                keys::DEVICE_ID.to_string(),
                keys::PERFORMANCE_HINT.to_string(),
                keys::AUTO_BATCH_SIZE.to_string(),
            ],
            infer_delay: Duration::ZERO,
            infer_error: None,
            inputs: vec![("in".to_string(), 4, Layout::Nchw)],
            outputs: vec![("out".to_string(), 4, Layout::Nchw)],
        }
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn optimal_requests(mut self, n: u32) -> Self {
        self.optimal_requests = n;
        self
    }

    pub fn infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    pub fn infer_error(mut self, msg: impl Into<String>) -> Self {
        self.infer_error = Some(msg.into());
        self
    }
}

/// One recorded `load_model` invocation
#[derive(Debug, Clone)]
pub struct LoadRecord {
    pub device: String,
    pub config: ConfigMap,
}

/// One recorded `start_async` invocation
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub device: String,

    /// Batch dimension the model was compiled for (1 = unbatched)
    pub batch: usize,

    /// Input bytes at the moment the inference started
    pub inputs: HashMap<String, Vec<u8>>,
}

/// Shared invocation log
#[derive(Debug, Default)]
pub struct MockStats {
    pub loads: Mutex<Vec<LoadRecord>>,
    pub starts: Mutex<Vec<StartRecord>>,
}

impl MockStats {
    /// `start_async` calls seen on models compiled with the given batch size
    pub fn starts_with_batch(&self, batch: usize) -> usize {
        self.starts.lock().iter().filter(|r| r.batch == batch).count()
    }

    /// `start_async` calls seen on the given device
    pub fn starts_on(&self, device: &str) -> usize {
        self.starts.lock().iter().filter(|r| r.device == device).count()
    }
}

/// Scriptable backend core
pub struct MockCore {
    devices: Mutex<HashMap<String, MockDevice>>,
    stats: Arc<MockStats>,
}

impl MockCore {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Register (or replace) a device script
    pub fn with_device(self, name: &str, device: MockDevice) -> Self {
        self.devices.lock().insert(name.to_string(), device);
        self
    }

    /// The shared invocation log
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCore for MockCore {
    fn load_model(&self, device: &str, config: &ConfigMap) -> Result<Arc<dyn BackendModel>> {
        let spec = self
            .devices
            .lock()
            .get(device)
            .cloned()
            .ok_or_else(|| DevMuxError::device_load(format!("No such device: {}", device)))?;

        if !spec.load_delay.is_zero() {
            std::thread::sleep(spec.load_delay);
        }
        if spec.fail_loads {
            return Err(DevMuxError::device_load(format!(
                "Device {} refused to load",
                device
            )));
        }

        self.stats.loads.lock().push(LoadRecord {
            device: device.to_string(),
            config: config.clone(),
        });

        let batch = config
            .get(keys::AUTO_BATCH_SIZE)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1);

        Ok(Arc::new(MockModel {
            device: device.to_string(),
            batch,
            spec,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn supported_config_keys(&self, device: &str) -> Vec<String> {
        self.devices
            .lock()
            .get(device)
            .map(|d| d.supported_keys.clone())
            .unwrap_or_default()
    }
}

/// Compiled-model handle produced by [`MockCore`]
pub struct MockModel {
    device: String,
    batch: usize,
    spec: MockDevice,
    stats: Arc<MockStats>,
}

impl BackendModel for MockModel {
    fn create_request(&self) -> Result<Box<dyn BackendRequest>> {
        let alloc = |specs: &[IoSpec]| {
            specs
                .iter()
                .map(|(name, bytes, layout)| {
                    let len = if layout.has_batch_axis() {
                        bytes * self.batch
                    } else {
                        *bytes
                    };
                    (name.clone(), Blob::allocate(len, *layout))
                })
                .collect::<HashMap<_, _>>()
        };

        let mut blobs = alloc(&self.spec.inputs);
        blobs.extend(alloc(&self.spec.outputs));

        Ok(Box::new(MockRequest {
            device: self.device.clone(),
            batch: self.batch,
            input_names: self.spec.inputs.iter().map(|(n, _, _)| n.clone()).collect(),
            output_names: self.spec.outputs.iter().map(|(n, _, _)| n.clone()).collect(),
            blobs,
            callback: Arc::new(Mutex::new(None)),
            infer_delay: self.spec.infer_delay,
            infer_error: self.spec.infer_error.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn metric(&self, key: MetricKey) -> Result<MetricValue> {
        match key {
            MetricKey::OptimalInferRequests => Ok(MetricValue::U32(self.spec.optimal_requests)),
            MetricKey::SupportedConfigKeys => {
                Ok(MetricValue::Keys(self.spec.supported_keys.clone()))
            }
            MetricKey::NetworkName => {
                Ok(MetricValue::Name(format!("mock-net@{}", self.device)))
            }
        }
    }
}

/// Native request produced by [`MockModel`]
pub struct MockRequest {
    device: String,
    batch: usize,
    input_names: Vec<String>,
    output_names: Vec<String>,
    blobs: HashMap<String, Blob>,
    callback: Arc<Mutex<Option<CompletionCallback>>>,
    infer_delay: Duration,
    infer_error: Option<String>,
    stats: Arc<MockStats>,
}

impl BackendRequest for MockRequest {
    fn set_callback(&mut self, callback: CompletionCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn start_async(&mut self) -> Result<()> {
        let inputs = self
            .input_names
            .iter()
            .filter_map(|name| self.blobs.get(name).map(|b| (name.clone(), b.bytes())))
            .collect();
        self.stats.starts.lock().push(StartRecord {
            device: self.device.clone(),
            batch: self.batch,
            inputs,
        });

        // Completion always fires from a separate thread, like a real
        // backend's callback thread; firing inline would re-enter the
        // caller while it still holds the request.
        let callback = Arc::clone(&self.callback);
        let delay = self.infer_delay;
        let error = self.infer_error.clone();
        std::thread::spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            if let Some(cb) = callback.lock().as_mut() {
                cb(error.map(DevMuxError::Backend));
            }
        });
        Ok(())
    }

    fn blob(&self, name: &str) -> Result<Blob> {
        self.blobs
            .get(name)
            .cloned()
            .ok_or_else(|| DevMuxError::not_found(format!("No blob named {}", name)))
    }

    fn set_blob(&mut self, name: &str, blob: Blob) -> Result<()> {
        if !self.blobs.contains_key(name) {
            return Err(DevMuxError::not_found(format!("No blob named {}", name)));
        }
        self.blobs.insert(name.to_string(), blob);
        Ok(())
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_mock_round_trip() {
        let core = MockCore::new().with_device("CPU", MockDevice::new());
        let stats = core.stats();

        let model = core.load_model("CPU", &ConfigMap::new()).unwrap();
        let mut request = model.create_request().unwrap();

        let (tx, rx) = mpsc::channel();
        request.set_callback(Box::new(move |err| {
            tx.send(err.is_none()).unwrap();
        }));

        request.blob("in").unwrap().copy_from_slice(&[1, 2, 3, 4]);
        request.start_async().unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert_eq!(stats.starts_on("CPU"), 1);
        assert_eq!(stats.starts.lock()[0].inputs["in"], vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_mock_batched_blob_sizing() {
        let core = MockCore::new().with_device("GPU", MockDevice::new());

        let mut config = ConfigMap::new();
        config.insert(keys::AUTO_BATCH_SIZE.to_string(), "4".to_string());
        let model = core.load_model("GPU", &config).unwrap();
        let request = model.create_request().unwrap();

        assert_eq!(request.blob("in").unwrap().len(), 16);
    }

    #[test]
    fn test_mock_failing_device() {
        let core = MockCore::new().with_device("NPU", MockDevice::new().failing());

        assert!(core.load_model("NPU", &ConfigMap::new()).is_err());
    }
}
