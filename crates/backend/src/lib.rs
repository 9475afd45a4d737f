//! devmux backend contract
//!
//! The scheduler treats every compute device as an opaque compiled-model
//! handle satisfying the narrow contract in this crate: create native
//! requests, answer a small set of metrics, run asynchronously and report
//! completion through a callback fired on the backend's own thread.

pub mod blob;
pub mod mock;

pub use blob::{Blob, Layout};

use devmux_common::{DevMuxError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Device name as used in priority strings, e.g. `"CPU"`, `"GPU"`, `"GPU.1"`
pub type DeviceName = String;

/// Flat string configuration map handed to backends
pub type ConfigMap = HashMap<String, String>;

/// Completion callback a backend invokes on its own thread when an
/// asynchronous inference finishes. `None` means success.
pub type CompletionCallback = Box<dyn FnMut(Option<DevMuxError>) + Send>;

/// Metric keys a compiled model can be queried for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKey {
    /// Number of parallel native requests the device runs best with;
    /// sizes the worker pool
    OptimalInferRequests,

    /// Config keys the backend accepts; everything else is dropped
    SupportedConfigKeys,

    /// Human-readable model name
    NetworkName,
}

/// Metric values returned by [`BackendModel::metric`]
#[derive(Debug, Clone)]
pub enum MetricValue {
    U32(u32),
    Keys(Vec<String>),
    Name(String),
}

impl MetricValue {
    /// Interpret the value as an unsigned integer
    pub fn as_u32(&self) -> Result<u32> {
        match self {
            MetricValue::U32(v) => Ok(*v),
            other => Err(DevMuxError::internal(format!(
                "Metric value {:?} is not an integer",
                other
            ))),
        }
    }

    /// Interpret the value as a list of config keys
    pub fn as_keys(&self) -> Result<&[String]> {
        match self {
            MetricValue::Keys(keys) => Ok(keys),
            other => Err(DevMuxError::internal(format!(
                "Metric value {:?} is not a key list",
                other
            ))),
        }
    }
}

/// Opaque compiled-model handle for one device
pub trait BackendModel: Send + Sync {
    /// Create one native inference request bound to this model
    fn create_request(&self) -> Result<Box<dyn BackendRequest>>;

    /// Query a model metric
    fn metric(&self, key: MetricKey) -> Result<MetricValue>;
}

/// One native inference request, reusable across many logical requests
pub trait BackendRequest: Send {
    /// Install the completion callback. The backend fires it on its own
    /// thread after every `start_async` completion; the callback must not
    /// panic there.
    fn set_callback(&mut self, callback: CompletionCallback);

    /// Begin an asynchronous inference; returns immediately
    fn start_async(&mut self) -> Result<()>;

    /// Fetch the request's buffer for a named tensor
    fn blob(&self, name: &str) -> Result<Blob>;

    /// Replace the request's buffer for a named tensor (aliasing, no copy)
    fn set_blob(&mut self, name: &str, blob: Blob) -> Result<()>;

    /// Input tensor names, in declaration order
    fn input_names(&self) -> Vec<String>;

    /// Output tensor names, in declaration order
    fn output_names(&self) -> Vec<String>;
}

/// Entry point for compiling models onto devices; drives the load race
pub trait BackendCore: Send + Sync {
    /// Compile the model for `device` with the given config. Slow for
    /// accelerators; may fail for unavailable devices.
    fn load_model(&self, device: &str, config: &ConfigMap) -> Result<Arc<dyn BackendModel>>;

    /// Config keys `device` accepts; used to filter merged device configs
    fn supported_config_keys(&self, device: &str) -> Vec<String>;
}
