//! Metrics collection for devmux
//!
//! This module provides Prometheus metrics for observability.
//! The batch full-vs-timeout split is the primary health signal: a high
//! timeout share means the configured batch size rarely fills in time.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for devmux
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
    pub batch: BatchMetrics,
    pub load: LoadMetrics,
}

/// Scheduler and worker-pool metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Tasks handed to an idle worker immediately
    pub dispatched_total: IntCounter,

    /// Tasks parked on a pending queue because every candidate was busy
    pub enqueued_total: IntCounter,

    /// Inferences completed across all pools
    pub infer_total: IntCounter,

    /// Inferences served by the load-race helper device before reclaim
    pub helper_infer_total: IntCounter,

    /// Current idle workers across all pools
    pub idle_workers: IntGauge,
}

/// Batch-collector metrics
#[derive(Debug, Clone)]
pub struct BatchMetrics {
    /// Requests satisfied by a full batched call
    pub full_dispatches_total: IntCounter,

    /// Requests satisfied individually on the collect-timeout path
    pub timeout_dispatches_total: IntCounter,

    /// Distribution of batch fill levels at dispatch time
    pub fill_at_dispatch: Histogram,
}

/// Device-load and fallback metrics
#[derive(Debug, Clone)]
pub struct LoadMetrics {
    /// Device load duration
    pub load_duration: Histogram,

    /// Candidate devices that failed to load
    pub load_failures_total: IntCounter,

    /// Fallbacks to the next candidate device
    pub fallback_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let dispatched_total = IntCounter::new(
            "scheduler_dispatched_total",
            "Tasks dispatched directly to an idle worker",
        )
        .unwrap();

        let enqueued_total = IntCounter::new(
            "scheduler_enqueued_total",
            "Tasks queued because all candidate workers were busy",
        )
        .unwrap();

        let infer_total = IntCounter::new(
            "scheduler_infer_total",
            "Total inferences completed across all worker pools",
        )
        .unwrap();

        let helper_infer_total = IntCounter::new(
            "scheduler_helper_infer_total",
            "Inferences served by the warm-up helper device",
        )
        .unwrap();

        let idle_workers = IntGauge::new(
            "scheduler_idle_workers",
            "Current number of idle workers across all pools",
        )
        .unwrap();

        let full_dispatches_total = IntCounter::new(
            "batch_full_dispatches_total",
            "Requests satisfied by a full batched backend call",
        )
        .unwrap();

        let timeout_dispatches_total = IntCounter::new(
            "batch_timeout_dispatches_total",
            "Requests satisfied individually after the collect timeout",
        )
        .unwrap();

        let fill_at_dispatch = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "batch_fill_at_dispatch",
                "Batch fill level at dispatch time",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )
        .unwrap();

        let load_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "load_device_duration_seconds",
                "Device model-load duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .unwrap();

        let load_failures_total = IntCounter::new(
            "load_device_failures_total",
            "Candidate devices that failed to load",
        )
        .unwrap();

        let fallback_total = IntCounter::new(
            "load_fallback_total",
            "Fallbacks from a failed candidate device to the next one",
        )
        .unwrap();

        registry.register(Box::new(dispatched_total.clone())).unwrap();
        registry.register(Box::new(enqueued_total.clone())).unwrap();
        registry.register(Box::new(infer_total.clone())).unwrap();
        registry.register(Box::new(helper_infer_total.clone())).unwrap();
        registry.register(Box::new(idle_workers.clone())).unwrap();

        registry.register(Box::new(full_dispatches_total.clone())).unwrap();
        registry.register(Box::new(timeout_dispatches_total.clone())).unwrap();
        registry.register(Box::new(fill_at_dispatch.clone())).unwrap();

        registry.register(Box::new(load_duration.clone())).unwrap();
        registry.register(Box::new(load_failures_total.clone())).unwrap();
        registry.register(Box::new(fallback_total.clone())).unwrap();

        let scheduler = SchedulerMetrics {
            dispatched_total,
            enqueued_total,
            infer_total,
            helper_infer_total,
            idle_workers,
        };

        let batch = BatchMetrics {
            full_dispatches_total,
            timeout_dispatches_total,
            fill_at_dispatch,
        };

        let load = LoadMetrics {
            load_duration,
            load_failures_total,
            fallback_total,
        };

        MetricsRegistry {
            registry,
            scheduler,
            batch,
            load,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
