//! Resource budget tracking for in-process plan execution.
//!
//! Estimates scale a base per-task profile by priority (critical 2x, high
//! 1.5x, medium 1x, low 0.5x). Acquisition returns a guard; dropping the
//! guard releases the budget, so release happens on every exit path.

use crate::config::ResourceLimitsConfig;
use crate::events::{EventBus, SystemEvent};
use crate::types::TaskPriority;
use crate::OrchestrationError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

const BASE_CPU: f64 = 0.05;
const BASE_MEMORY_MB: f64 = 128.0;
const BASE_NETWORK_MBPS: f64 = 10.0;
const BASE_DISK_IO_MBPS: f64 = 5.0;

const WARN_UTILIZATION: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory_mb: f64,
    pub network_mbps: f64,
    pub disk_io_mbps: f64,
}

#[derive(Debug, Clone, Copy)]
struct Estimate {
    cpu: f64,
    memory_mb: f64,
    network_mbps: f64,
    disk_io_mbps: f64,
}

impl Estimate {
    fn for_priority(priority: TaskPriority) -> Self {
        let f = priority.resource_factor();
        Self {
            cpu: BASE_CPU * f,
            memory_mb: BASE_MEMORY_MB * f,
            network_mbps: BASE_NETWORK_MBPS * f,
            disk_io_mbps: BASE_DISK_IO_MBPS * f,
        }
    }
}

#[derive(Debug)]
struct Inner {
    limits: ResourceLimitsConfig,
    current: Mutex<ResourceUsage>,
    events: EventBus,
}

#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<Inner>,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimitsConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                current: Mutex::new(ResourceUsage::default()),
                events,
            }),
        }
    }

    /// Reserve the estimated budget for one task, or fail with
    /// `InsufficientResources`.
    pub fn try_acquire(&self, priority: TaskPriority) -> Result<ResourceGuard, OrchestrationError> {
        let estimate = Estimate::for_priority(priority);
        let mut current = self.inner.current.lock();

        let limits = &self.inner.limits;
        if current.cpu + estimate.cpu > limits.max_cpu_usage
            || current.memory_mb + estimate.memory_mb > limits.max_memory_mb as f64
            || current.network_mbps + estimate.network_mbps > limits.max_network_mbps as f64
            || current.disk_io_mbps + estimate.disk_io_mbps > limits.max_disk_io_mbps as f64
        {
            return Err(OrchestrationError::InsufficientResources(format!(
                "task estimate exceeds remaining budget (cpu {:.2}/{:.2})",
                current.cpu + estimate.cpu,
                limits.max_cpu_usage
            )));
        }

        current.cpu += estimate.cpu;
        current.memory_mb += estimate.memory_mb;
        current.network_mbps += estimate.network_mbps;
        current.disk_io_mbps += estimate.disk_io_mbps;

        let cpu_utilization = current.cpu / limits.max_cpu_usage;
        drop(current);

        if cpu_utilization > WARN_UTILIZATION {
            self.inner.events.emit(SystemEvent::ResourceWarning {
                resource: "cpu".into(),
                utilization: cpu_utilization,
            });
        }

        Ok(ResourceGuard {
            inner: self.inner.clone(),
            estimate,
        })
    }

    pub fn usage(&self) -> ResourceUsage {
        *self.inner.current.lock()
    }

    pub fn limits(&self) -> &ResourceLimitsConfig {
        &self.inner.limits
    }
}

/// Releases its reservation on drop.
#[derive(Debug)]
pub struct ResourceGuard {
    inner: Arc<Inner>,
    estimate: Estimate,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let mut current = self.inner.current.lock();
        current.cpu = (current.cpu - self.estimate.cpu).max(0.0);
        current.memory_mb = (current.memory_mb - self.estimate.memory_mb).max(0.0);
        current.network_mbps = (current.network_mbps - self.estimate.network_mbps).max(0.0);
        current.disk_io_mbps = (current.disk_io_mbps - self.estimate.disk_io_mbps).max(0.0);
        debug!("released task resource reservation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(max_memory_mb: u64) -> ResourceMonitor {
        ResourceMonitor::new(
            ResourceLimitsConfig {
                max_cpu_usage: 1.0,
                max_memory_mb,
                max_network_mbps: 10_000,
                max_disk_io_mbps: 10_000,
            },
            EventBus::new(),
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let m = monitor(10_000);
        let guard = m.try_acquire(TaskPriority::Medium).unwrap();
        assert!((m.usage().memory_mb - BASE_MEMORY_MB).abs() < 1e-9);
        drop(guard);
        assert!(m.usage().memory_mb.abs() < 1e-9);
    }

    #[test]
    fn test_priority_scaling() {
        let m = monitor(10_000);
        let _critical = m.try_acquire(TaskPriority::Critical).unwrap();
        assert!((m.usage().memory_mb - BASE_MEMORY_MB * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_exhaustion_fails_acquisition() {
        // Budget for exactly one medium task.
        let m = monitor(BASE_MEMORY_MB as u64);
        let _held = m.try_acquire(TaskPriority::Medium).unwrap();
        let err = m.try_acquire(TaskPriority::Medium).unwrap_err();
        assert!(matches!(err, OrchestrationError::InsufficientResources(_)));
    }

    #[test]
    fn test_release_makes_budget_available_again() {
        let m = monitor(BASE_MEMORY_MB as u64);
        let guard = m.try_acquire(TaskPriority::Medium).unwrap();
        drop(guard);
        assert!(m.try_acquire(TaskPriority::Medium).is_ok());
    }
}
