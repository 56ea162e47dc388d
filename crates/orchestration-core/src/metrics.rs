//! Prometheus metrics for the orchestration engine.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_gauge_vec, register_histogram, Counter, Encoder,
    Gauge, GaugeVec, Histogram, TextEncoder,
};

lazy_static! {
    static ref TASKS_SUBMITTED: Counter = register_counter!(
        "orchestrator_tasks_submitted_total",
        "Total number of tasks admitted"
    )
    .expect("Can't create metrics");

    static ref TASK_RETRIES: Counter = register_counter!(
        "orchestrator_task_retries_total",
        "Total number of task retries scheduled"
    )
    .expect("Can't create metrics");

    static ref DLQ_ARRIVALS: Counter = register_counter!(
        "orchestrator_dead_letter_total",
        "Tasks moved to the dead-letter lane"
    )
    .expect("Can't create metrics");

    static ref TRANSPORT_FAILURES: Counter = register_counter!(
        "orchestrator_transport_failures_total",
        "Message deliveries that exhausted their retry budget"
    )
    .expect("Can't create metrics");

    static ref TASK_DURATION: Histogram = register_histogram!(
        "orchestrator_task_duration_seconds",
        "Task execution duration in seconds"
    )
    .expect("Can't create metrics");

    static ref TASK_WAIT: Histogram = register_histogram!(
        "orchestrator_task_wait_seconds",
        "Time between task admission and first dispatch"
    )
    .expect("Can't create metrics");

    static ref AGENTS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "orchestrator_agents",
        "Registered agents by status",
        &["status"]
    )
    .expect("Can't create metrics");

    static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "orchestrator_queue_depth",
        "Tasks per queue lane",
        &["lane"]
    )
    .expect("Can't create metrics");

    static ref ACTIVE_CONNECTIONS: Gauge = register_gauge!(
        "orchestrator_active_connections",
        "Live agent transport connections"
    )
    .expect("Can't create metrics");
}

pub struct EngineMetrics {
    encoder: TextEncoder,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            encoder: TextEncoder::new(),
        }
    }

    pub fn task_submitted(&self) {
        TASKS_SUBMITTED.inc();
    }

    pub fn task_retried(&self) {
        TASK_RETRIES.inc();
    }

    pub fn dead_letter(&self) {
        DLQ_ARRIVALS.inc();
    }

    pub fn transport_failure(&self) {
        TRANSPORT_FAILURES.inc();
    }

    pub fn observe_task_duration(&self, seconds: f64) {
        TASK_DURATION.observe(seconds);
    }

    pub fn observe_task_wait(&self, seconds: f64) {
        TASK_WAIT.observe(seconds);
    }

    pub fn set_agents(&self, status: &str, count: f64) {
        AGENTS_BY_STATUS.with_label_values(&[status]).set(count);
    }

    pub fn set_queue_depth(&self, lane: &str, depth: f64) {
        QUEUE_DEPTH.with_label_values(&[lane]).set(depth);
    }

    pub fn set_active_connections(&self, count: f64) {
        ACTIVE_CONNECTIONS.set(count);
    }

    /// Text-format encoding of the whole registry for the `/metrics` route.
    pub fn gather(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        self.encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        let metrics = EngineMetrics::new();
        metrics.task_submitted();
        metrics.set_queue_depth("ready", 3.0);
        let text = metrics.gather().unwrap();
        assert!(text.contains("orchestrator_tasks_submitted_total"));
        assert!(text.contains("orchestrator_queue_depth"));
    }
}
