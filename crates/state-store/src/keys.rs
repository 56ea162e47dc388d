//! Key layout of the shared store.
//!
//! Each component owns a disjoint prefix. Two-key transactions are never
//! assumed outside queue lane moves, which the queue serializes with a
//! per-task lock.

pub const AGENT_REGISTRATION: &str = "agent:registration:";
pub const AGENT_HEALTH: &str = "agent:health:";
pub const TASK: &str = "task:";
pub const BATCH: &str = "batch:";
pub const CHANNEL: &str = "channel:";
pub const TEMPLATE: &str = "template:";
pub const DEPLOYMENT: &str = "deployment:";
pub const METRIC: &str = "metric:";

pub const QUEUE_READY: &str = "queue:main";
pub const QUEUE_PROCESSING: &str = "queue:processing";
pub const QUEUE_DELAYED: &str = "queue:delayed";
pub const QUEUE_DLQ: &str = "queue:dlq";

pub fn agent_registration(id: &str) -> String {
    format!("{AGENT_REGISTRATION}{id}")
}

pub fn agent_health(id: &str) -> String {
    format!("{AGENT_HEALTH}{id}")
}

pub fn task(id: &str) -> String {
    format!("{TASK}{id}")
}

pub fn batch(id: &str) -> String {
    format!("{BATCH}{id}")
}

pub fn channel(id: &str) -> String {
    format!("{CHANNEL}{id}")
}

pub fn template(id: &str) -> String {
    format!("{TEMPLATE}{id}")
}

pub fn deployment(id: &str) -> String {
    format!("{DEPLOYMENT}{id}")
}

pub fn metric(name: &str, ts_millis: i64) -> String {
    format!("{METRIC}{name}:{ts_millis}")
}
