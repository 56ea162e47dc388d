//! Shared state store for the orchestration engine.
//!
//! Every component persists through the same abstract interface: a key-value
//! space with TTL support, score-ordered sets backing the queue lanes, and a
//! pub/sub fan-out for broadcasts. `RedisStore` is the production backend;
//! `MemoryStore` provides the same semantics in-process and is what the test
//! suites run against.

pub mod client;
pub mod keys;
pub mod memory;
pub mod types;

pub use client::RedisStore;
pub use memory::MemoryStore;
pub use types::{ScoredMember, StoreConfig};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {error}")]
    Connection { error: String },

    #[error("Operation failed: {error}")]
    Operation { error: String },

    #[error("Serialization error: {error}")]
    Serialization { error: String },

    #[error("PubSub error: {error}")]
    PubSub { error: String },
}

/// Abstract store contract shared by all orchestration components.
///
/// Each component owns a disjoint key prefix (see [`keys`]); per-key writes
/// from a single component are serialized by that component. Ordered sets
/// rank members by an `f64` score; ties are resolved by member ordering in
/// the backend and must not be relied upon by callers.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
    /// Members ranked highest score first.
    async fn ztop(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, StoreError>;
    /// Members with `min <= score <= max`, lowest first, capped at `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Returns the number of receivers the payload reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError>;
    async fn subscribe(&self, channel: &str)
        -> Result<mpsc::UnboundedReceiver<String>, StoreError>;
}
