//! Redis-backed implementation of [`StateStore`].
//!
//! Queue lanes map onto sorted sets, component records onto plain keys with
//! TTLs, and broadcasts onto Redis pub/sub. Connections come from a deadpool
//! pool; a dedicated client serves pub/sub subscriptions, one forwarding
//! task per channel.

use crate::types::{ScoredMember, StoreConfig};
use crate::{StateStore, StoreError};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use deadpool_redis::redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct RedisStore {
    pool: Pool,
    pubsub_client: redis::Client,
    config: StoreConfig,
}

fn op_err(e: deadpool_redis::redis::RedisError) -> StoreError {
    StoreError::Operation {
        error: e.to_string(),
    }
}

impl RedisStore {
    pub async fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let pool = Config::from_url(config.url.clone())
            .builder()
            .map_err(|e| StoreError::Connection {
                error: format!("Failed to create pool builder: {}", e),
            })?
            .max_size(config.max_connections as usize)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection {
                error: format!("Failed to build connection pool: {}", e),
            })?;

        let pubsub_client =
            redis::Client::open(config.url.as_str()).map_err(|e| StoreError::Connection {
                error: format!("Failed to open pub/sub client: {}", e),
            })?;

        let store = Self {
            pool,
            pubsub_client,
            config,
        };

        // Round-trip once so a bad URL fails at startup, not first use.
        let mut conn = store.conn().await?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StoreError::Connection {
                error: format!("Initial ping failed: {}", e),
            })?;

        info!("Redis store connected at {}", store.config.url);
        Ok(store)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        let mut last_error = None;
        for attempt in 0..=self.config.operation_retries {
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e.to_string());
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(StoreError::Connection {
            error: last_error.unwrap_or_else(|| "pool exhausted".to_string()),
        })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(op_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(op_err),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(op_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(op_err)?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.keys(format!("{prefix}*")).await.map_err(op_err)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(op_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrem(key, member).await.map_err(op_err)?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn().await?;
        conn.zscore(key, member).await.map_err(op_err)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        conn.zcard(key).await.map_err(op_err)
    }

    async fn ztop(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<(String, f64)> = conn
            .zrevrange_withscores(key, 0, count as isize - 1)
            .await
            .map_err(op_err)?;
        Ok(raw
            .into_iter()
            .map(|(member, score)| ScoredMember::new(member, score))
            .collect())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(key, min, max, 0, limit as isize)
            .await
            .map_err(op_err)?;
        Ok(raw
            .into_iter()
            .map(|(member, score)| ScoredMember::new(member, score))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let receivers: u64 = conn.publish(channel, payload).await.map_err(op_err)?;
        debug!("Published to {} subscribers on {}", receivers, channel);
        Ok(receivers)
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, StoreError> {
        let conn = self
            .pubsub_client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::PubSub {
                error: format!("Failed to get pub/sub connection: {}", e),
            })?;

        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::PubSub {
                error: format!("Failed to subscribe to {}: {}", channel, e),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();
                if tx.send(payload).is_err() {
                    break;
                }
            }
            debug!("Subscription to {} ended", channel_name);
        });

        info!("Subscribed to channel: {}", channel);
        Ok(rx)
    }
}
