//! Redis-backed settlement queue.
//!
//! Three keys per queue:
//! - `<key>`: sorted set of JSON jobs scored by ETA in epoch milliseconds
//! - `<key>:inflight`: sorted set of claimed job ids scored by lease expiry
//! - `<key>:payloads`: hash of claimed job id to its JSON
//!
//! Claiming runs as one Lua script, so requeueing expired leases, taking the
//! earliest due job and recording its lease happen atomically.

use super::{QueueError, SettlementJob, SettlementQueue};
use crate::config::{self, RedisConfig};
use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{debug, info};

/// KEYS: scheduled, inflight, payloads. ARGV: now millis, lease expiry millis.
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  local member = redis.call('HGET', KEYS[3], id)
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  if member then
    redis.call('ZADD', KEYS[1], ARGV[1], member)
  end
end

local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end

local member = due[1]
local id = cjson.decode(member)['id']
redis.call('ZREM', KEYS[1], member)
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', KEYS[3], id, member)
return member
"#;

#[derive(Clone)]
pub struct RedisSettlementQueue {
    pool: Pool<RedisConnectionManager>,
    key: String,
    inflight_key: String,
    payload_key: String,
    lease: chrono::Duration,
    claim: Script,
}

impl RedisSettlementQueue {
    pub async fn connect(config: &RedisConfig) -> Result<Self, QueueError> {
        let manager = RedisConnectionManager::new(config.url.as_str())?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .await?;
        info!(
            key = %config.queue_key,
            pool_size = config.pool_size,
            lease_secs = config.lease_secs,
            "Redis settlement queue connected"
        );
        Ok(Self {
            pool,
            key: config.queue_key.clone(),
            inflight_key: format!("{}:inflight", config.queue_key),
            payload_key: format!("{}:payloads", config.queue_key),
            lease: config::seconds(config.lease_secs),
            claim: Script::new(CLAIM_SCRIPT),
        })
    }

    async fn connection(
        &self,
    ) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Pool(e.to_string()))
    }
}

#[async_trait]
impl SettlementQueue for RedisSettlementQueue {
    async fn enqueue(&self, job: SettlementJob) -> Result<(), QueueError> {
        let member = serde_json::to_string(&job)?;
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(job.eta.timestamp_millis())
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        debug!(job_id = %job.id, reference = %job.reference, eta = %job.eta, "Job scheduled");
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<SettlementJob>, QueueError> {
        let mut conn = self.connection().await?;
        let member: Option<String> = self
            .claim
            .key(&self.key)
            .key(&self.inflight_key)
            .key(&self.payload_key)
            .arg(now.timestamp_millis())
            .arg((now + self.lease).timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;

        member
            .map(|m| serde_json::from_str(&m).map_err(QueueError::from))
            .transpose()
    }

    async fn ack(&self, job: &SettlementJob) -> Result<(), QueueError> {
        let id = job.id.to_string();
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.inflight_key)
            .arg(&id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.payload_key)
            .arg(&id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        debug!(job_id = %job.id, "Job acknowledged");
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let count: usize = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let count: usize = redis::cmd("ZCARD")
            .arg(&self.inflight_key)
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn scheduled(&self) -> Result<Vec<SettlementJob>, QueueError> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await?;
        members
            .iter()
            .map(|m| serde_json::from_str(m).map_err(QueueError::from))
            .collect()
    }
}
