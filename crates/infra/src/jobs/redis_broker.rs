//! Redis-backed broker (durable, multi-process).
//!
//! ## Layout (prefix `labflow` by default)
//!
//! - `{p}:envelopes` HASH entry id → envelope JSON
//! - `{p}:priority` HASH entry id → priority
//! - `{p}:ready:{queue}` ZSET entry id, score `-priority * 1e12 + seq`
//! - `{p}:delayed:{queue}` ZSET entry id, score visible-at (epoch ms)
//! - `{p}:leases:{queue}` ZSET lease token, score lease expiry (epoch ms)
//! - `{p}:lease_entries` HASH lease token → entry id
//! - `{p}:live` HASH job id → live envelope count
//! - `{p}:idem:{key}` STRING job id; given a TTL once the job completes
//!
//! Every state transition is a Lua script so concurrent workers never see a
//! half-moved envelope. Priorities are clamped to ±1000 to keep scores exact.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use labflow_core::JobId;

use super::broker::{Broker, BrokerError, Lease, Leased, QueueDepth};
use super::types::{AckHandle, JobEnvelope, QueueClass};

const DEFAULT_PREFIX: &str = "labflow";
const PRIORITY_LIMIT: i32 = 1_000;

const ENQUEUE: &str = r#"
-- KEYS: envelopes, priority, ready, delayed, live, seq
-- ARGV: entry, job_id, json, priority, visible_at_ms, is_delayed, idem_key
if ARGV[7] ~= '' then
  local owner = redis.call('GET', ARGV[7])
  if owner and owner ~= ARGV[2] then
    return {1, owner}
  end
  redis.call('SET', ARGV[7], ARGV[2])
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[4])
redis.call('HINCRBY', KEYS[5], ARGV[2], 1)
if ARGV[6] == '1' then
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  local seq = redis.call('INCR', KEYS[6])
  redis.call('ZADD', KEYS[3], -tonumber(ARGV[4]) * 1e12 + seq, ARGV[1])
end
return {0, ARGV[2]}
"#;

const DEQUEUE: &str = r#"
-- KEYS: ready, delayed, leases, lease_entries, envelopes, priority, seq
-- ARGV: now_ms, lease_expires_ms, token
local function requeue(entry)
  local p = tonumber(redis.call('HGET', KEYS[6], entry) or '0')
  local seq = redis.call('INCR', KEYS[7])
  redis.call('ZADD', KEYS[1], -p * 1e12 + seq, entry)
end
for _, token in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])) do
  local entry = redis.call('HGET', KEYS[4], token)
  redis.call('ZREM', KEYS[3], token)
  redis.call('HDEL', KEYS[4], token)
  if entry then requeue(entry) end
end
for _, entry in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[2], entry)
  requeue(entry)
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
  return false
end
local entry = head[1]
redis.call('ZREM', KEYS[1], entry)
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
redis.call('HSET', KEYS[4], ARGV[3], entry)
return {entry, redis.call('HGET', KEYS[5], entry)}
"#;

const ACK: &str = r#"
-- KEYS: leases, lease_entries, envelopes, priority, live
-- ARGV: token, idem_prefix, retention_secs
local entry = redis.call('HGET', KEYS[2], ARGV[1])
if not entry then
  return 0
end
local env = cjson.decode(redis.call('HGET', KEYS[3], entry))
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], entry)
redis.call('HDEL', KEYS[4], entry)
local live = redis.call('HINCRBY', KEYS[5], env.id, -1)
if live <= 0 then
  redis.call('HDEL', KEYS[5], env.id)
  if type(env.idempotency_key) == 'string' then
    local key = ARGV[2] .. env.idempotency_key
    if redis.call('GET', key) == env.id then
      redis.call('EXPIRE', key, ARGV[3])
    end
  end
end
return 1
"#;

const NACK: &str = r#"
-- KEYS: leases, lease_entries, ready, priority, seq
-- ARGV: token
local entry = redis.call('HGET', KEYS[2], ARGV[1])
if not entry then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
local p = tonumber(redis.call('HGET', KEYS[4], entry) or '0')
local seq = redis.call('INCR', KEYS[5])
redis.call('ZADD', KEYS[3], -p * 1e12 + seq, entry)
return 1
"#;

const EXTEND: &str = r#"
-- KEYS: leases
-- ARGV: token, now_ms, lease_expires_ms
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) <= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
return 1
"#;

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    retention: Duration,
    enqueue: redis::Script,
    dequeue: redis::Script,
    ack: redis::Script,
    nack: redis::Script,
    extend: redis::Script,
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

fn unavailable(e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

fn epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_epoch_ms(ms: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_else(Utc::now)
}

impl RedisBroker {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str, retention: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            retention,
            enqueue: redis::Script::new(ENQUEUE),
            dequeue: redis::Script::new(DEQUEUE),
            ack: redis::Script::new(ACK),
            nack: redis::Script::new(NACK),
            extend: redis::Script::new(EXTEND),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }

    fn queue_key(&self, kind: &str, queue: QueueClass) -> String {
        format!("{}:{kind}:{}", self.prefix, queue.as_str())
    }

    fn idem_prefix(&self) -> String {
        format!("{}:idem:", self.prefix)
    }

    fn decode(json: &str) -> Result<JobEnvelope, BrokerError> {
        serde_json::from_str(json).map_err(|e| BrokerError::Encoding(e.to_string()))
    }

    async fn envelopes(&self, entries: &[String]) -> Result<Vec<JobEnvelope>, BrokerError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key("envelopes"))
            .arg(entries)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.into_iter().flatten().map(|json| Self::decode(&json)).collect()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<AckHandle, BrokerError> {
        let json = serde_json::to_string(&envelope).map_err(|e| BrokerError::Encoding(e.to_string()))?;
        let now = Utc::now();
        let visible_at = envelope.not_before.filter(|at| *at > now);
        let idem_key = envelope
            .idempotency_key
            .as_ref()
            .map(|k| format!("{}{k}", self.idem_prefix()))
            .unwrap_or_default();

        let mut conn = self.conn.clone();
        let (duplicate, owner): (i64, String) = self
            .enqueue
            .key(self.key("envelopes"))
            .key(self.key("priority"))
            .key(self.queue_key("ready", envelope.queue))
            .key(self.queue_key("delayed", envelope.queue))
            .key(self.key("live"))
            .key(self.key("seq"))
            .arg(Uuid::now_v7().to_string())
            .arg(envelope.id.to_string())
            .arg(json)
            .arg(envelope.priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT))
            .arg(visible_at.map(epoch_ms).unwrap_or(0))
            .arg(if visible_at.is_some() { "1" } else { "0" })
            .arg(idem_key)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let job_id = owner
            .parse::<JobId>()
            .map_err(|e| BrokerError::Encoding(e.to_string()))?;
        Ok(AckHandle {
            job_id,
            duplicate: duplicate == 1,
        })
    }

    async fn dequeue(
        &self,
        queues: &[QueueClass],
        visibility_timeout: Duration,
    ) -> Result<Option<Leased>, BrokerError> {
        let mut conn = self.conn.clone();
        for &queue in queues {
            let now = Utc::now();
            let expires_at = now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
            let token = Uuid::now_v7();

            let hit: Option<(String, String)> = self
                .dequeue
                .key(self.queue_key("ready", queue))
                .key(self.queue_key("delayed", queue))
                .key(self.queue_key("leases", queue))
                .key(self.key("lease_entries"))
                .key(self.key("envelopes"))
                .key(self.key("priority"))
                .key(self.key("seq"))
                .arg(epoch_ms(now))
                .arg(epoch_ms(expires_at))
                .arg(token.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if let Some((_entry, json)) = hit {
                let envelope = Self::decode(&json)?;
                let lease = Lease {
                    token,
                    job_id: envelope.id,
                    queue,
                    expires_at,
                };
                return Ok(Some(Leased { envelope, lease }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let done: i64 = self
            .ack
            .key(self.queue_key("leases", lease.queue))
            .key(self.key("lease_entries"))
            .key(self.key("envelopes"))
            .key(self.key("priority"))
            .key(self.key("live"))
            .arg(lease.token.to_string())
            .arg(self.idem_prefix())
            .arg(self.retention.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if done == 1 {
            Ok(())
        } else {
            Err(BrokerError::LeaseNotFound(lease.job_id))
        }
    }

    async fn nack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let done: i64 = self
            .nack
            .key(self.queue_key("leases", lease.queue))
            .key(self.key("lease_entries"))
            .key(self.queue_key("ready", lease.queue))
            .key(self.key("priority"))
            .key(self.key("seq"))
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if done == 1 {
            Ok(())
        } else {
            Err(BrokerError::LeaseNotFound(lease.job_id))
        }
    }

    async fn extend(&self, lease: &Lease, visibility_timeout: Duration) -> Result<DateTime<Utc>, BrokerError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
        let mut conn = self.conn.clone();
        let done: i64 = self
            .extend
            .key(self.queue_key("leases", lease.queue))
            .arg(lease.token.to_string())
            .arg(epoch_ms(now))
            .arg(epoch_ms(expires_at))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if done == 1 {
            Ok(expires_at)
        } else {
            Err(BrokerError::LeaseNotFound(lease.job_id))
        }
    }

    async fn depth(&self, queue: QueueClass) -> Result<QueueDepth, BrokerError> {
        let mut conn = self.conn.clone();
        let ready: usize = conn.zcard(self.queue_key("ready", queue)).await.map_err(unavailable)?;
        let delayed: usize = conn.zcard(self.queue_key("delayed", queue)).await.map_err(unavailable)?;
        let in_flight: usize = conn.zcard(self.queue_key("leases", queue)).await.map_err(unavailable)?;
        Ok(QueueDepth {
            ready,
            delayed,
            in_flight,
        })
    }

    async fn pending(&self, queue: QueueClass, limit: usize) -> Result<Vec<JobEnvelope>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .zrange(self.queue_key("ready", queue), 0, limit as isize - 1)
            .await
            .map_err(unavailable)?;
        self.envelopes(&entries).await
    }

    async fn scheduled(&self, limit: usize) -> Result<Vec<JobEnvelope>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut entries: Vec<(String, f64)> = Vec::new();
        for queue in QueueClass::ALL {
            let batch: Vec<(String, f64)> = conn
                .zrange_withscores(self.queue_key("delayed", queue), 0, limit as isize - 1)
                .await
                .map_err(unavailable)?;
            entries.extend(batch);
        }
        entries.sort_by(|a, b| a.1.total_cmp(&b.1));
        entries.truncate(limit);
        let ids: Vec<String> = entries.into_iter().map(|(id, _)| id).collect();
        self.envelopes(&ids).await
    }

    async fn in_flight(&self) -> Result<Vec<Leased>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut out = Vec::new();
        for queue in QueueClass::ALL {
            let leases: Vec<(String, f64)> = conn
                .zrange_withscores(self.queue_key("leases", queue), 0, -1)
                .await
                .map_err(unavailable)?;
            if leases.is_empty() {
                continue;
            }
            let expiries: BTreeMap<String, f64> = leases.into_iter().collect();
            let tokens: Vec<&String> = expiries.keys().collect();
            let entries: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(self.key("lease_entries"))
                .arg(&tokens)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            for (token, entry) in tokens.iter().zip(entries) {
                let Some(entry) = entry else { continue };
                let Some(envelope) = self.envelopes(std::slice::from_ref(&entry)).await?.pop() else {
                    continue;
                };
                let Ok(token_uuid) = Uuid::parse_str(token) else { continue };
                out.push(Leased {
                    lease: Lease {
                        token: token_uuid,
                        job_id: envelope.id,
                        queue,
                        expires_at: from_epoch_ms(expiries[*token]),
                    },
                    envelope,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_reference_only_declared_keys() {
        // Each script indexes KEYS up to the number of keys the Rust side passes.
        for (script, keys) in [(ENQUEUE, 6), (DEQUEUE, 7), (ACK, 5), (NACK, 5), (EXTEND, 1)] {
            assert!(script.contains(&format!("KEYS[{keys}]")));
            assert!(!script.contains(&format!("KEYS[{}]", keys + 1)));
        }
    }

    #[test]
    fn epoch_conversion_round_trips_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(from_epoch_ms(epoch_ms(at) as f64), at);
    }
}
