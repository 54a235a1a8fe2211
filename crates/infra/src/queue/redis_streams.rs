//! Redis Streams-backed job queue with delayed delivery.
//!
//! ## Keys
//!
//! - **Ready stream**: `{name}:stream`, consumed with XREADGROUP by one consumer group
//! - **Delayed set**: `{name}:delayed`, a ZSET scored by due time in epoch milliseconds
//!
//! Due times are computed inside Lua scripts from the broker's `TIME`, so producers
//! and consumers on skewed hosts agree on when a job becomes ready. Delayed jobs are
//! promoted into the ready stream by the consumer on every `receive`; the ZREM and
//! XADD happen atomically in the same script. Each stream entry carries `job_id`,
//! `delay_ms` and `payload` fields.
//!
//! ## Acknowledgement
//!
//! `ack` issues XACK followed by XDEL. Entries a crashed consumer left pending are
//! reclaimed with XAUTOCLAIM once they have been idle for `reclaim_after`. Entries
//! without a payload can never be handled and are acknowledged and deleted as soon
//! as they are read.
//!
//! Every round-trip is bounded by `io_timeout`; a blocking read gets its wait added
//! on top.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use eatsavvy_core::EnrichmentJob;

use super::{encode_job, Delivery, JobQueue, QueueError};
use crate::config::QueueConfig;

/// Default idle time before another consumer's pending entry is reclaimed.
const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(10 * 60);

/// Max delayed entries promoted per receive.
const PROMOTE_BATCH: usize = 100;

/// KEYS: delayed set. ARGV: delay in ms, member.
const SCHEDULE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return redis.call('ZADD', KEYS[1], now_ms + tonumber(ARGV[1]), ARGV[2])
"#;

/// KEYS: delayed set, ready stream. ARGV: batch size.
const PROMOTE_DUE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now_ms, 'LIMIT', 0, ARGV[1])
local promoted = 0
for _, member in ipairs(due) do
  if redis.call('ZREM', KEYS[1], member) == 1 then
    local entry = cjson.decode(member)
    redis.call('XADD', KEYS[2], '*', 'job_id', entry.job_id, 'delay_ms', entry.delay_ms, 'payload', entry.payload)
    promoted = promoted + 1
  end
end
return promoted
"#;

/// Member of the delayed set. `delay_ms` is a string so it reaches XADD verbatim.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    job_id: String,
    delay_ms: String,
    payload: String,
}

#[derive(Clone)]
pub struct RedisJobQueue {
    /// Commands other than the blocking read.
    conn: MultiplexedConnection,
    /// Dedicated to XREADGROUP BLOCK so it never stalls publishes or acks.
    read_conn: MultiplexedConnection,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    io_timeout: Duration,
    reclaim_after: Duration,
    schedule_script: redis::Script,
    promote_script: redis::Script,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("stream_key", &self.stream_key)
            .field("delayed_key", &self.delayed_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl RedisJobQueue {
    /// Connect and ensure the consumer group exists (idempotent).
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `config` - queue name, consumer group and IO timeout
    pub async fn connect(redis_url: &str, config: &QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;

        let conn = bounded("connect", config.io_timeout, client.get_multiplexed_async_connection()).await?;
        let read_conn = bounded("connect", config.io_timeout, client.get_multiplexed_async_connection()).await?;

        let queue = Self {
            conn,
            read_conn,
            stream_key: format!("{}:stream", config.name),
            delayed_key: format!("{}:delayed", config.name),
            group: config.group.clone(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            io_timeout: config.io_timeout,
            reclaim_after: DEFAULT_RECLAIM_AFTER,
            schedule_script: redis::Script::new(SCHEDULE_SCRIPT),
            promote_script: redis::Script::new(PROMOTE_DUE_SCRIPT),
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// Use a fixed consumer name instead of a generated one.
    pub fn with_consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_reclaim_after(mut self, idle: Duration) -> Self {
        self.reclaim_after = idle;
        self
    }

    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        // XGROUP CREATE … MKSTREAM; BUSYGROUP means it already exists.
        let created = tokio::time::timeout(
            self.io_timeout,
            redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| QueueError::Timeout {
            operation: "xgroup_create",
            after: self.io_timeout,
        })?;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let promoted: i64 = bounded(
            "promote_due",
            self.io_timeout,
            self.promote_script
                .key(&self.delayed_key)
                .key(&self.stream_key)
                .arg(PROMOTE_BATCH)
                .invoke_async(&mut conn),
        )
        .await?;

        if promoted > 0 {
            debug!(promoted, "promoted delayed jobs");
        }
        Ok(())
    }

    async fn reclaim_stale(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = bounded(
            "xautoclaim",
            self.io_timeout,
            redis::cmd("XAUTOCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(self.reclaim_after.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(1)
                .query_async(&mut conn),
        )
        .await?;

        // Reply: [next_cursor, [entries…], (deleted ids)]
        let entries = match reply {
            redis::Value::Bulk(mut parts) if parts.len() >= 2 => parts.swap_remove(1),
            _ => return Ok(None),
        };
        let delivery = self.take_first(entries).await?;
        if let Some(d) = &delivery {
            warn!(message_id = %d.id, "reclaimed stale pending entry");
        }
        Ok(delivery)
    }

    /// First job of an entry list; unusable entries ahead of it are removed.
    async fn take_first(&self, entries: redis::Value) -> Result<Option<Delivery>, QueueError> {
        let batch = scan_entries(entries);
        for id in &batch.malformed {
            warn!(message_id = %id, "dropping stream entry without payload");
            self.remove(id).await?;
        }
        Ok(batch.delivery)
    }

    /// XACK then XDEL, so the entry leaves both the pending list and the stream.
    async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: (i64, i64) = bounded(
            "xack",
            self.io_timeout,
            redis::pipe()
                .cmd("XACK")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(id)
                .cmd("XDEL")
                .arg(&self.stream_key)
                .arg(id)
                .query_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn read_new(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.read_conn.clone();
        let block_ms = wait.as_millis().max(1) as u64;
        let reply: redis::Value = bounded(
            "xreadgroup",
            self.io_timeout + wait,
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(&self.stream_key)
                .arg(">")
                .query_async(&mut conn),
        )
        .await?;

        // Reply: nil on timeout, else [[stream_key, [entries…]]]
        let streams = match reply {
            redis::Value::Bulk(streams) => streams,
            _ => return Ok(None),
        };
        for stream in streams {
            if let redis::Value::Bulk(mut parts) = stream {
                if parts.len() >= 2 {
                    return self.take_first(parts.swap_remove(1)).await;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(stream_key = %self.stream_key, job_id = %job.job_id), err)]
    async fn publish(&self, job: &EnrichmentJob) -> Result<(), QueueError> {
        let payload = encode_job(job)?;
        let mut conn = self.conn.clone();

        let _: String = bounded(
            "xadd",
            self.io_timeout,
            redis::cmd("XADD")
                .arg(&self.stream_key)
                .arg("*")
                .arg("job_id")
                .arg(job.job_id.to_string())
                .arg("delay_ms")
                .arg(0)
                .arg("payload")
                .arg(payload)
                .query_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    #[instrument(
        skip(self, job),
        fields(delayed_key = %self.delayed_key, job_id = %job.job_id, delay_ms = delay.as_millis() as u64),
        err
    )]
    async fn publish_delayed(&self, job: &EnrichmentJob, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.publish(job).await;
        }

        let payload = String::from_utf8(encode_job(job)?).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let delay_ms = delay.as_millis() as u64;
        let member = serde_json::to_string(&DelayedEntry {
            job_id: job.job_id.to_string(),
            delay_ms: delay_ms.to_string(),
            payload,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: i64 = bounded(
            "zadd",
            self.io_timeout,
            self.schedule_script
                .key(&self.delayed_key)
                .arg(delay_ms)
                .arg(member)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.promote_due().await?;

        if let Some(delivery) = self.reclaim_stale().await? {
            return Ok(Some(delivery));
        }

        self.read_new(wait).await
    }

    #[instrument(skip(self, delivery), fields(stream_key = %self.stream_key, message_id = %delivery.id), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.remove(&delivery.id).await
    }
}

async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, QueueError>
where
    F: std::future::Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_connection_dropped() || e.is_io_error() => {
            Err(QueueError::Connection(format!("{operation} failed: {e}")))
        }
        Ok(Err(e)) => Err(QueueError::Command(format!("{operation} failed: {e}"))),
        Err(_) => Err(QueueError::Timeout {
            operation,
            after: limit,
        }),
    }
}

enum StreamEntry {
    Job(Delivery),
    /// Readable id but no payload.
    Malformed(String),
}

#[derive(Default)]
struct EntryBatch {
    delivery: Option<Delivery>,
    malformed: Vec<String>,
}

/// First job of an entry list (`[[id, [field, value, …]], …]`) plus the ids of
/// payload-less entries seen before it.
fn scan_entries(entries: redis::Value) -> EntryBatch {
    let mut batch = EntryBatch::default();
    let redis::Value::Bulk(entries) = entries else {
        return batch;
    };
    for entry in entries {
        match parse_entry(entry) {
            Some(StreamEntry::Job(delivery)) => {
                batch.delivery = Some(delivery);
                break;
            }
            Some(StreamEntry::Malformed(id)) => batch.malformed.push(id),
            None => {}
        }
    }
    batch
}

fn parse_entry(entry: redis::Value) -> Option<StreamEntry> {
    let redis::Value::Bulk(mut parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }
    let raw_fields = parts.swap_remove(1);
    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        redis::Value::Status(s) => s.clone(),
        _ => return None,
    };

    let redis::Value::Bulk(raw_fields) = raw_fields else {
        return Some(StreamEntry::Malformed(id));
    };
    let mut fields: HashMap<String, Vec<u8>> = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(String::from_utf8_lossy(key).to_string(), value.clone());
        }
    }

    let Some(payload) = fields.remove("payload") else {
        return Some(StreamEntry::Malformed(id));
    };
    let delay_ms = fields
        .get("delay_ms")
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Some(StreamEntry::Job(Delivery {
        id,
        payload,
        delay: Duration::from_millis(delay_ms),
    }))
}
