//! Typed producer/consumer event-log library (§4.1), backed by Redis
//! Streams. Redis Streams natively provides consumer groups, per-message
//! acknowledgement, and `XPENDING`/`XCLAIM` idle-reclaim — the exact
//! primitives this section specifies.
//!
//! Every public operation is a suspension point; the consumer loop's sleeps
//! are via `tokio::time::sleep` so they honor `tokio::time::pause`/`advance`
//! in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Value};
use reporunner_retry::{calculate_delay, RetryStrategyConfig};
use reporunner_types::{Error, Event, Result};

/// Dead-letter list key (§6, bit-exact).
pub const DLQ_KEY: &str = "list:dlq";

pub async fn connect(connection_string: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(connection_string)?;
    let manager = client.get_connection_manager().await?;
    Ok(manager)
}

/// One event stream's producer side.
pub struct Producer {
    conn: ConnectionManager,
    stream: String,
}

impl Producer {
    pub fn new(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
        }
    }

    /// Serialize and append `event`, returning the broker-assigned message
    /// id. One broker call per event.
    pub async fn publish(&mut self, event: &Event) -> Result<String> {
        let payload = serde_json::to_vec(event)?;
        let id: String = self
            .conn
            .xadd(
                &self.stream,
                "*",
                &[("type", event.type_name().as_bytes()), ("payload", payload.as_slice())],
            )
            .await?;
        Ok(id)
    }
}

/// What a handler decided about one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Handled successfully — acknowledge.
    Ack,
    /// Transient failure — leave pending; the reclaim pass will re-present it.
    Retry,
}

/// Caller-supplied event handler. Mirrors the `Cache` trait's
/// `Pin<Box<dyn Future>>` shape so handlers can close over async state
/// without an `async-trait` dependency.
pub trait EventHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send + 'a>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle<'a>(&'a self, event: Event) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send + 'a>> {
        Box::pin(self(event))
    }
}

/// Consumer configuration (defaults per §4.1).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// The `type` this consumer expects; messages of any other type on the
    /// same (multiplexed) stream are acknowledged and skipped.
    pub expected_types: Vec<&'static str>,
    pub batch_size: usize,
    pub idle_timeout: Duration,
    pub max_retries: u32,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        expected_types: Vec<&'static str>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            expected_types,
            batch_size: 10,
            idle_timeout: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Bound to one stream, one group, one consumer identity.
pub struct Consumer {
    conn: ConnectionManager,
    config: ConsumerConfig,
}

struct PendingEntry {
    id: String,
    idle_ms: i64,
    delivery_count: i64,
}

impl Consumer {
    pub async fn new(conn: ConnectionManager, config: ConsumerConfig) -> Result<Self> {
        let mut consumer = Self { conn, config };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// Idempotent group creation; "already exists" is swallowed.
    async fn ensure_group(&mut self) -> Result<()> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Run the consume loop forever, dispatching decoded events to
    /// `handler`. Returns only on a non-recoverable error.
    pub async fn run(&mut self, handler: &dyn EventHandler) -> Result<()> {
        let backoff = RetryStrategyConfig::eventlog_backoff();
        let mut backoff_attempt: u32 = 1;

        loop {
            match self.tick(handler).await {
                Ok(progressed) => {
                    backoff_attempt = 1;
                    if !progressed {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
                Err(Error::TransientDependency(msg)) => {
                    tracing::warn!(error = %msg, "event-log broker error, backing off");
                    let delay = calculate_delay(&backoff, backoff_attempt);
                    tokio::time::sleep(delay).await;
                    backoff_attempt = backoff_attempt.saturating_add(1);
                    let _ = self.ensure_group().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One reclaim pass + one read pass. Returns whether any message was
    /// processed (so the caller can decide whether to sleep).
    async fn tick(&mut self, handler: &dyn EventHandler) -> Result<bool> {
        let reclaimed = self.reclaim_pass(handler).await?;
        let read = self.read_pass(handler).await?;
        Ok(reclaimed || read)
    }

    async fn reclaim_pass(&mut self, handler: &dyn EventHandler) -> Result<bool> {
        let pending = self.list_pending().await?;
        let mut progressed = false;

        for entry in pending {
            if entry.idle_ms < self.config.idle_timeout.as_millis() as i64 {
                continue;
            }
            progressed = true;

            if entry.delivery_count >= self.config.max_retries as i64 {
                let claimed = self.claim(&entry.id).await?;
                self.move_to_dlq(&entry.id, claimed).await?;
                continue;
            }

            if let Some((type_name, payload)) = self.claim(&entry.id).await? {
                self.dispatch(&entry.id, &type_name, payload, handler).await?;
            }
        }

        Ok(progressed)
    }

    async fn read_pass(&mut self, handler: &dyn EventHandler) -> Result<bool> {
        let reply: redis::RedisResult<Value> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(self.config.batch_size as i64)
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await;

        let reply = match reply {
            Ok(Value::Nil) => return Ok(false),
            Ok(v) => v,
            Err(e) => return Err(Error::from(e)),
        };

        let entries = parse_xread_reply(&reply, &self.config.stream);
        if entries.is_empty() {
            return Ok(false);
        }

        for (id, fields) in entries {
            let type_name = fields
                .iter()
                .find(|(k, _)| k == "type")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let payload = fields
                .iter()
                .find(|(k, _)| k == "payload")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.dispatch(&id, &type_name, payload.into_bytes(), handler).await?;
        }

        Ok(true)
    }

    /// Decode and invoke the handler, applying the type-multiplex and
    /// poison-message policies (§4.1 step 4).
    async fn dispatch(
        &mut self,
        id: &str,
        type_name: &str,
        payload: Vec<u8>,
        handler: &dyn EventHandler,
    ) -> Result<()> {
        if !self.config.expected_types.is_empty() && !self.config.expected_types.contains(&type_name) {
            self.ack(id).await?;
            return Ok(());
        }

        let event: Event = match serde_json::from_slice(&payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(message_id = id, error = %e, "poison message, acknowledging");
                self.ack(id).await?;
                return Ok(());
            }
        };

        match handler.handle(event).await {
            HandlerOutcome::Ack => self.ack(id).await,
            HandlerOutcome::Retry => Ok(()),
        }
    }

    async fn ack(&mut self, id: &str) -> Result<()> {
        let _: i64 = self
            .conn
            .xack(&self.config.stream, &self.config.group, &[id])
            .await?;
        Ok(())
    }

    async fn list_pending(&mut self) -> Result<Vec<PendingEntry>> {
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(0)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size as i64 * 4)
            .query_async(&mut self.conn)
            .await?;

        Ok(parse_xpending_extended(&reply))
    }

    async fn claim(&mut self, id: &str) -> Result<Option<(String, Vec<u8>)>> {
        let reply: Value = redis::cmd("XCLAIM")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.idle_timeout.as_millis() as i64)
            .arg(id)
            .query_async(&mut self.conn)
            .await?;

        let entries = parse_xread_reply(&reply, &self.config.stream);
        let claimed = entries
            .into_iter()
            .find(|(entry_id, _)| entry_id == id)
            .map(|(_, fields)| {
                let type_name = fields.iter().find(|(k, _)| k == "type").map(|(_, v)| v.clone()).unwrap_or_default();
                let payload = fields
                    .iter()
                    .find(|(k, _)| k == "payload")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                (type_name, payload.into_bytes())
            });
        Ok(claimed)
    }

    /// §6: `<stream>:<msgId>:<field1>=<v1>,<field2>=<v2>,…`, carrying
    /// `{stream, id, type, payload-preview}` per §4.1's failure semantics.
    /// `claimed` is `None` if the message vanished between `list_pending`
    /// and `claim` (already reclaimed by another consumer) — still worth a
    /// dead-letter entry so the retry exhaustion isn't silently dropped.
    async fn move_to_dlq(&mut self, id: &str, claimed: Option<(String, Vec<u8>)>) -> Result<()> {
        let (type_name, payload) = claimed.unwrap_or_default();
        let preview = payload_preview(&payload);
        let entry = format!("{}:{}:type={},payload={}", self.config.stream, id, type_name, preview);
        let _: i64 = self.conn.lpush(DLQ_KEY, entry).await?;
        self.ack(id).await
    }

    /// Lag query for health reporting (`pendingCount`).
    pub async fn pending_count(&mut self) -> Result<i64> {
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .query_async(&mut self.conn)
            .await?;
        Ok(parse_xpending_summary_count(&reply))
    }
}

/// Delete known stream keys and the dead-letter list. The `purge` variant
/// also runs on startup; only one process (the Edge Adapter) should set it
/// (§9, flush-on-startup note).
pub async fn cleanup(conn: &mut ConnectionManager, streams: &[&str]) -> Result<()> {
    for stream in streams {
        let _: i64 = conn.del(*stream).await?;
    }
    let _: i64 = conn.del(DLQ_KEY).await?;
    Ok(())
}

const PAYLOAD_PREVIEW_LEN: usize = 160;

/// Truncated, comma/newline-sanitized rendering of a dead-lettered payload
/// for the `list:dlq` entry's `payload=` field.
fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let flattened: String = text.chars().map(|c| if c == ',' || c.is_control() { ' ' } else { c }).collect();
    flattened.chars().take(PAYLOAD_PREVIEW_LEN).collect()
}

fn parse_xread_reply(value: &Value, stream: &str) -> Vec<(String, Vec<(String, String)>)> {
    let Value::Array(streams) = value else {
        return Vec::new();
    };
    for entry in streams {
        let Value::Array(pair) = entry else { continue };
        let [Value::BulkString(name), Value::Array(messages)] = pair.as_slice() else {
            continue;
        };
        if String::from_utf8_lossy(name) != stream {
            continue;
        }
        let mut out = Vec::with_capacity(messages.len());
        for msg in messages {
            let Value::Array(msg_parts) = msg else { continue };
            let [Value::BulkString(id), Value::Array(field_values)] = msg_parts.as_slice() else {
                continue;
            };
            let id = String::from_utf8_lossy(id).into_owned();
            let mut fields = Vec::new();
            let mut iter = field_values.iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                if let (Value::BulkString(k), Value::BulkString(v)) = (k, v) {
                    fields.push((
                        String::from_utf8_lossy(k).into_owned(),
                        String::from_utf8_lossy(v).into_owned(),
                    ));
                }
            }
            out.push((id, fields));
        }
        return out;
    }
    Vec::new()
}

fn parse_xpending_extended(value: &Value) -> Vec<PendingEntry> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(parts) = entry else { continue };
        if parts.len() < 4 {
            continue;
        }
        let id = match &parts[0] {
            Value::BulkString(b) => String::from_utf8_lossy(b).into_owned(),
            _ => continue,
        };
        let idle_ms = match &parts[2] {
            Value::Int(i) => *i,
            _ => 0,
        };
        let delivery_count = match &parts[3] {
            Value::Int(i) => *i,
            _ => 0,
        };
        out.push(PendingEntry {
            id,
            idle_ms,
            delivery_count,
        });
    }
    out
}

fn parse_xpending_summary_count(value: &Value) -> i64 {
    if let Value::Array(parts) = value {
        if let Some(Value::Int(count)) = parts.first() {
            return *count;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_xpending_extended_reads_idle_and_delivery_count() {
        let value = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"1-0".to_vec()),
            Value::BulkString(b"consumer-a".to_vec()),
            Value::Int(65_000),
            Value::Int(2),
        ])]);
        let entries = parse_xpending_extended(&value);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].idle_ms, 65_000);
        assert_eq!(entries[0].delivery_count, 2);
    }

    #[test]
    fn parse_xpending_summary_extracts_count() {
        let value = Value::Array(vec![
            Value::Int(3),
            Value::BulkString(b"1-0".to_vec()),
            Value::BulkString(b"5-0".to_vec()),
            Value::Nil,
        ]);
        assert_eq!(parse_xpending_summary_count(&value), 3);
    }

    #[test]
    fn parse_xread_reply_extracts_type_and_payload() {
        let value = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"stream:repo-runs".to_vec()),
            Value::Array(vec![Value::Array(vec![
                Value::BulkString(b"1-0".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"type".to_vec()),
                    Value::BulkString(b"run_requested".to_vec()),
                    Value::BulkString(b"payload".to_vec()),
                    Value::BulkString(b"{}".to_vec()),
                ]),
            ])]),
        ])]);

        let entries = parse_xread_reply(&value, "stream:repo-runs");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "1-0");
        assert!(entries[0].1.contains(&("type".to_string(), "run_requested".to_string())));
    }

    #[test]
    fn payload_preview_strips_commas_and_truncates() {
        let preview = payload_preview(br#"{"a":1,"b":2}"#);
        assert_eq!(preview, r#"{"a":1 "b":2}"#);

        let long = payload_preview(&vec![b'x'; PAYLOAD_PREVIEW_LEN + 50]);
        assert_eq!(long.len(), PAYLOAD_PREVIEW_LEN);
    }
}
