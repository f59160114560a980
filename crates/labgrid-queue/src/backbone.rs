//! The Redis operations labgrid relies on, behind one async trait.
//!
//! [`RedisBackbone`] talks to a real server. [`MemoryBackbone`] keeps the
//! same semantics (TTLs, list ends, the atomic affinity pop) inside the
//! process and backs unit tests and single-replica development runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, instrument};

use labgrid_core::epoch_secs;

use crate::connection::{RedisConfig, RedisConnectionFactory};
use crate::error::{QueueError, QueueResult};

/// Parameters of one atomic affinity pop.
#[derive(Debug, Clone)]
pub struct AffinityPop<'a> {
    pub queue: &'a str,
    pub owned_set: &'a str,
    pub retry_count: u32,
    pub expire_secs: u64,
    pub owned_set_ttl: Duration,
}

#[async_trait]
pub trait Backbone: Send + Sync {
    /// `SET key value NX PX ttl`. Returns whether the key was created.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool>;
    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()>;
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;
    async fn del(&self, key: &str) -> QueueResult<bool>;
    async fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Re-arm `key` with `ttl` only while it still holds `expected`.
    /// Returns whether the key was re-armed.
    async fn pexpire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> QueueResult<bool>;
    /// Delete `key` only while it still holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> QueueResult<bool>;

    /// Push onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> QueueResult<()>;
    /// Pop from the tail of a list, waiting up to `timeout`.
    async fn brpop(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>>;
    async fn llen(&self, key: &str) -> QueueResult<usize>;

    /// Add a member and (re)arm the whole set's TTL.
    async fn sadd_with_ttl(&self, set: &str, member: &str, ttl: Duration) -> QueueResult<()>;
    async fn srem(&self, set: &str, member: &str) -> QueueResult<()>;
    async fn sismember(&self, set: &str, member: &str) -> QueueResult<bool>;

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<()>;

    /// Atomically pop the first message this replica may handle.
    ///
    /// Returns the (possibly rewritten) raw message, or `None` when nothing
    /// was claimable within `retry_count` attempts.
    async fn affinity_pop(&self, pop: AffinityPop<'_>) -> QueueResult<Option<String>>;
}

// ── Redis ──────────────────────────────────────────────────────────

/// The affinity pop as one server-side script.
///
/// KEYS[1] queue, KEYS[2] owned set.
/// ARGV[1] retry count, ARGV[2] expiry seconds, ARGV[3] owned-set ttl seconds.
pub const AFFINITY_POP_SCRIPT: &str = r#"
local queue = KEYS[1]
local owned = KEYS[2]
local retry = tonumber(ARGV[1])
local expire = tonumber(ARGV[2])
local owned_ttl = tonumber(ARGV[3])
local now = tonumber(redis.call('TIME')[1])

local empty = redis.call('SCARD', owned) == 0
redis.call('EXPIRE', owned, owned_ttl)
if empty then
  return false
end

for _ = 1, retry do
  local raw = redis.call('RPOP', queue)
  if not raw then
    return false
  end
  local ok, msg = pcall(cjson.decode, raw)
  if not ok or type(msg) ~= 'table' then
    return raw
  end
  msg['attempt_count'] = (tonumber(msg['attempt_count']) or 0) + 1
  local enqueued = tonumber(msg['enqueue_time'])
  if enqueued == nil then
    enqueued = now
    msg['enqueue_time'] = now
  end
  local encoded = cjson.encode(msg)
  if now - enqueued > expire then
    return encoded
  end
  local lab = msg['lab_uuid']
  if lab == nil or lab == cjson.null or lab == '' then
    return encoded
  end
  if redis.call('SISMEMBER', owned, lab) == 1 then
    return encoded
  end
  redis.call('LPUSH', queue, encoded)
end
return false
"#;

/// KEYS[1] key, ARGV[1] expected holder, ARGV[2] ttl millis.
pub const PEXPIRE_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// KEYS[1] key, ARGV[1] expected holder.
pub const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone, Debug)]
pub struct RedisBackbone {
    factory: RedisConnectionFactory,
}

impl RedisBackbone {
    pub fn new(config: RedisConfig) -> anyhow::Result<Self> {
        Ok(Self::with_factory(RedisConnectionFactory::new(config)?))
    }

    pub fn with_factory(factory: RedisConnectionFactory) -> Self {
        Self { factory }
    }

    fn key(&self, key: &str) -> String {
        self.factory.namespaced_key(key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.factory.connection().await?;
        let inserted: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(inserted.is_some())
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.factory.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.factory.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.factory.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.factory.connection().await?;
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut *conn)
            .await?;
        Ok(found > 0)
    }

    async fn pexpire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.factory.connection().await?;
        let armed: i64 = redis::cmd("EVAL")
            .arg(PEXPIRE_IF_EQ_SCRIPT)
            .arg(1)
            .arg(self.key(key))
            .arg(expected)
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(|err| QueueError::Script(err.to_string()))?;
        Ok(armed == 1)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> QueueResult<bool> {
        let mut conn = self.factory.connection().await?;
        let removed: i64 = redis::cmd("EVAL")
            .arg(DEL_IF_EQ_SCRIPT)
            .arg(1)
            .arg(self.key(key))
            .arg(expected)
            .query_async(&mut *conn)
            .await
            .map_err(|err| QueueError::Script(err.to_string()))?;
        Ok(removed == 1)
    }

    async fn lpush(&self, key: &str, value: &str) -> QueueResult<()> {
        let mut conn = self.factory.connection().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.key(key))
            .arg(value)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>> {
        let mut conn = self.factory.connection().await?;
        // A zero timeout would block forever.
        let secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.key(key))
            .arg(secs)
            .query_async(&mut *conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> QueueResult<usize> {
        let mut conn = self.factory.connection().await?;
        let len: usize = redis::cmd("LLEN")
            .arg(self.key(key))
            .query_async(&mut *conn)
            .await?;
        Ok(len)
    }

    async fn sadd_with_ttl(&self, set: &str, member: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.factory.connection().await?;
        let key = self.key(set);
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(&key)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> QueueResult<()> {
        let mut conn = self.factory.connection().await?;
        let _: i64 = redis::cmd("SREM")
            .arg(self.key(set))
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn sismember(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.factory.connection().await?;
        let found: i64 = redis::cmd("SISMEMBER")
            .arg(self.key(set))
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(found == 1)
    }

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<()> {
        let mut conn = self.factory.connection().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.key(channel))
            .arg(message)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = pop.queue))]
    async fn affinity_pop(&self, pop: AffinityPop<'_>) -> QueueResult<Option<String>> {
        let mut conn = self.factory.connection().await?;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(AFFINITY_POP_SCRIPT)
            .arg(2)
            .arg(self.key(pop.queue))
            .arg(self.key(pop.owned_set))
            .arg(pop.retry_count)
            .arg(pop.expire_secs)
            .arg(pop.owned_set_ttl.as_secs().max(1));
        let result: Option<String> = cmd
            .query_async(&mut *conn)
            .await
            .map_err(|err| QueueError::Script(err.to_string()))?;
        Ok(result)
    }
}

// ── In-memory ──────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, (HashSet<String>, Option<Instant>)>,
    published: Vec<(String, String)>,
}

impl MemoryState {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(self.strings.get(key), Some((_, Some(at))) if *at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn live_set(&mut self, key: &str) -> Option<&mut HashSet<String>> {
        let expired = matches!(self.sets.get(key), Some((_, Some(at))) if *at <= Instant::now());
        if expired {
            self.sets.remove(key);
        }
        self.sets.get_mut(key).map(|(members, _)| members)
    }

    fn expire_set(&mut self, key: &str, ttl: Duration) {
        if let Some((_, expires_at)) = self.sets.get_mut(key) {
            *expires_at = Some(Instant::now() + ttl);
        }
    }
}

/// Lua `tonumber` semantics: numbers and numeric strings are accepted.
fn enqueue_secs(value: &Value) -> Option<u64> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (secs.is_finite() && secs >= 0.0).then_some(secs as u64)
}

/// Process-local backbone with Redis semantics.
#[derive(Clone, Default)]
pub struct MemoryBackbone {
    state: Arc<Mutex<MemoryState>>,
    pushed: Arc<Notify>,
}

impl MemoryBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far, in order, as `(channel, payload)`.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.state.lock().await.published.clone()
    }

    /// Snapshot of a list from head to tail.
    pub async fn list(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn pop_tail(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        state.lists.get_mut(key).and_then(VecDeque::pop_back)
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.live_string(key).cloned())
    }

    async fn del(&self, key: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let live = state.live_string(key).is_some();
        state.strings.remove(key);
        let list = state.lists.remove(key).is_some();
        let set = state.sets.remove(key).is_some();
        Ok(live || list || set)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.live_string(key).is_some()
            || state.lists.get(key).is_some_and(|l| !l.is_empty())
            || state.live_set(key).is_some_and(|s| !s.is_empty()))
    }

    async fn pexpire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.live_string(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        if let Some((_, expires_at)) = state.strings.get_mut(key) {
            *expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.live_string(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        state.strings.remove(key);
        Ok(true)
    }

    async fn lpush(&self, key: &str, value: &str) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            state
                .lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_tail(key).await {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn llen(&self, key: &str) -> QueueResult<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn sadd_with_ttl(&self, set: &str, member: &str, ttl: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.live_set(set).is_none() {
            state.sets.insert(set.to_string(), (HashSet::new(), None));
        }
        if let Some((members, expires_at)) = state.sets.get_mut(set) {
            members.insert(member.to_string());
            *expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if let Some(members) = state.live_set(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn sismember(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.live_set(set).is_some_and(|m| m.contains(member)))
    }

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn affinity_pop(&self, pop: AffinityPop<'_>) -> QueueResult<Option<String>> {
        // The whole loop runs under one lock, mirroring the script's atomicity.
        let mut state = self.state.lock().await;
        let now = epoch_secs();

        let empty = state.live_set(pop.owned_set).is_none_or(|m| m.is_empty());
        state.expire_set(pop.owned_set, pop.owned_set_ttl);
        if empty {
            return Ok(None);
        }

        for _ in 0..pop.retry_count {
            let Some(raw) = state.lists.get_mut(pop.queue).and_then(VecDeque::pop_back) else {
                return Ok(None);
            };
            let mut msg = match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => return Ok(Some(raw)),
            };

            let attempts = msg.get("attempt_count").and_then(Value::as_u64).unwrap_or(0) + 1;
            msg.insert("attempt_count".into(), Value::from(attempts));
            let enqueued = match msg.get("enqueue_time").and_then(enqueue_secs) {
                Some(t) => t,
                None => {
                    msg.insert("enqueue_time".into(), Value::from(now));
                    now
                }
            };
            let lab = msg
                .get("lab_uuid")
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty())
                .map(str::to_string);
            let encoded = serde_json::to_string(&msg)?;

            if now.saturating_sub(enqueued) > pop.expire_secs {
                return Ok(Some(encoded));
            }
            let Some(lab) = lab else {
                return Ok(Some(encoded));
            };
            if state
                .live_set(pop.owned_set)
                .is_some_and(|m| m.contains(&lab))
            {
                return Ok(Some(encoded));
            }
            debug!(lab_uuid = %lab, "lab not owned here, requeueing");
            state
                .lists
                .entry(pop.queue.to_string())
                .or_default()
                .push_front(encoded);
        }
        Ok(None)
    }
}
