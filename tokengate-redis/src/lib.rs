//! Redis bucket store for `tokengate` (companion crate).
//!
//! Every withdrawal runs [`TOKEN_BUCKET_SCRIPT`] server-side, so refill, check and write
//! happen atomically no matter how many instances share the Redis server. Bring your own
//! [`ConnectionManager`] (or any other async [`ConnectionLike`]) or let
//! [`RedisBucketStore::connect`] build one.
//!
//! The store tracks its own health: a connection-class failure marks it down, and while
//! down [`BucketStore::is_available`] reports `false` so the coordinator skips the round
//! trip. After the probe interval one request is allowed through to test the connection.
//! Any reply from the server, even an error reply, counts as the connection being back.

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{RedisError, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokengate::{BucketKey, BucketStore, ConsumeRequest, StoreError, Withdrawal};

/// Default time a failed store stays marked down before a request probes it again.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Atomic refill-and-withdraw.
///
/// `KEYS = [tokens, ts]`, `ARGV = [capacity, rate, now, cost]` with `now` in fractional
/// seconds. Replies `{1, remaining}` when tokens were taken and `{0, available}` when
/// denied, with the number as a string so fractions are not truncated. A denial writes
/// nothing. Both keys expire after the time to refill an empty bucket, capped at
/// [`tokengate::MAX_BUCKET_EXPIRY`].
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local ts_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local tokens = tonumber(redis.call('GET', tokens_key))
local last = tonumber(redis.call('GET', ts_key))
if tokens == nil then tokens = capacity end
if last == nil then last = now end

local elapsed = math.max(0, now - last)
local filled = math.min(capacity, tokens + elapsed * rate)
if filled < cost then
  return {0, string.format('%.17g', filled)}
end

local remaining = filled - cost
local ttl = math.min(31536000, math.max(1, math.ceil(capacity / rate)))
redis.call('SET', tokens_key, string.format('%.17g', remaining), 'EX', ttl)
redis.call('SET', ts_key, ARGV[3], 'EX', ttl)
return {1, string.format('%.17g', remaining)}
"#;

/// [`BucketStore`] backed by a Redis server.
pub struct RedisBucketStore<C = ConnectionManager> {
    conn: C,
    script: Script,
    health: Health,
}

impl<C> std::fmt::Debug for RedisBucketStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("conn", &std::any::type_name::<C>())
            .field("health", &self.health)
            .finish()
    }
}

impl RedisBucketStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the first connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(StoreError::unavailable)?;
        tracing::debug!(target: "tokengate_redis", url = %url, "connected to redis");
        Ok(Self::new(conn))
    }
}

impl<C> RedisBucketStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Wrap an existing connection. It is cloned per call, so it should be a cheap
    /// handle such as [`ConnectionManager`] or a multiplexed connection.
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            health: Health::new(DEFAULT_PROBE_INTERVAL),
        }
    }

    /// How long to treat the server as down after a connection failure.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.health = Health::new(interval);
        self
    }
}

#[async_trait]
impl<C> BucketStore for RedisBucketStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn try_consume(
        &self,
        key: &BucketKey,
        request: &ConsumeRequest,
    ) -> Result<Withdrawal, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Result<(i64, String), RedisError> = self
            .script
            .key(&key.tokens)
            .key(&key.timestamp)
            .arg(request.capacity.to_string())
            .arg(request.rate.to_string())
            .arg(request.now.to_string())
            .arg(request.cost.to_string())
            .invoke_async(&mut conn)
            .await;

        let (status, amount) = match reply {
            Ok(reply) => {
                self.health.mark_up();
                reply
            }
            Err(e) => {
                let connection_lost = is_connection_error(&e);
                if connection_lost {
                    self.health.mark_down();
                } else {
                    // The server answered; only this call failed.
                    self.health.mark_up();
                }
                tracing::warn!(
                    target: "tokengate_redis",
                    key = %key.tokens,
                    error = %e,
                    connection_lost,
                    "token bucket script failed"
                );
                return Err(classify(e));
            }
        };

        decode(status, &amount)
    }

    fn is_available(&self) -> bool {
        self.health.is_available()
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn classify(e: RedisError) -> StoreError {
    if is_connection_error(&e) {
        StoreError::unavailable(e)
    } else {
        StoreError::Script { reason: e.to_string() }
    }
}

fn decode(status: i64, amount: &str) -> Result<Withdrawal, StoreError> {
    let malformed = || StoreError::MalformedReply { reply: format!("[{status}, {amount:?}]") };
    match status {
        0 => Ok(Withdrawal::Denied),
        1 => {
            let remaining: f64 = amount.parse().map_err(|_| malformed())?;
            if remaining.is_finite() && remaining >= 0.0 {
                Ok(Withdrawal::Remaining(remaining))
            } else {
                Err(malformed())
            }
        }
        _ => Err(malformed()),
    }
}

/// Down/up tracking shared by all requests through one store.
#[derive(Debug)]
struct Health {
    started: Instant,
    // Millis since `started` (+1) when the store was marked down; 0 while healthy.
    down_since: AtomicU64,
    probe_interval: Duration,
}

impl Health {
    fn new(probe_interval: Duration) -> Self {
        Self { started: Instant::now(), down_since: AtomicU64::new(0), probe_interval }
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX).saturating_add(1)
    }

    fn mark_down(&self) {
        let was_up = self.down_since.swap(self.now_millis(), Ordering::AcqRel) == 0;
        if was_up {
            tracing::warn!(target: "tokengate_redis", "redis marked unavailable");
        }
    }

    fn mark_up(&self) {
        if self.down_since.swap(0, Ordering::AcqRel) != 0 {
            tracing::info!(target: "tokengate_redis", "redis available again");
        }
    }

    fn is_available(&self) -> bool {
        let down_since = self.down_since.load(Ordering::Acquire);
        if down_since == 0 {
            return true;
        }
        let now = self.now_millis();
        let interval = u64::try_from(self.probe_interval.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(down_since) < interval {
            return false;
        }
        // Re-arm the window so only the caller that wins the swap probes.
        self.down_since
            .compare_exchange(down_since, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{ErrorKind, RedisFuture, RedisResult, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use tokengate::telemetry::CountingSink;
    use tokengate::{Admission, AdmissionCoordinator, BucketConfig, MAX_BUCKET_EXPIRY};

    /// Connection that answers each command with the next queued reply, then refuses.
    #[derive(Clone, Default)]
    struct ScriptedConnection {
        replies: Arc<Mutex<VecDeque<RedisResult<Value>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedConnection {
        fn reply(self, reply: RedisResult<Value>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ConnectionLike for ScriptedConnection {
        fn req_packed_command<'a>(&'a mut self, _cmd: &'a redis::Cmd) -> RedisFuture<'a, Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Err(refused()));
            Box::pin(async move { reply })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a redis::Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async { Err(refused()) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn refused() -> RedisError {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused").into()
    }

    fn granted(remaining: &str) -> RedisResult<Value> {
        Ok(Value::Array(vec![Value::Int(1), Value::BulkString(remaining.as_bytes().to_vec())]))
    }

    fn request() -> ConsumeRequest {
        ConsumeRequest {
            capacity: 10.0,
            rate: 1.0,
            now: tokengate::Timestamp::from_secs(1_700_000_000),
            cost: 1.0,
        }
    }

    fn key() -> BucketKey {
        BucketKey::derive("rate_limit", "1.2.3.4")
    }

    #[tokio::test]
    async fn script_reply_is_decoded() {
        let conn = ScriptedConnection::default().reply(granted("8.5"));
        let store = RedisBucketStore::new(conn);
        assert_eq!(store.try_consume(&key(), &request()).await.unwrap(), Withdrawal::Remaining(8.5));
        assert!(store.is_available());
    }

    #[tokio::test]
    async fn connection_loss_routes_coordinator_to_store_down() {
        let conn = ScriptedConnection::default();
        let store = Arc::new(RedisBucketStore::new(conn.clone()).with_probe_interval(Duration::from_secs(60)));
        let sink = CountingSink::new();
        let config = BucketConfig::new(10.0, 1.0).unwrap();
        let coordinator = AdmissionCoordinator::new(config, store.clone()).with_telemetry(sink.clone());

        assert_eq!(coordinator.admit("1.2.3.4").await, Admission::Bypass);
        assert!(!store.is_available());

        for _ in 0..5 {
            assert_eq!(coordinator.admit("1.2.3.4").await, Admission::Bypass);
        }
        assert_eq!(conn.calls(), 1, "a store known to be down is not called");

        let counts = sink.snapshot();
        assert_eq!(counts.bypassed_store_error, 1);
        assert_eq!(counts.bypassed_store_down, 5);
    }

    #[tokio::test]
    async fn error_reply_during_probe_restores_availability() {
        let conn = ScriptedConnection::default()
            .reply(Err(refused()))
            .reply(Err((ErrorKind::ResponseError, "ERR Error running script").into()));
        let store = RedisBucketStore::new(conn).with_probe_interval(Duration::from_millis(20));

        let err = store.try_consume(&key(), &request()).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert!(!store.is_available());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.is_available(), "interval elapsed, one caller probes");

        let err = store.try_consume(&key(), &request()).await.unwrap_err();
        assert!(matches!(err, StoreError::Script { .. }));
        assert!(store.is_available(), "redis answered, so it is reachable");
    }

    #[tokio::test]
    async fn malformed_reply_does_not_mark_down() {
        let conn = ScriptedConnection::default()
            .reply(Err(refused()))
            .reply(Ok(Value::Array(vec![Value::Int(7), Value::BulkString(b"1".to_vec())])));
        let store = RedisBucketStore::new(conn).with_probe_interval(Duration::from_millis(20));

        store.try_consume(&key(), &request()).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.is_available());

        let err = store.try_consume(&key(), &request()).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedReply { .. }));
        assert!(store.is_available());
    }

    #[test]
    fn script_ttl_is_capped() {
        let cap = format!("math.min({},", MAX_BUCKET_EXPIRY.as_secs());
        assert!(TOKEN_BUCKET_SCRIPT.contains(&cap));
    }

    #[test]
    fn script_writes_only_on_success_and_expires_both_keys() {
        let deny = TOKEN_BUCKET_SCRIPT.find("return {0").unwrap();
        let first_set = TOKEN_BUCKET_SCRIPT.find("redis.call('SET'").unwrap();
        assert!(deny < first_set, "denial must return before any write");
        assert_eq!(TOKEN_BUCKET_SCRIPT.matches("'EX', ttl").count(), 2);
        assert!(TOKEN_BUCKET_SCRIPT.contains("math.ceil(capacity / rate)"));
    }

    #[test]
    fn decodes_replies() {
        assert_eq!(decode(1, "9").unwrap(), Withdrawal::Remaining(9.0));
        assert_eq!(decode(1, "0.5").unwrap(), Withdrawal::Remaining(0.5));
        assert_eq!(decode(1, "8.3333333333333339").unwrap(), Withdrawal::Remaining(8.333333333333334));
        assert_eq!(decode(0, "0.25").unwrap(), Withdrawal::Denied);
    }

    #[test]
    fn rejects_malformed_replies() {
        for (status, amount) in [(2, "1"), (1, "lots"), (1, "-1"), (1, "nan"), (-1, "")] {
            let err = decode(status, amount).unwrap_err();
            assert!(matches!(err, StoreError::MalformedReply { .. }), "{status} {amount}");
        }
    }

    #[test]
    fn connection_errors_mark_unavailable_script_errors_do_not() {
        let io: RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(classify(io).is_connection_failure());

        let script: RedisError = (redis::ErrorKind::ResponseError, "ERR bad script").into();
        assert!(matches!(classify(script), StoreError::Script { .. }));
    }

    #[test]
    fn healthy_until_marked_down() {
        let health = Health::new(Duration::from_secs(60));
        assert!(health.is_available());
        health.mark_down();
        assert!(!health.is_available());
        health.mark_up();
        assert!(health.is_available());
    }

    #[test]
    fn single_probe_after_interval() {
        let health = Health::new(Duration::from_millis(20));
        health.mark_down();
        assert!(!health.is_available());

        std::thread::sleep(Duration::from_millis(40));
        assert!(health.is_available(), "first caller probes");
        assert!(!health.is_available(), "others wait for the probe");
    }
}
