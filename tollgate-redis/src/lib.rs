//! Redis shared store for `tollgate` (companion crate).
//! Bring your own `redis::Client`; bucket entries are plain strings with a millisecond TTL.
//! Connections are pooled with `r2d2`.
//!
//! Transactions use `WATCH` / `MULTI` / `EXEC`: if another client touches a watched
//! entry between the read and `EXEC`, Redis discards the writes and the store reports
//! [`TxOutcome::Conflict`].

use async_trait::async_trait;
use redis::ConnectionLike;
use std::ops::DerefMut;
use std::time::Duration;
use tollgate::store::{DistributedSettings, SharedStore, TxOutcome, Write};
use tollgate::StoreError;

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// Pooled connection that can be marked unusable after a failed exchange.
pub struct RedisConnection {
    conn: redis::Connection,
    broken: bool,
}

/// r2d2 manager opening connections with socket timeouts set.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
    io_timeout: Duration,
}

impl r2d2::ManageConnection for RedisConnector {
    type Connection = RedisConnection;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.client.get_connection_with_timeout(self.io_timeout)?;
        conn.set_read_timeout(Some(self.io_timeout))?;
        conn.set_write_timeout(Some(self.io_timeout))?;
        Ok(RedisConnection { conn, broken: false })
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query::<()>(&mut conn.conn)
    }

    // a failed exchange may leave a reply or a WATCH behind on the socket
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken || !conn.conn.is_open()
    }
}

/// [`SharedStore`] backed by a Redis server.
///
/// Calls run the synchronous client on the blocking pool over connections kept in an
/// r2d2 pool. A connection goes back to the pool only after a clean exchange, so it
/// never carries a pending reply or a stale `WATCH` into the next call.
///
/// Keep `io_timeout` at or below the [`DistributedBucketStore`](tollgate::DistributedBucketStore)
/// timeout ([`with_settings`](Self::with_settings) does this). A call the caller stopped
/// waiting for keeps running until it finishes or a socket timeout fires, and it may
/// still commit: a request already denied can use up a token.
#[derive(Clone)]
pub struct RedisSharedStore {
    connector: RedisConnector,
    max_connections: u32,
    pool: r2d2::Pool<RedisConnector>,
}

impl std::fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedStore")
            .field("client", &"<redis::Client>")
            .field("io_timeout", &self.connector.io_timeout)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl RedisSharedStore {
    /// Wrap an existing client. `io_timeout` starts at the default distributed store timeout.
    pub fn new(client: redis::Client) -> Self {
        let io_timeout = Duration::from_millis(DistributedSettings::default().timeout_ms);
        Self::build(RedisConnector { client, io_timeout }, DEFAULT_MAX_CONNECTIONS)
    }

    /// Connect lazily to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    /// Returns `Err` if the URL cannot be parsed.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        redis::Client::open(url).map(Self::new).map_err(StoreError::unavailable)
    }

    /// Match `io_timeout` to the timeout the distributed store will enforce.
    pub fn with_settings(self, settings: &DistributedSettings) -> Self {
        self.with_io_timeout(Duration::from_millis(settings.timeout_ms))
    }

    /// Socket connect/read/write timeout, also the longest wait for a pooled connection.
    pub fn with_io_timeout(self, timeout: Duration) -> Self {
        let connector = RedisConnector { io_timeout: timeout.max(Duration::from_millis(1)), ..self.connector };
        Self::build(connector, self.max_connections)
    }

    /// Upper bound on open connections.
    pub fn with_max_connections(self, max: u32) -> Self {
        Self::build(self.connector, max.max(1))
    }

    /// Connections currently open, idle or in use.
    pub fn open_connections(&self) -> u32 {
        self.pool.state().connections
    }

    pub fn io_timeout(&self) -> Duration {
        self.connector.io_timeout
    }

    // connections are opened on demand
    fn build(connector: RedisConnector, max_connections: u32) -> Self {
        let pool = r2d2::Pool::builder()
            .max_size(max_connections)
            .min_idle(Some(0))
            .connection_timeout(connector.io_timeout)
            .build_unchecked(connector.clone());
        Self { connector, max_connections, pool }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut pooled = pool.get().map_err(|e| {
                tracing::warn!(target: "tollgate::redis", error = %e, "no redis connection available");
                StoreError::unavailable(e)
            })?;
            let conn = pooled.deref_mut();
            let result = op(&mut conn.conn);
            if let Err(e) = &result {
                conn.broken = true;
                tracing::warn!(target: "tollgate::redis", error = %e, "redis command failed");
            }
            result.map_err(StoreError::unavailable)
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(e) => Err(StoreError::unavailable(format!("redis task failed: {e}"))),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn watch_and_commit<F>(
    conn: &mut redis::Connection,
    keys: &[String],
    plan: F,
) -> redis::RedisResult<TxOutcome>
where
    F: FnOnce(Vec<Option<String>>) -> Option<Vec<Write>>,
{
    redis::cmd("WATCH").arg(keys).query::<()>(conn)?;
    let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query(conn)?;

    let Some(writes) = plan(values) else {
        redis::cmd("UNWATCH").query::<()>(conn)?;
        return Ok(TxOutcome::Released);
    };

    let mut pipe = redis::pipe();
    pipe.atomic();
    for write in &writes {
        pipe.cmd("SET")
            .arg(&write.key)
            .arg(&write.value)
            .arg("PX")
            .arg(millis(write.ttl))
            .ignore();
    }
    // EXEC replies nil when a watched key changed
    let committed: Option<()> = pipe.query(conn)?;
    Ok(match committed {
        Some(()) => TxOutcome::Committed,
        None => TxOutcome::Conflict,
    })
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| redis::cmd("GET").arg(&key).query(conn)).await
    }

    async fn transact<F>(&self, keys: &[String], plan: F) -> Result<TxOutcome, StoreError>
    where
        F: FnOnce(Vec<Option<String>>) -> Option<Vec<Write>> + Send + 'static,
    {
        let keys = keys.to_vec();
        self.blocking(move |conn| watch_and_commit(conn, &keys, plan)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_bad_url() {
        assert!(matches!(RedisSharedStore::open("not a url"), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn ttl_rounds_to_at_least_one_millisecond() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(3_600)), 3_600_000);
    }

    #[test]
    fn io_timeout_defaults_to_store_timeout() {
        let store = RedisSharedStore::open("redis://127.0.0.1:1/").unwrap();
        let store_timeout = Duration::from_millis(DistributedSettings::default().timeout_ms);
        assert!(store.io_timeout() <= store_timeout);

        let settings = DistributedSettings { timeout_ms: 120, ..DistributedSettings::default() };
        assert_eq!(store.with_settings(&settings).io_timeout(), Duration::from_millis(120));
    }

    #[test]
    fn pool_opens_connections_lazily() {
        let store = RedisSharedStore::open("redis://127.0.0.1:1/").unwrap().with_max_connections(4);
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // port 1 is reserved; nothing listens there
        let store = RedisSharedStore::open("redis://127.0.0.1:1/")
            .unwrap()
            .with_io_timeout(Duration::from_millis(200));
        let result = store.get("rate_limit:x").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))), "{result:?}");
        assert_eq!(store.open_connections(), 0);
    }
}
