/// Namespaced Redis key-value wrapper with graceful degradation.
///
/// Every key is prefixed with the namespace given at construction (for example
/// `pokeprof:v1:`), so several stores can share one Redis database without colliding.
///
/// Read operations return `Option<T>` and write operations return `bool`: on any Redis
/// error the operation logs a warning and reports a miss/failure. Callers fall through to
/// their primary source. The system is fully functional without Redis.
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::CommonError;

#[derive(Clone)]
pub struct RedisCache {
    client: Option<redis::Client>,
    namespace: String,
}

impl RedisCache {
    /// Create a cache for `namespace`. If the URL is `None` or the client cannot be
    /// created, the returned cache is permanently disabled and every call is a no-op.
    pub fn new(url: Option<&str>, namespace: &str) -> Self {
        let client = url.and_then(|u| {
            redis::Client::open(u)
                .inspect_err(|e| warn!(error = %e, url = u, "failed to create redis client, cache disabled"))
                .ok()
        });
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// A cache that never talks to Redis.
    pub fn disabled() -> Self {
        Self {
            client: None,
            namespace: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Full key for `key` inside this cache's namespace.
    pub fn key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CommonError> {
        let client = self.client.as_ref().ok_or(CommonError::RedisUnavailable)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    async fn connection_or_warn(&self) -> Option<MultiplexedConnection> {
        match self.connection().await {
            Ok(conn) => Some(conn),
            Err(CommonError::RedisUnavailable) => None,
            Err(e) => {
                warn!(error = %e, "redis connection failed");
                None
            }
        }
    }

    /// Test the connection by sending a PING. Returns `true` if Redis is reachable.
    pub async fn is_available(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    /// Get a raw string value. `None` if Redis is unavailable or the key doesn't exist.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection_or_warn().await?;
        let full_key = self.key(key);
        conn.get::<_, Option<String>>(&full_key)
            .await
            .inspect_err(|e| warn!(error = %e, key = %full_key, "redis GET failed"))
            .ok()?
    }

    /// Set a raw string value. `ttl_secs = None` stores without expiry.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> bool {
        let Some(mut conn) = self.connection_or_warn().await else {
            return false;
        };
        let full_key = self.key(key);
        let result = match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(&full_key, value, ttl).await,
            None => conn.set::<_, _, ()>(&full_key, value).await,
        };
        result
            .inspect_err(|e| warn!(error = %e, key = %full_key, "redis SET failed"))
            .is_ok()
    }

    /// List the keys under `prefix` (relative to the namespace) using SCAN.
    /// Returned keys have the namespace stripped.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Option<Vec<String>> {
        let mut conn = self.connection_or_warn().await?;
        let pattern = format!("{}*", self.key(prefix));
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .inspect_err(|e| warn!(error = %e, pattern = %pattern, "redis SCAN failed"))
                .ok()?;
            out.extend(
                keys.into_iter()
                    .filter_map(|k| k.strip_prefix(&self.namespace).map(str::to_string)),
            );
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        out.sort();
        Some(out)
    }

    /// Delete every key under `prefix` (relative to the namespace).
    /// Uses SCAN-based deletion (not KEYS, which blocks).
    pub async fn delete_by_prefix(&self, prefix: &str) -> bool {
        let Some(keys) = self.keys_with_prefix(prefix).await else {
            return false;
        };
        if keys.is_empty() {
            return true;
        }
        let Some(mut conn) = self.connection_or_warn().await else {
            return false;
        };
        let full_keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        conn.del::<_, ()>(&full_keys)
            .await
            .inspect_err(|e| warn!(error = %e, "redis batch DEL failed during prefix delete"))
            .is_ok()
    }
}
