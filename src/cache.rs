use crate::config::CacheConfig;
use crate::models::ProductKey;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use std::{collections::HashMap, future::Future, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, time::timeout};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("price cache unavailable: {0}")]
    Unavailable(String),
}

/// Last observed price per product, used to decide whether a scraped record
/// carries new information.
pub trait PriceCache: Send + Sync {
    fn get(&self, key: &ProductKey) -> impl Future<Output = Result<Option<f64>, CacheError>> + Send;

    fn set(&self, key: &ProductKey, price: f64) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// Redis-backed cache. Values are plain decimal strings under `product:<key>`.
/// No retries: a failed call is reported as unavailable and the connection is
/// re-established on the next call.
pub struct RedisPriceCache {
    client: redis::Client,
    timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisPriceCache {
    pub fn open(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|err| CacheError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            timeout,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Unavailable("connect timed out".into()))?
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }
}

impl PriceCache for RedisPriceCache {
    async fn get(&self, key: &ProductKey) -> Result<Option<f64>, CacheError> {
        let mut conn = self.connection().await?;
        let cache_key = key.cache_key();
        let raw: Option<String> = match timeout(self.timeout, conn.get::<_, Option<String>>(&cache_key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.reset().await;
                return Err(CacheError::Unavailable(err.to_string()));
            }
            Err(_) => {
                self.reset().await;
                return Err(CacheError::Unavailable("GET timed out".into()));
            }
        };

        Ok(raw.and_then(|value| match value.trim().parse::<f64>() {
            Ok(price) => Some(price),
            Err(_) => {
                warn!(target = "catalog.cache", key = %cache_key, value = %value, "ignoring unparsable cached price");
                None
            }
        }))
    }

    async fn set(&self, key: &ProductKey, price: f64) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result = timeout(
            self.timeout,
            conn.set::<_, _, ()>(key.cache_key(), price.to_string()),
        )
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.reset().await;
                Err(CacheError::Unavailable(err.to_string()))
            }
            Err(_) => {
                self.reset().await;
                Err(CacheError::Unavailable("SET timed out".into()))
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryPriceCache {
    prices: Mutex<HashMap<String, f64>>,
}

impl PriceCache for MemoryPriceCache {
    async fn get(&self, key: &ProductKey) -> Result<Option<f64>, CacheError> {
        Ok(self.prices.lock().await.get(&key.cache_key()).copied())
    }

    async fn set(&self, key: &ProductKey, price: f64) -> Result<(), CacheError> {
        self.prices.lock().await.insert(key.cache_key(), price);
        Ok(())
    }
}

/// Cache selected at startup: Redis when `REDIS_URL` is set, otherwise an
/// in-process map that lives as long as the server.
pub enum CacheBackend {
    Redis(RedisPriceCache),
    Memory(MemoryPriceCache),
}

impl CacheBackend {
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        match config.redis_url.as_deref() {
            Some(url) => {
                info!(target = "catalog.cache", "using redis price cache");
                Ok(Self::Redis(RedisPriceCache::open(url, config.timeout)?))
            }
            None => {
                warn!(
                    target = "catalog.cache",
                    "REDIS_URL not set; price cache is in-memory and resets on restart"
                );
                Ok(Self::Memory(MemoryPriceCache::default()))
            }
        }
    }
}

impl PriceCache for CacheBackend {
    async fn get(&self, key: &ProductKey) -> Result<Option<f64>, CacheError> {
        match self {
            Self::Redis(cache) => cache.get(key).await,
            Self::Memory(cache) => cache.get(key).await,
        }
    }

    async fn set(&self, key: &ProductKey, price: f64) -> Result<(), CacheError> {
        match self {
            Self::Redis(cache) => cache.set(key, price).await,
            Self::Memory(cache) => cache.set(key, price).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_tracks_latest_price() {
        let cache = MemoryPriceCache::default();
        let key = ProductKey::from_title("Composite Kit");
        assert_eq!(cache.get(&key).await.unwrap(), None);

        cache.set(&key, 100.0).await.unwrap();
        cache.set(&key, 120.0).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(120.0));
    }

    #[tokio::test]
    async fn unreachable_redis_reports_unavailable() {
        let cache = RedisPriceCache::open("redis://127.0.0.1:1/", Duration::from_millis(500))
            .expect("url parses");
        let key = ProductKey::from_title("Composite Kit");

        assert!(matches!(cache.get(&key).await, Err(CacheError::Unavailable(_))));
        assert!(matches!(cache.set(&key, 1.0).await, Err(CacheError::Unavailable(_))));
    }

    #[test]
    fn backend_defaults_to_memory_without_url() {
        let config = CacheConfig {
            redis_url: None,
            timeout: Duration::from_millis(100),
        };
        assert!(matches!(
            CacheBackend::from_config(&config),
            Ok(CacheBackend::Memory(_))
        ));
    }

    #[test]
    fn malformed_redis_url_is_rejected() {
        assert!(RedisPriceCache::open("not a url", Duration::from_millis(100)).is_err());
    }
}
