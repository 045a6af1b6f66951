use std::sync::Arc;

use application::{CacheStore, MemoryCacheStore, MemoryRateCounter, RateCounterStore, SystemClock};
use config::{AppConfig, CacheBackend};
use domain::RateLimitConfig;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Db, PgStorage};
use crate::redis::{self as redis_store, RedisCacheStore, RedisRateCounter};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 进程级单例：启动时构造一次，按引用注入到 Hub、缓存和限流器
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub cache_store: Arc<dyn CacheStore>,
    pub rate_counter: Arc<dyn RateCounterStore>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = Db::create_pool(&config.database.url, config.database.max_connections).await?;
        let storage = Arc::new(PgStorage::new(pool));

        let (cache_store, rate_counter): (Arc<dyn CacheStore>, Arc<dyn RateCounterStore>) =
            match config.cache.backend {
                CacheBackend::Redis => {
                    let conn = redis_store::connect(&config.redis.url).await?;
                    info!("using redis cache backend");
                    (
                        Arc::new(RedisCacheStore::new(conn.clone())),
                        Arc::new(RedisRateCounter::new(conn)),
                    )
                }
                CacheBackend::Memory => {
                    warn!("using in-process cache backend, only valid for a single process");
                    (
                        Arc::new(MemoryCacheStore::new()),
                        Arc::new(MemoryRateCounter::new(Arc::new(SystemClock))),
                    )
                }
            };

        Ok(Self {
            storage,
            cache_store,
            rate_counter,
        })
    }

    /// 启动时的限流配置：数据库中的配置优先，读取失败时退回到配置文件中的默认值
    pub async fn initial_rate_limit(&self, config: &AppConfig) -> RateLimitConfig {
        let fallback = RateLimitConfig {
            limit: config.rate_limit.limit,
            window_seconds: config.rate_limit.window_seconds,
        };
        let Some(settings_id) = config.rate_limit.settings_id else {
            return fallback;
        };
        match domain::RateLimitRepository::load(self.storage.as_ref(), settings_id).await {
            Ok(loaded) => {
                info!(
                    settings_id,
                    limit = loaded.limit,
                    window_seconds = loaded.window_seconds,
                    "rate limit loaded from database"
                );
                loaded
            }
            Err(err) => {
                warn!(settings_id, error = %err, "rate limit settings unavailable, using defaults");
                fallback
            }
        }
    }
}
