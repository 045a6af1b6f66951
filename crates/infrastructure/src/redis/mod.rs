//! Redis 缓存模块
//!
//! 消息缓存与限流计数的 Redis 实现。

pub mod cache_store;
pub mod error;
pub mod rate_counter;

// 重新导出
pub use cache_store::RedisCacheStore;
pub use rate_counter::RedisRateCounter;

use redis::aio::ConnectionManager;

/// 建立自动重连的连接
pub async fn connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}
