use std::time::Duration;

use application::{RateCounterStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::error::store_error;

/// 自增后为 1 时设置过期时间，窗口只会被 TTL 重置
pub(crate) const INCREMENT_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Redis 固定窗口计数器
#[derive(Clone)]
pub struct RedisRateCounter {
    conn: ConnectionManager,
    script: Script,
}

impl RedisRateCounter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(INCREMENT_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl RateCounterStore for RedisRateCounter {
    async fn increment_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let current: i64 = self
            .script
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        u64::try_from(current)
            .map_err(|_| StoreError::unexpected_reply(format!("negative counter {current}")))
    }
}
