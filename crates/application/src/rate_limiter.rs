use std::sync::{Arc, RwLock};
use std::time::Duration;

use domain::{RateLimitConfig, UserId};
use tracing::warn;

use crate::store::{RateCounterStore, StoreError};

/// 限流错误类型
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {current}/{max} messages in window")]
    RateLimitExceeded { current: u64, max: u32 },

    #[error("rate counter unavailable: {0}")]
    Store(#[from] StoreError),
}

/// 每用户固定窗口限流器
///
/// 计数保存在 `RateCounterStore` 中，键为 `ratelimit:<user_id>`。每次检查都会自增计数，
/// 被拒绝的尝试同样计入窗口。
pub struct RateLimiter {
    store: Arc<dyn RateCounterStore>,
    config: RwLock<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateCounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: RwLock::new(config),
        }
    }

    /// 当前生效的配置
    pub fn config(&self) -> RateLimitConfig {
        *self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 替换配置，对之后的所有检查生效
    pub fn configure(&self, config: RateLimitConfig) {
        let mut current = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = config;
    }

    /// 检查用户是否可以发送消息
    pub async fn check(&self, user_id: UserId) -> Result<(), RateLimitError> {
        let config = self.config();
        let key = counter_key(user_id);
        let current = self
            .store
            .increment_window(&key, Duration::from_secs(config.window_seconds))
            .await?;

        if current > u64::from(config.limit) {
            warn!(user_id = %user_id, current, limit = config.limit, "rate limit exceeded");
            return Err(RateLimitError::RateLimitExceeded {
                current,
                max: config.limit,
            });
        }
        Ok(())
    }
}

fn counter_key(user_id: UserId) -> String {
    format!("ratelimit:{user_id}")
}
