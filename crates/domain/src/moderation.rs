use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 封禁记录（由管理端维护，核心只读）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub banished_id: UserId,
    /// 为空表示永久封禁
    pub end_time: Option<Timestamp>,
    pub pardoned: bool,
}

impl BanRecord {
    /// 未被赦免且未到期的封禁才生效
    pub fn is_active(&self, now: Timestamp) -> bool {
        !self.pardoned && self.end_time.map_or(true, |end| end > now)
    }
}

/// 固定窗口限流配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 窗口内允许的消息数
    pub limit: u32,
    /// 窗口长度（秒）
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window_seconds: 60,
        }
    }
}
