//! 持久化协作方接口
//!
//! 核心只调用下面这几个窄接口，具体的 SQL 实现在基础设施层。

use async_trait::async_trait;

use crate::errors::RepositoryError;
use crate::message::{ChatMessage, MessageClass, PrivateChatMessage};
use crate::moderation::RateLimitConfig;
use crate::value_objects::{Timestamp, UserId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// 一次刷盘的消息批次，所有消息都已带序列号
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveBatch {
    Public(Vec<ChatMessage>),
    Private(Vec<PrivateChatMessage>),
}

impl ArchiveBatch {
    pub fn class(&self) -> MessageClass {
        match self {
            ArchiveBatch::Public(_) => MessageClass::Public,
            ArchiveBatch::Private(_) => MessageClass::Private,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArchiveBatch::Public(messages) => messages.len(),
            ArchiveBatch::Private(messages) => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 会话记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub user_id: UserId,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
}

/// 消息归档：批量写入必须在单个事务内完成，任一失败整体回滚
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// 返回写入的行数
    async fn insert_batch(&self, batch: ArchiveBatch) -> RepositoryResult<u64>;
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait SessionRecordRepository: Send + Sync {
    async fn insert_session_record(&self, record: SessionRecord) -> RepositoryResult<()>;
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait BanRepository: Send + Sync {
    /// 用户当前是否处于有效封禁中
    async fn is_banned(&self, user_id: UserId) -> RepositoryResult<bool>;
}

/// 限流配置的持久化，启动时加载，管理端修改后更新
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    async fn load(&self, settings_id: i32) -> RepositoryResult<RateLimitConfig>;
    async fn update(&self, settings_id: i32, config: RateLimitConfig) -> RepositoryResult<()>;
}
