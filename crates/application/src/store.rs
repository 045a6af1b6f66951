//! 缓存存储抽象
//!
//! 消息缓存和限流器只依赖这里的原语。Redis 实现用服务端 Lua 脚本保证多键原子性，
//! 内存实现用一把进程内互斥锁，只适用于单进程部署。

use std::time::Duration;

use async_trait::async_trait;
use domain::SequenceId;
use serde::Deserialize;
use thiserror::Error;

/// 缓存存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 后端不可用或命令执行失败
    #[error("cache backend error: {message}")]
    Backend { message: String },

    /// 后端返回了无法解析的数据
    #[error("unexpected cache reply: {message}")]
    UnexpectedReply { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn unexpected_reply(message: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            message: message.into(),
        }
    }
}

/// 一次入队涉及的键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueKeys {
    /// 序列号计数器
    pub counter: String,
    /// 待刷新列表（不裁剪）
    pub pending: String,
    /// 需要追加并裁剪到容量的最近列表
    pub recent: Vec<String>,
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub sequence_id: SequenceId,
    /// 追加后待刷新列表的长度
    pub pending_len: usize,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// 原子地执行：计数器自增、包装条目、追加到每个最近列表并裁剪、追加到待刷新列表
    async fn enqueue(
        &self,
        keys: &EnqueueKeys,
        payload: &str,
        capacity: usize,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// 按插入顺序读取整个列表
    async fn read_list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// 原子地删除列表中第一个序列号匹配的条目
    async fn remove_entry(&self, key: &str, sequence_id: SequenceId) -> Result<bool, StoreError>;

    /// 原子地从表头移除序列号不大于 `last` 的条目，返回移除数量
    ///
    /// 刷盘提交后调用。刷盘期间新追加的条目序列号更大，不会被误删。
    async fn drain_through(&self, key: &str, last: SequenceId) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait RateCounterStore: Send + Sync {
    /// 原子地自增窗口计数；自增后为 1 时设置过期时间为 `window`
    async fn increment_window(&self, key: &str, window: Duration) -> Result<u64, StoreError>;
}

/// 包装后的条目格式：`{"sequence_id":N,"data":<payload>}`
///
/// Redis 脚本按同样的格式拼接，两种后端的数据可以互相读取。
pub fn wrap_entry(sequence_id: SequenceId, payload: &str) -> String {
    format!(r#"{{"sequence_id":{},"data":{}}}"#, sequence_id.value(), payload)
}

#[derive(Deserialize)]
struct EntryHeader {
    sequence_id: SequenceId,
}

/// 只解析条目的序列号，不解析消息体
pub fn entry_sequence(raw: &str) -> Option<SequenceId> {
    serde_json::from_str::<EntryHeader>(raw)
        .ok()
        .map(|header| header.sequence_id)
}
