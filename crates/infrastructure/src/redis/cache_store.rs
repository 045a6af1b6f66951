//! Redis 缓存存储
//!
//! 多键操作都用服务端 Lua 脚本执行，多个进程写同一组键时依然保持原子性。

use application::{CacheStore, EnqueueKeys, EnqueueOutcome, StoreError};
use async_trait::async_trait;
use domain::SequenceId;
use redis::aio::ConnectionManager;
use redis::Script;

use super::error::store_error;

/// KEYS[1]=计数器 KEYS[2]=待刷新列表 KEYS[3..]=最近列表；ARGV[1]=消息体 ARGV[2]=容量
pub(crate) const ENQUEUE_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local entry = '{"sequence_id":' .. string.format('%d', seq) .. ',"data":' .. ARGV[1] .. '}'
local capacity = tonumber(ARGV[2])
for i = 3, #KEYS do
    redis.call('RPUSH', KEYS[i], entry)
    redis.call('LTRIM', KEYS[i], -capacity, -1)
end
local pending = redis.call('RPUSH', KEYS[2], entry)
return {seq, pending}
"#;

/// 删除第一个序列号等于 ARGV[1] 的条目
pub(crate) const REMOVE_ENTRY_SCRIPT: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, entry in ipairs(entries) do
    local seq = string.match(entry, '^{"sequence_id":(%d+),')
    if seq == ARGV[1] then
        return redis.call('LREM', KEYS[1], 1, entry)
    end
end
return 0
"#;

/// 从表头弹出序列号不大于 ARGV[1] 的条目，无法解析的条目同样弹出
pub(crate) const DRAIN_THROUGH_SCRIPT: &str = r#"
local last = tonumber(ARGV[1])
local removed = 0
while true do
    local head = redis.call('LINDEX', KEYS[1], 0)
    if not head then
        break
    end
    local seq = tonumber(string.match(head, '^{"sequence_id":(%d+),'))
    if seq and seq > last then
        break
    end
    redis.call('LPOP', KEYS[1])
    removed = removed + 1
end
return removed
"#;

#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
    enqueue: Script,
    remove_entry: Script,
    drain_through: Script,
}

impl RedisCacheStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            enqueue: Script::new(ENQUEUE_SCRIPT),
            remove_entry: Script::new(REMOVE_ENTRY_SCRIPT),
            drain_through: Script::new(DRAIN_THROUGH_SCRIPT),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn enqueue(
        &self,
        keys: &EnqueueKeys,
        payload: &str,
        capacity: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.enqueue.prepare_invoke();
        invocation.key(&keys.counter).key(&keys.pending);
        for key in &keys.recent {
            invocation.key(key);
        }
        invocation.arg(payload).arg(capacity);

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        match reply.as_slice() {
            [sequence_id, pending_len] if *sequence_id > 0 && *pending_len >= 0 => {
                Ok(EnqueueOutcome {
                    sequence_id: SequenceId(*sequence_id as u64),
                    pending_len: *pending_len as usize,
                })
            }
            other => Err(StoreError::unexpected_reply(format!(
                "enqueue script returned {other:?}"
            ))),
        }
    }

    async fn read_list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn remove_entry(&self, key: &str, sequence_id: SequenceId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .remove_entry
            .key(key)
            .arg(sequence_id.value().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn drain_through(&self, key: &str, last: SequenceId) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .drain_through
            .key(key)
            .arg(last.value())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed.max(0) as usize)
    }
}
