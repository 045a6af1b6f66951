//! 进程内存储实现
//!
//! 单进程部署可以直接使用内存缓存和内存计数器；持久化部分的内存实现主要用于测试。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ArchiveBatch, BanRecord, BanRepository, ChatMessage, MessageArchive, PrivateChatMessage,
    RateLimitConfig, RateLimitRepository, RepositoryError, RepositoryResult, SequenceId,
    SessionRecord, SessionRecordRepository, Timestamp, UserId,
};

use crate::clock::Clock;
use crate::store::{
    entry_sequence, wrap_entry, CacheStore, EnqueueKeys, EnqueueOutcome, RateCounterStore,
    StoreError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct CacheState {
    counters: HashMap<String, u64>,
    lists: HashMap<String, VecDeque<String>>,
}

/// 内存缓存存储，所有多键操作在同一把锁内完成
#[derive(Default)]
pub struct MemoryCacheStore {
    state: Mutex<CacheState>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn enqueue(
        &self,
        keys: &EnqueueKeys,
        payload: &str,
        capacity: usize,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut state = lock(&self.state);

        let counter = state.counters.entry(keys.counter.clone()).or_insert(0);
        *counter += 1;
        let sequence_id = SequenceId(*counter);
        let entry = wrap_entry(sequence_id, payload);

        for key in &keys.recent {
            let list = state.lists.entry(key.clone()).or_default();
            list.push_back(entry.clone());
            while list.len() > capacity {
                list.pop_front();
            }
        }

        let pending = state.lists.entry(keys.pending.clone()).or_default();
        pending.push_back(entry);

        Ok(EnqueueOutcome {
            sequence_id,
            pending_len: pending.len(),
        })
    }

    async fn read_list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_entry(&self, key: &str, sequence_id: SequenceId) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(false);
        };
        match list
            .iter()
            .position(|raw| entry_sequence(raw) == Some(sequence_id))
        {
            Some(index) => {
                list.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn drain_through(&self, key: &str, last: SequenceId) -> Result<usize, StoreError> {
        let mut state = lock(&self.state);
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        while let Some(head) = list.front() {
            match entry_sequence(head) {
                Some(sequence_id) if sequence_id > last => break,
                // 无法解析序列号的条目同样移除，避免永久卡住表头
                _ => {
                    list.pop_front();
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

struct CounterWindow {
    count: u64,
    expires_at: Option<Timestamp>,
}

/// 内存窗口计数器，语义与 Redis 的 INCR + EXPIRE 一致
pub struct MemoryRateCounter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, CounterWindow>>,
}

impl MemoryRateCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateCounterStore for MemoryRateCounter {
    async fn increment_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(window)
            .map_err(|err| StoreError::backend(format!("invalid window: {err}")))?;
        let mut windows = lock(&self.windows);

        let expired = windows
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|expires_at| expires_at <= now);
        if expired {
            windows.remove(key);
        }

        let entry = windows.entry(key.to_string()).or_insert(CounterWindow {
            count: 0,
            expires_at: None,
        });
        entry.count += 1;
        if entry.count == 1 {
            entry.expires_at = Some(now + window);
        }
        Ok(entry.count)
    }
}

#[derive(Default)]
struct StorageState {
    public: Vec<ChatMessage>,
    private: Vec<PrivateChatMessage>,
    batches: usize,
    fail_archive: bool,
    fail_session_records: bool,
    sessions: Vec<SessionRecord>,
    bans: Vec<BanRecord>,
    rate_limits: HashMap<i32, RateLimitConfig>,
}

/// 内存持久化实现（用于测试），可以注入写入失败
pub struct MemoryStorage {
    clock: Arc<dyn Clock>,
    state: Mutex<StorageState>,
}

impl MemoryStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(StorageState::default()),
        }
    }

    /// 让后续的批量写入失败，直到重新设置为 false
    pub fn set_archive_failure(&self, fail: bool) {
        lock(&self.state).fail_archive = fail;
    }

    pub fn set_session_record_failure(&self, fail: bool) {
        lock(&self.state).fail_session_records = fail;
    }

    pub fn add_ban(&self, ban: BanRecord) {
        lock(&self.state).bans.push(ban);
    }

    pub fn archived_public(&self) -> Vec<ChatMessage> {
        lock(&self.state).public.clone()
    }

    pub fn archived_private(&self) -> Vec<PrivateChatMessage> {
        lock(&self.state).private.clone()
    }

    /// 成功提交的批次数
    pub fn committed_batches(&self) -> usize {
        lock(&self.state).batches
    }

    pub fn session_records(&self) -> Vec<SessionRecord> {
        lock(&self.state).sessions.clone()
    }

    /// 已持久化的公开消息序列号
    pub fn archived_sequences(&self) -> HashSet<SequenceId> {
        lock(&self.state)
            .public
            .iter()
            .filter_map(|message| message.sequence_id)
            .collect()
    }
}

#[async_trait]
impl MessageArchive for MemoryStorage {
    async fn insert_batch(&self, batch: ArchiveBatch) -> RepositoryResult<u64> {
        let mut state = lock(&self.state);
        if state.fail_archive {
            return Err(RepositoryError::storage("archive unavailable"));
        }
        let inserted = batch.len() as u64;
        match batch {
            ArchiveBatch::Public(messages) => state.public.extend(messages),
            ArchiveBatch::Private(messages) => state.private.extend(messages),
        }
        state.batches += 1;
        Ok(inserted)
    }
}

#[async_trait]
impl SessionRecordRepository for MemoryStorage {
    async fn insert_session_record(&self, record: SessionRecord) -> RepositoryResult<()> {
        let mut state = lock(&self.state);
        if state.fail_session_records {
            return Err(RepositoryError::storage("session table unavailable"));
        }
        state.sessions.push(record);
        Ok(())
    }
}

#[async_trait]
impl BanRepository for MemoryStorage {
    async fn is_banned(&self, user_id: UserId) -> RepositoryResult<bool> {
        let now = self.clock.now();
        let state = lock(&self.state);
        Ok(state
            .bans
            .iter()
            .any(|ban| ban.banished_id == user_id && ban.is_active(now)))
    }
}

#[async_trait]
impl RateLimitRepository for MemoryStorage {
    async fn load(&self, settings_id: i32) -> RepositoryResult<RateLimitConfig> {
        lock(&self.state)
            .rate_limits
            .get(&settings_id)
            .copied()
            .ok_or_else(|| RepositoryError::not_found(format!("rate_limiter {settings_id}")))
    }

    async fn update(&self, settings_id: i32, config: RateLimitConfig) -> RepositoryResult<()> {
        lock(&self.state).rate_limits.insert(settings_id, config);
        Ok(())
    }
}
