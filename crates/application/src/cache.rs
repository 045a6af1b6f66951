//! 消息缓存与刷盘桥
//!
//! 每个消息类别拥有一个序列号计数器、一个有界的最近列表和一个待刷新列表；私聊另外为每个
//! 参与者维护一个个人最近列表。入队通过 `CacheStore::enqueue` 原子完成，刷盘把待刷新列表
//! 整批写入持久化存储，提交成功后才清理。

use std::sync::Arc;
use std::time::Duration;

use config::CacheConfig;
use domain::{
    ArchiveBatch, CachedEntry, ChatMessage, MessageArchive, MessageClass, PrivateChatMessage,
    RepositoryError, SequenceId, UserId,
};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::rate_limiter::{RateLimitError, RateLimiter};
use crate::store::{entry_sequence, CacheStore, EnqueueKeys, EnqueueOutcome, StoreError};

const PUBLIC_COUNTER_KEY: &str = "cache_message_id";
const PUBLIC_RECENT_KEY: &str = "recent_messages";
const PUBLIC_PENDING_KEY: &str = "flush_messages";
const PRIVATE_COUNTER_KEY: &str = "cache_private_message_id";
const PRIVATE_PENDING_KEY: &str = "flush_private_messages";

fn private_recent_key(user_id: UserId) -> String {
    format!("recent_private_messages:{user_id}")
}

fn pending_key(class: MessageClass) -> &'static str {
    match class {
        MessageClass::Public => PUBLIC_PENDING_KEY,
        MessageClass::Private => PRIVATE_PENDING_KEY,
    }
}

/// 缓存错误类型
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("cache store failure: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode cached message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to archive {class} messages: {source}")]
    Archive {
        class: MessageClass,
        #[source]
        source: RepositoryError,
    },
}

impl CacheError {
    /// 是否为限流策略拒绝（而不是基础设施故障）
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            CacheError::RateLimited(RateLimitError::RateLimitExceeded { .. })
        )
    }
}

/// 缓存参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// 最近列表容量
    pub recent_capacity: usize,
    /// 待刷新列表达到该长度时立即刷盘
    pub flush_threshold: usize,
    /// 定时刷盘间隔
    pub flush_interval: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            recent_capacity: config.recent_capacity,
            flush_threshold: config.flush_threshold,
            flush_interval: config.flush_interval(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            recent_capacity: 500,
            flush_threshold: 500,
            flush_interval: Duration::from_secs(120),
        }
    }
}

/// 一次刷盘的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub class: MessageClass,
    /// 写入持久化存储的行数
    pub inserted: u64,
    /// 从待刷新列表移除的条目数
    pub cleared: usize,
}

impl FlushReport {
    fn empty(class: MessageClass) -> Self {
        Self {
            class,
            inserted: 0,
            cleared: 0,
        }
    }
}

/// 需要从缓存中清除的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeTarget {
    Chat {
        sequence_id: SequenceId,
    },
    /// 私聊消息同时存在于双方的个人最近列表中
    Private {
        sequence_id: SequenceId,
        owner_id: UserId,
        recipient_id: UserId,
    },
}

impl PurgeTarget {
    pub fn class(&self) -> MessageClass {
        match self {
            PurgeTarget::Chat { .. } => MessageClass::Public,
            PurgeTarget::Private { .. } => MessageClass::Private,
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        match self {
            PurgeTarget::Chat { sequence_id } | PurgeTarget::Private { sequence_id, .. } => {
                *sequence_id
            }
        }
    }

    fn recent_keys(&self) -> Vec<String> {
        match self {
            PurgeTarget::Chat { .. } => vec![PUBLIC_RECENT_KEY.to_string()],
            PurgeTarget::Private {
                owner_id,
                recipient_id,
                ..
            } => {
                let mut keys = vec![private_recent_key(*owner_id)];
                if owner_id != recipient_id {
                    keys.push(private_recent_key(*recipient_id));
                }
                keys
            }
        }
    }
}

/// 清除结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// 从最近列表中移除的条目数
    pub recent_removed: usize,
    /// 从待刷新列表中移除的条目数
    pub pending_removed: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.recent_removed + self.pending_removed
    }
}

/// 消息缓存
pub struct MessageCache {
    store: Arc<dyn CacheStore>,
    archive: Arc<dyn MessageArchive>,
    rate_limiter: Arc<RateLimiter>,
    settings: CacheSettings,
    public_flush: Mutex<()>,
    private_flush: Mutex<()>,
}

impl MessageCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        archive: Arc<dyn MessageArchive>,
        rate_limiter: Arc<RateLimiter>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            archive,
            rate_limiter,
            settings,
            public_flush: Mutex::new(()),
            private_flush: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// 入队一条频道消息，返回分配的序列号和待刷新列表长度
    pub async fn enqueue_chat(&self, message: &ChatMessage) -> Result<EnqueueOutcome, CacheError> {
        let mut unsequenced = message.clone();
        unsequenced.sequence_id = None;
        let payload = serde_json::to_string(&unsequenced)?;

        let keys = EnqueueKeys {
            counter: PUBLIC_COUNTER_KEY.to_string(),
            pending: PUBLIC_PENDING_KEY.to_string(),
            recent: vec![PUBLIC_RECENT_KEY.to_string()],
        };
        let outcome = self
            .store
            .enqueue(&keys, &payload, self.settings.recent_capacity)
            .await?;
        debug!(
            sequence_id = %outcome.sequence_id,
            pending = outcome.pending_len,
            channel = %message.channel,
            "chat message cached"
        );
        Ok(outcome)
    }

    /// 入队一条私聊消息；发给自己的消息只写入一次个人最近列表
    pub async fn enqueue_private(
        &self,
        message: &PrivateChatMessage,
    ) -> Result<EnqueueOutcome, CacheError> {
        let mut unsequenced = message.clone();
        unsequenced.sequence_id = None;
        let payload = serde_json::to_string(&unsequenced)?;

        let mut recent = vec![private_recent_key(message.owner_id)];
        if !message.is_self_message() {
            recent.push(private_recent_key(message.recipient_id));
        }
        let keys = EnqueueKeys {
            counter: PRIVATE_COUNTER_KEY.to_string(),
            pending: PRIVATE_PENDING_KEY.to_string(),
            recent,
        };
        let outcome = self
            .store
            .enqueue(&keys, &payload, self.settings.recent_capacity)
            .await?;
        debug!(
            sequence_id = %outcome.sequence_id,
            pending = outcome.pending_len,
            owner_id = %message.owner_id,
            recipient_id = %message.recipient_id,
            "private message cached"
        );
        Ok(outcome)
    }

    /// 限流后入队频道消息，返回带序列号的消息
    ///
    /// 待刷新列表达到阈值时在返回前同步刷盘；刷盘失败只记录日志，消息仍然保留在缓存中。
    pub async fn rate_limited_enqueue_chat(
        &self,
        message: ChatMessage,
    ) -> Result<ChatMessage, CacheError> {
        self.rate_limiter.check(message.owner_id).await?;
        let outcome = self.enqueue_chat(&message).await?;
        self.flush_if_needed(MessageClass::Public, outcome.pending_len)
            .await;
        Ok(message.with_sequence(outcome.sequence_id))
    }

    pub async fn rate_limited_enqueue_private(
        &self,
        message: PrivateChatMessage,
    ) -> Result<PrivateChatMessage, CacheError> {
        self.rate_limiter.check(message.owner_id).await?;
        let outcome = self.enqueue_private(&message).await?;
        self.flush_if_needed(MessageClass::Private, outcome.pending_len)
            .await;
        Ok(message.with_sequence(outcome.sequence_id))
    }

    async fn flush_if_needed(&self, class: MessageClass, pending_len: usize) {
        if pending_len < self.settings.flush_threshold {
            return;
        }
        debug!(%class, pending = pending_len, "flush threshold reached");
        if let Err(err) = self.flush(class).await {
            error!(%class, error = %err, "threshold flush failed, entries kept for retry");
        }
    }

    /// 把某个类别的待刷新列表整批写入持久化存储
    ///
    /// 同一类别的刷盘互斥执行。写入失败时待刷新列表保持不变，等待下一次触发重试。
    pub async fn flush(&self, class: MessageClass) -> Result<FlushReport, CacheError> {
        let _guard = match class {
            MessageClass::Public => self.public_flush.lock().await,
            MessageClass::Private => self.private_flush.lock().await,
        };

        let key = pending_key(class);
        let raw_entries = self.store.read_list(key).await?;
        if raw_entries.is_empty() {
            return Ok(FlushReport::empty(class));
        }

        let last = raw_entries
            .iter()
            .filter_map(|raw| entry_sequence(raw))
            .max()
            .unwrap_or_default();

        let batch = match class {
            MessageClass::Public => ArchiveBatch::Public(
                decode_entries::<ChatMessage>(&raw_entries, class)
                    .into_iter()
                    .map(|entry| entry.into_message())
                    .collect(),
            ),
            MessageClass::Private => ArchiveBatch::Private(
                decode_entries::<PrivateChatMessage>(&raw_entries, class)
                    .into_iter()
                    .map(|entry| entry.into_message())
                    .collect(),
            ),
        };

        let inserted = if batch.is_empty() {
            0
        } else {
            self.archive
                .insert_batch(batch)
                .await
                .map_err(|source| {
                    error!(%class, error = %source, "message batch insert failed");
                    CacheError::Archive { class, source }
                })?
        };

        let cleared = self.store.drain_through(key, last).await.map_err(|err| {
            error!(
                %class,
                error = %err,
                "pending list not cleared after commit, entries will be archived again"
            );
            err
        })?;

        info!(%class, inserted, cleared, "cache flushed");
        Ok(FlushReport {
            class,
            inserted,
            cleared,
        })
    }

    /// 刷新所有类别，一个类别失败不影响其他类别
    pub async fn flush_all(&self) -> Vec<FlushReport> {
        let mut reports = Vec::with_capacity(MessageClass::ALL.len());
        for class in MessageClass::ALL {
            match self.flush(class).await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(%class, error = %err, "flush failed"),
            }
        }
        reports
    }

    /// 启动定时刷盘任务，取消令牌触发后退出
    pub fn spawn_periodic_flush(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.settings.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("periodic flush stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.flush_all().await;
                    }
                }
            }
        })
    }

    /// 最近的频道消息，按插入顺序
    pub async fn recent_chat_messages(&self) -> Result<Vec<ChatMessage>, CacheError> {
        let raw_entries = self.store.read_list(PUBLIC_RECENT_KEY).await?;
        Ok(decode_entries::<ChatMessage>(&raw_entries, MessageClass::Public)
            .into_iter()
            .map(|entry| entry.into_message())
            .collect())
    }

    /// 某用户个人最近列表中的私聊消息（发出和收到的）
    pub async fn recent_private_messages(
        &self,
        user_id: UserId,
    ) -> Result<Vec<PrivateChatMessage>, CacheError> {
        let raw_entries = self.store.read_list(&private_recent_key(user_id)).await?;
        Ok(decode_entries::<PrivateChatMessage>(&raw_entries, MessageClass::Private)
            .into_iter()
            .map(|entry| entry.into_message())
            .collect())
    }

    pub async fn pending_len(&self, class: MessageClass) -> Result<usize, CacheError> {
        Ok(self.store.read_list(pending_key(class)).await?.len())
    }

    /// 在持久化存储删除消息后调用，避免它通过回放或下一次刷盘重新出现
    pub async fn purge(&self, target: PurgeTarget) -> Result<PurgeReport, CacheError> {
        let sequence_id = target.sequence_id();
        let mut report = PurgeReport::default();

        for key in target.recent_keys() {
            if self.store.remove_entry(&key, sequence_id).await? {
                report.recent_removed += 1;
            }
        }
        if self
            .store
            .remove_entry(pending_key(target.class()), sequence_id)
            .await?
        {
            report.pending_removed += 1;
        }

        info!(
            class = %target.class(),
            sequence_id = %sequence_id,
            removed = report.total(),
            "cached message purged"
        );
        Ok(report)
    }

    /// 批量清除，返回合计结果
    pub async fn purge_many(&self, targets: &[PurgeTarget]) -> Result<PurgeReport, CacheError> {
        let mut total = PurgeReport::default();
        for target in targets {
            let report = self.purge(*target).await?;
            total.recent_removed += report.recent_removed;
            total.pending_removed += report.pending_removed;
        }
        Ok(total)
    }
}

fn decode_entries<T: DeserializeOwned>(
    raw_entries: &[String],
    class: MessageClass,
) -> Vec<CachedEntry<T>> {
    raw_entries
        .iter()
        .filter_map(|raw| match serde_json::from_str::<CachedEntry<T>>(raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(%class, error = %err, "skipping malformed cache entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::memory::{MemoryCacheStore, MemoryRateCounter, MemoryStorage};
    use chrono::Utc;
    use domain::{MockMessageArchive, RateLimitConfig};
    use futures::future::join_all;
    use std::collections::HashSet;
    use uuid::Uuid;

    struct Fixture {
        cache: Arc<MessageCache>,
        store: Arc<MemoryCacheStore>,
        storage: Arc<MemoryStorage>,
    }

    fn fixture(settings: CacheSettings, rate: RateLimitConfig) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryCacheStore::new());
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryRateCounter::new(clock)),
            rate,
        ));
        let cache = Arc::new(MessageCache::new(
            store.clone(),
            storage.clone(),
            limiter,
            settings,
        ));
        Fixture {
            cache,
            store,
            storage,
        }
    }

    fn settings(recent_capacity: usize, flush_threshold: usize) -> CacheSettings {
        CacheSettings {
            recent_capacity,
            flush_threshold,
            flush_interval: Duration::from_secs(120),
        }
    }

    fn generous() -> RateLimitConfig {
        RateLimitConfig {
            limit: 1_000,
            window_seconds: 60,
        }
    }

    fn chat(owner: UserId, text: &str) -> ChatMessage {
        ChatMessage::new(owner, "alice", "general", text, Utc::now())
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[tokio::test]
    async fn concurrent_enqueues_get_consecutive_ids() {
        let fx = fixture(settings(500, 500), generous());
        let owner = user();

        let calls = (0..50).map(|i| {
            let cache = fx.cache.clone();
            let message = chat(owner, &format!("m{i}"));
            async move { cache.enqueue_chat(&message).await.unwrap().sequence_id }
        });
        let ids: Vec<u64> = join_all(calls).await.into_iter().map(|s| s.value()).collect();

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 50);
        assert_eq!(unique.iter().min(), Some(&1));
        assert_eq!(unique.iter().max(), Some(&50));
    }

    #[tokio::test]
    async fn recent_list_keeps_last_entries_in_order() {
        let fx = fixture(settings(5, 500), generous());
        let owner = user();
        for i in 1..=8 {
            fx.cache.enqueue_chat(&chat(owner, &format!("m{i}"))).await.unwrap();
        }

        let recent = fx.cache.recent_chat_messages().await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m4", "m5", "m6", "m7", "m8"]);
        assert_eq!(recent[0].sequence_id, Some(SequenceId(4)));

        // 待刷新列表不裁剪
        assert_eq!(fx.cache.pending_len(MessageClass::Public).await.unwrap(), 8);

        // 再次读取返回同一快照
        assert_eq!(fx.cache.recent_chat_messages().await.unwrap(), recent);
    }

    #[tokio::test]
    async fn second_flush_is_a_noop() {
        let fx = fixture(settings(500, 500), generous());
        let owner = user();
        fx.cache.enqueue_chat(&chat(owner, "a")).await.unwrap();
        fx.cache.enqueue_chat(&chat(owner, "b")).await.unwrap();

        let first = fx.cache.flush(MessageClass::Public).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.cleared, 2);

        let second = fx.cache.flush(MessageClass::Public).await.unwrap();
        assert_eq!(second, FlushReport::empty(MessageClass::Public));
        assert_eq!(fx.storage.archived_public().len(), 2);
        assert_eq!(fx.storage.committed_batches(), 1);
    }

    #[tokio::test]
    async fn reaching_threshold_flushes_inline() {
        let fx = fixture(settings(500, 3), generous());
        let owner = user();

        for i in 0..3 {
            fx.cache
                .rate_limited_enqueue_chat(chat(owner, &format!("m{i}")))
                .await
                .unwrap();
        }

        let archived = fx.storage.archived_public();
        assert_eq!(archived.len(), 3);
        assert!(archived.iter().all(|m| m.sequence_id.is_some()));
        assert_eq!(fx.cache.pending_len(MessageClass::Public).await.unwrap(), 0);
        // 最近列表不受刷盘影响
        assert_eq!(fx.cache.recent_chat_messages().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejected_message_is_not_cached() {
        let fx = fixture(
            settings(500, 500),
            RateLimitConfig {
                limit: 1,
                window_seconds: 60,
            },
        );
        let owner = user();

        let first = fx.cache.rate_limited_enqueue_chat(chat(owner, "ok")).await.unwrap();
        assert_eq!(first.sequence_id, Some(SequenceId(1)));

        let err = fx
            .cache
            .rate_limited_enqueue_chat(chat(owner, "too much"))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(fx.cache.pending_len(MessageClass::Public).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purged_message_is_not_archived() {
        let fx = fixture(settings(500, 500), generous());
        let owner = user();
        for i in 1..=3 {
            fx.cache.enqueue_chat(&chat(owner, &format!("m{i}"))).await.unwrap();
        }

        let report = fx
            .cache
            .purge(PurgeTarget::Chat {
                sequence_id: SequenceId(2),
            })
            .await
            .unwrap();
        assert_eq!(report.recent_removed, 1);
        assert_eq!(report.pending_removed, 1);

        let recent: Vec<_> = fx
            .cache
            .recent_chat_messages()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|m| m.sequence_id)
            .collect();
        assert_eq!(recent, vec![SequenceId(1), SequenceId(3)]);

        fx.cache.flush(MessageClass::Public).await.unwrap();
        let archived = fx.storage.archived_sequences();
        assert!(!archived.contains(&SequenceId(2)));
        assert_eq!(archived.len(), 2);
    }

    #[tokio::test]
    async fn purge_of_unknown_sequence_removes_nothing() {
        let fx = fixture(settings(500, 500), generous());
        fx.cache.enqueue_chat(&chat(user(), "m")).await.unwrap();

        let report = fx
            .cache
            .purge_many(&[
                PurgeTarget::Chat {
                    sequence_id: SequenceId(9),
                },
                PurgeTarget::Chat {
                    sequence_id: SequenceId(1),
                },
            ])
            .await
            .unwrap();
        assert_eq!(report.total(), 2);
    }

    #[tokio::test]
    async fn private_messages_land_in_both_personal_lists() {
        let fx = fixture(settings(500, 500), generous());
        let alice = user();
        let bob = user();

        let message = PrivateChatMessage::new(alice, "alice", bob, "bob", "psst", Utc::now());
        let sent = fx.cache.rate_limited_enqueue_private(message).await.unwrap();
        assert_eq!(sent.sequence_id, Some(SequenceId(1)));

        assert_eq!(fx.cache.recent_private_messages(alice).await.unwrap().len(), 1);
        assert_eq!(fx.cache.recent_private_messages(bob).await.unwrap().len(), 1);

        let report = fx
            .cache
            .purge(PurgeTarget::Private {
                sequence_id: SequenceId(1),
                owner_id: alice,
                recipient_id: bob,
            })
            .await
            .unwrap();
        assert_eq!(report.recent_removed, 2);
        assert_eq!(report.pending_removed, 1);
        assert!(fx.cache.recent_private_messages(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_message_is_cached_once() {
        let fx = fixture(settings(500, 500), generous());
        let alice = user();

        let message = PrivateChatMessage::new(alice, "alice", alice, "alice", "memo", Utc::now());
        fx.cache.enqueue_private(&message).await.unwrap();

        assert_eq!(fx.cache.recent_private_messages(alice).await.unwrap().len(), 1);
        assert_eq!(fx.cache.pending_len(MessageClass::Private).await.unwrap(), 1);

        let report = fx.cache.flush(MessageClass::Private).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(fx.storage.archived_private().len(), 1);
    }

    #[tokio::test]
    async fn classes_have_independent_counters() {
        let fx = fixture(settings(500, 500), generous());
        let alice = user();
        let bob = user();

        fx.cache.enqueue_chat(&chat(alice, "a")).await.unwrap();
        fx.cache.enqueue_chat(&chat(alice, "b")).await.unwrap();
        let private = PrivateChatMessage::new(alice, "alice", bob, "bob", "c", Utc::now());
        let outcome = fx.cache.enqueue_private(&private).await.unwrap();
        assert_eq!(outcome.sequence_id, SequenceId(1));
    }

    #[tokio::test]
    async fn failed_archive_keeps_pending_entries() {
        let fx = fixture(settings(500, 500), generous());
        fx.cache.enqueue_chat(&chat(user(), "keep me")).await.unwrap();

        fx.storage.set_archive_failure(true);
        let err = fx.cache.flush(MessageClass::Public).await.unwrap_err();
        assert!(matches!(err, CacheError::Archive { .. }));
        assert_eq!(fx.cache.pending_len(MessageClass::Public).await.unwrap(), 1);

        fx.storage.set_archive_failure(false);
        let report = fx.cache.flush(MessageClass::Public).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(fx.cache.pending_len(MessageClass::Public).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn threshold_flush_failure_still_accepts_message() {
        let store = Arc::new(MemoryCacheStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryRateCounter::new(clock)),
            generous(),
        ));
        let mut archive = MockMessageArchive::new();
        archive
            .expect_insert_batch()
            .times(1)
            .returning(|_| Err(RepositoryError::storage("connection refused")));
        let cache = MessageCache::new(store.clone(), Arc::new(archive), limiter, settings(500, 1));

        let sent = cache.rate_limited_enqueue_chat(chat(user(), "hi")).await.unwrap();
        assert_eq!(sent.sequence_id, Some(SequenceId(1)));
        assert_eq!(store.read_list(PUBLIC_PENDING_KEY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entries_added_during_flush_survive_the_drain() {
        let fx = fixture(settings(500, 500), generous());
        let owner = user();
        fx.cache.enqueue_chat(&chat(owner, "first")).await.unwrap();

        // 模拟刷盘读取之后才写入的条目
        let raw = fx.store.read_list(PUBLIC_PENDING_KEY).await.unwrap();
        fx.cache.enqueue_chat(&chat(owner, "late")).await.unwrap();
        let last = entry_sequence(&raw[0]).unwrap();
        fx.store.drain_through(PUBLIC_PENDING_KEY, last).await.unwrap();

        assert_eq!(fx.cache.pending_len(MessageClass::Public).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_drains_both_classes() {
        let fx = fixture(settings(500, 500), generous());
        let alice = user();
        let bob = user();
        fx.cache.enqueue_chat(&chat(alice, "public")).await.unwrap();
        fx.cache
            .enqueue_private(&PrivateChatMessage::new(
                alice,
                "alice",
                bob,
                "bob",
                "private",
                Utc::now(),
            ))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let task = fx.cache.spawn_periodic_flush(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(fx.storage.archived_public().len(), 1);
        assert_eq!(fx.storage.archived_private().len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
