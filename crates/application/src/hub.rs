//! 会话注册表与路由事件循环
//!
//! Hub 是单消费者的 actor：注册、注销、消息分发都经由同一个命令队列按到达顺序处理，
//! 注册表只被事件循环修改，不需要内部加锁。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{
    ChatMessage, Envelope, Payload, PrivateChatMessage, SessionRecord, SessionRecordRepository,
    Timestamp, UserId, UserStatus,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::MessageCache;
use crate::clock::Clock;
use crate::session::{Session, SessionIdentity, SessionKey};

/// Hub 错误类型
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub event loop is not running")]
    Stopped,
}

impl<T> From<mpsc::error::SendError<T>> for HubError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        HubError::Stopped
    }
}

impl From<oneshot::error::RecvError> for HubError {
    fn from(_: oneshot::error::RecvError) -> Self {
        HubError::Stopped
    }
}

/// 事件循环的命令，所有命令共享同一个全序
#[derive(Debug)]
pub enum HubCommand {
    Register {
        session: Arc<Session>,
    },
    Admit {
        session: Arc<Session>,
        chat_history: Vec<ChatMessage>,
    },
    Unregister {
        session: Arc<Session>,
    },
    Dispatch {
        envelope: Envelope,
    },
    FindUsername {
        user_id: UserId,
        reply: oneshot::Sender<Option<String>>,
    },
    ConnectedUsers {
        reply: oneshot::Sender<Vec<UserStatus>>,
    },
}

/// Hub 依赖
pub struct HubDependencies {
    pub cache: Arc<MessageCache>,
    pub session_records: Arc<dyn SessionRecordRepository>,
    pub clock: Arc<dyn Clock>,
    /// 不计入在线用户的应用
    pub observer_applications: Vec<String>,
}

/// 会话注册表与路由
pub struct Hub {
    sessions: HashMap<SessionKey, Arc<Session>>,
    cache: Arc<MessageCache>,
    session_records: Arc<dyn SessionRecordRepository>,
    clock: Arc<dyn Clock>,
    observers: HashSet<String>,
    commands: mpsc::Receiver<HubCommand>,
}

impl Hub {
    pub fn new(deps: HubDependencies, command_capacity: usize) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(command_capacity.max(1));
        let hub = Self {
            sessions: HashMap::new(),
            cache: deps.cache,
            session_records: deps.session_records,
            clock: deps.clock,
            observers: deps.observer_applications.into_iter().collect(),
            commands: receiver,
        };
        (hub, HubHandle { commands: sender })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_observer(&self, session: &Session) -> bool {
        self.observers.contains(session.application_id().as_str())
    }

    /// 注册会话（同键覆盖，后注册者生效），并推送该用户缓存中的私聊消息
    ///
    /// 被覆盖的旧会话不会再收到任何路由消息，它的出站队列在这里关闭。
    pub async fn register(&mut self, session: Arc<Session>) {
        let key = session.key();
        session.start_connection_timer(self.clock.now());

        if let Some(previous) = self.sessions.insert(key.clone(), Arc::clone(&session)) {
            if previous.connection_id() != session.connection_id() {
                warn!(
                    key = %key,
                    replaced = %previous.connection_id(),
                    connection_id = %session.connection_id(),
                    "session key already registered, replacing"
                );
                previous.close();
            }
        }
        info!(key = %key, username = %session.display_name(), "session registered");

        match self.cache.recent_private_messages(session.user_id()).await {
            Ok(messages) if !messages.is_empty() => {
                push_handshake(&session, Envelope::bulk_private(messages));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "failed to load cached private messages");
            }
        }
    }

    /// 注册新连接并完成握手推送：缓存的私聊、频道历史、在线用户列表
    pub async fn admit(&mut self, session: Arc<Session>, chat_history: Vec<ChatMessage>) {
        self.register(Arc::clone(&session)).await;
        if !chat_history.is_empty() {
            push_handshake(&session, Envelope::bulk_chat(chat_history));
        }
        push_handshake(&session, Envelope::connected_users(self.connected_users()));
    }

    /// 注销会话：记录会话时长、关闭出站队列、广播离线状态
    ///
    /// 键不存在时什么也不做。键已被更新的连接占用时，只关闭传入会话自己的队列。
    pub async fn unregister(&mut self, session: Arc<Session>) {
        let key = session.key();
        let is_current = match self.sessions.get(&key) {
            None => {
                debug!(key = %key, "unregister for unknown session ignored");
                return;
            }
            Some(current) => current.connection_id() == session.connection_id(),
        };
        if !is_current {
            debug!(
                key = %key,
                connection_id = %session.connection_id(),
                "stale session unregistered, newer connection kept"
            );
            session.close();
            return;
        }

        self.sessions.remove(&key);

        let ended_at = self.clock.now();
        let started_at = session.connected_at().unwrap_or(ended_at);
        let record = SessionRecord {
            user_id: session.user_id(),
            started_at,
            ended_at,
        };
        match self.session_records.insert_session_record(record).await {
            Ok(()) => info!(
                key = %key,
                duration_secs = (ended_at - started_at).num_seconds(),
                "session recorded"
            ),
            Err(err) => error!(key = %key, error = %err, "failed to record session"),
        }

        if !session.close() {
            debug!(key = %key, "outbound queue was already closed");
        }

        self.broadcast(Envelope::user_status(
            session.display_name(),
            session.user_id(),
            false,
        ))
        .await;
        info!(key = %key, "session unregistered");
    }

    /// 按负载类型路由信封；任何单条消息的失败都只记录日志
    pub async fn dispatch(&mut self, envelope: Envelope) {
        let Envelope { sender, payload } = envelope;
        match payload {
            Payload::ChatMessage(message) => self.dispatch_chat(sender, message).await,
            Payload::PrivateChatMessage(message) => self.dispatch_private(sender, message).await,
            Payload::BulkPrivateMessages(bulk) => {
                warn!(
                    sender = %sender,
                    count = bulk.messages.len(),
                    "bulk private messages are never broadcast, dropped"
                );
            }
            payload @ (Payload::UserStatus(_)
            | Payload::ConnectedUsers(_)
            | Payload::BulkChatMessages(_)
            | Payload::Analytics(_)) => {
                self.broadcast(Envelope::new(sender, payload)).await;
            }
        }
    }

    async fn dispatch_chat(&mut self, sender: String, message: ChatMessage) {
        let owner_id = message.owner_id;
        match self.cache.rate_limited_enqueue_chat(message).await {
            Ok(message) => {
                self.broadcast(Envelope::new(sender, Payload::ChatMessage(message)))
                    .await;
            }
            Err(err) if err.is_rate_limited() => {
                warn!(user_id = %owner_id, error = %err, "chat message dropped by rate limit");
            }
            Err(err) => {
                error!(user_id = %owner_id, error = %err, "chat message dropped, cache failure");
            }
        }
    }

    async fn dispatch_private(&mut self, sender: String, message: PrivateChatMessage) {
        let owner_id = message.owner_id;
        match self.cache.rate_limited_enqueue_private(message).await {
            Ok(message) => {
                self.whisper(Envelope::new(sender, Payload::PrivateChatMessage(message)))
                    .await;
            }
            Err(err) if err.is_rate_limited() => {
                warn!(user_id = %owner_id, error = %err, "private message dropped by rate limit");
            }
            Err(err) => {
                error!(user_id = %owner_id, error = %err, "private message dropped, cache failure");
            }
        }
    }

    /// 推送给所有会话
    pub async fn broadcast(&self, envelope: Envelope) {
        let kind = envelope.kind();
        let envelope = Arc::new(envelope);
        for (key, session) in &self.sessions {
            if let Err(err) = session.deliver(Arc::clone(&envelope)).await {
                warn!(key = %key, kind = %kind, error = %err, "broadcast delivery failed");
            }
        }
        debug!(kind = %kind, recipients = self.sessions.len(), "broadcast");
    }

    /// 只推送给发送者和接收者的会话；同时匹配两者的会话只收到一次
    pub async fn whisper(&self, envelope: Envelope) {
        let (owner_id, recipient_id) = match &envelope.payload {
            Payload::PrivateChatMessage(message) => (message.owner_id, message.recipient_id),
            _ => {
                warn!(kind = %envelope.kind(), "whisper requires a private chat payload");
                return;
            }
        };

        let envelope = Arc::new(envelope);
        for (key, session) in &self.sessions {
            let user_id = session.user_id();
            if user_id == owner_id || user_id == recipient_id {
                if let Err(err) = session.deliver(Arc::clone(&envelope)).await {
                    warn!(key = %key, error = %err, "whisper delivery failed");
                }
            }
        }
    }

    /// 按用户 ID 查找第一个在线会话的显示名
    pub fn reverse_lookup(&self, user_id: UserId) -> Option<String> {
        self.sessions
            .values()
            .find(|session| session.user_id() == user_id)
            .map(|session| session.display_name().to_string())
    }

    /// 在线用户快照，排除观察者应用的连接
    pub fn connected_users(&self) -> Vec<UserStatus> {
        let mut users: Vec<UserStatus> = self
            .sessions
            .values()
            .filter(|session| !self.is_observer(session))
            .map(|session| UserStatus {
                username: session.display_name().to_string(),
                user_id: session.user_id(),
                is_connected: true,
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { session } => self.register(session).await,
            HubCommand::Admit {
                session,
                chat_history,
            } => self.admit(session, chat_history).await,
            HubCommand::Unregister { session } => self.unregister(session).await,
            HubCommand::Dispatch { envelope } => self.dispatch(envelope).await,
            HubCommand::FindUsername { user_id, reply } => {
                let _ = reply.send(self.reverse_lookup(user_id));
            }
            HubCommand::ConnectedUsers { reply } => {
                let _ = reply.send(self.connected_users());
            }
        }
    }

    /// 事件循环：直到取消令牌触发或所有句柄被丢弃
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("hub event loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        for session in self.sessions.values() {
            session.close();
        }
        info!(sessions = self.sessions.len(), "hub event loop stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// 握手阶段的推送
///
/// 此时传输层还没有拿到出站队列，推送一律不等待，放不下的直接丢弃。
fn push_handshake(session: &Session, envelope: Envelope) {
    let kind = envelope.kind();
    match session.try_deliver(Arc::new(envelope)) {
        Ok(()) => debug!(key = %session.key(), kind = %kind, "handshake envelope queued"),
        Err(err) => warn!(
            key = %session.key(),
            kind = %kind,
            error = %err,
            "handshake envelope dropped"
        ),
    }
}

/// 向事件循环发送命令的句柄
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn register(&self, session: Arc<Session>) -> Result<(), HubError> {
        self.commands.send(HubCommand::Register { session }).await?;
        Ok(())
    }

    /// 注册并完成握手推送；命令入队后立即返回，不等待事件循环处理
    pub async fn admit(
        &self,
        session: Arc<Session>,
        chat_history: Vec<ChatMessage>,
    ) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Admit {
                session,
                chat_history,
            })
            .await?;
        Ok(())
    }

    pub async fn unregister(&self, session: Arc<Session>) -> Result<(), HubError> {
        self.commands.send(HubCommand::Unregister { session }).await?;
        Ok(())
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), HubError> {
        self.commands.send(HubCommand::Dispatch { envelope }).await?;
        Ok(())
    }

    pub async fn find_username(&self, user_id: UserId) -> Result<Option<String>, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::FindUsername { user_id, reply })
            .await?;
        Ok(response.await?)
    }

    pub async fn connected_users(&self) -> Result<Vec<UserStatus>, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::ConnectedUsers { reply })
            .await?;
        Ok(response.await?)
    }

    /// 构造频道消息并交给事件循环
    pub async fn send_chat(
        &self,
        from: &SessionIdentity,
        channel: impl Into<String>,
        text: impl Into<String>,
        sent_at: Timestamp,
    ) -> Result<(), HubError> {
        let message = ChatMessage::new(
            from.user_id,
            from.display_name.clone(),
            channel,
            text,
            sent_at,
        );
        self.dispatch(Envelope::chat(message)).await
    }

    /// 构造私聊消息并交给事件循环
    ///
    /// 接收者必须在线才能解析出显示名；解析不到时消息被丢弃，返回 `Ok(false)`。
    pub async fn send_private(
        &self,
        from: &SessionIdentity,
        recipient_id: UserId,
        text: impl Into<String>,
        sent_at: Timestamp,
    ) -> Result<bool, HubError> {
        let Some(recipient_name) = self.find_username(recipient_id).await? else {
            warn!(
                user_id = %from.user_id,
                recipient_id = %recipient_id,
                "private message recipient not connected, dropped"
            );
            return Ok(false);
        };
        let message = PrivateChatMessage::new(
            from.user_id,
            from.display_name.clone(),
            recipient_id,
            recipient_name,
            text,
            sent_at,
        );
        self.dispatch(Envelope::private_chat(message)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryCacheStore, MemoryRateCounter, MemoryStorage};
    use crate::rate_limiter::RateLimiter;
    use crate::session::OutboundQueue;
    use domain::{
        AnalyticsSnapshot, ApplicationId, ChannelMessageCount, EnvelopeKind,
        MockSessionRecordRepository, RateLimitConfig, RepositoryError,
    };
    use uuid::Uuid;

    struct Fixture {
        hub: Hub,
        storage: Arc<MemoryStorage>,
        cache: Arc<MessageCache>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(
        rate: RateLimitConfig,
        session_records: Option<Arc<dyn SessionRecordRepository>>,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryRateCounter::new(clock.clone())),
            rate,
        ));
        let cache = Arc::new(MessageCache::new(
            Arc::new(MemoryCacheStore::new()),
            storage.clone(),
            limiter,
            CacheSettings::default(),
        ));
        let (hub, _handle) = Hub::new(
            HubDependencies {
                cache: cache.clone(),
                session_records: session_records
                    .unwrap_or_else(|| storage.clone() as Arc<dyn SessionRecordRepository>),
                clock: clock.clone(),
                observer_applications: vec!["WebClient".to_string()],
            },
            16,
        );
        Fixture {
            hub,
            storage,
            cache,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            RateLimitConfig {
                limit: 100,
                window_seconds: 60,
            },
            None,
        )
    }

    fn connect(user_id: UserId, name: &str, app: &str) -> (Arc<Session>, OutboundQueue) {
        Session::new(
            SessionIdentity::new(user_id, name, ApplicationId::parse(app).unwrap()),
            32,
        )
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn kinds(queue: &mut OutboundQueue) -> Vec<EnvelopeKind> {
        queue.drain().iter().map(|envelope| envelope.kind()).collect()
    }

    #[tokio::test]
    async fn self_whisper_is_delivered_once() {
        let mut fx = fixture();
        let alice = user();
        let (session, mut queue) = connect(alice, "alice", "ChatClient");
        let (other, mut other_queue) = connect(user(), "carol", "ChatClient");
        fx.hub.register(session).await;
        fx.hub.register(other).await;

        let message = PrivateChatMessage::new(alice, "alice", alice, "alice", "memo", fx.clock.now());
        fx.hub.dispatch(Envelope::private_chat(message)).await;

        assert_eq!(kinds(&mut queue), vec![EnvelopeKind::PrivateChatMessage]);
        assert!(other_queue.drain().is_empty());
    }

    #[tokio::test]
    async fn whisper_reaches_every_session_of_both_users() {
        let mut fx = fixture();
        let alice = user();
        let bob = user();
        let (alice_chat, mut alice_chat_q) = connect(alice, "alice", "ChatClient");
        let (alice_web, mut alice_web_q) = connect(alice, "alice", "WebClient");
        let (bob_chat, mut bob_q) = connect(bob, "bob", "ChatClient");
        let (carol, mut carol_q) = connect(user(), "carol", "ChatClient");
        for session in [alice_chat, alice_web, bob_chat, carol] {
            fx.hub.register(session).await;
        }

        let message = PrivateChatMessage::new(alice, "alice", bob, "bob", "hi", fx.clock.now());
        fx.hub.dispatch(Envelope::private_chat(message)).await;

        assert_eq!(alice_chat_q.drain().len(), 1);
        assert_eq!(alice_web_q.drain().len(), 1);
        let delivered = bob_q.drain();
        assert_eq!(delivered.len(), 1);
        match &delivered[0].payload {
            Payload::PrivateChatMessage(message) => {
                assert!(message.sequence_id.is_some());
                assert_eq!(message.recipient_name, "bob");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(carol_q.drain().is_empty());
    }

    #[tokio::test]
    async fn double_unregister_broadcasts_once() {
        let mut fx = fixture();
        let (leaving, _leaving_q) = connect(user(), "alice", "ChatClient");
        let (staying, mut staying_q) = connect(user(), "bob", "ChatClient");
        fx.hub.register(leaving.clone()).await;
        fx.hub.register(staying).await;

        fx.clock.advance(chrono::Duration::seconds(90));
        fx.hub.unregister(leaving.clone()).await;
        fx.hub.unregister(leaving.clone()).await;

        assert!(leaving.is_closed());
        assert_eq!(kinds(&mut staying_q), vec![EnvelopeKind::UserStatus]);
        let records = fx.storage.session_records();
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].ended_at - records[0].started_at).num_seconds(), 90);
        assert_eq!(fx.hub.session_count(), 1);
    }

    #[tokio::test]
    async fn session_record_failure_is_not_fatal() {
        let mut records = MockSessionRecordRepository::new();
        records
            .expect_insert_session_record()
            .times(1)
            .returning(|_| Err(RepositoryError::storage("database offline")));
        let mut fx = fixture_with(
            RateLimitConfig {
                limit: 100,
                window_seconds: 60,
            },
            Some(Arc::new(records)),
        );
        let (leaving, _q) = connect(user(), "alice", "ChatClient");
        let (staying, mut staying_q) = connect(user(), "bob", "ChatClient");
        fx.hub.register(leaving.clone()).await;
        fx.hub.register(staying).await;

        fx.hub.unregister(leaving.clone()).await;

        assert!(leaving.is_closed());
        assert_eq!(kinds(&mut staying_q), vec![EnvelopeKind::UserStatus]);
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_session() {
        let mut fx = fixture();
        let alice = user();
        let (old, _old_q) = connect(alice, "alice", "ChatClient");
        let (new, mut new_q) = connect(alice, "alice", "ChatClient");
        fx.hub.register(old.clone()).await;
        fx.hub.register(new.clone()).await;
        assert_eq!(fx.hub.session_count(), 1);

        fx.hub.unregister(old.clone()).await;

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(fx.hub.session_count(), 1);
        assert!(new_q.drain().is_empty());
        assert!(fx.storage.session_records().is_empty());
    }

    #[tokio::test]
    async fn replaced_session_is_closed_when_newer_one_registers() {
        let mut fx = fixture();
        let alice = user();
        let (old, mut old_q) = connect(alice, "alice", "ChatClient");
        let (new, _new_q) = connect(alice, "alice", "ChatClient");
        fx.hub.register(old.clone()).await;
        fx.hub.register(new.clone()).await;
        assert!(old.is_closed());

        // 新会话先离开，旧会话的注销落在键不存在的分支
        fx.hub.unregister(new.clone()).await;
        fx.hub.unregister(old.clone()).await;

        assert!(new.is_closed());
        assert!(old_q.recv().await.is_none());
        assert_eq!(fx.hub.session_count(), 0);
        assert_eq!(fx.storage.session_records().len(), 1);
    }

    #[tokio::test]
    async fn admit_never_waits_on_a_full_queue() {
        let mut fx = fixture();
        let alice = user();
        let bob = user();
        let now = fx.clock.now();
        fx.cache
            .enqueue_private(&PrivateChatMessage::new(alice, "alice", bob, "bob", "hi", now))
            .await
            .unwrap();
        let history = vec![ChatMessage::new(alice, "alice", "general", "earlier", now)];

        let (session, mut queue) = Session::new(
            SessionIdentity::new(bob, "bob", ApplicationId::parse("ChatClient").unwrap()),
            1,
        );
        fx.hub.admit(session.clone(), history).await;

        assert_eq!(fx.hub.session_count(), 1);
        assert_eq!(kinds(&mut queue), vec![EnvelopeKind::BulkPrivateMessages]);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn register_replays_cached_private_messages() {
        let mut fx = fixture();
        let alice = user();
        let bob = user();
        fx.cache
            .enqueue_private(&PrivateChatMessage::new(
                alice,
                "alice",
                bob,
                "bob",
                "while you were away",
                fx.clock.now(),
            ))
            .await
            .unwrap();

        let (session, mut queue) = connect(bob, "bob", "ChatClient");
        fx.hub.register(session.clone()).await;

        assert_eq!(session.connected_at(), Some(fx.clock.now()));
        let delivered = queue.drain();
        assert_eq!(delivered.len(), 1);
        match &delivered[0].payload {
            Payload::BulkPrivateMessages(bulk) => {
                assert_eq!(bulk.messages.len(), 1);
                assert_eq!(bulk.messages[0].sequence_id, Some(domain::SequenceId(1)));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_chat_is_not_broadcast() {
        let mut fx = fixture_with(
            RateLimitConfig {
                limit: 1,
                window_seconds: 60,
            },
            None,
        );
        let alice = user();
        let (session, mut queue) = connect(alice, "alice", "ChatClient");
        fx.hub.register(session).await;

        for text in ["first", "second"] {
            let message = ChatMessage::new(alice, "alice", "general", text, fx.clock.now());
            fx.hub.dispatch(Envelope::chat(message)).await;
        }

        let delivered = queue.drain();
        assert_eq!(delivered.len(), 1);
        match &delivered[0].payload {
            Payload::ChatMessage(message) => {
                assert_eq!(message.text, "first");
                assert_eq!(message.sequence_id, Some(domain::SequenceId(1)));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bulk_private_messages_are_not_broadcast() {
        let mut fx = fixture();
        let (session, mut queue) = connect(user(), "alice", "ChatClient");
        fx.hub.register(session).await;

        fx.hub.dispatch(Envelope::bulk_private(Vec::new())).await;
        fx.hub
            .dispatch(Envelope::user_status("bob", user(), true))
            .await;

        assert_eq!(kinds(&mut queue), vec![EnvelopeKind::UserStatus]);
    }

    #[tokio::test]
    async fn analytics_and_connected_users_are_forwarded_unchanged() {
        let mut fx = fixture();
        let (chat, mut chat_q) = connect(user(), "alice", "ChatClient");
        let (dashboard, mut dashboard_q) = connect(user(), "admin", "WebClient");
        fx.hub.register(chat).await;
        fx.hub.register(dashboard).await;

        let analytics = Envelope::analytics(AnalyticsSnapshot::MessageCountByChannel {
            counts: vec![ChannelMessageCount {
                channel: "general".to_string(),
                count: 42,
            }],
        });
        let snapshot = Envelope::connected_users(vec![UserStatus {
            username: "bob".to_string(),
            user_id: user(),
            is_connected: true,
        }]);
        fx.hub.dispatch(analytics.clone()).await;
        fx.hub.dispatch(snapshot.clone()).await;

        for queue in [&mut chat_q, &mut dashboard_q] {
            let delivered: Vec<Envelope> = queue
                .drain()
                .iter()
                .map(|envelope| envelope.as_ref().clone())
                .collect();
            assert_eq!(delivered, vec![analytics.clone(), snapshot.clone()]);
        }
    }

    #[tokio::test]
    async fn connected_users_exclude_observers() {
        let mut fx = fixture();
        let alice = user();
        let (chat, _q1) = connect(alice, "alice", "ChatClient");
        let (dashboard, _q2) = connect(user(), "admin", "WebClient");
        fx.hub.register(chat).await;
        fx.hub.register(dashboard).await;

        let users = fx.hub.connected_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, alice);
        assert!(users[0].is_connected);

        assert_eq!(fx.hub.reverse_lookup(alice), Some("alice".to_string()));
        assert_eq!(fx.hub.reverse_lookup(user()), None);
    }

    #[tokio::test]
    async fn handle_fails_after_loop_stops() {
        let fx = fixture();
        let (hub, handle) = Hub::new(
            HubDependencies {
                cache: fx.cache.clone(),
                session_records: fx.storage.clone(),
                clock: fx.clock.clone(),
                observer_applications: Vec::new(),
            },
            4,
        );
        let shutdown = CancellationToken::new();
        let task = hub.spawn(shutdown.clone());

        assert_eq!(handle.connected_users().await.unwrap(), Vec::new());
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(handle.find_username(user()).await, Err(HubError::Stopped));
    }
}
