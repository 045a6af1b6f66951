//! 推送给客户端的消息信封
//!
//! 负载是封闭的和类型，按变体穷举匹配，不在运行时检查字符串标签。

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, PrivateChatMessage};
use crate::value_objects::UserId;

/// 服务端生成的信封使用的发送者名称
pub const SERVER_SENDER: &str = "Server";

/// 用户在线状态变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub username: String,
    #[serde(rename = "id")]
    pub user_id: UserId,
    #[serde(rename = "status")]
    pub is_connected: bool,
}

/// 当前在线用户快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedUsers {
    pub users: Vec<UserStatus>,
}

/// 批量历史消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkMessages<T> {
    pub messages: Vec<T>,
}

/// 频道消息计数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessageCount {
    pub channel: String,
    pub count: i64,
}

/// 每日会话活跃度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionActivity {
    pub session_date: String,
    pub session_count: i64,
    pub total_duration: String,
}

/// 仪表盘类连接使用的统计快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalyticsSnapshot {
    MessageCountByChannel { counts: Vec<ChannelMessageCount> },
    SessionActivity { activity: Vec<SessionActivity> },
}

/// 信封负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    ChatMessage(ChatMessage),
    PrivateChatMessage(PrivateChatMessage),
    UserStatus(UserStatus),
    ConnectedUsers(ConnectedUsers),
    BulkChatMessages(BulkMessages<ChatMessage>),
    BulkPrivateMessages(BulkMessages<PrivateChatMessage>),
    Analytics(AnalyticsSnapshot),
}

/// 负载类型标签，用于日志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    ChatMessage,
    PrivateChatMessage,
    UserStatus,
    ConnectedUsers,
    BulkChatMessages,
    BulkPrivateMessages,
    Analytics,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::ChatMessage => "chat_message",
            EnvelopeKind::PrivateChatMessage => "private_chat_message",
            EnvelopeKind::UserStatus => "user_status",
            EnvelopeKind::ConnectedUsers => "connected_users",
            EnvelopeKind::BulkChatMessages => "bulk_chat_messages",
            EnvelopeKind::BulkPrivateMessages => "bulk_private_messages",
            EnvelopeKind::Analytics => "analytics",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息信封：`{type, sender, payload}`
///
/// 构造后不可变，唯一的例外是缓存分配序列号后写回聊天负载。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender: sender.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match &self.payload {
            Payload::ChatMessage(_) => EnvelopeKind::ChatMessage,
            Payload::PrivateChatMessage(_) => EnvelopeKind::PrivateChatMessage,
            Payload::UserStatus(_) => EnvelopeKind::UserStatus,
            Payload::ConnectedUsers(_) => EnvelopeKind::ConnectedUsers,
            Payload::BulkChatMessages(_) => EnvelopeKind::BulkChatMessages,
            Payload::BulkPrivateMessages(_) => EnvelopeKind::BulkPrivateMessages,
            Payload::Analytics(_) => EnvelopeKind::Analytics,
        }
    }

    pub fn chat(message: ChatMessage) -> Self {
        Self::new(message.username.clone(), Payload::ChatMessage(message))
    }

    pub fn private_chat(message: PrivateChatMessage) -> Self {
        Self::new(message.username.clone(), Payload::PrivateChatMessage(message))
    }

    pub fn user_status(username: impl Into<String>, user_id: UserId, is_connected: bool) -> Self {
        Self::new(
            SERVER_SENDER,
            Payload::UserStatus(UserStatus {
                username: username.into(),
                user_id,
                is_connected,
            }),
        )
    }

    pub fn connected_users(users: Vec<UserStatus>) -> Self {
        Self::new(SERVER_SENDER, Payload::ConnectedUsers(ConnectedUsers { users }))
    }

    pub fn bulk_chat(messages: Vec<ChatMessage>) -> Self {
        Self::new(SERVER_SENDER, Payload::BulkChatMessages(BulkMessages { messages }))
    }

    pub fn bulk_private(messages: Vec<PrivateChatMessage>) -> Self {
        Self::new(SERVER_SENDER, Payload::BulkPrivateMessages(BulkMessages { messages }))
    }

    pub fn analytics(snapshot: AnalyticsSnapshot) -> Self {
        Self::new(SERVER_SENDER, Payload::Analytics(snapshot))
    }
}
