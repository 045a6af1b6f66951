use serde::{Deserialize, Serialize};

use crate::value_objects::{SequenceId, Timestamp, UserId};

/// 消息类别，每个类别拥有独立的序列号计数器和缓存列表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    /// 频道内公开消息
    Public,
    /// 两个用户之间的私聊消息
    Private,
}

impl MessageClass {
    pub const ALL: [MessageClass; 2] = [MessageClass::Public, MessageClass::Private];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageClass::Public => "public",
            MessageClass::Private => "private",
        }
    }
}

impl std::fmt::Display for MessageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 频道聊天消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// 入缓存前为空，由缓存原子分配
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<SequenceId>,
    pub owner_id: UserId,
    pub username: String,
    pub channel: String,
    #[serde(rename = "message")]
    pub text: String,
    #[serde(rename = "sent")]
    pub sent_at: Timestamp,
}

impl ChatMessage {
    pub fn new(
        owner_id: UserId,
        username: impl Into<String>,
        channel: impl Into<String>,
        text: impl Into<String>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            sequence_id: None,
            owner_id,
            username: username.into(),
            channel: channel.into(),
            text: text.into(),
            sent_at,
        }
    }

    pub fn with_sequence(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }
}

/// 私聊消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<SequenceId>,
    pub owner_id: UserId,
    pub username: String,
    pub recipient_id: UserId,
    #[serde(rename = "recipient")]
    pub recipient_name: String,
    #[serde(rename = "message")]
    pub text: String,
    #[serde(rename = "sent")]
    pub sent_at: Timestamp,
}

impl PrivateChatMessage {
    pub fn new(
        owner_id: UserId,
        username: impl Into<String>,
        recipient_id: UserId,
        recipient_name: impl Into<String>,
        text: impl Into<String>,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            sequence_id: None,
            owner_id,
            username: username.into(),
            recipient_id,
            recipient_name: recipient_name.into(),
            text: text.into(),
            sent_at,
        }
    }

    /// 发送给自己的私聊不会重复写入接收方列表
    pub fn is_self_message(&self) -> bool {
        self.owner_id == self.recipient_id
    }

    pub fn with_sequence(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }
}

/// 缓存条目：序列号与原始消息的包装。
///
/// 最近列表与待刷新列表中存放的是同一份包装数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    pub sequence_id: SequenceId,
    pub data: T,
}

impl CachedEntry<ChatMessage> {
    /// 拆包并把序列号写回消息体
    pub fn into_message(self) -> ChatMessage {
        self.data.with_sequence(self.sequence_id)
    }
}

impl CachedEntry<PrivateChatMessage> {
    pub fn into_message(self) -> PrivateChatMessage {
        self.data.with_sequence(self.sequence_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn unsequenced_message_omits_sequence_field() {
        let msg = ChatMessage::new(UserId::from(Uuid::new_v4()), "alice", "general", "hi", Utc::now());
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("sequence_id").is_none());
        assert_eq!(value["message"], "hi");
    }

    #[test]
    fn cached_entry_unwraps_sequence() {
        let user = UserId::from(Uuid::new_v4());
        let entry = CachedEntry {
            sequence_id: SequenceId(7),
            data: PrivateChatMessage::new(user, "bob", user, "bob", "note to self", Utc::now()),
        };
        assert!(entry.data.is_self_message());
        assert_eq!(entry.into_message().sequence_id, Some(SequenceId(7)));
    }
}
