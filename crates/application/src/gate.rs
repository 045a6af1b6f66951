//! 连接准入
//!
//! 认证完成后、传输层启动读写循环前调用：检查封禁、创建会话、通知上线，
//! 然后把注册和握手推送（频道历史、在线用户列表）一起交给 Hub。
//! `open` 不等待 Hub 处理注册，出站队列总是立即交还给传输层。

use std::collections::HashSet;
use std::sync::Arc;

use domain::{BanRepository, Envelope, RepositoryError};
use tracing::{info, warn};

use crate::cache::MessageCache;
use crate::hub::{HubError, HubHandle};
use crate::session::{OutboundQueue, Session, SessionIdentity};

/// 准入错误类型
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("user {user_id} is banned")]
    Banned { user_id: domain::UserId },

    #[error("could not determine ban status: {0}")]
    BanLookup(#[from] RepositoryError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

pub struct ConnectionGate {
    bans: Arc<dyn BanRepository>,
    cache: Arc<MessageCache>,
    hub: HubHandle,
    outbound_capacity: usize,
    observers: HashSet<String>,
}

impl ConnectionGate {
    pub fn new(
        bans: Arc<dyn BanRepository>,
        cache: Arc<MessageCache>,
        hub: HubHandle,
        outbound_capacity: usize,
        observer_applications: Vec<String>,
    ) -> Self {
        Self {
            bans,
            cache,
            hub,
            outbound_capacity,
            observers: observer_applications.into_iter().collect(),
        }
    }

    /// 为已认证的身份打开会话，返回会话及其出站队列
    pub async fn open(
        &self,
        identity: SessionIdentity,
    ) -> Result<(Arc<Session>, OutboundQueue), AdmissionError> {
        let user_id = identity.user_id;
        if self.bans.is_banned(user_id).await? {
            info!(user_id = %user_id, "banned user rejected");
            return Err(AdmissionError::Banned { user_id });
        }

        let (session, queue) = Session::new(identity, self.outbound_capacity);
        let key = session.key();

        if !self.observers.contains(session.application_id().as_str()) {
            self.hub
                .dispatch(Envelope::user_status(
                    session.display_name(),
                    user_id,
                    true,
                ))
                .await?;
        }

        let history = self.cache.recent_chat_messages().await.unwrap_or_else(|err| {
            warn!(key = %key, error = %err, "failed to load chat history");
            Vec::new()
        });
        self.hub.admit(Arc::clone(&session), history).await?;

        info!(key = %key, connection_id = %session.connection_id(), "connection admitted");
        Ok((session, queue))
    }
}
