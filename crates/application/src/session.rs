//! 会话句柄
//!
//! 每个连接对应一个 `Session`，由 Hub 的注册表独占持有；出站队列由 Hub 写入、传输层消费，
//! 关闭只会发生一次。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use domain::{ApplicationId, Envelope, Timestamp, UserId};
use tokio::sync::mpsc;
use uuid::Uuid;

/// 认证层提供的会话身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub application_id: ApplicationId,
}

impl SessionIdentity {
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        application_id: ApplicationId,
    ) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            application_id,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            user_id: self.user_id,
            application_id: self.application_id.clone(),
        }
    }
}

/// 注册表键：同一用户在每个应用下最多一个会话
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: UserId,
    pub application_id: ApplicationId,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.application_id)
    }
}

/// 会话错误类型
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session outbound queue already closed")]
    Closed,

    #[error("session consumer disconnected")]
    Disconnected,

    #[error("session outbound queue is full")]
    Full,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 单个连接
#[derive(Debug)]
pub struct Session {
    connection_id: Uuid,
    identity: SessionIdentity,
    connected_at: Mutex<Option<Timestamp>>,
    outbound: Mutex<Option<mpsc::Sender<Arc<Envelope>>>>,
    closed: AtomicBool,
}

impl Session {
    /// 创建会话和它的出站队列，队列由传输层的写循环消费
    pub fn new(identity: SessionIdentity, outbound_capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(outbound_capacity.max(1));
        let session = Arc::new(Self {
            connection_id: Uuid::new_v4(),
            identity,
            connected_at: Mutex::new(None),
            outbound: Mutex::new(Some(sender)),
            closed: AtomicBool::new(false),
        });
        (session, OutboundQueue { receiver })
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.identity.display_name
    }

    pub fn application_id(&self) -> &ApplicationId {
        &self.identity.application_id
    }

    pub fn key(&self) -> SessionKey {
        self.identity.key()
    }

    /// 注册成功时记录连接开始时间
    pub fn start_connection_timer(&self, now: Timestamp) {
        *lock(&self.connected_at) = Some(now);
    }

    pub fn connected_at(&self) -> Option<Timestamp> {
        *lock(&self.connected_at)
    }

    /// 推送到出站队列；队列已满时等待消费者
    pub async fn deliver(&self, envelope: Arc<Envelope>) -> Result<(), SessionError> {
        let sender = lock(&self.outbound).clone().ok_or(SessionError::Closed)?;
        sender
            .send(envelope)
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    /// 不等待地推送；队列已满时返回 `Full`，用于还没有消费者的握手阶段
    pub fn try_deliver(&self, envelope: Arc<Envelope>) -> Result<(), SessionError> {
        let guard = lock(&self.outbound);
        let sender = guard.as_ref().ok_or(SessionError::Closed)?;
        sender.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SessionError::Full,
            mpsc::error::TrySendError::Closed(_) => SessionError::Disconnected,
        })
    }

    /// 关闭出站队列；只有第一次调用返回 true
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        lock(&self.outbound).take();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 会话出站队列的消费端
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<Arc<Envelope>>,
}

impl OutboundQueue {
    /// 按 FIFO 顺序取下一条；会话关闭且队列取空后返回 None
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.recv().await
    }

    /// 非阻塞地取下一条
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.try_recv().ok()
    }

    /// 取出当前已排队的全部信封
    pub fn drain(&mut self) -> Vec<Arc<Envelope>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
