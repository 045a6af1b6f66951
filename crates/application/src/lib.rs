//! 应用层实现。
//!
//! 这里是聊天核心：会话注册表与路由事件循环（Hub）、带原子序列号的消息缓存与刷盘桥、
//! 每用户限流器，以及它们依赖的存储抽象和单进程内存实现。

pub mod cache;
pub mod clock;
pub mod gate;
pub mod hub;
pub mod memory;
pub mod rate_limiter;
pub mod session;
pub mod store;

pub use cache::{CacheError, CacheSettings, FlushReport, MessageCache, PurgeReport, PurgeTarget};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::{AdmissionError, ConnectionGate};
pub use hub::{Hub, HubCommand, HubDependencies, HubError, HubHandle};
pub use memory::{MemoryCacheStore, MemoryRateCounter, MemoryStorage};
pub use rate_limiter::{RateLimitError, RateLimiter};
pub use session::{OutboundQueue, Session, SessionError, SessionIdentity, SessionKey};
pub use store::{CacheStore, EnqueueKeys, EnqueueOutcome, RateCounterStore, StoreError};
