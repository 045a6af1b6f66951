//! 聊天核心领域模型
//!
//! 包含标识值对象、聊天消息、推送信封，以及核心依赖的持久化接口。

pub mod envelope;
pub mod errors;
pub mod message;
pub mod moderation;
pub mod repository;
pub mod value_objects;

// 重新导出常用类型
pub use envelope::*;
pub use errors::*;
pub use message::*;
pub use moderation::*;
pub use repository::*;
pub use value_objects::*;
