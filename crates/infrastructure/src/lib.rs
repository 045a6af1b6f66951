//! 基础设施层实现。
//!
//! 提供 Redis 缓存存储、Postgres 持久化等适配器，实现应用/领域层定义的接口。

pub mod builder;
pub mod db;
pub mod redis;

pub use builder::{Infrastructure, InfrastructureError};
pub use db::{Db, DbPool, PgStorage};
pub use crate::redis::{RedisCacheStore, RedisRateCounter};
