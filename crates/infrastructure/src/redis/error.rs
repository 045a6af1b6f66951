//! Redis 错误映射

use application::StoreError;

/// 把 Redis 客户端错误映射为缓存存储错误
pub(crate) fn store_error(err: redis::RedisError) -> StoreError {
    match err.kind() {
        redis::ErrorKind::IoError => StoreError::backend(format!("Redis 连接错误: {err}")),
        redis::ErrorKind::InvalidClientConfig => {
            StoreError::backend(format!("Redis 配置错误: {err}"))
        }
        redis::ErrorKind::TypeError => StoreError::unexpected_reply(err.to_string()),
        _ if err.is_timeout() => StoreError::backend(format!("Redis 操作超时: {err}")),
        _ => StoreError::backend(err.to_string()),
    }
}
