//! 领域模型错误定义
//!
//! 领域层只区分两类错误：值对象校验失败，以及持久化协作方返回的存储错误。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 参数校验错误
    #[error("参数无效: {field}: {message}")]
    InvalidArgument { field: String, message: String },
}

impl DomainError {
    /// 创建参数校验错误
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 持久化存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    /// 底层存储不可用或执行失败
    #[error("storage error: {message}")]
    Storage { message: String },

    /// 记录不存在
    #[error("record not found: {resource}")]
    NotFound { resource: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }
}
