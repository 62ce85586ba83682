//! 统一错误类型模块
//!
//! 这里只定义基础设施层面的错误（存储不可达、配置无效、调用被取消等）。
//! OAuth 协议错误（`invalid_grant` 等）是普通的返回值，定义在
//! [`crate::protocol`] 中；基础设施错误在协议边界被映射为 `server_error`。

use thiserror::Error;

/// grantrs 库的统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// grantrs 库的错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// 存储错误
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// 配置错误
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// 加密 / 随机数错误
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 调用方取消了请求
    #[error("operation cancelled by caller")]
    Cancelled,

    /// 超过调用方给定的截止时间
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// 外部协作者（profile 服务、扩展授权验证器等）失败
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 创建一个内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// 创建一个配置值无效错误
    pub fn invalid_config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        })
    }

    /// 调用是否因取消或超时而中止
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// 存储相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// 连接失败 / 存储不可达
    #[error("storage connection failed: {0}")]
    ConnectionFailed(String),
    /// 记录已存在
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// 操作失败
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

/// 配置相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 缺少必需的配置
    #[error("missing required configuration: {0}")]
    MissingRequired(String),
    /// 无效的配置值
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
    /// 请求的资源之间没有共同的签名算法
    #[error("no signing algorithm is shared by the requested resources: {0}")]
    NoMatchingSigningAlgorithm(String),
}

/// 加密相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 随机数生成失败
    #[error("random number generation failed: {0}")]
    RngFailed(String),
    /// 密钥无效
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
