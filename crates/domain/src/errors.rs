//! 领域模型错误定义
//!
//! 定义了推送协议解析、凭据校验、成员合并时可能出现的错误类型。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 消息不是合法的 JSON 或结构不符合预期
    #[error("消息格式错误: {message}")]
    MalformedMessage { message: String },

    /// 消息结构合法但无法识别其类型
    #[error("无法识别的消息: {message}")]
    UnrecognizedMessage { message: String },

    /// 凭据缺失或无法解析
    #[error("凭据无效: {message}")]
    InvalidCredential { message: String },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },
}

impl DomainError {
    /// 创建消息格式错误
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// 创建无法识别的消息错误
    pub fn unrecognized(message: impl Into<String>) -> Self {
        Self::UnrecognizedMessage {
            message: message.into(),
        }
    }

    /// 创建凭据错误
    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::InvalidCredential {
            message: message.into(),
        }
    }

    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
