use thiserror::Error;

/// 推送传输层错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// 握手被服务端以 401/403 拒绝，通常意味着访问令牌已失效
    #[error("stream handshake rejected with status {status}")]
    Unauthorized { status: u16 },
    #[error("stream connect failed: {0}")]
    Connect(String),
    #[error("stream closed by server: {code} {reason}")]
    Closed { code: u16, reason: String },
    #[error("stream io error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn connect(message: impl Into<String>) -> Self {
        TransportError::Connect(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        TransportError::Io(message.into())
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized { .. })
    }
}

/// 推送客户端错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    /// 驱动任务已退出
    #[error("stream client is shut down")]
    ShutDown,
}

/// 单次续期请求的错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenewalError {
    /// 刷新令牌本身无效（401/403）
    #[error("refresh token rejected with status {status}")]
    Rejected { status: u16 },
    #[error("renewal endpoint returned status {status}")]
    Status { status: u16 },
    #[error("renewal request failed: {0}")]
    Network(String),
    #[error("renewal response malformed: {0}")]
    Malformed(String),
}

impl RenewalError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, RenewalError::Rejected { .. })
    }
}

/// 凭据续期最终失败的原因，所有并发调用方收到同一个值
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshError {
    #[error("refresh token for user {user_id} was rejected")]
    Rejected { user_id: String },
    #[error("renewal for user {user_id} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        user_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("no refresh token available for user {user_id}")]
    MissingRefreshToken { user_id: String },
    #[error("renewal for user {user_id} was cancelled")]
    Cancelled { user_id: String },
}

/// 名单修改错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MutationError {
    #[error("unknown roster member: {0}")]
    UnknownMember(String),
    #[error("no outbound request layer configured")]
    NoGateway,
    #[error("roster update request failed: {0}")]
    Request(String),
}

/// 告警状态持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("alert state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("alert state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
