//! 外部协作方抽象
//!
//! 具体实现位于 infrastructure crate，测试中使用手写替身。

use async_trait::async_trait;
use domain::TokenPair;
use futures_util::stream::BoxStream;

use crate::alerts::PersistedAlertState;
use crate::error::{MutationError, RenewalError, StoreError, TransportError};

/// 推送连接参数
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub url: String,
    pub access_token: String,
    pub world: String,
}

/// 服务端推送的文本帧流；流结束或出现错误即视为连接关闭，丢弃即关闭连接
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// 推送传输层
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: ConnectRequest) -> Result<FrameStream, TransportError>;
}

/// 续期请求携带刷新令牌的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalScheme {
    /// `Authorization: Bearer <refresh>`
    Bearer,
    /// 自定义请求头
    CustomHeader,
}

/// 凭据续期接口
#[async_trait]
pub trait RenewalTransport: Send + Sync {
    async fn renew(
        &self,
        refresh_token: &str,
        scheme: RenewalScheme,
    ) -> Result<TokenPair, RenewalError>;
}

/// 全局登出
pub trait SessionTerminator: Send + Sync {
    fn terminate(&self, user_id: &str, reason: &str);
}

/// 提示音输出
pub trait SoundPlayer: Send + Sync {
    fn play(&self, sound_id: &str);
}

/// 名单修改的出站请求层
#[async_trait]
pub trait RosterMutationGateway: Send + Sync {
    async fn update_local(&self, name: &str, local: &str) -> Result<(), MutationError>;

    async fn update_classification(&self, name: &str, kind: &str) -> Result<(), MutationError>;
}

/// 告警规则累计状态的存储
#[async_trait]
pub trait AlertStateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedAlertState>, StoreError>;

    async fn save(&self, state: &PersistedAlertState) -> Result<(), StoreError>;
}
