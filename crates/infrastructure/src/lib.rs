//! 基础设施层实现。
//!
//! 提供 WebSocket 推送传输、凭据续期与名单修改的 HTTP 客户端、告警状态文件存储等适配器，
//! 实现应用层定义的接口。

pub mod alert_store;
pub mod authorized;
pub mod builder;
pub mod renewal;
pub mod roster_gateway;
pub mod ws_transport;

pub use alert_store::JsonFileAlertStore;
pub use authorized::{AuthorizedHttpClient, AuthorizedRequestError};
pub use builder::{Infrastructure, InfrastructureError};
pub use renewal::HttpRenewalClient;
pub use roster_gateway::HttpRosterGateway;
pub use ws_transport::WebSocketTransport;
