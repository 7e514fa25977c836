//! 公会监控实时同步核心领域模型
//!
//! 包含名单成员、访问凭据、告警规则、推送消息等核心实体，
//! 以及推送协议的解析规则。

pub mod entities;
pub mod errors;
pub mod feed;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use feed::*;
