//! 领域实体定义
//!
//! 包含系统的核心实体：名单成员、凭据、告警规则、连接状态。

pub mod alert_rule;
pub mod connection;
pub mod credential;
pub mod roster;

// 重新导出核心实体
pub use alert_rule::AlertRule;
pub use connection::ConnectionStatus;
pub use credential::{extract_user_id, Credential, TokenClaims, TokenPair};
pub use roster::{format_time_online, RosterMember, ONLINE_STATE_FIELDS};
