//! 告警累计状态的持久化形式
//!
//! 内存中按规则 ID 与成员名称建立映射；落盘时转换为键值对数组，
//! 读回时再还原为映射，避免依赖 JSON 对象键的顺序与转义规则。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 一次被计入规则的登录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginEntry {
    /// 成员本次上线时间
    pub since: DateTime<Utc>,
    /// 计入规则的时间
    pub counted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedRule {
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logins: Vec<(String, LoginEntry)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedAlertState {
    #[serde(default)]
    pub rules: Vec<(String, PersistedRule)>,
}

/// 单条规则在内存中的累计状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleLogins {
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub logins: HashMap<String, LoginEntry>,
}

impl PersistedAlertState {
    pub fn from_map(map: &HashMap<String, RuleLogins>) -> Self {
        let mut rules: Vec<(String, PersistedRule)> = map
            .iter()
            .map(|(id, state)| {
                let mut logins: Vec<_> = state
                    .logins
                    .iter()
                    .map(|(name, entry)| (name.clone(), *entry))
                    .collect();
                logins.sort_by(|a, b| a.0.cmp(&b.0));
                (
                    id.clone(),
                    PersistedRule {
                        last_triggered_at: state.last_triggered_at,
                        logins,
                    },
                )
            })
            .collect();
        rules.sort_by(|a, b| a.0.cmp(&b.0));
        Self { rules }
    }

    /// 重复的键以后出现的为准
    pub fn into_map(self) -> HashMap<String, RuleLogins> {
        self.rules
            .into_iter()
            .map(|(id, rule)| {
                (
                    id,
                    RuleLogins {
                        last_triggered_at: rule.last_triggered_at,
                        logins: rule.logins.into_iter().collect(),
                    },
                )
            })
            .collect()
    }
}
