//! 告警规则实体
//!
//! 规则由用户配置产生，评估器只读使用。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};

fn default_enabled() -> bool {
    true
}

/// 告警规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    /// 触发时播放的声音
    pub sound_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 窗口内需要达到的上线人数
    pub threshold: u32,
    /// 统计窗口（分钟）
    pub time_range_minutes: u32,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        sound_id: impl Into<String>,
        threshold: u32,
        time_range_minutes: u32,
    ) -> Self {
        Self {
            id: id.into(),
            sound_id: sound_id.into(),
            enabled: true,
            threshold,
            time_range_minutes,
            last_triggered_at: None,
        }
    }

    /// 规则的统计窗口
    pub fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.time_range_minutes))
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.id.trim().is_empty() {
            return Err(DomainError::validation_error("id", "规则 ID 不能为空"));
        }
        if self.threshold == 0 {
            return Err(DomainError::validation_error("threshold", "阈值必须大于 0"));
        }
        if self.time_range_minutes == 0 {
            return Err(DomainError::validation_error(
                "time_range_minutes",
                "统计窗口必须大于 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_defaults_to_enabled() {
        let rule: AlertRule = serde_json::from_str(
            r#"{"id":"r1","sound_id":"horn","threshold":2,"time_range_minutes":5}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.window(), Duration::minutes(5));
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rule_validation() {
        assert!(AlertRule::new("r1", "horn", 0, 5).validate().is_err());
        assert!(AlertRule::new("r1", "horn", 1, 0).validate().is_err());
        assert!(AlertRule::new(" ", "horn", 1, 1).validate().is_err());
    }
}
