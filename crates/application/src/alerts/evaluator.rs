use chrono::{DateTime, Duration as TimeDelta, Utc};
use domain::{AlertRule, RosterMember};
use std::collections::HashMap;
use std::time::Duration;

use super::persisted::{LoginEntry, PersistedAlertState, RuleLogins};

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::days(365))
}

/// 评估器配置
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    /// 超过该时长的登录不再计入任何规则
    pub max_login_age: Duration,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(30_000),
            max_login_age: Duration::from_secs(180),
        }
    }
}

impl From<&config::AlertsConfig> for AlertSettings {
    fn from(config: &config::AlertsConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            max_login_age: config.max_login_age(),
        }
    }
}

/// 告警触发通知
#[derive(Debug, Clone, PartialEq)]
pub struct AlertFired {
    pub rule_id: String,
    pub sound_id: String,
    /// 触发时计入规则的成员，按名称排序
    pub members: Vec<String>,
    pub fired_at: DateTime<Utc>,
    /// 规则的第几次触发，用于匹配延迟清空
    pub sequence: u64,
    /// 多久后清空该规则的累计登录
    pub clear_after: Duration,
}

#[derive(Debug, Clone)]
struct RuleState {
    rule: AlertRule,
    logins: HashMap<String, LoginEntry>,
    sequence: u64,
}

impl RuleState {
    /// 该规则接受的最早上线时间跨度
    fn horizon(&self, max_login_age: TimeDelta) -> TimeDelta {
        self.rule.window().min(max_login_age)
    }
}

/// 滑动窗口告警评估器
///
/// 纯同步逻辑，由调用方提供当前时间；定时清空与声音输出由运行器负责。
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    cooldown: TimeDelta,
    max_login_age: TimeDelta,
    rules: Vec<RuleState>,
    dirty: bool,
}

impl AlertEvaluator {
    pub fn new(settings: &AlertSettings, rules: Vec<AlertRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| match rule.validate() {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(rule_id = %rule.id, error = %err, "ignoring invalid alert rule");
                    false
                }
            })
            .map(|rule| RuleState {
                rule,
                logins: HashMap::new(),
                sequence: 0,
            })
            .collect();
        Self {
            cooldown: to_delta(settings.cooldown),
            max_login_age: to_delta(settings.max_login_age),
            rules,
            dirty: false,
        }
    }

    /// 用当前在线成员重新评估所有启用的规则，返回本次触发的告警
    ///
    /// 上线时间为估计值的成员不计入登录。
    pub fn evaluate<'a, I>(&mut self, members: I, now: DateTime<Utc>) -> Vec<AlertFired>
    where
        I: IntoIterator<Item = &'a RosterMember>,
    {
        let logins: Vec<(&str, DateTime<Utc>)> = members
            .into_iter()
            .filter(|member| member.online_status && !member.since_estimated)
            .filter_map(|member| member.online_since.map(|since| (member.name.as_str(), since)))
            .collect();

        let mut fired = Vec::new();
        for state in self.rules.iter_mut() {
            if !state.rule.enabled {
                continue;
            }
            let horizon = state.horizon(self.max_login_age);

            let before = state.logins.len();
            state
                .logins
                .retain(|_, entry| now - entry.since <= horizon);
            let mut changed = state.logins.len() != before;

            for &(name, since) in &logins {
                let age = now - since;
                if age < TimeDelta::zero() || age > horizon {
                    continue;
                }
                match state.logins.get_mut(name) {
                    Some(entry) if entry.since == since => {}
                    Some(entry) => {
                        if now - entry.counted_at >= self.cooldown {
                            *entry = LoginEntry {
                                since,
                                counted_at: now,
                            };
                            changed = true;
                        }
                    }
                    None => {
                        state.logins.insert(
                            name.to_string(),
                            LoginEntry {
                                since,
                                counted_at: now,
                            },
                        );
                        changed = true;
                    }
                }
            }

            let count = state.logins.len();
            let cooled_down = state
                .rule
                .last_triggered_at
                .map_or(true, |last| now - last >= self.cooldown);
            if count >= state.rule.threshold as usize && cooled_down {
                state.rule.last_triggered_at = Some(now);
                state.sequence += 1;
                changed = true;
                let mut members: Vec<String> = state.logins.keys().cloned().collect();
                members.sort();
                tracing::info!(
                    rule_id = %state.rule.id,
                    count,
                    threshold = state.rule.threshold,
                    "alert rule fired"
                );
                fired.push(AlertFired {
                    rule_id: state.rule.id.clone(),
                    sound_id: state.rule.sound_id.clone(),
                    members,
                    fired_at: now,
                    sequence: state.sequence,
                    clear_after: state.rule.window().to_std().unwrap_or_default(),
                });
            }
            self.dirty |= changed;
        }
        fired
    }

    /// 清空规则的累计登录；规则在此期间再次触发时忽略本次清空
    pub fn clear_rule(&mut self, rule_id: &str, sequence: u64) -> bool {
        let Some(state) = self.rules.iter_mut().find(|state| state.rule.id == rule_id) else {
            return false;
        };
        if state.sequence != sequence {
            return false;
        }
        tracing::debug!(rule_id = %rule_id, cleared = state.logins.len(), "alert rule window cleared");
        state.logins.clear();
        self.dirty = true;
        true
    }

    pub fn eligible_count(&self, rule_id: &str) -> Option<usize> {
        self.rule(rule_id).map(|state| state.logins.len())
    }

    pub fn last_triggered_at(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        self.rule(rule_id)
            .and_then(|state| state.rule.last_triggered_at)
    }

    fn rule(&self, rule_id: &str) -> Option<&RuleState> {
        self.rules.iter().find(|state| state.rule.id == rule_id)
    }

    /// 上次取走后状态是否有变化
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn export(&self) -> PersistedAlertState {
        let map: HashMap<String, RuleLogins> = self
            .rules
            .iter()
            .map(|state| {
                (
                    state.rule.id.clone(),
                    RuleLogins {
                        last_triggered_at: state.rule.last_triggered_at,
                        logins: state.logins.clone(),
                    },
                )
            })
            .collect();
        PersistedAlertState::from_map(&map)
    }

    /// 恢复持久化的状态，未知规则的条目被忽略
    pub fn restore(&mut self, persisted: PersistedAlertState) {
        let mut map = persisted.into_map();
        for state in self.rules.iter_mut() {
            if let Some(saved) = map.remove(&state.rule.id) {
                state.logins = saved.logins;
                if saved.last_triggered_at > state.rule.last_triggered_at {
                    state.rule.last_triggered_at = saved.last_triggered_at;
                }
            }
        }
        if !map.is_empty() {
            tracing::debug!(unknown = map.len(), "discarding state for unknown alert rules");
        }
    }
}
