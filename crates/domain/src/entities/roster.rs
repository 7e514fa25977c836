//! 名单成员实体
//!
//! 名单以成员名称为唯一键。在线状态相关字段必须保持一致：
//! `OnlineSince` 与 `TimeOnline` 当且仅当 `OnlineStatus` 为 true 时非空。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DomainError, DomainResult};

/// 在线状态相关的字段名（推送协议中的原始名称）
pub const ONLINE_STATE_FIELDS: [&str; 3] = ["OnlineStatus", "OnlineSince", "TimeOnline"];

/// `null` 按字段默认值处理
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 名单成员
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RosterMember {
    /// 角色名称（唯一键）
    pub name: String,
    /// 职业
    #[serde(default, deserialize_with = "null_as_default")]
    pub vocation: String,
    /// 等级
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: u32,
    /// 是否在线
    #[serde(default, deserialize_with = "null_as_default")]
    pub online_status: bool,
    /// 本次上线时间
    #[serde(default)]
    pub online_since: Option<DateTime<Utc>>,
    /// 在线时长，格式 `HH:MM:SS`
    #[serde(default)]
    pub time_online: Option<String>,
    /// 分类标签
    #[serde(default, deserialize_with = "null_as_default")]
    pub kind: String,
    /// 位置备注
    #[serde(default, deserialize_with = "null_as_default")]
    pub local: String,
    /// 最后登录时间（服务端原样透传）
    #[serde(default)]
    pub last_login: Option<String>,
    /// 上线时间由本地补齐（快照未提供），不代表真实的登录时刻
    #[serde(skip)]
    pub since_estimated: bool,
}

impl RosterMember {
    /// 创建一个只有名称的离线成员
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vocation: String::new(),
            level: 0,
            online_status: false,
            online_since: None,
            time_online: None,
            kind: String::new(),
            local: String::new(),
            last_login: None,
            since_estimated: false,
        }
    }

    /// 标记为刚刚上线
    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        self.online_status = true;
        self.online_since = Some(now);
        self.since_estimated = false;
        self.time_online = Some(format_time_online(Duration::zero()));
    }

    /// 标记为离线，清空在线相关字段
    pub fn mark_offline(&mut self) {
        self.online_status = false;
        self.online_since = None;
        self.time_online = None;
        self.since_estimated = false;
    }

    /// 修正在线状态字段，使其满足不变量
    ///
    /// 在线但缺少上线时间的记录以 `now` 作为上线时间，并标记为估计值。
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        if self.online_status {
            if self.online_since.is_none() {
                self.since_estimated = true;
            }
            let since = *self.online_since.get_or_insert(now);
            self.time_online = Some(format_time_online(now - since));
        } else {
            self.online_since = None;
            self.time_online = None;
            self.since_estimated = false;
        }
    }

    /// 根据上线时间重新计算在线时长，返回值是否发生变化
    pub fn refresh_time_online(&mut self, now: DateTime<Utc>) -> bool {
        let next = match (self.online_status, self.online_since) {
            (true, Some(since)) => Some(format_time_online(now - since)),
            (true, None) => return false,
            (false, _) => None,
        };
        if self.time_online == next {
            return false;
        }
        self.time_online = next;
        true
    }

    /// 将增量字段浅合并到当前记录，返回记录是否发生变化
    ///
    /// `Name` 字段始终以名单键为准，不会被覆盖。合并结果无法还原为
    /// 合法成员时返回错误且不修改当前记录。
    pub fn merge_fields(&mut self, fields: &Map<String, Value>) -> DomainResult<bool> {
        if fields.is_empty() {
            return Ok(false);
        }

        let mut current = serde_json::to_value(&*self)
            .map_err(|err| DomainError::malformed(format!("成员序列化失败: {err}")))?;
        let object = current
            .as_object_mut()
            .ok_or_else(|| DomainError::malformed("成员记录不是对象"))?;
        for (key, value) in fields {
            if key == "Name" {
                continue;
            }
            object.insert(key.clone(), value.clone());
        }

        let mut merged: RosterMember = serde_json::from_value(current).map_err(|err| {
            DomainError::malformed(format!("成员 {} 的字段无法合并: {err}", self.name))
        })?;
        merged.since_estimated = self.since_estimated;
        let changed = merged != *self;
        *self = merged;
        Ok(changed)
    }
}

/// 将在线时长格式化为 `HH:MM:SS`，小时数不设上限，负值按 0 处理
pub fn format_time_online(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_format_time_online() {
        assert_eq!(format_time_online(Duration::zero()), "00:00:00");
        assert_eq!(format_time_online(Duration::seconds(3725)), "01:02:05");
        assert_eq!(format_time_online(Duration::hours(30)), "30:00:00");
        assert_eq!(format_time_online(Duration::seconds(-5)), "00:00:00");
    }

    #[test]
    fn test_deserialize_wire_record() {
        let member: RosterMember = serde_json::from_value(json!({
            "Name": "Alice",
            "Vocation": "Knight",
            "Level": 312,
            "OnlineStatus": false,
            "Kind": "main",
            "Local": "Thais",
            "LastLogin": "2024-01-01 10:00:00"
        }))
        .unwrap();

        assert_eq!(member.name, "Alice");
        assert_eq!(member.level, 312);
        assert!(member.online_since.is_none());
        assert_eq!(member.last_login.as_deref(), Some("2024-01-01 10:00:00"));
    }

    #[test]
    fn test_normalize_enforces_online_invariant() {
        let mut online = RosterMember::new("Alice");
        online.online_status = true;
        online.normalize(at(0));
        assert_eq!(online.online_since, Some(at(0)));
        assert_eq!(online.time_online.as_deref(), Some("00:00:00"));
        assert!(online.since_estimated);

        let mut reported = RosterMember::new("Carol");
        reported.online_status = true;
        reported.online_since = Some(at(-30));
        reported.normalize(at(0));
        assert!(!reported.since_estimated);

        let mut offline = RosterMember::new("Bob");
        offline.online_since = Some(at(0));
        offline.time_online = Some("00:10:00".into());
        offline.normalize(at(60));
        assert!(offline.online_since.is_none());
        assert!(offline.time_online.is_none());
    }

    #[test]
    fn test_refresh_time_online_reports_changes() {
        let mut member = RosterMember::new("Alice");
        member.mark_online(at(0));

        assert!(!member.refresh_time_online(at(0)));
        assert!(member.refresh_time_online(at(61)));
        assert_eq!(member.time_online.as_deref(), Some("00:01:01"));
    }

    #[test]
    fn test_merge_fields_keeps_name_and_rejects_bad_types() {
        let mut member = RosterMember::new("Alice");
        let fields = json!({"Name": "Mallory", "Level": 20, "Local": "Venore"});
        let changed = member
            .merge_fields(fields.as_object().unwrap())
            .unwrap();
        assert!(changed);
        assert_eq!(member.name, "Alice");
        assert_eq!(member.level, 20);
        assert_eq!(member.local, "Venore");

        let bad = json!({"Level": "not a number"});
        let before = member.clone();
        assert!(member.merge_fields(bad.as_object().unwrap()).is_err());
        assert_eq!(member, before);
    }

    #[test]
    fn test_null_fields_fall_back_to_defaults() {
        let member: RosterMember = serde_json::from_value(json!({
            "Name": "Bob",
            "Vocation": null,
            "Level": null,
            "OnlineStatus": null,
            "Kind": null,
            "Local": null
        }))
        .unwrap();
        assert_eq!(member, RosterMember::new("Bob"));

        let mut member = RosterMember::new("Bob");
        member.kind = "maker".into();
        let fields = json!({"Kind": null, "Local": null, "Level": 7});
        assert!(member.merge_fields(fields.as_object().unwrap()).unwrap());
        assert_eq!(member.kind, "");
        assert_eq!(member.level, 7);
    }
}
