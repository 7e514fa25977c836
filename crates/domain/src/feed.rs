//! 推送协议消息
//!
//! 服务端推送离散的 JSON 事件。数据对象以监控模式名称（例如 `"enemy"`）
//! 为键时是全量快照，以 `"{mode}-changes"` 为键时是增量变更。
//! 事件可以带信封 `{"kind", "timestamp", "data"}`；带 `kind` 标签时优先按标签
//! 解释，否则按数据对象的键推断类型。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::entities::RosterMember;
use crate::errors::{DomainError, DomainResult};

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RosterSnapshot,
    RosterDelta,
    Heartbeat,
    Error,
}

impl MessageKind {
    fn from_tag(tag: &str) -> DomainResult<Self> {
        match tag {
            "roster_snapshot" | "snapshot" => Ok(MessageKind::RosterSnapshot),
            "roster_delta" | "delta" => Ok(MessageKind::RosterDelta),
            "heartbeat" | "ping" => Ok(MessageKind::Heartbeat),
            "error" => Ok(MessageKind::Error),
            other => Err(DomainError::unrecognized(format!("未知的消息类型标签: {other}"))),
        }
    }
}

/// 增量变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "logged-in", alias = "logged_in")]
    LoggedIn,
    #[serde(rename = "logged-out", alias = "logged_out")]
    LoggedOut,
    #[serde(rename = "field-update", alias = "field_update", alias = "updated")]
    FieldUpdate,
}

/// 单个成员的增量变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberChange {
    #[serde(rename = "ChangeType")]
    pub change_kind: ChangeKind,
    /// 需要合并的字段（部分成员记录）
    #[serde(rename = "Member", default)]
    pub fields: Map<String, Value>,
}

/// 解析后的消息内容
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    Snapshot {
        mode: String,
        members: Vec<RosterMember>,
    },
    Delta {
        mode: String,
        changes: Vec<(String, MemberChange)>,
    },
    Heartbeat,
    Error {
        message: String,
    },
}

/// 推送消息
#[derive(Debug, Clone)]
pub struct FeedMessage {
    pub kind: MessageKind,
    pub payload: FeedPayload,
    /// 服务端逻辑时间戳（毫秒），用于水位线去重
    pub timestamp: Option<i64>,
    /// 接收时刻（单调时钟）
    pub received_at: Instant,
    /// 无法解析而被丢弃的条目（成员名称或下标）
    pub rejected: Vec<String>,
}

impl FeedMessage {
    /// 解析一条文本帧
    pub fn parse(text: &str, mode: &str, received_at: Instant) -> DomainResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| DomainError::malformed(format!("JSON 解析失败: {err}")))?;
        let Value::Object(mut root) = value else {
            return Err(DomainError::malformed("消息不是 JSON 对象"));
        };

        let tagged = match root.get("kind") {
            Some(Value::String(tag)) => Some(MessageKind::from_tag(tag)?),
            Some(other) => {
                return Err(DomainError::malformed(format!("kind 字段类型错误: {other}")))
            }
            None => None,
        };
        let timestamp = root.get("timestamp").and_then(Value::as_i64);

        let mut data = match root.remove("data") {
            Some(Value::Object(data)) => data,
            Some(Value::Null) => Map::new(),
            Some(other) => {
                return Err(DomainError::malformed(format!("data 字段不是对象: {other}")))
            }
            None if tagged.is_some() || root.contains_key("timestamp") => Map::new(),
            None => std::mem::take(&mut root),
        };

        let changes_key = format!("{mode}-changes");
        let kind = match tagged {
            Some(kind) => kind,
            None => infer_kind(&root, &data, mode, &changes_key)?,
        };

        let mut rejected = Vec::new();
        let payload = match kind {
            MessageKind::RosterSnapshot => {
                let records = match data.remove(mode) {
                    Some(Value::Array(records)) => records,
                    Some(_) => {
                        return Err(DomainError::malformed(format!("快照 {mode} 不是数组")))
                    }
                    None => return Err(DomainError::malformed(format!("快照缺少 {mode} 字段"))),
                };
                FeedPayload::Snapshot {
                    mode: mode.to_string(),
                    members: parse_members(records, &mut rejected),
                }
            }
            MessageKind::RosterDelta => {
                let entries = match data.remove(&changes_key) {
                    Some(Value::Object(entries)) => entries,
                    Some(_) => {
                        return Err(DomainError::malformed(format!(
                            "增量 {changes_key} 不是对象"
                        )))
                    }
                    None => {
                        return Err(DomainError::malformed(format!(
                            "增量缺少 {changes_key} 字段"
                        )))
                    }
                };
                FeedPayload::Delta {
                    mode: mode.to_string(),
                    changes: parse_changes(entries, &mut rejected),
                }
            }
            MessageKind::Heartbeat => FeedPayload::Heartbeat,
            MessageKind::Error => FeedPayload::Error {
                message: error_message(&root, &data),
            },
        };

        Ok(Self {
            kind,
            payload,
            timestamp,
            received_at,
            rejected,
        })
    }

    /// 是否携带名单数据
    pub fn is_roster(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::RosterSnapshot | MessageKind::RosterDelta
        )
    }
}

fn infer_kind(
    root: &Map<String, Value>,
    data: &Map<String, Value>,
    mode: &str,
    changes_key: &str,
) -> DomainResult<MessageKind> {
    if data.contains_key(mode) {
        return Ok(MessageKind::RosterSnapshot);
    }
    if data.contains_key(changes_key) {
        return Ok(MessageKind::RosterDelta);
    }
    let type_tag = data
        .get("type")
        .or_else(|| root.get("type"))
        .and_then(Value::as_str);
    if matches!(type_tag, Some("heartbeat" | "ping")) || data.contains_key("heartbeat") {
        return Ok(MessageKind::Heartbeat);
    }
    if data.contains_key("error") || root.contains_key("error") {
        return Ok(MessageKind::Error);
    }
    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    Err(DomainError::unrecognized(format!(
        "无法识别的数据键: [{}]",
        keys.join(", ")
    )))
}

fn parse_members(records: Vec<Value>, rejected: &mut Vec<String>) -> Vec<RosterMember> {
    let mut members = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let label = record
            .get("Name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{index}"));
        match serde_json::from_value::<RosterMember>(record) {
            Ok(member) if !member.name.trim().is_empty() => members.push(member),
            _ => rejected.push(label),
        }
    }
    members
}

fn parse_changes(
    entries: Map<String, Value>,
    rejected: &mut Vec<String>,
) -> Vec<(String, MemberChange)> {
    let mut changes = Vec::with_capacity(entries.len());
    for (name, entry) in entries {
        if name.trim().is_empty() {
            rejected.push(name);
            continue;
        }
        match serde_json::from_value::<MemberChange>(entry) {
            Ok(change) => changes.push((name, change)),
            Err(_) => rejected.push(name),
        }
    }
    changes
}

fn error_message(root: &Map<String, Value>, data: &Map<String, Value>) -> String {
    ["error", "message"]
        .iter()
        .find_map(|key| data.get(*key).or_else(|| root.get(*key)))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> DomainResult<FeedMessage> {
        FeedMessage::parse(text, "enemy", Instant::now())
    }

    #[test]
    fn test_bare_snapshot_is_inferred() {
        let msg = parse(
            r#"{"enemy":[{"Name":"Alice","Level":100},{"Name":"Bob","OnlineStatus":true}]}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageKind::RosterSnapshot);
        assert!(msg.timestamp.is_none());
        match msg.payload {
            FeedPayload::Snapshot { members, .. } => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].name, "Alice");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_enveloped_delta_with_timestamp() {
        let msg = parse(
            r#"{"timestamp":1700000000123,"data":{"enemy-changes":{
                "Alice":{"ChangeType":"logged-in","Member":{"Level":101}},
                "Bob":{"ChangeType":"logged-out"}
            }}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageKind::RosterDelta);
        assert_eq!(msg.timestamp, Some(1_700_000_000_123));
        let FeedPayload::Delta { changes, .. } = msg.payload else {
            panic!("expected delta");
        };
        assert_eq!(changes.len(), 2);
        let alice = changes.iter().find(|(name, _)| name == "Alice").unwrap();
        assert_eq!(alice.1.change_kind, ChangeKind::LoggedIn);
        assert_eq!(alice.1.fields.get("Level"), Some(&Value::from(101)));
    }

    #[test]
    fn test_explicit_kind_tag_wins_over_inference() {
        let msg = parse(r#"{"kind":"heartbeat","data":{"enemy":[]}}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Heartbeat);
        assert_eq!(msg.payload, FeedPayload::Heartbeat);
    }

    #[test]
    fn test_error_message() {
        let msg = parse(r#"{"kind":"error","message":"world offline"}"#).unwrap();
        assert_eq!(
            msg.payload,
            FeedPayload::Error {
                message: "world offline".into()
            }
        );
    }

    #[test]
    fn test_bad_entries_are_rejected_individually() {
        let msg = parse(
            r#"{"enemy-changes":{
                "Alice":{"ChangeType":"logged-in"},
                "Bob":{"ChangeType":"teleported"}
            }}"#,
        )
        .unwrap();
        assert_eq!(msg.rejected, vec!["Bob".to_string()]);

        let snapshot = parse(r#"{"enemy":[{"Name":"Alice"},{"Level":3},{"Name":"Eve","Level":"x"}]}"#)
            .unwrap();
        assert_eq!(snapshot.rejected, vec!["#1".to_string(), "Eve".to_string()]);
    }

    #[test]
    fn test_unrecognized_and_malformed() {
        assert!(matches!(
            parse(r#"{"friends":[]}"#),
            Err(DomainError::UnrecognizedMessage { .. })
        ));
        assert!(matches!(
            parse("not json"),
            Err(DomainError::MalformedMessage { .. })
        ));
        assert!(matches!(
            parse(r#"{"kind":"roster_snapshot","data":{"enemy":{}}}"#),
            Err(DomainError::MalformedMessage { .. })
        ));
        assert!(matches!(
            parse(r#"{"kind":"teleport"}"#),
            Err(DomainError::UnrecognizedMessage { .. })
        ));
    }
}
