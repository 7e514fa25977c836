//! 名单合并器
//!
//! 推送消息先进入有界队列，每个帧间隔合并一次，内容变化时发布新的名单视图。
//! 所有状态修改都在同步锁内一步完成，锁内没有 `.await`。

mod mutations;
mod runner;

pub use mutations::MutableField;
pub use runner::ReconcilerTasks;

use chrono::{DateTime, Utc};
use domain::{ChangeKind, FeedMessage, FeedPayload, MemberChange, RosterMember, ONLINE_STATE_FIELDS};
use serde_json::Map;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::ports::RosterMutationGateway;

/// 合并器配置
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub mode: String,
    pub queue_capacity: usize,
    pub frame_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            mode: "enemy".to_string(),
            queue_capacity: 200,
            frame_interval: Duration::from_millis(16),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl ReconcilerSettings {
    pub fn from_config(stream: &config::StreamConfig, reconciler: &config::ReconcilerConfig) -> Self {
        Self {
            mode: stream.mode.clone(),
            queue_capacity: reconciler.queue_capacity,
            frame_interval: reconciler.frame_interval(),
            tick_interval: reconciler.tick_interval(),
        }
    }
}

/// 对外发布的名单视图，成员按名称排序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterSnapshot {
    pub version: u64,
    pub members: Arc<Vec<RosterMember>>,
}

impl RosterSnapshot {
    pub fn get(&self, name: &str) -> Option<&RosterMember> {
        self.members
            .binary_search_by(|member| member.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.members[index])
    }

    pub fn online(&self) -> impl Iterator<Item = &RosterMember> {
        self.members.iter().filter(|member| member.online_status)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub(crate) struct RosterState {
    pub(crate) members: BTreeMap<String, RosterMember>,
    /// 监控模式 -> 该模式下出现过的成员
    modes: HashMap<String, HashSet<String>>,
    queue: VecDeque<Arc<FeedMessage>>,
    watermark: Option<i64>,
    version: u64,
    pub(crate) intents: HashMap<(String, MutableField), u64>,
    pub(crate) confirmed: HashMap<(String, MutableField), String>,
}

impl RosterState {
    fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            modes: HashMap::new(),
            queue: VecDeque::new(),
            watermark: None,
            version: 0,
            intents: HashMap::new(),
            confirmed: HashMap::new(),
        }
    }

    fn snapshot(&mut self) -> RosterSnapshot {
        self.version += 1;
        RosterSnapshot {
            version: self.version,
            members: Arc::new(self.members.values().cloned().collect()),
        }
    }

    /// 带时间戳且不高于水位线的消息直接跳过
    fn apply(&mut self, message: &FeedMessage, now: DateTime<Utc>) -> bool {
        if let (Some(timestamp), Some(watermark)) = (message.timestamp, self.watermark) {
            if timestamp <= watermark {
                tracing::debug!(timestamp, watermark, "skipping stale message");
                return false;
            }
        }

        let changed = match &message.payload {
            FeedPayload::Snapshot { mode, members } => self.apply_snapshot(mode, members, now),
            FeedPayload::Delta { mode, changes } => self.apply_delta(mode, changes, now),
            FeedPayload::Heartbeat => false,
            FeedPayload::Error { message } => {
                tracing::warn!(error = %message, "server reported an error");
                false
            }
        };

        if message.is_roster() {
            if let Some(timestamp) = message.timestamp {
                self.watermark = Some(self.watermark.map_or(timestamp, |w| w.max(timestamp)));
            }
        }
        changed
    }

    /// 用快照替换该模式下的成员集合
    fn apply_snapshot(&mut self, mode: &str, members: &[RosterMember], now: DateTime<Utc>) -> bool {
        let mut changed = false;
        let mut seen = HashSet::with_capacity(members.len());

        for incoming in members {
            let mut member = incoming.clone();
            if member.online_status && member.online_since.is_none() {
                if let Some(existing) = self
                    .members
                    .get(&member.name)
                    .filter(|existing| existing.online_status && existing.online_since.is_some())
                {
                    member.online_since = existing.online_since;
                    member.since_estimated = existing.since_estimated;
                }
            }
            member.normalize(now);
            seen.insert(member.name.clone());
            if self.members.get(&member.name) != Some(&member) {
                self.members.insert(member.name.clone(), member);
                changed = true;
            }
        }

        let previous = self.modes.insert(mode.to_string(), seen);
        for name in previous.unwrap_or_default() {
            let still_tracked = self.modes.values().any(|names| names.contains(&name));
            if !still_tracked && self.members.remove(&name).is_some() {
                changed = true;
            }
        }
        changed
    }

    fn apply_delta(
        &mut self,
        mode: &str,
        changes: &[(String, MemberChange)],
        now: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;
        for (name, change) in changes {
            let mut member = self
                .members
                .get(name)
                .cloned()
                .unwrap_or_else(|| RosterMember::new(name.clone()));

            // 在线状态字段只由变更类型决定
            let fields: Map<_, _> = change
                .fields
                .iter()
                .filter(|(key, _)| !ONLINE_STATE_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if let Err(err) = member.merge_fields(&fields) {
                tracing::warn!(member = %name, error = %err, "dropping roster change");
                continue;
            }

            match change.change_kind {
                ChangeKind::LoggedIn => member.mark_online(now),
                ChangeKind::LoggedOut => member.mark_offline(),
                ChangeKind::FieldUpdate => member.normalize(now),
            }

            self.modes
                .entry(mode.to_string())
                .or_default()
                .insert(name.clone());
            if self.members.get(name) != Some(&member) {
                self.members.insert(name.clone(), member);
                changed = true;
            }
        }
        changed
    }

    fn refresh_time_online(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for member in self.members.values_mut() {
            changed |= member.refresh_time_online(now);
        }
        changed
    }
}

pub(crate) struct Shared {
    pub(crate) settings: ReconcilerSettings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) gateway: Option<Arc<dyn RosterMutationGateway>>,
    pub(crate) state: Mutex<RosterState>,
    pub(crate) member_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) view: watch::Sender<RosterSnapshot>,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, RosterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, state: &mut RosterState) {
        let snapshot = state.snapshot();
        tracing::trace!(version = snapshot.version, members = snapshot.len(), "roster published");
        self.view.send_replace(snapshot);
    }
}

/// 名单合并器句柄，克隆后共享同一份名单
#[derive(Clone)]
pub struct Reconciler {
    pub(crate) shared: Arc<Shared>,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        clock: Arc<dyn Clock>,
        gateway: Option<Arc<dyn RosterMutationGateway>>,
    ) -> Self {
        let (view, _) = watch::channel(RosterSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                settings,
                clock,
                gateway,
                state: Mutex::new(RosterState::new()),
                member_locks: Mutex::new(HashMap::new()),
                view,
            }),
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.shared.settings
    }

    /// 消息入队；队列满时丢弃最旧的一条
    pub fn enqueue(&self, message: Arc<FeedMessage>) {
        let capacity = self.shared.settings.queue_capacity.max(1);
        let mut state = self.shared.state();
        while state.queue.len() >= capacity {
            state.queue.pop_front();
        }
        state.queue.push_back(message);
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state().queue.len()
    }

    /// 合并队列中的全部消息，名单变化时发布一次；返回是否发布
    pub fn flush(&self) -> bool {
        let now = self.shared.clock.now();
        let mut state = self.shared.state();
        let mut changed = false;
        while let Some(message) = state.queue.pop_front() {
            changed |= state.apply(&message, now);
        }
        if changed {
            self.shared.publish(&mut state);
        }
        changed
    }

    /// 重新计算所有在线成员的在线时长
    pub fn tick(&self) -> bool {
        let now = self.shared.clock.now();
        let mut state = self.shared.state();
        let changed = state.refresh_time_online(now);
        if changed {
            self.shared.publish(&mut state);
        }
        changed
    }

    pub fn watermark(&self) -> Option<i64> {
        self.shared.state().watermark
    }

    pub fn roster(&self) -> RosterSnapshot {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RosterSnapshot> {
        self.shared.view.subscribe()
    }
}
