use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Reconciler, RosterState};
use crate::error::MutationError;

/// 可由用户修改的成员字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutableField {
    Local,
    Classification,
}

impl MutableField {
    fn read(self, state: &RosterState, name: &str) -> Option<String> {
        state.members.get(name).map(|member| match self {
            MutableField::Local => member.local.clone(),
            MutableField::Classification => member.kind.clone(),
        })
    }

    fn write(self, state: &mut RosterState, name: &str, value: &str) -> bool {
        let Some(member) = state.members.get_mut(name) else {
            return false;
        };
        let slot = match self {
            MutableField::Local => &mut member.local,
            MutableField::Classification => &mut member.kind,
        };
        if slot == value {
            return false;
        }
        *slot = value.to_string();
        true
    }
}

type MemberLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// 成员串行锁的使用权，释放时若无其他等待者则移除该成员的锁
struct MemberLease<'a> {
    locks: &'a MemberLocks,
    name: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> MemberLease<'a> {
    fn acquire(locks: &'a MemberLocks, name: &str) -> Self {
        let lock = Arc::clone(
            locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.to_string())
                .or_default(),
        );
        Self {
            locks,
            name: name.to_string(),
            lock,
        }
    }
}

impl Drop for MemberLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 只剩映射表和自己持有
        let idle = locks
            .get(&self.name)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(&self.name);
        }
    }
}

impl Reconciler {
    /// 修改成员位置备注
    pub async fn update_local(&self, name: &str, local: &str) -> Result<(), MutationError> {
        self.mutate(name, MutableField::Local, local).await
    }

    /// 修改成员分类
    pub async fn update_classification(&self, name: &str, kind: &str) -> Result<(), MutationError> {
        self.mutate(name, MutableField::Classification, kind).await
    }

    /// 先在本地乐观修改，再按成员串行转发请求
    ///
    /// 请求失败时，只有该字段没有更新的本地意图且值未被改动才回滚。
    async fn mutate(
        &self,
        name: &str,
        field: MutableField,
        value: &str,
    ) -> Result<(), MutationError> {
        let gateway = self.shared.gateway.clone().ok_or(MutationError::NoGateway)?;
        let key = (name.to_string(), field);

        let intent = {
            let mut state = self.shared.state();
            let previous = field
                .read(&state, name)
                .ok_or_else(|| MutationError::UnknownMember(name.to_string()))?;
            let intent = {
                let seq = state.intents.entry(key.clone()).or_insert(0);
                *seq += 1;
                *seq
            };
            state.confirmed.entry(key.clone()).or_insert(previous);
            if field.write(&mut state, name, value) {
                self.shared.publish(&mut state);
            }
            intent
        };

        let lease = MemberLease::acquire(&self.shared.member_locks, name);
        let _serialized = lease.lock.lock().await;

        if self.shared.state().intents.get(&key) != Some(&intent) {
            tracing::debug!(member = %name, ?field, "skipping superseded roster update");
            return Ok(());
        }

        let result = match field {
            MutableField::Local => gateway.update_local(name, value).await,
            MutableField::Classification => gateway.update_classification(name, value).await,
        };

        let mut state = self.shared.state();
        let latest = state.intents.get(&key) == Some(&intent);
        match result {
            Ok(()) => {
                if latest {
                    state.confirmed.remove(&key);
                    state.intents.remove(&key);
                } else {
                    state.confirmed.insert(key, value.to_string());
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(member = %name, ?field, error = %err, "roster update rejected");
                let unchanged = field.read(&state, name).as_deref() == Some(value);
                if latest {
                    let restore = state.confirmed.remove(&key);
                    state.intents.remove(&key);
                    if let (true, Some(restore)) = (unchanged, restore) {
                        if field.write(&mut state, name, &restore) {
                            self.shared.publish(&mut state);
                        }
                    }
                }
                Err(err)
            }
        }
    }
}
