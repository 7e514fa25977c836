use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::evaluator::{AlertEvaluator, AlertFired, AlertSettings};
use crate::clock::Clock;
use crate::ports::{AlertStateStore, SoundPlayer};
use crate::reconciler::RosterSnapshot;
use domain::AlertRule;

pub struct AlertRunnerDependencies {
    pub settings: AlertSettings,
    pub rules: Vec<AlertRule>,
    pub roster: watch::Receiver<RosterSnapshot>,
    pub sound: Arc<dyn SoundPlayer>,
    pub store: Option<Arc<dyn AlertStateStore>>,
    pub clock: Arc<dyn Clock>,
}

/// 告警后台任务
pub struct AlertTasks {
    handle: JoinHandle<()>,
}

impl AlertTasks {
    /// 停止评估并取消所有规则的清空定时器
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for AlertTasks {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 告警运行器句柄
#[derive(Clone)]
pub struct AlertRunner {
    evaluator: Arc<Mutex<AlertEvaluator>>,
    events: broadcast::Sender<AlertFired>,
}

impl AlertRunner {
    /// 恢复持久化状态后开始订阅名单变化
    pub async fn start(deps: AlertRunnerDependencies) -> (Self, AlertTasks) {
        let mut evaluator = AlertEvaluator::new(&deps.settings, deps.rules);
        if let Some(store) = &deps.store {
            match store.load().await {
                Ok(Some(state)) => {
                    evaluator.restore(state);
                    tracing::info!("restored alert rule state");
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "failed to load alert state, starting empty"),
            }
        }

        let (events, _) = broadcast::channel(64);
        let runner = Self {
            evaluator: Arc::new(Mutex::new(evaluator)),
            events,
        };
        let handle = tokio::spawn(runner.clone().run(deps.roster, deps.sound, deps.store, deps.clock));
        (runner, AlertTasks { handle })
    }

    fn evaluator(&self) -> MutexGuard<'_, AlertEvaluator> {
        self.evaluator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertFired> {
        self.events.subscribe()
    }

    pub fn eligible_count(&self, rule_id: &str) -> Option<usize> {
        self.evaluator().eligible_count(rule_id)
    }

    async fn run(
        self,
        mut roster: watch::Receiver<RosterSnapshot>,
        sound: Arc<dyn SoundPlayer>,
        store: Option<Arc<dyn AlertStateStore>>,
        clock: Arc<dyn Clock>,
    ) {
        // 规则清空定时器，任务退出时随 JoinSet 一起取消
        let mut timers: JoinSet<(String, u64)> = JoinSet::new();

        loop {
            tokio::select! {
                changed = roster.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = roster.borrow_and_update().clone();
                    let fired = self
                        .evaluator()
                        .evaluate(snapshot.online(), clock.now());
                    for alert in fired {
                        sound.play(&alert.sound_id);
                        let rule_id = alert.rule_id.clone();
                        let sequence = alert.sequence;
                        let delay = alert.clear_after;
                        timers.spawn(async move {
                            tokio::time::sleep(delay).await;
                            (rule_id, sequence)
                        });
                        let _ = self.events.send(alert);
                    }
                }
                Some(expired) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok((rule_id, sequence)) = expired {
                        self.evaluator().clear_rule(&rule_id, sequence);
                    }
                }
            }
            self.persist(store.as_deref()).await;
        }
        tracing::debug!("alert runner stopped");
    }

    async fn persist(&self, store: Option<&dyn AlertStateStore>) {
        let Some(store) = store else {
            return;
        };
        let state = {
            let mut evaluator = self.evaluator();
            if !evaluator.take_dirty() {
                return;
            }
            evaluator.export()
        };
        if let Err(err) = store.save(&state).await {
            tracing::warn!(error = %err, "failed to persist alert state");
        }
    }
}
