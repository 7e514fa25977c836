//! 告警规则评估
//!
//! 每次名单视图变化时，按规则统计窗口内的新上线成员，达到阈值且冷却结束后触发告警。

mod evaluator;
mod persisted;
mod runner;

pub use evaluator::{AlertEvaluator, AlertFired, AlertSettings};
pub use persisted::{LoginEntry, PersistedAlertState, PersistedRule, RuleLogins};
pub use runner::{AlertRunner, AlertRunnerDependencies, AlertTasks};
