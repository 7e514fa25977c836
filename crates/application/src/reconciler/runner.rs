use std::future::pending;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use super::Reconciler;
use crate::stream_client::StreamEvent;

/// 合并器后台任务
pub struct ReconcilerTasks {
    handle: JoinHandle<()>,
}

impl ReconcilerTasks {
    /// 停止帧合并与计时器
    pub fn shutdown(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ReconcilerTasks {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn frame_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

impl Reconciler {
    /// 订阅推送事件：入队、按帧合并、每秒刷新在线时长
    pub fn spawn(&self, mut events: broadcast::Receiver<StreamEvent>) -> ReconcilerTasks {
        let reconciler = self.clone();
        let frame_interval = self.settings().frame_interval;
        let tick_interval = self.settings().tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut frame_deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(StreamEvent::Message(message)) => {
                            reconciler.enqueue(message);
                            frame_deadline.get_or_insert_with(|| Instant::now() + frame_interval);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "reconciler fell behind the stream");
                        }
                        Err(RecvError::Closed) => {
                            reconciler.flush();
                            break;
                        }
                    },
                    _ = frame_due(frame_deadline) => {
                        frame_deadline = None;
                        reconciler.flush();
                    }
                    _ = ticker.tick() => {
                        reconciler.tick();
                    }
                }
            }
            tracing::debug!("reconciler stopped");
        });

        ReconcilerTasks { handle }
    }
}
