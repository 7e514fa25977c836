//! 主应用程序入口
//!
//! 组装实时同步管线：凭据续期协调器、推送客户端、名单合并器和告警评估器，
//! 收到 Ctrl-C 或会话被终止时依次拆除。

use application::{
    AlertRunner, AlertRunnerDependencies, AlertSettings, AlertStateStore, CredentialCoordinator,
    Reconciler, ReconcilerSettings, RefreshPolicy, RosterMutationGateway, SessionTerminator,
    SoundPlayer, StreamClient, StreamClientConfig, StreamClientDependencies, StreamEvent,
    SystemClock,
};
use config::{AlertRuleConfig, AppConfig};
use domain::{AlertRule, Credential};
use infrastructure::Infrastructure;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

/// 会话终止请求通过通道交给主循环处理
struct ChannelTerminator {
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl SessionTerminator for ChannelTerminator {
    fn terminate(&self, user_id: &str, reason: &str) {
        let _ = self.tx.send((user_id.to_string(), reason.to_string()));
    }
}

/// 终端响铃
struct TerminalBell;

impl SoundPlayer for TerminalBell {
    fn play(&self, sound_id: &str) {
        tracing::info!(sound_id, "播放提示音");
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

fn alert_rules(configs: &[AlertRuleConfig]) -> Vec<AlertRule> {
    configs
        .iter()
        .map(|config| {
            let mut rule = AlertRule::new(
                config.id.clone(),
                config.sound_id.clone(),
                config.threshold,
                config.time_range_minutes,
            );
            rule.enabled = config.enabled;
            rule
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    if config.session.access_token.is_empty() || config.session.refresh_token.is_empty() {
        anyhow::bail!("session.access_token and session.refresh_token must be configured");
    }
    let infra = Infrastructure::build(&config)?;

    let (terminate_tx, mut terminate_rx) = mpsc::unbounded_channel();
    let coordinator = CredentialCoordinator::new(
        infra.renewal.clone(),
        Arc::new(ChannelTerminator { tx: terminate_tx }),
        RefreshPolicy::from(&config.auth),
    );

    let user_id = config
        .session
        .user_id
        .clone()
        .or_else(|| coordinator.extract_user_id(&config.session.access_token))
        .ok_or_else(|| anyhow::anyhow!("cannot determine user id from access token"))?;
    let credential = coordinator.install(
        &user_id,
        Credential::new(
            config.session.access_token.clone(),
            config.session.refresh_token.clone(),
        ),
    );
    tracing::info!(user_id = %user_id, world = %config.stream.world, "会话已建立");

    let (client, driver) = StreamClient::spawn(StreamClientDependencies {
        config: StreamClientConfig::from(&config.stream),
        transport: infra.stream.clone(),
        coordinator: coordinator.clone(),
        credential: Some(credential),
        user_id: Some(user_id.clone()),
        environment: None,
    });

    let clock = Arc::new(SystemClock);
    let gateway: Arc<dyn RosterMutationGateway> =
        infra.roster_gateway(coordinator.clone(), user_id.clone());
    let reconciler = Reconciler::new(
        ReconcilerSettings::from_config(&config.stream, &config.reconciler),
        clock.clone(),
        Some(gateway),
    );
    let reconciler_tasks = reconciler.spawn(client.subscribe());

    let (alerts, alert_tasks) = AlertRunner::start(AlertRunnerDependencies {
        settings: AlertSettings::from(&config.alerts),
        rules: alert_rules(&config.alerts.rules),
        roster: reconciler.watch(),
        sound: Arc::new(TerminalBell),
        store: infra
            .alert_store
            .clone()
            .map(|store| store as Arc<dyn AlertStateStore>),
        clock,
    })
    .await;

    let mut stream_events = client.subscribe();
    let mut fired = alerts.subscribe();
    let mut roster = reconciler.watch();

    client.connect()?;

    let reason = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break "interrupted".to_string(),
            Some((user, reason)) = terminate_rx.recv() => {
                tracing::warn!(user_id = %user, reason = %reason, "会话被终止");
                break reason;
            }
            event = stream_events.recv() => match event {
                Ok(StreamEvent::Status(status)) => tracing::info!(%status, "连接状态"),
                Ok(StreamEvent::ReconnectExhausted { attempts }) => {
                    tracing::error!(attempts, "重连次数耗尽，等待手动重连");
                }
                Ok(StreamEvent::Message(_)) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break "stream closed".to_string(),
            },
            alert = fired.recv() => {
                if let Ok(alert) = alert {
                    tracing::warn!(
                        rule_id = %alert.rule_id,
                        members = ?alert.members,
                        "告警触发"
                    );
                }
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break "roster closed".to_string();
                }
                let snapshot = roster.borrow_and_update().clone();
                tracing::debug!(
                    version = snapshot.version,
                    members = snapshot.len(),
                    online = snapshot.online().count(),
                    "名单已更新"
                );
            }
        }
    };

    tracing::info!(reason = %reason, "开始关闭");
    client.close_connection().ok();
    client.shutdown().await;
    let _ = driver.await;
    reconciler_tasks.shutdown();
    alert_tasks.shutdown();
    coordinator.clear(&user_id);
    tracing::info!("已退出");

    Ok(())
}
