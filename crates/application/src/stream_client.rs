//! 推送连接客户端
//!
//! 单个驱动任务独占连接状态，依次处理命令、传输帧和定时器，每个处理步骤都是原子的。
//! 句柄方法只向驱动任务发送命令。握手在独立任务中进行，结果带上连接代数回送，
//! 过期代数的结果直接丢弃。

use domain::{ConnectionStatus, Credential, FeedMessage};
use futures_util::StreamExt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::credential::{CredentialCoordinator, CredentialEvent};
use crate::error::{StreamError, TransportError};
use crate::ports::{ConnectRequest, FrameStream, StreamTransport};

const EVENT_CAPACITY: usize = 1024;

/// 推送客户端配置
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub url: String,
    pub world: String,
    /// 监控模式，决定快照与增量数据所在的键
    pub mode: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// 连接正常但持续静默多久后主动续期凭据
    pub silence_refresh: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            world: "default".to_string(),
            mode: "enemy".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(45),
            silence_refresh: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

impl From<&config::StreamConfig> for StreamClientConfig {
    fn from(config: &config::StreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            world: config.world.clone(),
            mode: config.mode.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            silence_refresh: config.silence_refresh(),
            reconnect_base_delay: config.reconnect_base_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

impl StreamClientConfig {
    /// 重连退避：`base × 1.5^n`，不超过 `max`
    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::exponential(self.reconnect_base_delay)
            .with_factor(1.5)
            .with_max(self.reconnect_max_delay)
    }
}

/// 推送客户端对外发布的事件
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Status(ConnectionStatus),
    Message(Arc<FeedMessage>),
    /// 重连次数耗尽，需要调用方显式 `connect()` 才会恢复
    ReconnectExhausted { attempts: u32 },
}

/// 运行环境信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    /// 界面重新回到前台
    VisibilityRegained,
    NetworkRestored,
    NetworkLost,
}

pub struct StreamClientDependencies {
    pub config: StreamClientConfig,
    pub transport: Arc<dyn StreamTransport>,
    pub coordinator: CredentialCoordinator,
    pub credential: Option<Arc<Credential>>,
    /// 为空时从访问令牌中解析
    pub user_id: Option<String>,
    pub environment: Option<broadcast::Sender<EnvironmentSignal>>,
}

enum Command {
    Connect {
        manual: bool,
    },
    Close,
    UpdateCredential(Arc<Credential>),
    Environment(EnvironmentSignal),
    Opened {
        generation: u64,
        result: Result<FrameStream, TransportError>,
    },
    Shutdown,
}

/// 连接状态，只由驱动任务修改
struct Connection {
    credential: Option<Arc<Credential>>,
    status: ConnectionStatus,
    reconnect_attempt: u32,
    last_message_at: Instant,
    generation: u64,
    stream: Option<FrameStream>,
}

struct Driver {
    config: StreamClientConfig,
    backoff: Backoff,
    transport: Arc<dyn StreamTransport>,
    coordinator: CredentialCoordinator,
    user_id: Option<String>,
    connection: Connection,
    should_reconnect: bool,
    exhausted: bool,
    offline: bool,
    silence_refreshed: bool,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    loopback: mpsc::WeakUnboundedSender<Command>,
    credential_events: Option<broadcast::Receiver<CredentialEvent>>,
    environment_source: Option<broadcast::Sender<EnvironmentSignal>>,
    environment: Option<broadcast::Receiver<EnvironmentSignal>>,
    events: broadcast::Sender<StreamEvent>,
    status: watch::Sender<ConnectionStatus>,
}

/// 推送客户端句柄
#[derive(Clone)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<StreamEvent>,
    status: watch::Receiver<ConnectionStatus>,
}

impl StreamClient {
    /// 启动驱动任务，初始状态为未连接
    pub fn spawn(deps: StreamClientDependencies) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let user_id = deps.user_id.or_else(|| {
            deps.credential
                .as_ref()
                .and_then(|credential| deps.coordinator.extract_user_id(&credential.access_token))
        });
        let credential = deps.credential.or_else(|| {
            user_id
                .as_deref()
                .and_then(|user| deps.coordinator.current(user))
        });

        let driver = Driver {
            backoff: deps.config.reconnect_backoff(),
            config: deps.config,
            transport: deps.transport,
            credential_events: Some(deps.coordinator.subscribe()),
            coordinator: deps.coordinator,
            user_id,
            connection: Connection {
                credential,
                status: ConnectionStatus::Disconnected,
                reconnect_attempt: 0,
                last_message_at: Instant::now(),
                generation: 0,
                stream: None,
            },
            should_reconnect: true,
            exhausted: false,
            offline: false,
            silence_refreshed: false,
            heartbeat: None,
            reconnect_at: None,
            commands: commands_rx,
            loopback: commands_tx.downgrade(),
            environment: deps.environment.as_ref().map(broadcast::Sender::subscribe),
            environment_source: deps.environment,
            events: events.clone(),
            status: status_tx,
        };
        let handle = tokio::spawn(driver.run());

        (
            Self {
                commands: commands_tx,
                events,
                status: status_rx,
            },
            handle,
        )
    }

    fn send(&self, command: Command) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::ShutDown)
    }

    /// 建立连接；正在连接或已连接时无操作。会重置已耗尽的重连计数。
    pub fn connect(&self) -> Result<(), StreamError> {
        self.send(Command::Connect { manual: true })
    }

    /// 停止所有定时器并关闭连接，可重复调用
    pub fn close_connection(&self) -> Result<(), StreamError> {
        self.send(Command::Close)
    }

    /// 替换凭据，不影响当前连接
    pub fn update_credential(&self, credential: Credential) -> Result<(), StreamError> {
        self.send(Command::UpdateCredential(Arc::new(credential)))
    }

    pub fn notify_environment(&self, signal: EnvironmentSignal) -> Result<(), StreamError> {
        self.send(Command::Environment(signal))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// 关闭连接并等待驱动任务退出
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            self.commands.closed().await;
        }
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<String, TransportError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn recv_signal<T: Clone>(
    receiver: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.close();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                frame = next_frame(&mut self.connection.stream) => self.handle_frame(frame),
                _ = tick(&mut self.heartbeat) => self.check_heartbeat(),
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect(false);
                }
                event = recv_signal(&mut self.credential_events) => match event {
                    Ok(event) => self.handle_credential_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "credential events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => self.credential_events = None,
                },
                signal = recv_signal(&mut self.environment) => match signal {
                    Ok(signal) => self.handle_environment(signal),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => self.environment = None,
                },
            }
        }
        tracing::debug!("stream client driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { manual } => self.connect(manual),
            Command::Close => self.close(),
            Command::UpdateCredential(credential) => {
                tracing::debug!("stream credential updated");
                self.connection.credential = Some(credential);
            }
            Command::Environment(signal) => self.handle_environment(signal),
            Command::Opened { generation, result } => self.handle_opened(generation, result),
            Command::Shutdown => {}
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.connection.status == status {
            return;
        }
        tracing::info!(from = %self.connection.status, to = %status, "stream status changed");
        self.connection.status = status;
        self.status.send_replace(status);
        let _ = self.events.send(StreamEvent::Status(status));
    }

    fn connect(&mut self, manual: bool) {
        if manual {
            self.should_reconnect = true;
            if self.exhausted {
                tracing::info!("manual connect after exhausted reconnects");
                self.exhausted = false;
                self.connection.reconnect_attempt = 0;
            }
            if self.environment.is_none() {
                self.environment = self
                    .environment_source
                    .as_ref()
                    .map(broadcast::Sender::subscribe);
            }
        } else if !self.should_reconnect || self.exhausted || self.offline {
            return;
        }

        if self.connection.status.is_active() {
            return;
        }

        let Some(credential) = self.connection.credential.clone() else {
            tracing::warn!("no access credential available, stream stays disconnected");
            return;
        };

        self.reconnect_at = None;
        self.connection.generation += 1;
        let generation = self.connection.generation;
        self.set_status(ConnectionStatus::Connecting);

        let request = ConnectRequest {
            url: self.config.url.clone(),
            access_token: credential.access_token.clone(),
            world: self.config.world.clone(),
        };
        let transport = self.transport.clone();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let result = transport.open(request).await;
            if let Some(sender) = loopback.upgrade() {
                let _ = sender.send(Command::Opened { generation, result });
            }
        });
    }

    fn handle_opened(&mut self, generation: u64, result: Result<FrameStream, TransportError>) {
        if generation != self.connection.generation
            || self.connection.status != ConnectionStatus::Connecting
        {
            tracing::debug!(generation, "dropping superseded stream handshake");
            return;
        }

        match result {
            Ok(stream) => {
                let now = Instant::now();
                self.connection.stream = Some(stream);
                self.connection.reconnect_attempt = 0;
                self.connection.last_message_at = now;
                self.silence_refreshed = false;
                let period = self.config.heartbeat_interval;
                let mut heartbeat = interval_at(now + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);
                self.set_status(ConnectionStatus::Connected);
            }
            Err(err) => {
                tracing::warn!(error = %err, "stream handshake failed");
                if err.is_unauthorized() {
                    self.spawn_refresh("handshake rejected");
                }
                self.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<Result<String, TransportError>>) {
        match frame {
            Some(Ok(text)) => {
                let now = Instant::now();
                self.connection.last_message_at = now;
                self.silence_refreshed = false;
                match FeedMessage::parse(&text, &self.config.mode, now) {
                    Ok(message) => {
                        if !message.rejected.is_empty() {
                            tracing::warn!(rejected = ?message.rejected, "dropped malformed roster entries");
                        }
                        let _ = self.events.send(StreamEvent::Message(Arc::new(message)));
                    }
                    Err(err) => tracing::warn!(error = %err, "dropping unparseable frame"),
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "stream connection lost");
                self.drop_transport();
                self.schedule_reconnect();
            }
            None => {
                tracing::info!("stream closed by server");
                self.drop_transport();
                self.schedule_reconnect();
            }
        }
    }

    fn check_heartbeat(&mut self) {
        if self.connection.status != ConnectionStatus::Connected {
            return;
        }
        let silence = self.connection.last_message_at.elapsed();
        if silence > self.config.heartbeat_timeout {
            tracing::warn!(
                silence_ms = silence.as_millis() as u64,
                "heartbeat timed out, reconnecting"
            );
            self.drop_transport();
            self.connect(false);
        } else if silence >= self.config.silence_refresh && !self.silence_refreshed {
            self.silence_refreshed = true;
            self.spawn_refresh("stream silent");
        }
    }

    /// 第 n 次失败后按 `n - 1` 计算退避；达到上限时发出一次终止事件
    fn schedule_reconnect(&mut self) {
        if !self.should_reconnect || self.exhausted || self.offline {
            return;
        }
        let exponent = self.connection.reconnect_attempt;
        self.connection.reconnect_attempt += 1;
        let attempts = self.connection.reconnect_attempt;
        if attempts >= self.config.max_reconnect_attempts {
            tracing::error!(attempts, "reconnect attempts exhausted");
            self.exhausted = true;
            self.reconnect_at = None;
            let _ = self.events.send(StreamEvent::ReconnectExhausted { attempts });
            return;
        }
        let delay = self.backoff.jittered(exponent);
        tracing::info!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// 关闭传输与心跳，使后续回调失效
    fn drop_transport(&mut self) {
        self.connection.stream = None;
        self.heartbeat = None;
        self.connection.generation += 1;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn close(&mut self) {
        self.should_reconnect = false;
        self.reconnect_at = None;
        self.environment = None;
        self.drop_transport();
    }

    fn handle_environment(&mut self, signal: EnvironmentSignal) {
        tracing::debug!(?signal, "environment signal");
        match signal {
            EnvironmentSignal::NetworkLost => {
                self.offline = true;
                self.reconnect_at = None;
                if self.connection.stream.is_some()
                    || self.connection.status != ConnectionStatus::Disconnected
                {
                    self.drop_transport();
                }
            }
            EnvironmentSignal::NetworkRestored | EnvironmentSignal::VisibilityRegained => {
                if signal == EnvironmentSignal::NetworkRestored {
                    self.offline = false;
                }
                if self.connection.status != ConnectionStatus::Connected {
                    self.reconnect_at = None;
                    self.connect(false);
                }
            }
        }
    }

    fn handle_credential_event(&mut self, event: CredentialEvent) {
        match event {
            CredentialEvent::Renewed {
                user_id,
                credential,
            } if self.user_id.as_deref() == Some(user_id.as_str()) => {
                tracing::debug!(user_id = %user_id, "applying renewed credential to stream");
                self.connection.credential = Some(credential);
            }
            CredentialEvent::Failed { user_id, error }
                if self.user_id.as_deref() == Some(user_id.as_str()) =>
            {
                tracing::warn!(user_id = %user_id, error = %error, "credential lost, closing stream");
                self.connection.credential = None;
                self.close();
            }
            _ => {}
        }
    }

    fn spawn_refresh(&self, reason: &'static str) {
        let Some(user_id) = self.user_id.clone() else {
            tracing::warn!(reason, "cannot refresh credential without a user id");
            return;
        };
        let refresh_token = self
            .connection
            .credential
            .as_ref()
            .map(|credential| credential.refresh_token.clone())
            .unwrap_or_default();
        let coordinator = self.coordinator.clone();
        tracing::info!(user_id = %user_id, reason, "requesting credential refresh");
        tokio::spawn(async move {
            if let Err(err) = coordinator.refresh(&user_id, &refresh_token).await {
                tracing::warn!(user_id = %user_id, error = %err, "stream-triggered refresh failed");
            }
        });
    }
}
