//! 统一配置中心
//!
//! 提供客户端的全局配置管理，包括：
//! - 推送连接与重连策略
//! - 凭据续期
//! - 名单合并节奏
//! - 告警规则
//!
//! 加载顺序：默认值 -> 可选配置文件（`APP_CONFIG_FILE`）-> 环境变量（`APP_*`，以 `__` 分隔层级）

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    /// 推送连接配置
    #[validate(nested)]
    pub stream: StreamConfig,
    /// REST 接口配置
    #[validate(nested)]
    pub api: ApiConfig,
    /// 凭据续期配置
    #[validate(nested)]
    pub auth: AuthConfig,
    /// 初始会话凭据
    #[serde(default)]
    pub session: SessionConfig,
    /// 名单合并配置
    #[serde(default)]
    #[validate(nested)]
    pub reconciler: ReconcilerConfig,
    /// 告警配置
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// 推送连接配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StreamConfig {
    #[validate(url)]
    pub url: String,
    /// 监控的世界标识
    #[validate(length(min = 1))]
    pub world: String,
    /// 监控模式名称，决定快照/增量消息的数据键
    #[validate(length(min = 1))]
    pub mode: String,
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,
    #[validate(range(min = 1))]
    pub heartbeat_timeout_secs: u64,
    /// 静默多久后主动续期凭据
    #[validate(range(min = 1))]
    pub silence_refresh_secs: u64,
    #[validate(range(min = 1))]
    pub reconnect_base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub reconnect_max_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_reconnect_attempts: u32,
}

/// REST 接口配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApiConfig {
    #[validate(url)]
    pub base_url: String,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

/// 凭据续期配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthConfig {
    #[validate(length(min = 1))]
    pub refresh_path: String,
    /// 备用方案使用的自定义请求头
    #[validate(length(min = 1))]
    pub fallback_header: String,
    #[validate(range(min = 1))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub retry_base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub retry_max_delay_ms: u64,
}

/// 初始会话凭据（通常来自环境变量）
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// 无法从令牌中解析用户时使用
    #[serde(default)]
    pub user_id: Option<String>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// 名单合并配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReconcilerConfig {
    /// 待处理消息队列上限，超出后丢弃最旧的
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    /// 合并突发增量的帧间隔
    #[validate(range(min = 1))]
    pub frame_interval_ms: u64,
    /// 在线时长刷新周期
    #[validate(range(min = 1))]
    pub tick_interval_ms: u64,
}

/// 告警配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub cooldown_ms: u64,
    /// 上线超过该时长的成员不再计入
    pub max_login_age_secs: u64,
    /// 规则累计状态的持久化文件
    #[serde(default)]
    pub state_file: Option<String>,
    #[serde(default)]
    pub rules: Vec<AlertRuleConfig>,
}

/// 单条告警规则配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub id: String,
    pub sound_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub threshold: u32,
    pub time_range_minutes: u32,
}

fn default_enabled() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".into(),
            world: "default".into(),
            mode: "enemy".into(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 45,
            silence_refresh_secs: 30,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".into(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: "/auth/refresh".into(),
            fallback_header: "X-Refresh-Token".into(),
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 8_000,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 200,
            frame_interval_ms: 16,
            tick_interval_ms: 1_000,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            max_login_age_secs: 180,
            state_file: None,
            rules: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            api: ApiConfig::default(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            reconciler: ReconcilerConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn silence_refresh(&self) -> Duration {
        Duration::from_secs(self.silence_refresh_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AuthConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl ReconcilerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl AlertsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_login_age(&self) -> Duration {
        Duration::from_secs(self.max_login_age_secs)
    }
}

impl AppConfig {
    /// 按 默认值 -> 配置文件 -> 环境变量 的顺序加载并验证
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed("APP_").split("__"));

        let cfg: AppConfig = fig.extract().map_err(Box::new)?;
        cfg.validate_all()?;
        Ok(cfg)
    }

    /// 从 TOML/YAML/JSON 字符串解析，未给出的字段使用默认值
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let base = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        let trimmed = s.trim_start();
        let fig = if trimmed.starts_with('{') {
            base.merge(Json::string(s))
        } else if trimmed.starts_with('[') || s.contains('=') {
            base.merge(Toml::string(s))
        } else {
            base.merge(Yaml::string(s))
        };
        let cfg: AppConfig = fig.extract().map_err(Box::new)?;
        cfg.validate_all()?;
        Ok(cfg)
    }

    /// 字段校验加跨字段校验
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.stream.reconnect_max_delay_ms < self.stream.reconnect_base_delay_ms {
            return Err(ConfigError::InvalidStreamConfig(
                "reconnect_max_delay_ms must not be below reconnect_base_delay_ms".to_string(),
            ));
        }
        if self.auth.retry_max_delay_ms < self.auth.retry_base_delay_ms {
            return Err(ConfigError::InvalidAuthConfig(
                "retry_max_delay_ms must not be below retry_base_delay_ms".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for rule in &self.alerts.rules {
            if rule.id.trim().is_empty() {
                return Err(ConfigError::InvalidAlertRule("rule id cannot be empty".into()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::InvalidAlertRule(format!(
                    "duplicate rule id: {}",
                    rule.id
                )));
            }
            if rule.threshold == 0 || rule.time_range_minutes == 0 {
                return Err(ConfigError::InvalidAlertRule(format!(
                    "rule {} needs threshold and time_range_minutes above 0",
                    rule.id
                )));
            }
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Invalid stream configuration: {0}")]
    InvalidStreamConfig(String),
    #[error("Invalid auth configuration: {0}")]
    InvalidAuthConfig(String),
    #[error("Invalid alert rule: {0}")]
    InvalidAlertRule(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate_all().is_ok());
        assert_eq!(config.stream.max_reconnect_attempts, 5);
        assert_eq!(config.stream.heartbeat_timeout(), Duration::from_secs(45));
        assert_eq!(config.reconciler.queue_capacity, 200);
        assert_eq!(config.alerts.cooldown(), Duration::from_secs(30));
        assert_eq!(config.alerts.max_login_age(), Duration::from_secs(180));
    }

    #[test]
    fn test_from_toml_merges_over_defaults() {
        let config = AppConfig::from_str(
            r#"
            [stream]
            url = "wss://monitor.example.com/ws"
            world = "Antica"

            [[alerts.rules]]
            id = "raid"
            sound_id = "horn"
            threshold = 3
            time_range_minutes = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.world, "Antica");
        assert_eq!(config.stream.mode, "enemy");
        assert_eq!(config.alerts.rules.len(), 1);
        assert!(config.alerts.rules[0].enabled);
    }

    #[test]
    fn test_from_yaml() {
        let config = AppConfig::from_str(
            "stream:\n  world: Secura\n  max_reconnect_attempts: 8\n",
        )
        .unwrap();
        assert_eq!(config.stream.world, "Secura");
        assert_eq!(config.stream.max_reconnect_attempts, 8);
    }

    #[test]
    fn test_duplicate_rule_ids_rejected() {
        let mut config = AppConfig::default();
        let rule = AlertRuleConfig {
            id: "raid".into(),
            sound_id: "horn".into(),
            enabled: true,
            threshold: 2,
            time_range_minutes: 5,
        };
        config.alerts.rules = vec![rule.clone(), rule];
        let err = config.validate_all().unwrap_err();
        assert!(err.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn test_field_validation() {
        let mut config = AppConfig::default();
        config.stream.url = "not a url".into();
        assert!(matches!(
            config.validate_all(),
            Err(ConfigError::Validation(_))
        ));

        let mut config = AppConfig::default();
        config.stream.reconnect_max_delay_ms = 10;
        assert!(matches!(
            config.validate_all(),
            Err(ConfigError::InvalidStreamConfig(_))
        ));
    }

    #[test]
    fn test_load_reads_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "client.toml",
                r#"
                [stream]
                world = "Refugia"
                "#,
            )?;
            jail.set_env("APP_CONFIG_FILE", "client.toml");
            jail.set_env("APP_STREAM__MODE", "ally");
            jail.set_env("APP_SESSION__REFRESH_TOKEN", "r-token");

            let config = AppConfig::load().map_err(|err| err.to_string())?;
            assert_eq!(config.stream.world, "Refugia");
            assert_eq!(config.stream.mode, "ally");
            assert_eq!(config.session.refresh_token, "r-token");
            assert!(!format!("{:?}", config.session).contains("r-token"));
            Ok(())
        });
    }
}
