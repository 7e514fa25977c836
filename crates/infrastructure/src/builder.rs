use std::sync::Arc;

use application::CredentialCoordinator;
use config::AppConfig;
use reqwest::{Client, Url};
use thiserror::Error;

use crate::{
    alert_store::JsonFileAlertStore, authorized::AuthorizedHttpClient, renewal::HttpRenewalClient,
    roster_gateway::HttpRosterGateway, ws_transport::WebSocketTransport,
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

fn parse_url(url: &str) -> Result<Url, InfrastructureError> {
    Url::parse(url).map_err(|err| InfrastructureError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })
}

/// 按配置构建的外部适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub http: Client,
    pub api_base: Url,
    pub renewal: Arc<HttpRenewalClient>,
    pub stream: Arc<WebSocketTransport>,
    pub alert_store: Option<Arc<JsonFileAlertStore>>,
}

impl Infrastructure {
    pub fn build(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let http = Client::builder()
            .timeout(config.api.request_timeout())
            .build()?;
        let api_base = parse_url(&config.api.base_url)?;

        let mut endpoint = api_base.clone();
        endpoint
            .path_segments_mut()
            .map_err(|_| InfrastructureError::InvalidUrl {
                url: config.api.base_url.clone(),
                reason: "cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(config.auth.refresh_path.split('/').filter(|s| !s.is_empty()));

        let renewal = Arc::new(HttpRenewalClient::new(
            http.clone(),
            endpoint,
            config.auth.fallback_header.clone(),
        ));
        let alert_store = config
            .alerts
            .state_file
            .as_ref()
            .map(|path| Arc::new(JsonFileAlertStore::new(path)));

        tracing::debug!(api_base = %api_base, "infrastructure adapters built");
        Ok(Self {
            http,
            api_base,
            renewal,
            stream: Arc::new(WebSocketTransport::new()),
            alert_store,
        })
    }

    /// 以指定用户身份发送名单修改请求
    pub fn roster_gateway(
        &self,
        coordinator: CredentialCoordinator,
        user_id: impl Into<String>,
    ) -> Arc<HttpRosterGateway> {
        let client = AuthorizedHttpClient::new(self.http.clone(), coordinator, user_id);
        Arc::new(HttpRosterGateway::new(client, self.api_base.clone()))
    }
}
