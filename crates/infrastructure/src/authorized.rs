//! 带访问令牌的出站请求层
//!
//! 收到 401 时通过共享的续期协调器刷新凭据，然后重试一次。

use application::{CredentialCoordinator, RefreshError};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorizedRequestError {
    #[error("no credential installed for user {0}")]
    NoCredential(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

#[derive(Clone)]
pub struct AuthorizedHttpClient {
    http: Client,
    coordinator: CredentialCoordinator,
    user_id: String,
}

impl AuthorizedHttpClient {
    pub fn new(http: Client, coordinator: CredentialCoordinator, user_id: impl Into<String>) -> Self {
        Self {
            http,
            coordinator,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// 发送请求；`build` 可能被调用两次
    pub async fn send<F>(&self, build: F) -> Result<Response, AuthorizedRequestError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let credential = self
            .coordinator
            .current(&self.user_id)
            .ok_or_else(|| AuthorizedRequestError::NoCredential(self.user_id.clone()))?;

        let response = build(&self.http)
            .bearer_auth(&credential.access_token)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!(user_id = %self.user_id, "request unauthorized, renewing credential");
        let renewed = self.coordinator.refresh_current(&self.user_id).await?;
        let response = build(&self.http)
            .bearer_auth(&renewed.access_token)
            .send()
            .await?;
        Ok(response)
    }
}
