use application::{RenewalError, RenewalScheme, RenewalTransport};
use async_trait::async_trait;
use domain::TokenPair;
use reqwest::{Client, StatusCode, Url};

/// 凭据续期接口的 HTTP 实现
#[derive(Debug, Clone)]
pub struct HttpRenewalClient {
    http: Client,
    endpoint: Url,
    fallback_header: String,
}

impl HttpRenewalClient {
    pub fn new(http: Client, endpoint: Url, fallback_header: impl Into<String>) -> Self {
        Self {
            http,
            endpoint,
            fallback_header: fallback_header.into(),
        }
    }
}

#[async_trait]
impl RenewalTransport for HttpRenewalClient {
    async fn renew(
        &self,
        refresh_token: &str,
        scheme: RenewalScheme,
    ) -> Result<TokenPair, RenewalError> {
        let request = self.http.post(self.endpoint.clone());
        let request = match scheme {
            RenewalScheme::Bearer => request.bearer_auth(refresh_token),
            RenewalScheme::CustomHeader => request.header(self.fallback_header.as_str(), refresh_token),
        };

        let response = request
            .send()
            .await
            .map_err(|err| RenewalError::Network(err.to_string()))?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(RenewalError::Rejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(RenewalError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|err| RenewalError::Malformed(err.to_string()))
    }
}
