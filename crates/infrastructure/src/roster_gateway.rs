use application::{MutationError, RosterMutationGateway};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;

use crate::authorized::AuthorizedHttpClient;

/// 名单修改接口：`PATCH {api}/guild/members/{name}/{field}`
#[derive(Clone)]
pub struct HttpRosterGateway {
    client: AuthorizedHttpClient,
    api_base: Url,
}

impl HttpRosterGateway {
    pub fn new(client: AuthorizedHttpClient, api_base: Url) -> Self {
        Self { client, api_base }
    }

    /// 成员名称作为单独的路径段编码
    pub fn member_url(&self, name: &str, field: &str) -> Result<Url, MutationError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| MutationError::Request(format!("api base {} cannot be a base", self.api_base)))?
            .pop_if_empty()
            .extend(["guild", "members", name, field]);
        Ok(url)
    }

    async fn patch(
        &self,
        name: &str,
        field: &str,
        body: serde_json::Value,
    ) -> Result<(), MutationError> {
        let url = self.member_url(name, field)?;
        let response = self
            .client
            .send(|http| http.patch(url.clone()).json(&body))
            .await
            .map_err(|err| MutationError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MutationError::Request(format!(
                "{field} update for {name} returned status {status}"
            )));
        }
        tracing::debug!(member = %name, field, "roster update accepted");
        Ok(())
    }
}

#[async_trait]
impl RosterMutationGateway for HttpRosterGateway {
    async fn update_local(&self, name: &str, local: &str) -> Result<(), MutationError> {
        self.patch(name, "local", json!({ "local": local })).await
    }

    async fn update_classification(&self, name: &str, kind: &str) -> Result<(), MutationError> {
        self.patch(name, "kind", json!({ "kind": kind })).await
    }
}
