use application::{
    CredentialCoordinator, MutationError, RefreshError, RefreshPolicy, RenewalError,
    RenewalScheme, RenewalTransport, RosterMutationGateway, SessionTerminator,
};
use domain::Credential;
use infrastructure::{AuthorizedHttpClient, HttpRenewalClient, HttpRosterGateway};
use reqwest::{Client, Url};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingTerminator {
    terminated: Mutex<Vec<String>>,
}

impl SessionTerminator for RecordingTerminator {
    fn terminate(&self, user_id: &str, _reason: &str) {
        self.terminated.lock().unwrap().push(user_id.to_string());
    }
}

fn renewal_client(server: &MockServer) -> Arc<HttpRenewalClient> {
    let endpoint = Url::parse(&format!("{}/api/auth/refresh", server.uri())).unwrap();
    Arc::new(HttpRenewalClient::new(
        Client::new(),
        endpoint,
        "X-Refresh-Token",
    ))
}

fn tokens(access: &str, refresh: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": access,
        "refresh_token": refresh,
    }))
}

fn fast_policy() -> RefreshPolicy {
    RefreshPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

#[tokio::test]
async fn test_renewal_uses_bearer_then_custom_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(header("authorization", "Bearer r1"))
        .respond_with(tokens("a2", "r2"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(header("x-refresh-token", "r1"))
        .respond_with(tokens("a3", "r3"))
        .expect(1)
        .mount(&server)
        .await;

    let client = renewal_client(&server);
    let bearer = client.renew("r1", RenewalScheme::Bearer).await.unwrap();
    assert_eq!(bearer.access_token.as_deref(), Some("a2"));
    let custom = client
        .renew("r1", RenewalScheme::CustomHeader)
        .await
        .unwrap();
    assert_eq!(custom.refresh_token.as_deref(), Some("r3"));
}

#[tokio::test]
async fn test_renewal_maps_status_codes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer revoked"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer garbled"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let client = renewal_client(&server);
    assert!(matches!(
        client.renew("revoked", RenewalScheme::Bearer).await,
        Err(RenewalError::Rejected { status: 401 })
    ));
    assert!(matches!(
        client.renew("busy", RenewalScheme::Bearer).await,
        Err(RenewalError::Status { status: 503 })
    ));
    assert!(matches!(
        client.renew("garbled", RenewalScheme::Bearer).await,
        Err(RenewalError::Malformed(_))
    ));
}

#[tokio::test]
async fn test_coordinator_falls_back_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer r1"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("x-refresh-token", "r1"))
        .respond_with(tokens("a2", "r2"))
        .expect(1)
        .mount(&server)
        .await;

    let terminator = Arc::new(RecordingTerminator::default());
    let coordinator =
        CredentialCoordinator::new(renewal_client(&server), terminator.clone(), fast_policy());
    let (first, second) = tokio::join!(
        coordinator.refresh("u1", "r1"),
        coordinator.refresh("u1", "r1")
    );
    assert_eq!(first.unwrap().access_token, "a2");
    assert_eq!(second.unwrap().access_token, "a2");
    assert!(terminator.terminated.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_coordinator_signs_out_when_refresh_token_revoked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&server)
        .await;

    let terminator = Arc::new(RecordingTerminator::default());
    let coordinator =
        CredentialCoordinator::new(renewal_client(&server), terminator.clone(), fast_policy());
    coordinator.install("u1", Credential::new("a1", "r1"));

    let err = coordinator.refresh_current("u1").await.unwrap_err();
    assert_eq!(
        err,
        RefreshError::Rejected {
            user_id: "u1".to_string()
        }
    );
    assert!(coordinator.current("u1").is_none());
    assert_eq!(*terminator.terminated.lock().unwrap(), ["u1"]);
}

#[tokio::test]
async fn test_gateway_retries_once_after_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/guild/members/Sir%20Bob/local"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(header("authorization", "Bearer r1"))
        .respond_with(tokens("fresh", "r2"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/guild/members/Sir%20Bob/local"))
        .and(header("authorization", "Bearer fresh"))
        .and(body_json(json!({ "local": "depot" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = CredentialCoordinator::new(
        renewal_client(&server),
        Arc::new(RecordingTerminator::default()),
        fast_policy(),
    );
    coordinator.install("u1", Credential::new("stale", "r1"));
    let api_base = Url::parse(&format!("{}/api", server.uri())).unwrap();
    let gateway = HttpRosterGateway::new(
        AuthorizedHttpClient::new(Client::new(), coordinator.clone(), "u1"),
        api_base,
    );

    gateway.update_local("Sir Bob", "depot").await.unwrap();
    assert_eq!(coordinator.current("u1").unwrap().access_token, "fresh");
}

#[tokio::test]
async fn test_gateway_reports_failed_classification_update() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/guild/members/Alice/kind"))
        .and(body_json(json!({ "kind": "maker" })))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = CredentialCoordinator::new(
        renewal_client(&server),
        Arc::new(RecordingTerminator::default()),
        fast_policy(),
    );
    coordinator.install("u1", Credential::new("a1", "r1"));
    let api_base = Url::parse(&format!("{}/api/", server.uri())).unwrap();
    let gateway = HttpRosterGateway::new(
        AuthorizedHttpClient::new(Client::new(), coordinator, "u1"),
        api_base,
    );

    let err = gateway
        .update_classification("Alice", "maker")
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::Request(message) if message.contains("500")));
}
