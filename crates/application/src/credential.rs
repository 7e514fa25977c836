//! 凭据续期协调器
//!
//! 推送客户端和普通出站请求共用同一个实例。每个用户同一时间最多只有一个
//! 续期请求在途，并发调用方共享同一个结果。续期在独立任务中执行，
//! 不受调用方取消或推送连接生命周期影响。

use domain::{Credential, TokenPair};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::backoff::{retry_async, Backoff, RetryConfig};
use crate::error::{RefreshError, RenewalError};
use crate::ports::{RenewalScheme, RenewalTransport, SessionTerminator};

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<Credential>, RefreshError>>>;

/// 续期重试策略
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl From<&config::AuthConfig> for RefreshPolicy {
    fn from(config: &config::AuthConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }
}

impl RefreshPolicy {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries.max(1),
            backoff: Backoff::exponential(self.base_delay).with_max(self.max_delay),
        }
    }
}

/// 续期结果通知
#[derive(Debug, Clone)]
pub enum CredentialEvent {
    Renewed {
        user_id: String,
        credential: Arc<Credential>,
    },
    Failed {
        user_id: String,
        error: RefreshError,
    },
}

struct InFlight {
    id: u64,
    future: SharedRefresh,
    attempt: Arc<AtomicU32>,
    abort: AbortHandle,
}

struct Inner {
    transport: Arc<dyn RenewalTransport>,
    terminator: Arc<dyn SessionTerminator>,
    policy: RefreshPolicy,
    in_flight: Mutex<HashMap<String, InFlight>>,
    credentials: RwLock<HashMap<String, Arc<Credential>>>,
    events: broadcast::Sender<CredentialEvent>,
    next_id: AtomicU64,
}

/// 单飞续期协调器，克隆后共享同一份状态
#[derive(Clone)]
pub struct CredentialCoordinator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CredentialCoordinator {
    pub fn new(
        transport: Arc<dyn RenewalTransport>,
        terminator: Arc<dyn SessionTerminator>,
        policy: RefreshPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                transport,
                terminator,
                policy,
                in_flight: Mutex::new(HashMap::new()),
                credentials: RwLock::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// 从令牌载荷中恢复用户标识
    pub fn extract_user_id(&self, token: &str) -> Option<String> {
        domain::extract_user_id(token)
    }

    /// 登记用户当前凭据（整体替换）
    pub fn install(&self, user_id: &str, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        self.inner
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), credential.clone());
        credential
    }

    pub fn current(&self, user_id: &str) -> Option<Arc<Credential>> {
        self.inner
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_refreshing(&self, user_id: &str) -> bool {
        lock(&self.inner.in_flight).contains_key(user_id)
    }

    /// 在途续期当前的尝试序号，没有在途续期时为 `None`
    pub fn retry_attempt(&self, user_id: &str) -> Option<u32> {
        lock(&self.inner.in_flight)
            .get(user_id)
            .map(|flight| flight.attempt.load(Ordering::SeqCst))
    }

    /// 续期用户凭据
    ///
    /// 已有在途续期时直接等待其结果，不会发起新的网络请求。
    pub async fn refresh(
        &self,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<Arc<Credential>, RefreshError> {
        let future = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(existing) = in_flight.get(user_id) {
                tracing::debug!(user_id = %user_id, "joining in-flight credential renewal");
                existing.future.clone()
            } else {
                if refresh_token.trim().is_empty() {
                    return Err(RefreshError::MissingRefreshToken {
                        user_id: user_id.to_string(),
                    });
                }

                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let attempt = Arc::new(AtomicU32::new(0));
                // 持有锁期间启动并登记，任务的清理步骤一定能看到这条记录
                let handle = tokio::spawn(Inner::run_renewal(
                    self.inner.clone(),
                    user_id.to_string(),
                    refresh_token.to_string(),
                    id,
                    attempt.clone(),
                ));
                let abort = handle.abort_handle();
                let cancelled_user = user_id.to_string();
                let future: SharedRefresh = async move {
                    handle.await.unwrap_or_else(|_| {
                        Err(RefreshError::Cancelled {
                            user_id: cancelled_user,
                        })
                    })
                }
                .boxed()
                .shared();

                in_flight.insert(
                    user_id.to_string(),
                    InFlight {
                        id,
                        future: future.clone(),
                        attempt,
                        abort,
                    },
                );
                tracing::info!(user_id = %user_id, "starting credential renewal");
                future
            }
        };
        future.await
    }

    /// 使用已登记的刷新令牌续期
    pub async fn refresh_current(&self, user_id: &str) -> Result<Arc<Credential>, RefreshError> {
        let refresh_token = self
            .current(user_id)
            .map(|credential| credential.refresh_token.clone())
            .unwrap_or_default();
        self.refresh(user_id, &refresh_token).await
    }

    /// 清除用户的凭据与在途续期（登出时调用），可重复调用
    pub fn clear(&self, user_id: &str) {
        let flight = lock(&self.inner.in_flight).remove(user_id);
        if let Some(flight) = flight {
            flight.abort.abort();
        }
        self.inner
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
    }
}

/// 续期任务结束时移除在途记录
struct FlightGuard {
    inner: Arc<Inner>,
    user_id: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.get(&self.user_id).is_some_and(|flight| flight.id == self.id) {
            in_flight.remove(&self.user_id);
        }
    }
}

impl Inner {
    async fn run_renewal(
        self: Arc<Self>,
        user_id: String,
        refresh_token: String,
        id: u64,
        attempt: Arc<AtomicU32>,
    ) -> Result<Arc<Credential>, RefreshError> {
        let _guard = FlightGuard {
            inner: self.clone(),
            user_id: user_id.clone(),
            id,
        };

        let config = self.policy.retry_config();
        let result = retry_async(&config, |err: &RenewalError| !err.is_rejection(), |n| {
            attempt.store(n, Ordering::SeqCst);
            self.attempt_once(&user_id, &refresh_token, n)
        })
        .await;

        match result {
            Ok(credential) => {
                let credential = Arc::new(credential);
                self.credentials
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(user_id.clone(), credential.clone());
                tracing::info!(user_id = %user_id, "credential renewed");
                let _ = self.events.send(CredentialEvent::Renewed {
                    user_id,
                    credential: credential.clone(),
                });
                Ok(credential)
            }
            Err((err, attempts)) => {
                let error = if err.is_rejection() {
                    RefreshError::Rejected {
                        user_id: user_id.clone(),
                    }
                } else {
                    RefreshError::Exhausted {
                        user_id: user_id.clone(),
                        attempts,
                        last_error: err.to_string(),
                    }
                };
                self.fail(&user_id, &error);
                Err(error)
            }
        }
    }

    /// 一次尝试：先用主方案，失败后再用备用方案
    async fn attempt_once(
        &self,
        user_id: &str,
        refresh_token: &str,
        attempt: u32,
    ) -> Result<Credential, RenewalError> {
        match self.renew_with(refresh_token, RenewalScheme::Bearer).await {
            Ok(credential) => Ok(credential),
            Err(primary) => {
                tracing::warn!(
                    user_id = %user_id,
                    attempt,
                    error = %primary,
                    "primary renewal scheme failed, trying fallback header"
                );
                self.renew_with(refresh_token, RenewalScheme::CustomHeader)
                    .await
                    .inspect_err(|fallback| {
                        tracing::warn!(
                            user_id = %user_id,
                            attempt,
                            error = %fallback,
                            "fallback renewal scheme failed"
                        );
                    })
            }
        }
    }

    async fn renew_with(
        &self,
        refresh_token: &str,
        scheme: RenewalScheme,
    ) -> Result<Credential, RenewalError> {
        let pair: TokenPair = self.transport.renew(refresh_token, scheme).await?;
        pair.into_credential()
            .map_err(|err| RenewalError::Malformed(err.to_string()))
    }

    /// 续期彻底失败：清除缓存、通知监听方、强制登出
    fn fail(&self, user_id: &str, error: &RefreshError) {
        tracing::error!(user_id = %user_id, error = %error, "credential renewal failed, signing out");
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
        let _ = self.events.send(CredentialEvent::Failed {
            user_id: user_id.to_string(),
            error: error.clone(),
        });
        self.terminator
            .terminate(user_id, "session expired, please log in again");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// 按脚本返回结果的续期接口替身
    struct ScriptedRenewal {
        calls: AtomicUsize,
        schemes: Mutex<Vec<RenewalScheme>>,
        script: Mutex<Vec<Result<TokenPair, RenewalError>>>,
        latency: Duration,
    }

    impl ScriptedRenewal {
        fn new(script: Vec<Result<TokenPair, RenewalError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                schemes: Mutex::new(Vec::new()),
                script: Mutex::new(script.into_iter().rev().collect()),
                latency: Duration::from_millis(50),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RenewalTransport for ScriptedRenewal {
        async fn renew(
            &self,
            _refresh_token: &str,
            scheme: RenewalScheme,
        ) -> Result<TokenPair, RenewalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.schemes).push(scheme);
            tokio::time::sleep(self.latency).await;
            lock(&self.script)
                .pop()
                .unwrap_or(Err(RenewalError::Status { status: 503 }))
        }
    }

    #[derive(Default)]
    struct RecordingTerminator {
        terminated: Mutex<Vec<String>>,
    }

    impl SessionTerminator for RecordingTerminator {
        fn terminate(&self, user_id: &str, _reason: &str) {
            lock(&self.terminated).push(user_id.to_string());
        }
    }

    fn pair(access: &str, refresh: &str) -> Result<TokenPair, RenewalError> {
        Ok(TokenPair {
            access_token: Some(access.to_string()),
            refresh_token: Some(refresh.to_string()),
        })
    }

    fn coordinator(
        renewal: Arc<ScriptedRenewal>,
    ) -> (CredentialCoordinator, Arc<RecordingTerminator>) {
        let terminator = Arc::new(RecordingTerminator::default());
        let coordinator =
            CredentialCoordinator::new(renewal, terminator.clone(), RefreshPolicy::default());
        (coordinator, terminator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_request() {
        let renewal = ScriptedRenewal::new(vec![pair("a2", "r2")]);
        let (coordinator, _) = coordinator(renewal.clone());

        let callers = (0..5).map(|_| coordinator.refresh("u1", "r1"));
        let results = futures::future::join_all(callers).await;

        assert_eq!(renewal.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().access_token, "a2");
        }
        assert!(!coordinator.is_refreshing("u1"));
        assert_eq!(coordinator.current("u1").unwrap().refresh_token, "r2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_custom_header() {
        let renewal = ScriptedRenewal::new(vec![
            Err(RenewalError::Status { status: 400 }),
            pair("a2", "r2"),
        ]);
        let (coordinator, terminator) = coordinator(renewal.clone());

        let credential = coordinator.refresh("u1", "r1").await.unwrap();

        assert_eq!(credential.access_token, "a2");
        assert_eq!(
            *lock(&renewal.schemes),
            vec![RenewalScheme::Bearer, RenewalScheme::CustomHeader]
        );
        assert!(lock(&terminator.terminated).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_is_retried() {
        let malformed = Ok(TokenPair {
            access_token: Some("a2".into()),
            refresh_token: None,
        });
        let renewal = ScriptedRenewal::new(vec![
            malformed.clone(),
            malformed,
            pair("a3", "r3"),
        ]);
        let (coordinator, _) = coordinator(renewal.clone());

        let started = tokio::time::Instant::now();
        let credential = coordinator.refresh("u1", "r1").await.unwrap();

        assert_eq!(credential.access_token, "a3");
        assert_eq!(renewal.calls(), 3);
        // 两次请求延迟加上第一次失败后的 1 秒退避
        assert_eq!(started.elapsed(), Duration::from_millis(1150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_signs_out_without_retrying() {
        let renewal = ScriptedRenewal::new(vec![
            Err(RenewalError::Rejected { status: 401 }),
            Err(RenewalError::Rejected { status: 403 }),
        ]);
        let (coordinator, terminator) = coordinator(renewal.clone());
        coordinator.install("u1", Credential::new("a1", "r1"));
        let mut events = coordinator.subscribe();

        let err = coordinator.refresh("u1", "r1").await.unwrap_err();

        assert_eq!(
            err,
            RefreshError::Rejected {
                user_id: "u1".into()
            }
        );
        assert_eq!(renewal.calls(), 2);
        assert!(coordinator.current("u1").is_none());
        assert_eq!(*lock(&terminator.terminated), vec!["u1".to_string()]);
        assert!(matches!(
            events.recv().await.unwrap(),
            CredentialEvent::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_then_state_resets() {
        let renewal = ScriptedRenewal::new(Vec::new());
        let (coordinator, terminator) = coordinator(renewal.clone());

        let err = coordinator.refresh("u1", "r1").await.unwrap_err();
        assert!(matches!(err, RefreshError::Exhausted { attempts: 3, .. }));
        // 每次尝试都走主方案和备用方案
        assert_eq!(renewal.calls(), 6);
        assert_eq!(lock(&terminator.terminated).len(), 1);
        assert!(!coordinator.is_refreshing("u1"));

        lock(&renewal.script).push(pair("a2", "r2"));
        let credential = coordinator.refresh("u1", "r1").await.unwrap();
        assert_eq!(credential.access_token, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_refresh_independently() {
        let renewal = ScriptedRenewal::new(vec![pair("a", "r"), pair("b", "r")]);
        let (coordinator, _) = coordinator(renewal.clone());

        let (first, second) = tokio::join!(
            coordinator.refresh("u1", "r1"),
            coordinator.refresh("u2", "r2")
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(renewal.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_refresh_token_and_clear() {
        let renewal = ScriptedRenewal::new(Vec::new());
        let (coordinator, _) = coordinator(renewal.clone());

        let err = coordinator.refresh_current("u1").await.unwrap_err();
        assert!(matches!(err, RefreshError::MissingRefreshToken { .. }));
        assert_eq!(renewal.calls(), 0);

        coordinator.install("u1", Credential::new("a1", "r1"));
        coordinator.clear("u1");
        coordinator.clear("u1");
        assert!(coordinator.current("u1").is_none());
    }
}
