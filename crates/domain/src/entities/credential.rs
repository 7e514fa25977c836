//! 访问凭据实体
//!
//! 凭据整体替换，不做部分更新。令牌载荷只用于读取身份和过期时间，
//! 不在客户端校验签名。

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::{DomainError, DomainResult};

/// 访问凭据
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// 访问令牌过期时间（来自令牌的 `exp` 声明）
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// 创建凭据，过期时间从访问令牌中读取
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = TokenClaims::decode(&access_token)
            .ok()
            .and_then(|claims| claims.expires_at());
        Self {
            access_token,
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// 访问令牌在给定时间是否已过期，无过期信息时视为未过期
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// 续期接口返回的令牌对
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenPair {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenPair {
    /// 校验两个令牌都存在且非空，再转换为凭据
    pub fn into_credential(self) -> DomainResult<Credential> {
        let access = self
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| DomainError::invalid_credential("响应缺少 access_token"))?;
        let refresh = self
            .refresh_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| DomainError::invalid_credential("响应缺少 refresh_token"))?;
        Ok(Credential::new(access, refresh))
    }
}

/// 令牌载荷中客户端关心的声明
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub sub: Option<Value>,
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// 解码令牌载荷（不校验签名和过期）
    pub fn decode(token: &str) -> DomainResult<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|err| DomainError::invalid_credential(format!("令牌解析失败: {err}")))
    }

    /// 用户标识，优先 `user_id`，其次 `sub`
    pub fn subject(&self) -> Option<String> {
        [self.user_id.as_ref(), self.sub.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }
}

/// 从令牌载荷中恢复用户标识
pub fn extract_user_id(token: &str) -> Option<String> {
    TokenClaims::decode(token).ok()?.subject()
}
