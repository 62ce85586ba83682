//! 自包含访问令牌验证
//!
//! [`JwtAccessTokenVerifier`] 为内省端点验证本服务签发的 JWT 访问令牌：
//! 签名、签发者与有效期。有效期按注入的 [`Clock`] 判断。
//!
//! ```rust
//! use grantrs::jwt::JwtAccessTokenVerifier;
//!
//! let verifier = JwtAccessTokenVerifier::hmac(b"my-secret-key-at-least-32-bytes!", "https://auth.example.com");
//! assert_eq!(verifier.issuer(), "https://auth.example.com");
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::clock::{Clock, system_clock};
use crate::context::CallContext;
use crate::error::{CryptoError, Error, Result};
use crate::grant::{AccessTokenType, Token};
use crate::introspection::AccessTokenVerifier;

/// 字符串或字符串数组形式的声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    /// scope 声明按空格拆分
    fn into_scopes(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => value.split_whitespace().map(str::to_string).collect(),
            OneOrMany::Many(values) => values,
        }
    }

    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// 访问令牌中的 `cnf`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(rename = "x5t#S256")]
    pub x5t_s256: String,
}

/// JWT 访问令牌声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub client_id: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AccessTokenClaims {
    /// 转换为令牌内容；时间戳无效时返回 `None`
    pub fn into_token(self) -> Option<Token> {
        let creation_time = DateTime::<Utc>::from_timestamp(self.iat, 0)?;
        let mut token = Token::new(
            self.iss,
            self.client_id,
            self.scope.map(OneOrMany::into_scopes).unwrap_or_default(),
            creation_time,
            self.exp - self.iat,
        )
        .with_type(AccessTokenType::Jwt);
        token.subject_id = self.sub;
        token.session_id = self.sid;
        token.audiences = self.aud.map(OneOrMany::into_vec).unwrap_or_default();
        token.confirmation = self.cnf.map(|cnf| cnf.x5t_s256);
        token.claims = self.extra;
        Some(token)
    }
}

/// JWT 访问令牌验证器
#[derive(Clone)]
pub struct JwtAccessTokenVerifier {
    key: DecodingKey,
    algorithms: Vec<Algorithm>,
    issuer: String,
    clock: Arc<dyn Clock>,
}

impl JwtAccessTokenVerifier {
    /// 使用 HMAC 密钥（HS256）
    pub fn hmac(secret: &[u8], issuer: impl Into<String>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            algorithms: vec![Algorithm::HS256],
            issuer: issuer.into(),
            clock: system_clock(),
        }
    }

    /// 使用 RSA 公钥（RS256/RS384/RS512）
    pub fn rsa_pem(public_key_pem: &[u8], issuer: impl Into<String>) -> Result<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
        Ok(Self {
            key,
            algorithms: vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512],
            issuer: issuer.into(),
            clock: system_clock(),
        })
    }

    /// 使用 EC 公钥（ES256/ES384）
    pub fn ec_pem(public_key_pem: &[u8], issuer: impl Into<String>) -> Result<Self> {
        let key = DecodingKey::from_ec_pem(public_key_pem)
            .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
        Ok(Self {
            key,
            algorithms: vec![Algorithm::ES256, Algorithm::ES384],
            issuer: issuer.into(),
            clock: system_clock(),
        })
    }

    /// 限定接受的算法
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithms.first().copied().unwrap_or_default());
        validation.algorithms = self.algorithms.clone();
        validation.set_issuer(&[self.issuer.as_str()]);
        // 受众由内省的 scope 交集决定，有效期按注入的时钟判断
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation
    }

    /// 同步验证
    pub fn verify_token(&self, token: &str) -> Option<Token> {
        let data = match decode::<AccessTokenClaims>(token, &self.key, &self.validation()) {
            Ok(data) => data,
            Err(err) => {
                debug!(error = %err, "JWT rejected");
                return None;
            }
        };

        let now = self.clock.now().timestamp();
        if data.claims.exp <= now {
            debug!("JWT expired");
            return None;
        }
        data.claims.into_token()
    }
}

impl std::fmt::Debug for JwtAccessTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAccessTokenVerifier")
            .field("algorithms", &self.algorithms)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AccessTokenVerifier for JwtAccessTokenVerifier {
    async fn verify(&self, _ctx: &CallContext, token: &str) -> Result<Option<Token>> {
        Ok(self.verify_token(token))
    }
}
