//! 令牌签发
//!
//! [`TokenService`] 决定令牌的内容与形态：引用令牌写入 grant 存储并返回 handle，
//! 自包含令牌交给 [`TokenIssuer`] 协作者签名。签名算法与密钥管理不在本 crate 内。

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::client::Client;
use crate::context::CallContext;
use crate::error::Result;
use crate::grant::{
    AccessTokenType, Grant, GrantPayload, RefreshTokenExpiration, RefreshTokenPayload, Token,
};
use crate::resources::Resources;
use crate::store::GrantRepository;

/// ID Token 的签发输入
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityTokenRequest {
    pub issuer: String,
    pub subject_id: String,
    pub client_id: String,
    pub session_id: Option<String>,
    pub nonce: Option<String>,
    pub auth_time: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub creation_time: DateTime<Utc>,
    pub lifetime: i64,
    /// 同一响应中的访问令牌（用于 `at_hash`）
    pub access_token: Option<String>,
    /// 同一响应中的授权码（用于 `c_hash`）
    pub authorization_code: Option<String>,
    /// `s_hash` 的值，见 [`left_half_hash`]
    pub state_hash: Option<String>,
    pub signing_algorithms: Vec<String>,
}

/// 签名协作者
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// 将访问令牌内容签名为 JWT
    ///
    /// `signing_algorithms` 为空表示使用默认密钥
    async fn sign_access_token(
        &self,
        ctx: &CallContext,
        token: &Token,
        signing_algorithms: &[String],
    ) -> Result<String>;

    /// 创建 ID Token
    async fn create_identity_token(
        &self,
        ctx: &CallContext,
        request: &IdentityTokenRequest,
    ) -> Result<String>;
}

/// 令牌服务
#[derive(Clone)]
pub struct TokenService {
    repository: GrantRepository,
    issuer: Arc<dyn TokenIssuer>,
    issuer_name: String,
}

impl TokenService {
    /// 创建服务
    pub fn new(
        repository: GrantRepository,
        issuer: Arc<dyn TokenIssuer>,
        issuer_name: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            issuer,
            issuer_name: issuer_name.into(),
        }
    }

    /// grant 仓库
    pub fn repository(&self) -> &GrantRepository {
        &self.repository
    }

    /// 签发者名称
    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    /// 组装访问令牌内容
    pub fn build_access_token(
        &self,
        client: &Client,
        subject_id: Option<&str>,
        session_id: Option<&str>,
        resources: &Resources,
        confirmation: Option<String>,
    ) -> Token {
        let mut token = Token::new(
            self.issuer_name.clone(),
            client.client_id.clone(),
            resources.scope_names(),
            self.repository.now(),
            client.access_token_lifetime,
        )
        .with_audiences(resources.audiences())
        .with_type(client.access_token_type);

        token.subject_id = subject_id.map(str::to_string);
        token.session_id = session_id.map(str::to_string);
        token.confirmation = confirmation;
        token
    }

    /// 生成交给客户端的访问令牌
    pub async fn create_access_token(
        &self,
        ctx: &CallContext,
        token: &Token,
        signing_algorithms: &[String],
    ) -> Result<String> {
        match token.access_token_type {
            AccessTokenType::Reference => {
                let grant = Grant::new(
                    GrantPayload::ReferenceToken(token.clone()),
                    token.client_id.clone(),
                    token.creation_time,
                    Some(token.lifetime),
                )
                .with_optional_subject(token.subject_id.clone())
                .with_session(token.session_id.clone());
                debug!(client_id = %token.client_id, "issuing reference token");
                self.repository.create(ctx, grant).await
            }
            AccessTokenType::Jwt => {
                ctx.run(self.issuer.sign_access_token(ctx, token, signing_algorithms))
                    .await
            }
        }
    }

    /// 签发新的刷新令牌
    pub async fn create_refresh_token(
        &self,
        ctx: &CallContext,
        client: &Client,
        access_token: Token,
    ) -> Result<String> {
        let now = self.repository.now();
        let payload = RefreshTokenPayload {
            access_token,
            version: 1,
            usage: client.refresh_token_usage,
            expiration: client.refresh_token_expiration,
            absolute_lifetime: client.absolute_refresh_token_lifetime,
            sliding_lifetime: client.sliding_refresh_token_lifetime,
            original_creation_time: now,
        };
        let grant = refresh_grant(payload, now, client);
        self.repository.create(ctx, grant).await
    }

    /// 以新 handle 延续刷新链（一次性刷新令牌的轮换）
    pub async fn rotate_refresh_token(
        &self,
        ctx: &CallContext,
        client: &Client,
        previous: &RefreshTokenPayload,
        access_token: Token,
    ) -> Result<String> {
        let now = self.repository.now();
        let payload = RefreshTokenPayload {
            access_token,
            version: previous.version + 1,
            usage: client.refresh_token_usage,
            expiration: client.refresh_token_expiration,
            absolute_lifetime: previous.absolute_lifetime,
            sliding_lifetime: client.sliding_refresh_token_lifetime,
            original_creation_time: previous.original_creation_time,
        };
        let grant = refresh_grant(payload, now, client);
        self.repository.create(ctx, grant).await
    }

    /// 创建 ID Token
    pub async fn create_identity_token(
        &self,
        ctx: &CallContext,
        request: &IdentityTokenRequest,
    ) -> Result<String> {
        ctx.run(self.issuer.create_identity_token(ctx, request))
            .await
    }
}

/// OIDC 的 `at_hash` / `c_hash` / `s_hash` 计算方式（SHA-256 系列算法）
///
/// 取 SHA-256 摘要的左半部分，再做 base64url 编码
pub fn left_half_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// 刷新令牌 grant 的生命周期
///
/// 绝对模式：刷新链剩余的绝对生命周期；滑动模式：滑动窗口，但不超过剩余的绝对生命周期
pub fn refresh_lifetime(payload: &RefreshTokenPayload, now: DateTime<Utc>) -> i64 {
    let remaining_absolute = (payload.absolute_expiration() - now).num_seconds().max(0);
    match payload.expiration {
        RefreshTokenExpiration::Absolute => remaining_absolute,
        RefreshTokenExpiration::Sliding => payload.sliding_lifetime.min(remaining_absolute),
    }
}

fn refresh_grant(payload: RefreshTokenPayload, now: DateTime<Utc>, client: &Client) -> Grant {
    let lifetime = refresh_lifetime(&payload, now);
    let subject = payload.access_token.subject_id.clone();
    let session = payload.access_token.session_id.clone();
    Grant::new(
        GrantPayload::RefreshToken(payload),
        client.client_id.clone(),
        now,
        Some(lifetime),
    )
    .with_optional_subject(subject)
    .with_session(session)
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer_name", &self.issuer_name)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::grant::{GrantKind, RefreshTokenUsage};
    use crate::store::InMemoryGrantStore;
    use chrono::Duration;

    fn setup() -> (TokenService, FixedClock) {
        let clock = FixedClock::at_now();
        let repo = GrantRepository::new(
            Arc::new(InMemoryGrantStore::new()),
            Arc::new(clock.clone()),
        );
        (
            TokenService::new(repo, Arc::new(testing::PlainIssuer), "https://issuer"),
            clock,
        )
    }

    #[tokio::test]
    async fn test_reference_token_is_stored() {
        let (service, _) = setup();
        let ctx = CallContext::new();
        let client = Client {
            client_id: "api-client".into(),
            access_token_type: AccessTokenType::Reference,
            ..Default::default()
        };
        let token =
            service.build_access_token(&client, Some("alice"), None, &Resources::default(), None);
        let handle = service.create_access_token(&ctx, &token, &[]).await.unwrap();

        let grant = service
            .repository()
            .get(&ctx, GrantKind::ReferenceToken, &handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.subject_id.as_deref(), Some("alice"));
        assert_eq!(grant.as_reference_token(), Some(&token));
    }

    #[tokio::test]
    async fn test_jwt_token_is_delegated() {
        let (service, _) = setup();
        let client = Client {
            client_id: "c".into(),
            ..Default::default()
        };
        let token = service.build_access_token(&client, None, None, &Resources::default(), None);
        let value = service
            .create_access_token(&CallContext::new(), &token, &[])
            .await
            .unwrap();
        assert_eq!(value, "jwt.c.-");
    }

    #[test]
    fn test_left_half_hash() {
        // OIDC Core A.4 中的 at_hash 示例
        assert_eq!(
            left_half_hash("jHkWEdUXMU1BwAsC4vtUsZwnNm8"),
            "77QmUPtjPfzWtF2AnpK9RQ"
        );
    }

    #[test]
    fn test_refresh_lifetime() {
        let now = Utc::now();
        let mut payload = RefreshTokenPayload {
            access_token: Token::new("iss", "c", vec![], now, 60),
            version: 1,
            usage: RefreshTokenUsage::ReUse,
            expiration: RefreshTokenExpiration::Absolute,
            absolute_lifetime: 1000,
            sliding_lifetime: 100,
            original_creation_time: now - Duration::seconds(400),
        };
        assert_eq!(refresh_lifetime(&payload, now), 600);

        payload.expiration = RefreshTokenExpiration::Sliding;
        assert_eq!(refresh_lifetime(&payload, now), 100);

        payload.original_creation_time = now - Duration::seconds(950);
        assert_eq!(refresh_lifetime(&payload, now), 50);
    }
}
