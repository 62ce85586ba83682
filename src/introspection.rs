//! Token 内省 (RFC 7662)
//!
//! 调用方是 API 资源（资源服务器），用 API 密钥认证。内省依次查找引用访问令牌、
//! 刷新令牌，最后交给配置的 [`AccessTokenVerifier`] 验证自包含的 JWT。
//!
//! 令牌只有在携带至少一个属于调用方的 scope 时才是 `active`，响应中也只列出
//! 这些 scope；资源服务器不会因此得知令牌对其他 API 的授权。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::InputLengthRestrictions;
use crate::context::CallContext;
use crate::error::Result;
use crate::grant::{GrantKind, Token};
use crate::profile::{ProfileCaller, ProfileService};
use crate::protocol::{OAuthError, OAuthErrorCode, join_scopes};
use crate::resources::ApiResource;
use crate::revocation::TokenTypeHint;
use crate::secret::{ApiResourceAuthenticator, ParsedSecret};
use crate::store::GrantRepository;

/// 自包含访问令牌的验证协作者
#[async_trait]
pub trait AccessTokenVerifier: Send + Sync {
    /// 验证签名与有效期；无效时返回 `None`
    async fn verify(&self, ctx: &CallContext, token: &str) -> Result<Option<Token>>;
}

/// 内省请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrospectionRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type_hint: Option<String>,
}

impl IntrospectionRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type_hint: None,
        }
    }

    /// 设置令牌类型提示
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.token_type_hint = Some(hint.into());
        self
    }
}

/// 内省响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// 令牌是否活跃；这是响应中唯一必需的字段
    pub active: bool,

    /// 以空格分隔的 scope（只包含调用方拥有的 scope）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// `access_token` 或 `refresh_token`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aud: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// 会话 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// 额外声明（含 mTLS 绑定的 `cnf`）
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl IntrospectionResponse {
    /// 令牌无效
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            token_type: None,
            exp: None,
            iat: None,
            sub: None,
            aud: Vec::new(),
            iss: None,
            sid: None,
            extra: HashMap::new(),
        }
    }

    /// 令牌有效
    pub fn active() -> IntrospectionResponseBuilder {
        IntrospectionResponseBuilder::default()
    }

    /// 过期时间
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }

    /// scope 列表
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_ref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().contains(&scope)
    }
}

impl Default for IntrospectionResponse {
    fn default() -> Self {
        Self::inactive()
    }
}

/// 活跃响应的构建器
#[derive(Debug, Default)]
pub struct IntrospectionResponseBuilder {
    response: Option<IntrospectionResponse>,
}

impl IntrospectionResponseBuilder {
    fn get(&mut self) -> &mut IntrospectionResponse {
        self.response.get_or_insert_with(|| IntrospectionResponse {
            active: true,
            ..IntrospectionResponse::inactive()
        })
    }

    pub fn scopes(mut self, scopes: &[String]) -> Self {
        self.get().scope = Some(join_scopes(scopes));
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.get().client_id = Some(client_id.into());
        self
    }

    pub fn token_type(mut self, token_type: impl Into<String>) -> Self {
        self.get().token_type = Some(token_type.into());
        self
    }

    pub fn expires_at(mut self, dt: DateTime<Utc>) -> Self {
        self.get().exp = Some(dt.timestamp());
        self
    }

    pub fn issued_at(mut self, dt: DateTime<Utc>) -> Self {
        self.get().iat = Some(dt.timestamp());
        self
    }

    pub fn sub(mut self, sub: Option<String>) -> Self {
        self.get().sub = sub;
        self
    }

    pub fn aud(mut self, aud: Vec<String>) -> Self {
        self.get().aud = aud;
        self
    }

    pub fn iss(mut self, iss: impl Into<String>) -> Self {
        self.get().iss = Some(iss.into());
        self
    }

    pub fn sid(mut self, sid: Option<String>) -> Self {
        self.get().sid = sid;
        self
    }

    /// 添加自定义声明
    pub fn claim(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.get().extra.insert(key.into(), v);
        }
        self
    }

    pub fn build(mut self) -> IntrospectionResponse {
        self.get();
        self.response.unwrap_or_default()
    }
}

/// 内省失败
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntrospectionError {
    /// 调用方缺少或出示了无效的 API 凭证（HTTP 401）
    #[error("introspection caller is not authenticated")]
    Unauthorized,
    /// 请求错误或基础设施故障
    #[error(transparent)]
    Protocol(#[from] OAuthError),
}

impl From<crate::Error> for IntrospectionError {
    fn from(err: crate::Error) -> Self {
        IntrospectionError::Protocol(err.into())
    }
}

/// 内省中找到的令牌
struct Located {
    token: Token,
    kind: Option<GrantKind>,
    expiration: Option<DateTime<Utc>>,
}

/// 内省服务
#[derive(Clone)]
pub struct IntrospectionService {
    repository: GrantRepository,
    authenticator: ApiResourceAuthenticator,
    profile: Arc<dyn ProfileService>,
    clients: Arc<dyn crate::client::ClientStore>,
    verifier: Option<Arc<dyn AccessTokenVerifier>>,
    lengths: InputLengthRestrictions,
}

impl IntrospectionService {
    /// 创建服务
    pub fn new(
        repository: GrantRepository,
        authenticator: ApiResourceAuthenticator,
        profile: Arc<dyn ProfileService>,
        clients: Arc<dyn crate::client::ClientStore>,
        lengths: InputLengthRestrictions,
    ) -> Self {
        Self {
            repository,
            authenticator,
            profile,
            clients,
            verifier: None,
            lengths,
        }
    }

    /// 启用自包含令牌的内省
    pub fn with_verifier(mut self, verifier: Arc<dyn AccessTokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 认证调用方
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        caller: &ParsedSecret,
    ) -> std::result::Result<ApiResource, IntrospectionError> {
        self.authenticator
            .authenticate(ctx, caller)
            .await
            .map_err(|err| {
                if err.is(OAuthErrorCode::ServerError) {
                    IntrospectionError::Protocol(err)
                } else {
                    IntrospectionError::Unauthorized
                }
            })
    }

    /// 内省令牌
    #[instrument(skip_all, fields(api = %caller.id))]
    pub async fn introspect(
        &self,
        ctx: &CallContext,
        caller: &ParsedSecret,
        request: &IntrospectionRequest,
    ) -> std::result::Result<IntrospectionResponse, IntrospectionError> {
        let api = self.authenticate(ctx, caller).await?;
        self.introspect_for(ctx, &api, request).await
    }

    /// 以已认证的 API 资源身份内省
    pub async fn introspect_for(
        &self,
        ctx: &CallContext,
        api: &ApiResource,
        request: &IntrospectionRequest,
    ) -> std::result::Result<IntrospectionResponse, IntrospectionError> {
        let token = request.token.trim();
        if token.is_empty() {
            return Err(OAuthError::invalid_request("token is missing").into());
        }

        let hint = request.token_type_hint.as_deref().and_then(TokenTypeHint::parse);
        let Some(located) = self.locate(ctx, token, hint).await? else {
            debug!("token not found");
            return Ok(IntrospectionResponse::inactive());
        };

        let now = self.repository.now();
        if located.expiration.is_some_and(|exp| exp <= now) {
            debug!("token expired");
            return Ok(IntrospectionResponse::inactive());
        }

        if let Some(subject_id) = &located.token.subject_id {
            if !self.subject_active(ctx, subject_id, &located.token.client_id).await? {
                debug!("subject inactive");
                return Ok(IntrospectionResponse::inactive());
            }
        }

        let scopes: Vec<String> = located
            .token
            .scopes
            .iter()
            .filter(|s| api.scopes.contains(s))
            .cloned()
            .collect();
        if scopes.is_empty() {
            warn!(api = %api.name, "API resource introspected a token without any of its scopes");
            return Ok(IntrospectionResponse::inactive());
        }

        let token = located.token;
        let mut builder = IntrospectionResponse::active()
            .scopes(&scopes)
            .client_id(token.client_id.clone())
            .token_type(match located.kind {
                Some(GrantKind::RefreshToken) => "refresh_token",
                _ => "access_token",
            })
            .issued_at(token.creation_time)
            .sub(token.subject_id.clone())
            .aud(token.audiences.clone())
            .iss(token.issuer.clone())
            .sid(token.session_id.clone());
        if let Some(exp) = located.expiration {
            builder = builder.expires_at(exp);
        }
        if let Some(thumbprint) = &token.confirmation {
            builder = builder.claim("cnf", serde_json::json!({ "x5t#S256": thumbprint }));
        }
        for (name, value) in &token.claims {
            builder = builder.claim(name.clone(), value);
        }
        Ok(builder.build())
    }

    async fn locate(
        &self,
        ctx: &CallContext,
        token: &str,
        hint: Option<TokenTypeHint>,
    ) -> Result<Option<Located>> {
        if token.len() <= self.lengths.token_handle {
            for kind in TokenTypeHint::lookup_order(hint) {
                let Some(grant) = self.repository.get(ctx, kind, token).await? else {
                    continue;
                };
                let expiration = grant.expiration();
                match kind {
                    GrantKind::ReferenceToken => {
                        if let Some(token) = grant.as_reference_token() {
                            return Ok(Some(Located {
                                token: token.clone(),
                                kind: Some(kind),
                                expiration,
                            }));
                        }
                    }
                    GrantKind::RefreshToken => {
                        if grant.is_consumed() {
                            return Ok(None);
                        }
                        if let Some(payload) = grant.as_refresh_token() {
                            return Ok(Some(Located {
                                token: payload.access_token.clone(),
                                kind: Some(kind),
                                expiration,
                            }));
                        }
                    }
                    _ => {}
                }
            }
        }

        match &self.verifier {
            Some(verifier) if token.len() <= self.lengths.jwt => {
                let verified = ctx.run(verifier.verify(ctx, token)).await?;
                Ok(verified.map(|token| Located {
                    expiration: Some(token.expiration()),
                    token,
                    kind: None,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn subject_active(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client_id: &str,
    ) -> Result<bool> {
        let Some(client) = ctx
            .run(self.clients.find_enabled_client_by_id(ctx, client_id))
            .await?
        else {
            return Ok(false);
        };
        ctx.run(self.profile.is_active(
            ctx,
            subject_id,
            &client,
            ProfileCaller::IntrospectionEndpoint,
        ))
        .await
    }
}

impl std::fmt::Debug for IntrospectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrospectionService")
            .field("jwt", &self.verifier.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, InMemoryClientStore};
    use crate::clock::FixedClock;
    use crate::grant::{Grant, GrantPayload};
    use crate::profile::DefaultProfileService;
    use crate::resources::{ApiScope, InMemoryResourceStore};
    use crate::secret::{ClientSecret, SecretValidator};
    use crate::store::InMemoryGrantStore;
    use chrono::Duration;

    struct Fixture {
        clock: FixedClock,
        repo: GrantRepository,
        profile: Arc<DefaultProfileService>,
        service: IntrospectionService,
    }

    fn setup() -> Fixture {
        let clock = FixedClock::at_now();
        let repo = GrantRepository::new(
            Arc::new(InMemoryGrantStore::new()),
            Arc::new(clock.clone()),
        );
        let resources = Arc::new(InMemoryResourceStore::new(
            [],
            [ApiScope::new("orders.read"), ApiScope::new("billing")],
            [
                ApiResource::new("orders", ["orders.read"])
                    .with_secret(ClientSecret::shared("orders-secret")),
                ApiResource::new("billing", ["billing"])
                    .with_secret(ClientSecret::shared("billing-secret")),
            ],
        ));
        let clients = Arc::new(InMemoryClientStore::new([Client {
            client_id: "web".into(),
            ..Default::default()
        }]));
        let profile = Arc::new(DefaultProfileService::new());
        let service = IntrospectionService::new(
            repo.clone(),
            ApiResourceAuthenticator::new(resources, SecretValidator::new(Arc::new(clock.clone()))),
            profile.clone(),
            clients,
            InputLengthRestrictions::default(),
        );
        Fixture {
            clock,
            repo,
            profile,
            service,
        }
    }

    async fn reference(repo: &GrantRepository, scopes: &[&str]) -> String {
        let token = Token::new(
            "https://issuer",
            "web",
            scopes.iter().map(|s| s.to_string()).collect(),
            repo.now(),
            600,
        )
        .with_subject("alice")
        .with_audiences(vec!["orders".into()]);
        let grant = Grant::new(
            GrantPayload::ReferenceToken(token),
            "web",
            repo.now(),
            Some(600),
        )
        .with_subject("alice");
        repo.create(&CallContext::new(), grant).await.unwrap()
    }

    fn orders() -> ParsedSecret {
        ParsedSecret::shared("orders", "orders-secret")
    }

    #[tokio::test]
    async fn test_active_reference_token() {
        let fx = setup();
        let handle = reference(&fx.repo, &["orders.read", "billing"]).await;

        let response = fx
            .service
            .introspect(&CallContext::new(), &orders(), &IntrospectionRequest::new(&handle))
            .await
            .unwrap();
        assert!(response.active);
        assert_eq!(response.scopes(), vec!["orders.read"]);
        assert_eq!(response.sub.as_deref(), Some("alice"));
        assert_eq!(response.client_id.as_deref(), Some("web"));
        assert_eq!(response.token_type.as_deref(), Some("access_token"));
    }

    #[tokio::test]
    async fn test_no_scope_overlap_is_inactive() {
        let fx = setup();
        let handle = reference(&fx.repo, &["billing"]).await;

        let response = fx
            .service
            .introspect(&CallContext::new(), &orders(), &IntrospectionRequest::new(&handle))
            .await
            .unwrap();
        assert!(!response.active);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({ "active": false }));
    }

    #[tokio::test]
    async fn test_expired_and_inactive_subject() {
        let fx = setup();
        let ctx = CallContext::new();
        let handle = reference(&fx.repo, &["orders.read"]).await;

        fx.profile.deactivate("alice").await;
        let response = fx
            .service
            .introspect(&ctx, &orders(), &IntrospectionRequest::new(&handle))
            .await
            .unwrap();
        assert!(!response.active);

        fx.profile.activate("alice").await;
        fx.clock.advance(Duration::seconds(601));
        let response = fx
            .service
            .introspect(&ctx, &orders(), &IntrospectionRequest::new(&handle))
            .await
            .unwrap();
        assert!(!response.active);
    }

    #[tokio::test]
    async fn test_unauthenticated_caller() {
        let fx = setup();
        let ctx = CallContext::new();
        let request = IntrospectionRequest::new("anything");

        let err = fx
            .service
            .introspect(&ctx, &ParsedSecret::shared("orders", "wrong"), &request)
            .await
            .unwrap_err();
        assert_eq!(err, IntrospectionError::Unauthorized);

        let err = fx
            .service
            .introspect(&ctx, &ParsedSecret::public("orders"), &request)
            .await
            .unwrap_err();
        assert_eq!(err, IntrospectionError::Unauthorized);
    }

    struct StaticVerifier(Token);

    #[async_trait]
    impl AccessTokenVerifier for StaticVerifier {
        async fn verify(&self, _ctx: &CallContext, token: &str) -> Result<Option<Token>> {
            Ok((token == "header.payload.signature").then(|| self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_self_contained_token() {
        let fx = setup();
        let token = Token::new(
            "https://issuer",
            "web",
            vec!["orders.read".into()],
            fx.repo.now(),
            300,
        );
        let service = fx.service.clone().with_verifier(Arc::new(StaticVerifier(token)));

        let response = service
            .introspect(
                &CallContext::new(),
                &orders(),
                &IntrospectionRequest::new("header.payload.signature"),
            )
            .await
            .unwrap();
        assert!(response.active);
        assert!(response.sub.is_none());

        let response = service
            .introspect(&CallContext::new(), &orders(), &IntrospectionRequest::new("x.y.z"))
            .await
            .unwrap();
        assert!(!response.active);
    }
}
