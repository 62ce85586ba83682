//! Token 响应生成

use tracing::{info, instrument};

use super::{GrantContext, ValidatedTokenRequest};
use crate::client::GrantType;
use crate::context::CallContext;
use crate::error::Result;
use crate::grant::{GrantKind, GrantPayload, RefreshTokenPayload, RefreshTokenUsage, Token};
use crate::issuer::{IdentityTokenRequest, TokenService, refresh_lifetime};
use crate::protocol::{OAuthError, TokenResponse, join_scopes};

/// 根据通过验证的请求签发令牌
#[derive(Debug, Clone)]
pub struct TokenResponseGenerator {
    tokens: TokenService,
}

impl TokenResponseGenerator {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    /// 签发访问令牌，以及按需的刷新令牌与 ID Token
    #[instrument(skip_all, fields(client_id = %request.client.client_id, grant_type = %request.grant_type))]
    pub async fn generate(
        &self,
        ctx: &CallContext,
        request: &ValidatedTokenRequest,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        Ok(self.create_response(ctx, request).await?)
    }

    async fn create_response(
        &self,
        ctx: &CallContext,
        request: &ValidatedTokenRequest,
    ) -> Result<TokenResponse> {
        let client = &request.client;
        let signing_algorithms = request.resources.signing_algorithms()?;

        let mut token = self.tokens.build_access_token(
            client,
            request.subject_id.as_deref(),
            request.session_id.as_deref(),
            &request.resources,
            request.confirmation.clone(),
        );
        match &request.context {
            GrantContext::Password { claims } | GrantContext::Extension { claims } => {
                token.claims.extend(claims.clone());
            }
            GrantContext::RefreshToken { payload, .. } => {
                token.claims = payload.access_token.claims.clone();
            }
            _ => {}
        }

        let access_token = self
            .tokens
            .create_access_token(ctx, &token, &signing_algorithms)
            .await?;

        let refresh_token = if request.wants_refresh_token() {
            Some(self.refresh_token(ctx, request, token.clone()).await?)
        } else {
            None
        };

        let id_token = if self.wants_identity_token(request) {
            Some(
                self.identity_token(ctx, request, &access_token, signing_algorithms)
                    .await?,
            )
        } else {
            None
        };

        info!(
            refresh_token = refresh_token.is_some(),
            id_token = id_token.is_some(),
            "token issued"
        );

        let mut response = TokenResponse::new(access_token)
            .with_expires_in(u64::try_from(token.lifetime).unwrap_or_default())
            .with_scope(join_scopes(&token.scopes));
        if let Some(refresh_token) = refresh_token {
            response = response.with_refresh_token(refresh_token);
        }
        if let Some(id_token) = id_token {
            response = response.with_id_token(id_token);
        }
        Ok(response)
    }

    /// 新签发、轮换或延续刷新令牌
    async fn refresh_token(
        &self,
        ctx: &CallContext,
        request: &ValidatedTokenRequest,
        token: Token,
    ) -> Result<String> {
        let client = &request.client;
        let GrantContext::RefreshToken { handle, payload } = &request.context else {
            return self.tokens.create_refresh_token(ctx, client, token).await;
        };

        // 刷新链保留最初授予的范围，收窄只作用于本次的访问令牌
        let mut token = token;
        token.scopes = payload.access_token.scopes.clone();
        token.audiences = payload.access_token.audiences.clone();

        match payload.usage {
            RefreshTokenUsage::OneTimeOnly => {
                self.tokens
                    .rotate_refresh_token(ctx, client, payload, token)
                    .await
            }
            RefreshTokenUsage::ReUse => {
                self.extend_refresh_token(ctx, handle, payload, token).await?;
                Ok(handle.clone())
            }
        }
    }

    /// 保持 handle 不变，更新令牌内容；滑动过期在此延长
    async fn extend_refresh_token(
        &self,
        ctx: &CallContext,
        handle: &str,
        payload: &RefreshTokenPayload,
        token: Token,
    ) -> Result<()> {
        let repository = self.tokens.repository();
        let now = repository.now();
        let Some(mut grant) = repository.get(ctx, GrantKind::RefreshToken, handle).await? else {
            return Err(crate::Error::internal("refresh token vanished before update"));
        };

        let mut payload = payload.clone();
        payload.access_token = token;
        grant.creation_time = now;
        grant.lifetime = Some(refresh_lifetime(&payload, now));
        grant.payload = GrantPayload::RefreshToken(payload);
        repository.update(ctx, grant).await
    }

    fn wants_identity_token(&self, request: &ValidatedTokenRequest) -> bool {
        request.subject_id.is_some()
            && request.resources.has_openid()
            && matches!(
                request.grant_type,
                GrantType::AuthorizationCode | GrantType::DeviceCode | GrantType::RefreshToken
            )
    }

    async fn identity_token(
        &self,
        ctx: &CallContext,
        request: &ValidatedTokenRequest,
        access_token: &str,
        signing_algorithms: Vec<String>,
    ) -> Result<String> {
        let nonce = match &request.context {
            GrantContext::AuthorizationCode(code) => code.nonce.clone(),
            _ => None,
        };
        let identity = IdentityTokenRequest {
            issuer: self.tokens.issuer_name().to_string(),
            subject_id: request.subject_id.clone().unwrap_or_default(),
            client_id: request.client.client_id.clone(),
            session_id: request.session_id.clone(),
            nonce,
            auth_time: request.auth_time,
            scopes: request
                .resources
                .identity_resources
                .iter()
                .map(|r| r.name.clone())
                .collect(),
            creation_time: self.tokens.repository().now(),
            lifetime: request.client.identity_token_lifetime,
            access_token: Some(access_token.to_string()),
            authorization_code: None,
            state_hash: None,
            signing_algorithms,
        };
        self.tokens.create_identity_token(ctx, &identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::TokenRequestParameters;
    use super::super::fixtures::*;
    use super::*;
    use crate::client::Client;
    use crate::grant::{AccessTokenType, AuthorizationCode, Grant, RefreshTokenExpiration};
    use crate::issuer::testing::PlainIssuer;
    use crate::secret::ClientSecret;
    use chrono::Duration;
    use std::sync::Arc;

    const REDIRECT: &str = "https://app.example.com/cb";

    fn generator(fx: &Fixture) -> TokenResponseGenerator {
        TokenResponseGenerator::new(TokenService::new(
            fx.repo.clone(),
            Arc::new(PlainIssuer),
            "https://issuer",
        ))
    }

    fn web_client(usage: RefreshTokenUsage) -> Client {
        let mut client = Client::builder("web")
            .secret(ClientSecret::shared("secret"))
            .grant_type(GrantType::AuthorizationCode)
            .redirect_uri(REDIRECT)
            .scopes(["openid", "profile", "api1"])
            .offline_access()
            .build()
            .unwrap();
        client.require_pkce = false;
        client.refresh_token_usage = usage;
        client
    }

    async fn redeem_code(fx: &Fixture, client: &Client) -> ValidatedTokenRequest {
        let grant = Grant::new(
            GrantPayload::AuthorizationCode(AuthorizationCode {
                redirect_uri: REDIRECT.into(),
                requested_scopes: vec!["openid".into(), "api1".into(), "offline_access".into()],
                code_challenge: None,
                nonce: Some("n-0S6_WzA2Mj".into()),
                was_consent_shown: true,
                auth_time: Some(fx.repo.now()),
                is_openid: true,
                state_hash: None,
            }),
            client.client_id.clone(),
            fx.repo.now(),
            Some(300),
        )
        .with_subject("alice")
        .with_session(Some("sid".into()));
        let ctx = CallContext::new();
        let code = fx.repo.create(&ctx, grant).await.unwrap();
        let params = TokenRequestParameters::new()
            .insert("grant_type", "authorization_code")
            .insert("code", code)
            .insert("redirect_uri", REDIRECT);
        fx.validator
            .validate(&ctx, &params, &authenticated(client.clone()))
            .await
            .unwrap()
    }

    async fn refresh(fx: &Fixture, client: &Client, handle: &str) -> ValidatedTokenRequest {
        let params = TokenRequestParameters::new()
            .insert("grant_type", "refresh_token")
            .insert("refresh_token", handle);
        fx.validator
            .validate(&CallContext::new(), &params, &authenticated(client.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_response_includes_refresh_and_id_token() {
        let fx = Fixture::new();
        let client = web_client(RefreshTokenUsage::OneTimeOnly);
        let validated = redeem_code(&fx, &client).await;

        let response = generator(&fx)
            .generate(&CallContext::new(), &validated)
            .await
            .unwrap();
        assert_eq!(response.access_token, "jwt.web.alice");
        assert_eq!(response.id_token.as_deref(), Some("id.web.alice"));
        assert_eq!(response.expires_in, Some(3600));
        assert_eq!(response.scope.as_deref(), Some("openid api1 offline_access"));
        assert!(response.refresh_token.is_some());
    }

    #[tokio::test]
    async fn test_one_time_refresh_rotates() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let client = web_client(RefreshTokenUsage::OneTimeOnly);
        let generator = generator(&fx);

        let first = generator
            .generate(&ctx, &redeem_code(&fx, &client).await)
            .await
            .unwrap();
        let first_handle = first.refresh_token.unwrap();

        let second = generator
            .generate(&ctx, &refresh(&fx, &client, &first_handle).await)
            .await
            .unwrap();
        let second_handle = second.refresh_token.unwrap();
        assert_ne!(first_handle, second_handle);

        let grant = fx
            .repo
            .get(&ctx, GrantKind::RefreshToken, &second_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.as_refresh_token().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_narrowed_refresh_keeps_chain_scopes() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let client = web_client(RefreshTokenUsage::OneTimeOnly);
        let generator = generator(&fx);

        let first = generator
            .generate(&ctx, &redeem_code(&fx, &client).await)
            .await
            .unwrap();
        let params = TokenRequestParameters::new()
            .insert("grant_type", "refresh_token")
            .insert("refresh_token", first.refresh_token.unwrap())
            .insert("scope", "api1");
        let narrowed = fx
            .validator
            .validate(&ctx, &params, &authenticated(client.clone()))
            .await
            .unwrap();

        let response = generator.generate(&ctx, &narrowed).await.unwrap();
        assert_eq!(response.scope.as_deref(), Some("api1"));
        assert!(response.id_token.is_none());

        let grant = fx
            .repo
            .get(&ctx, GrantKind::RefreshToken, &response.refresh_token.unwrap())
            .await
            .unwrap()
            .unwrap();
        let stored = &grant.as_refresh_token().unwrap().access_token.scopes;
        assert!(stored.contains(&"openid".to_string()));
        assert!(stored.contains(&"offline_access".to_string()));
    }

    #[tokio::test]
    async fn test_reuse_refresh_slides_within_absolute() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let mut client = web_client(RefreshTokenUsage::ReUse);
        client.refresh_token_expiration = RefreshTokenExpiration::Sliding;
        client.absolute_refresh_token_lifetime = 1000;
        client.sliding_refresh_token_lifetime = 300;
        let generator = generator(&fx);

        let handle = generator
            .generate(&ctx, &redeem_code(&fx, &client).await)
            .await
            .unwrap()
            .refresh_token
            .unwrap();

        fx.clock.advance(Duration::seconds(200));
        let response = generator
            .generate(&ctx, &refresh(&fx, &client, &handle).await)
            .await
            .unwrap();
        assert_eq!(response.refresh_token.as_deref(), Some(handle.as_str()));

        // 200 + 300 秒仍在滑动窗口内
        fx.clock.advance(Duration::seconds(250));
        let grant = fx
            .repo
            .get(&ctx, GrantKind::RefreshToken, &handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.lifetime, Some(300));

        // 每次使用都续期，但不超过从首次签发起算的 1000 秒
        for _ in 0..2 {
            generator
                .generate(&ctx, &refresh(&fx, &client, &handle).await)
                .await
                .unwrap();
            fx.clock.advance(Duration::seconds(250));
        }
        generator
            .generate(&ctx, &refresh(&fx, &client, &handle).await)
            .await
            .unwrap();
        let grant = fx
            .repo
            .get(&ctx, GrantKind::RefreshToken, &handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.lifetime, Some(50));
    }

    #[tokio::test]
    async fn test_client_credentials_reference_token() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let client = Client::builder("svc")
            .secret(ClientSecret::shared("secret"))
            .grant_type(GrantType::ClientCredentials)
            .scope("api1")
            .access_token_type(AccessTokenType::Reference)
            .build()
            .unwrap();
        let params = TokenRequestParameters::new().insert("grant_type", "client_credentials");
        let validated = fx
            .validator
            .validate(&ctx, &params, &authenticated(client))
            .await
            .unwrap();

        let response = generator(&fx).generate(&ctx, &validated).await.unwrap();
        assert!(response.refresh_token.is_none());
        assert!(response.id_token.is_none());

        let grant = fx
            .repo
            .get(&ctx, GrantKind::ReferenceToken, &response.access_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.as_reference_token().unwrap().audiences, vec!["api"]);
    }
}
