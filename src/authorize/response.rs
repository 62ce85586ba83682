//! 授权响应
//!
//! 交互决策为 `Authorized` 之后，创建授权码 grant 或直接签发令牌，
//! 并按响应模式组装返回给客户端的重定向。

use tracing::{info, instrument};
use url::Url;
use url::form_urlencoded;

use super::{AuthorizeError, InteractionOutcome, ResponseMode, ValidatedAuthorizeRequest};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::grant::{AuthorizationCode, Grant, GrantPayload};
use crate::issuer::{IdentityTokenRequest, TokenService, left_half_hash};
use crate::protocol::{OAuthError, TokenType, join_scopes};
use crate::session::UserSession;

/// 返回给客户端的重定向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeRedirect {
    /// 302 跳转地址（query 或 fragment 模式）
    Location(String),
    /// 以自动提交表单 POST 到 `action`
    FormPost {
        action: String,
        parameters: Vec<(String, String)>,
    },
}

impl AuthorizeRedirect {
    /// 按响应模式组装重定向
    pub fn build(
        redirect_uri: &str,
        mode: ResponseMode,
        parameters: Vec<(String, String)>,
    ) -> Result<Self> {
        let mut url = Url::parse(redirect_uri)
            .map_err(|e| Error::internal(format!("invalid redirect_uri: {}", e)))?;

        match mode {
            ResponseMode::Query => {
                url.query_pairs_mut().extend_pairs(&parameters);
                Ok(AuthorizeRedirect::Location(url.to_string()))
            }
            ResponseMode::Fragment => {
                let fragment = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&parameters)
                    .finish();
                url.set_fragment(Some(&fragment));
                Ok(AuthorizeRedirect::Location(url.to_string()))
            }
            ResponseMode::FormPost => Ok(AuthorizeRedirect::FormPost {
                action: url.to_string(),
                parameters,
            }),
        }
    }
}

/// 授权成功的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeResponse {
    pub redirect_uri: String,
    pub response_mode: ResponseMode,
    pub code: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<TokenType>,
    pub expires_in: Option<i64>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
}

impl AuthorizeResponse {
    /// 响应参数
    pub fn parameters(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                params.push((name.to_string(), value));
            }
        };
        push("code", self.code.clone());
        push("access_token", self.access_token.clone());
        push("token_type", self.token_type.map(|t| t.to_string()));
        push("expires_in", self.expires_in.map(|e| e.to_string()));
        push("id_token", self.id_token.clone());
        push("scope", self.scope.clone());
        push("state", self.state.clone());
        params
    }

    /// 组装重定向
    pub fn redirect(&self) -> Result<AuthorizeRedirect> {
        AuthorizeRedirect::build(&self.redirect_uri, self.response_mode, self.parameters())
    }
}

impl AuthorizeError {
    /// 错误参数
    pub fn parameters(&self) -> Vec<(String, String)> {
        let mut params = vec![("error".to_string(), self.error.code().to_string())];
        if let Some(description) = &self.error.error_description {
            params.push(("error_description".to_string(), description.clone()));
        }
        if let Some(state) = &self.state {
            params.push(("state".to_string(), state.clone()));
        }
        params
    }

    /// 组装错误重定向；不可重定向的错误返回 `None`
    pub fn redirect(&self) -> Option<Result<AuthorizeRedirect>> {
        if !self.redirectable {
            return None;
        }
        let redirect_uri = self.redirect_uri.as_deref()?;
        let mode = self.response_mode.unwrap_or(ResponseMode::Query);
        Some(AuthorizeRedirect::build(redirect_uri, mode, self.parameters()))
    }
}

/// 授权响应生成器
#[derive(Debug, Clone)]
pub struct AuthorizeResponseGenerator {
    tokens: TokenService,
}

impl AuthorizeResponseGenerator {
    /// 创建生成器
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    /// 为已授权的交互结果生成响应
    #[instrument(skip_all)]
    pub async fn generate(
        &self,
        ctx: &CallContext,
        outcome: &InteractionOutcome,
    ) -> std::result::Result<AuthorizeResponse, AuthorizeError> {
        let (Some(request), Some(session)) = (&outcome.request, &outcome.session) else {
            return Err(AuthorizeError::local(OAuthError::server_error(), None));
        };
        if !outcome.is_authorized() {
            return Err(AuthorizeError::for_request(
                OAuthError::server_error(),
                request,
            ));
        }

        self.create_response(ctx, request, session, outcome.consent_shown)
            .await
            .map_err(|e| AuthorizeError::for_request(e.into(), request))
    }

    async fn create_response(
        &self,
        ctx: &CallContext,
        request: &ValidatedAuthorizeRequest,
        session: &UserSession,
        consent_shown: bool,
    ) -> Result<AuthorizeResponse> {
        let client = &request.client;
        let repository = self.tokens.repository();
        let now = repository.now();
        let state_hash = request.state.as_deref().map(left_half_hash);

        let code = if request.response_type.includes_code() {
            let grant = Grant::new(
                GrantPayload::AuthorizationCode(AuthorizationCode {
                    redirect_uri: request.redirect_uri.clone(),
                    requested_scopes: request.requested_scopes.clone(),
                    code_challenge: request.code_challenge.clone(),
                    nonce: request.nonce.clone(),
                    was_consent_shown: consent_shown,
                    auth_time: Some(session.auth_time),
                    is_openid: request.is_openid,
                    state_hash: state_hash.clone(),
                }),
                client.client_id.clone(),
                now,
                Some(client.authorization_code_lifetime),
            )
            .with_subject(session.subject_id.clone())
            .with_session(Some(session.session_id.clone()));
            Some(repository.create(ctx, grant).await?)
        } else {
            None
        };

        let signing_algorithms = request.resources.signing_algorithms()?;

        let access_token = if request.response_type.includes_access_token() {
            let token = self.tokens.build_access_token(
                client,
                Some(&session.subject_id),
                Some(&session.session_id),
                &request.resources,
                None,
            );
            Some(
                self.tokens
                    .create_access_token(ctx, &token, &signing_algorithms)
                    .await?,
            )
        } else {
            None
        };

        let id_token = if request.response_type.includes_id_token() {
            let identity = IdentityTokenRequest {
                issuer: self.tokens.issuer_name().to_string(),
                subject_id: session.subject_id.clone(),
                client_id: client.client_id.clone(),
                session_id: Some(session.session_id.clone()),
                nonce: request.nonce.clone(),
                auth_time: Some(session.auth_time),
                scopes: request
                    .resources
                    .identity_resources
                    .iter()
                    .map(|r| r.name.clone())
                    .collect(),
                creation_time: now,
                lifetime: client.identity_token_lifetime,
                access_token: access_token.clone(),
                authorization_code: code.clone(),
                state_hash,
                signing_algorithms: signing_algorithms.clone(),
            };
            Some(self.tokens.create_identity_token(ctx, &identity).await?)
        } else {
            None
        };

        info!(
            client_id = %client.client_id,
            response_type = %request.response_type,
            "authorize response issued"
        );

        let issued_token = access_token.is_some();
        Ok(AuthorizeResponse {
            redirect_uri: request.redirect_uri.clone(),
            response_mode: request.response_mode,
            code,
            access_token,
            token_type: issued_token.then_some(TokenType::Bearer),
            expires_in: issued_token.then_some(client.access_token_lifetime),
            id_token,
            scope: issued_token.then(|| join_scopes(&request.resources.scope_names())),
            state: request.state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorize::{AuthorizeRequest, InteractionState, ResponseType};
    use crate::client::Client;
    use crate::clock::FixedClock;
    use crate::grant::GrantKind;
    use crate::issuer::testing::PlainIssuer;
    use crate::resources::{ApiScope, IdentityResource, Resources};
    use crate::store::{GrantRepository, InMemoryGrantStore};
    use chrono::Utc;
    use std::sync::Arc;

    fn generator() -> AuthorizeResponseGenerator {
        let repo = GrantRepository::new(
            Arc::new(InMemoryGrantStore::new()),
            Arc::new(FixedClock::at_now()),
        );
        AuthorizeResponseGenerator::new(TokenService::new(
            repo,
            Arc::new(PlainIssuer),
            "https://issuer",
        ))
    }

    fn outcome(response_type: ResponseType, mode: ResponseMode) -> InteractionOutcome {
        let request = ValidatedAuthorizeRequest {
            client: Client {
                client_id: "web".into(),
                ..Default::default()
            },
            raw: AuthorizeRequest::default(),
            response_type,
            response_mode: mode,
            redirect_uri: "https://app.example.com/cb".into(),
            requested_scopes: vec!["openid".into(), "api1".into()],
            resources: Resources {
                identity_resources: vec![IdentityResource::openid()],
                api_scopes: vec![ApiScope::new("api1")],
                ..Default::default()
            },
            state: Some("af0ifjsldkj".into()),
            nonce: Some("n-0S6_WzA2Mj".into()),
            code_challenge: None,
            prompt: Vec::new(),
            max_age: None,
            login_hint: None,
            acr_values: Vec::new(),
            ui_locales: None,
            is_openid: true,
        };
        InteractionOutcome {
            state: InteractionState::Authorized,
            request: Some(request),
            session: Some(UserSession::new("alice", "sid-1", Utc::now())),
            consent_shown: true,
        }
    }

    #[tokio::test]
    async fn test_code_response_creates_grant() {
        let generator = generator();
        let ctx = CallContext::new();
        let response = generator
            .generate(&ctx, &outcome(ResponseType::Code, ResponseMode::Query))
            .await
            .unwrap();

        let code = response.code.clone().unwrap();
        assert!(response.access_token.is_none());
        let grant = generator
            .tokens
            .repository()
            .get(&ctx, GrantKind::AuthorizationCode, &code)
            .await
            .unwrap()
            .unwrap();
        let payload = grant.as_authorization_code().unwrap();
        assert!(payload.was_consent_shown);
        assert_eq!(payload.nonce.as_deref(), Some("n-0S6_WzA2Mj"));
        assert_eq!(grant.session_id.as_deref(), Some("sid-1"));

        match response.redirect().unwrap() {
            AuthorizeRedirect::Location(url) => {
                assert!(url.starts_with("https://app.example.com/cb?code="));
                assert!(url.contains("state=af0ifjsldkj"));
            }
            other => panic!("unexpected redirect: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hybrid_response_uses_fragment() {
        let response = generator()
            .generate(
                &CallContext::new(),
                &outcome(ResponseType::CodeIdTokenToken, ResponseMode::Fragment),
            )
            .await
            .unwrap();
        assert!(response.code.is_some());
        assert_eq!(response.access_token.as_deref(), Some("jwt.web.alice"));
        assert_eq!(response.id_token.as_deref(), Some("id.web.alice"));
        assert_eq!(response.token_type, Some(TokenType::Bearer));

        match response.redirect().unwrap() {
            AuthorizeRedirect::Location(url) => {
                let fragment = Url::parse(&url).unwrap().fragment().unwrap().to_string();
                assert!(fragment.contains("id_token=id.web.alice"));
                assert!(fragment.contains("token_type=Bearer"));
            }
            other => panic!("unexpected redirect: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_authorized_outcome() {
        let mut outcome = outcome(ResponseType::Code, ResponseMode::Query);
        outcome.state = InteractionState::NeedsConsent;
        let err = generator()
            .generate(&CallContext::new(), &outcome)
            .await
            .unwrap_err();
        assert_eq!(err.error.code(), "server_error");
    }

    #[test]
    fn test_error_redirect() {
        let mut error = AuthorizeError::local(OAuthError::access_denied("no"), Some("web".into()));
        assert!(error.redirect().is_none());

        error.redirectable = true;
        error.redirect_uri = Some("https://app.example.com/cb".into());
        error.response_mode = Some(ResponseMode::FormPost);
        error.state = Some("s".into());
        match error.redirect().unwrap().unwrap() {
            AuthorizeRedirect::FormPost { action, parameters } => {
                assert_eq!(action, "https://app.example.com/cb");
                assert!(parameters.contains(&("error".to_string(), "access_denied".to_string())));
                assert!(parameters.contains(&("state".to_string(), "s".to_string())));
            }
            other => panic!("unexpected redirect: {:?}", other),
        }
    }
}
