//! 集成测试共用的引擎装配

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use grantrs::audit::InMemoryAuditLogger;
use grantrs::authorize::{AuthorizeRequest, AuthorizeResponse};
use grantrs::clock::{Clock, FixedClock};
use grantrs::engine::{AuthorizeResult, GrantEngine};
use grantrs::grant::{AccessTokenType, Token};
use grantrs::issuer::{IdentityTokenRequest, TokenIssuer};
use grantrs::pkce::{PkceChallenge, PkceMethod};
use grantrs::profile::DefaultProfileService;
use grantrs::resources::{ApiResource, ApiScope, IdentityResource, InMemoryResourceStore};
use grantrs::secret::{ClientSecret, ParsedSecret};
use grantrs::session::UserSession;
use grantrs::store::{GrantStore, InMemoryGrantStore};
use grantrs::{CallContext, Client, GrantType, InMemoryClientStore};

pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// 以 `jwt.<client>.<subject>` 形式“签名”的签发者
pub struct PlainIssuer;

#[async_trait]
impl TokenIssuer for PlainIssuer {
    async fn sign_access_token(
        &self,
        _ctx: &CallContext,
        token: &Token,
        _signing_algorithms: &[String],
    ) -> grantrs::Result<String> {
        Ok(format!(
            "jwt.{}.{}",
            token.client_id,
            token.subject_id.as_deref().unwrap_or("-")
        ))
    }

    async fn create_identity_token(
        &self,
        _ctx: &CallContext,
        request: &IdentityTokenRequest,
    ) -> grantrs::Result<String> {
        Ok(format!("id.{}.{}", request.client_id, request.subject_id))
    }
}

pub fn clients() -> Vec<Client> {
    vec![
        Client::builder("web")
            .secret(ClientSecret::shared("web-secret"))
            .grant_type(GrantType::AuthorizationCode)
            .grant_type(GrantType::RefreshToken)
            .redirect_uri(REDIRECT_URI)
            .scopes(["openid", "profile", "api1"])
            .offline_access()
            .build()
            .unwrap(),
        Client::builder("mobile")
            .public()
            .grant_type(GrantType::AuthorizationCode)
            .redirect_uri(REDIRECT_URI)
            .scopes(["openid", "api1"])
            .build()
            .unwrap(),
        Client::builder("svc")
            .secret(ClientSecret::shared("svc-secret"))
            .grant_type(GrantType::ClientCredentials)
            .scope("api1")
            .access_token_type(AccessTokenType::Reference)
            .build()
            .unwrap(),
        Client::builder("tv")
            .secret(ClientSecret::shared("tv-secret"))
            .grant_type(GrantType::DeviceCode)
            .scopes(["openid", "api1"])
            .device_flow(300, Some(5))
            .build()
            .unwrap(),
        Client::builder("code")
            .secret(ClientSecret::shared("code-secret"))
            .grant_type(GrantType::AuthorizationCode)
            .redirect_uri(REDIRECT_URI)
            .scope("api1")
            .build()
            .unwrap(),
        Client::builder("tv2")
            .secret(ClientSecret::shared("tv2-secret"))
            .grant_type(GrantType::DeviceCode)
            .scopes(["openid", "api1"])
            .device_flow(300, Some(5))
            .build()
            .unwrap(),
    ]
}

pub fn resources() -> InMemoryResourceStore {
    InMemoryResourceStore::new(
        [IdentityResource::openid(), IdentityResource::profile()],
        [ApiScope::new("api1"), ApiScope::new("api2")],
        [ApiResource::new("api", ["api1", "api2"]).with_secret(ClientSecret::shared("api-secret"))],
    )
}

pub struct Harness {
    pub clock: FixedClock,
    pub audit: InMemoryAuditLogger,
    pub profile: Arc<DefaultProfileService>,
    pub engine: GrantEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryGrantStore::new()))
    }

    pub fn with_store(grants: Arc<dyn GrantStore>) -> Self {
        let clock = FixedClock::at_now();
        let audit = InMemoryAuditLogger::new();
        let profile = Arc::new(DefaultProfileService::new());
        let engine = GrantEngine::builder(
            Arc::new(InMemoryClientStore::new(clients())),
            Arc::new(resources()),
            grants,
            Arc::new(PlainIssuer),
        )
        .clock(Arc::new(clock.clone()))
        .profile(profile.clone())
        .audit_logger(Arc::new(audit.clone()))
        .build()
        .unwrap();

        Self {
            clock,
            audit,
            profile,
            engine,
        }
    }

    pub fn session(&self, subject: &str) -> UserSession {
        UserSession::new(subject, format!("sid-{}", subject), self.clock.now())
    }

    /// 以 alice 的身份走完授权端点，返回授权响应与 PKCE verifier
    pub async fn authorize_code(&self, client_id: &str, scope: &str) -> (AuthorizeResponse, String) {
        let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();
        let request = AuthorizeRequest::from_pairs([
            ("client_id", client_id),
            ("response_type", "code"),
            ("redirect_uri", REDIRECT_URI),
            ("scope", scope),
            ("state", "xyz"),
            ("code_challenge", pkce.challenge()),
            ("code_challenge_method", "S256"),
        ]);

        let result = self
            .engine
            .authorize_with_session(&CallContext::new(), request, Some(self.session("alice")), None)
            .await;
        match result {
            AuthorizeResult::Success(response) => (response, pkce.verifier().to_string()),
            other => panic!("authorize failed: {:?}", other),
        }
    }
}

pub fn web() -> ParsedSecret {
    ParsedSecret::shared("web", "web-secret")
}

pub fn api() -> ParsedSecret {
    ParsedSecret::shared("api", "api-secret")
}
