//! 引擎入口
//!
//! [`GrantEngine`] 把各端点的验证器、生成器和存储组装在一起，并在边界上
//! 把结果值转换成审计事件。内部组件之间不直接写审计日志。
//!
//! ```rust
//! use std::sync::Arc;
//! use grantrs::client::InMemoryClientStore;
//! use grantrs::engine::GrantEngine;
//! use grantrs::resources::InMemoryResourceStore;
//! use grantrs::store::InMemoryGrantStore;
//! # use async_trait::async_trait;
//! # use grantrs::context::CallContext;
//! # use grantrs::grant::Token;
//! # use grantrs::issuer::{IdentityTokenRequest, TokenIssuer};
//! # struct Signer;
//! # #[async_trait]
//! # impl TokenIssuer for Signer {
//! #     async fn sign_access_token(&self, _: &CallContext, t: &Token, _: &[String]) -> grantrs::Result<String> {
//! #         Ok(t.client_id.clone())
//! #     }
//! #     async fn create_identity_token(&self, _: &CallContext, r: &IdentityTokenRequest) -> grantrs::Result<String> {
//! #         Ok(r.subject_id.clone())
//! #     }
//! # }
//!
//! let engine = GrantEngine::builder(
//!     Arc::new(InMemoryClientStore::new([])),
//!     Arc::new(InMemoryResourceStore::new([], [], [])),
//!     Arc::new(InMemoryGrantStore::new()),
//!     Arc::new(Signer),
//! )
//! .build()
//! .unwrap();
//!
//! assert_eq!(engine.options().issuer, "https://localhost");
//! ```

use std::sync::Arc;

use tracing::{info, instrument};

use crate::audit::{AuditLogger, GrantEvent, NoOpAuditLogger};
use crate::authorize::{
    AuthorizeError, AuthorizeRequest, AuthorizeRequestValidator, AuthorizeResponse,
    AuthorizeResponseGenerator, ConsentResponse, InteractionCustomizer, InteractionOutcome,
    InteractionResolver, InteractionState, RequestObjectValidator,
};
use crate::client::ClientStore;
use crate::clock::{Clock, system_clock};
use crate::config::EngineOptions;
use crate::consent::ConsentService;
use crate::context::CallContext;
use crate::device::{DeviceAuthorizationResponse, DeviceAuthorizationService, DeviceDecision};
use crate::error::Result;
use crate::introspection::{
    AccessTokenVerifier, IntrospectionError, IntrospectionRequest, IntrospectionResponse,
    IntrospectionService,
};
use crate::issuer::{TokenIssuer, TokenService};
use crate::profile::{DefaultProfileService, ProfileService};
use crate::protocol::{OAuthError, TokenResponse};
use crate::resources::{ResourceStore, ResourceValidator};
use crate::revocation::{RevocationOutcome, RevocationRequest, RevocationService};
use crate::secret::{
    ApiResourceAuthenticator, AuthenticatedClient, ClientAuthenticator, ParsedSecret,
    SecretValidator,
};
use crate::session::{SessionPort, StaticSession, UserSession};
use crate::store::{GrantRepository, GrantStore};
use crate::token_request::{
    DeviceFlowThrottler, ExtensionGrantRegistry, ResourceOwnerPasswordValidator,
    TokenRequestParameters, TokenRequestValidator, TokenResponseGenerator,
};

/// 授权端点的结果
#[derive(Debug, Clone)]
pub enum AuthorizeResult {
    /// 授权完成，按 [`AuthorizeResponse::redirect`] 返回给客户端
    Success(AuthorizeResponse),
    /// 需要宿主程序处理的交互（登录、consent 或自定义页面）
    Interaction(InteractionOutcome),
    /// 授权失败
    Error(AuthorizeError),
}

/// [`GrantEngine`] 构建器
pub struct GrantEngineBuilder {
    options: EngineOptions,
    clients: Arc<dyn ClientStore>,
    resources: Arc<dyn ResourceStore>,
    grants: Arc<dyn GrantStore>,
    issuer: Arc<dyn TokenIssuer>,
    clock: Arc<dyn Clock>,
    sessions: Arc<dyn SessionPort>,
    profile: Arc<dyn ProfileService>,
    audit: Arc<dyn AuditLogger>,
    password: Option<Arc<dyn ResourceOwnerPasswordValidator>>,
    extensions: ExtensionGrantRegistry,
    throttler: Option<Arc<dyn DeviceFlowThrottler>>,
    request_objects: Option<Arc<dyn RequestObjectValidator>>,
    customizer: Option<Arc<dyn InteractionCustomizer>>,
    verifier: Option<Arc<dyn AccessTokenVerifier>>,
}

impl GrantEngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 当前会话来源，默认匿名
    pub fn sessions(mut self, sessions: Arc<dyn SessionPort>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn profile(mut self, profile: Arc<dyn ProfileService>) -> Self {
        self.profile = profile;
        self
    }

    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn password_validator(mut self, validator: Arc<dyn ResourceOwnerPasswordValidator>) -> Self {
        self.password = Some(validator);
        self
    }

    pub fn extensions(mut self, extensions: ExtensionGrantRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn device_throttler(mut self, throttler: Arc<dyn DeviceFlowThrottler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    pub fn request_object_validator(mut self, validator: Arc<dyn RequestObjectValidator>) -> Self {
        self.request_objects = Some(validator);
        self
    }

    pub fn interaction_customizer(mut self, customizer: Arc<dyn InteractionCustomizer>) -> Self {
        self.customizer = Some(customizer);
        self
    }

    pub fn access_token_verifier(mut self, verifier: Arc<dyn AccessTokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 校验配置并组装引擎
    pub fn build(self) -> Result<GrantEngine> {
        self.options.validate()?;
        let options = self.options;
        let lengths = options.input_lengths.clone();

        let repository = GrantRepository::new(self.grants, self.clock.clone());
        let resource_validator = ResourceValidator::new(self.resources.clone());
        let secrets = SecretValidator::new(self.clock.clone());
        let tokens = TokenService::new(repository.clone(), self.issuer, options.issuer.clone());
        let consent = ConsentService::new(repository.clone(), options.default_consent_lifetime);

        let mut authorize_validator =
            AuthorizeRequestValidator::new(self.clients.clone(), resource_validator.clone(), &options);
        if let Some(request_objects) = self.request_objects {
            authorize_validator = authorize_validator.with_request_object_validator(request_objects);
        }

        let mut interaction = InteractionResolver::new(
            self.sessions,
            self.profile.clone(),
            consent.clone(),
            self.clock.clone(),
        );
        if let Some(customizer) = self.customizer.clone() {
            interaction = interaction.with_customizer(customizer);
        }

        let mut token_validator = TokenRequestValidator::new(
            repository.clone(),
            resource_validator.clone(),
            self.profile.clone(),
            &options,
        )
        .with_extensions(self.extensions);
        if let Some(password) = self.password {
            token_validator = token_validator.with_password_validator(password);
        }
        if let Some(throttler) = self.throttler {
            token_validator = token_validator.with_throttler(throttler);
        }

        let mut introspection = IntrospectionService::new(
            repository.clone(),
            ApiResourceAuthenticator::new(self.resources, secrets.clone()),
            self.profile.clone(),
            self.clients.clone(),
            lengths.clone(),
        );
        if let Some(verifier) = self.verifier {
            introspection = introspection.with_verifier(verifier);
        }

        Ok(GrantEngine {
            client_authenticator: ClientAuthenticator::new(self.clients, secrets, lengths.clone()),
            authorize_validator,
            interaction,
            customizer: self.customizer,
            authorize_generator: AuthorizeResponseGenerator::new(tokens.clone()),
            token_validator,
            token_generator: TokenResponseGenerator::new(tokens),
            device: DeviceAuthorizationService::new(
                repository.clone(),
                resource_validator,
                options.device_flow.clone(),
                lengths.clone(),
            ),
            revocation: RevocationService::new(repository.clone(), lengths),
            introspection,
            profile: self.profile,
            consent,
            repository,
            audit: self.audit,
            clock: self.clock,
            options,
        })
    }
}

impl std::fmt::Debug for GrantEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantEngineBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// grant 引擎
#[derive(Clone)]
pub struct GrantEngine {
    options: EngineOptions,
    repository: GrantRepository,
    client_authenticator: ClientAuthenticator,
    authorize_validator: AuthorizeRequestValidator,
    interaction: InteractionResolver,
    customizer: Option<Arc<dyn InteractionCustomizer>>,
    authorize_generator: AuthorizeResponseGenerator,
    token_validator: TokenRequestValidator,
    token_generator: TokenResponseGenerator,
    device: DeviceAuthorizationService,
    revocation: RevocationService,
    introspection: IntrospectionService,
    profile: Arc<dyn ProfileService>,
    consent: ConsentService,
    audit: Arc<dyn AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl GrantEngine {
    /// 创建构建器
    ///
    /// 客户端注册表、资源注册表、grant 存储和签名协作者是必需的，其余协作者
    /// 都有默认实现
    pub fn builder(
        clients: Arc<dyn ClientStore>,
        resources: Arc<dyn ResourceStore>,
        grants: Arc<dyn GrantStore>,
        issuer: Arc<dyn TokenIssuer>,
    ) -> GrantEngineBuilder {
        GrantEngineBuilder {
            options: EngineOptions::default(),
            clients,
            resources,
            grants,
            issuer,
            clock: system_clock(),
            sessions: Arc::new(StaticSession::anonymous()),
            profile: Arc::new(DefaultProfileService::new()),
            audit: Arc::new(NoOpAuditLogger),
            password: None,
            extensions: ExtensionGrantRegistry::new(),
            throttler: None,
            request_objects: None,
            customizer: None,
            verifier: None,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// grant 仓库
    pub fn repository(&self) -> &GrantRepository {
        &self.repository
    }

    /// consent 服务
    pub fn consent(&self) -> &ConsentService {
        &self.consent
    }

    fn emit(&self, event: GrantEvent) {
        self.audit.log(event.with_timestamp(self.clock.now()));
    }

    // ========================================================================
    // 授权端点
    // ========================================================================

    /// 处理授权请求，会话来自构建时配置的 [`SessionPort`]
    pub async fn authorize(
        &self,
        ctx: &CallContext,
        request: AuthorizeRequest,
        consent: Option<&ConsentResponse>,
    ) -> AuthorizeResult {
        self.authorize_with(ctx, &self.interaction, request, consent)
            .await
    }

    /// 处理授权请求，使用宿主程序已经解析好的会话
    pub async fn authorize_with_session(
        &self,
        ctx: &CallContext,
        request: AuthorizeRequest,
        session: Option<UserSession>,
        consent: Option<&ConsentResponse>,
    ) -> AuthorizeResult {
        let mut interaction = InteractionResolver::new(
            Arc::new(StaticSession(session)),
            self.profile.clone(),
            self.consent.clone(),
            self.clock.clone(),
        );
        if let Some(customizer) = self.customizer.clone() {
            interaction = interaction.with_customizer(customizer);
        }
        self.authorize_with(ctx, &interaction, request, consent)
            .await
    }

    #[instrument(skip_all, fields(client_id = request.client_id.as_deref().unwrap_or("")))]
    async fn authorize_with(
        &self,
        ctx: &CallContext,
        interaction: &InteractionResolver,
        request: AuthorizeRequest,
        consent: Option<&ConsentResponse>,
    ) -> AuthorizeResult {
        let validated = self.authorize_validator.validate(ctx, request).await;
        let outcome = interaction.resolve(ctx, validated, consent).await;

        match &outcome.state {
            InteractionState::Authorized => {}
            InteractionState::Error(error) => {
                self.emit(GrantEvent::authorize_failed(
                    error.client_id.clone(),
                    error.error.error.as_str(),
                ));
                return AuthorizeResult::Error(error.clone());
            }
            _ => return AuthorizeResult::Interaction(outcome),
        }

        match self.authorize_generator.generate(ctx, &outcome).await {
            Ok(response) => {
                if let (Some(request), Some(session)) = (&outcome.request, &outcome.session) {
                    self.emit(GrantEvent::authorize_succeeded(
                        request.client.client_id.as_str(),
                        session.subject_id.as_str(),
                        request.response_type.as_str(),
                    ));
                }
                AuthorizeResult::Success(response)
            }
            Err(error) => {
                self.emit(GrantEvent::authorize_failed(
                    error.client_id.clone(),
                    error.error.error.as_str(),
                ));
                AuthorizeResult::Error(error)
            }
        }
    }

    // ========================================================================
    // 设备授权
    // ========================================================================

    /// 设备授权端点
    pub async fn device_authorization(
        &self,
        ctx: &CallContext,
        credentials: &ParsedSecret,
        scope: Option<&str>,
    ) -> std::result::Result<DeviceAuthorizationResponse, OAuthError> {
        let client = self.client_authenticator.authenticate(ctx, credentials).await?;
        let response = self
            .device
            .authorize_device(ctx, &client.client, scope)
            .await?;
        self.emit(GrantEvent::device_authorized(client.client_id()));
        Ok(response)
    }

    /// 用户在验证页面批准设备请求
    pub async fn approve_device(
        &self,
        ctx: &CallContext,
        user_code: &str,
        session: &UserSession,
        granted_scopes: Option<Vec<String>>,
    ) -> std::result::Result<DeviceDecision, OAuthError> {
        Ok(self
            .device
            .approve(ctx, user_code, session, granted_scopes)
            .await?)
    }

    /// 用户在验证页面拒绝设备请求
    pub async fn deny_device(
        &self,
        ctx: &CallContext,
        user_code: &str,
    ) -> std::result::Result<DeviceDecision, OAuthError> {
        Ok(self.device.deny(ctx, user_code).await?)
    }

    // ========================================================================
    // Token 端点
    // ========================================================================

    /// Token 端点：认证客户端，验证请求，签发令牌
    pub async fn token(
        &self,
        ctx: &CallContext,
        credentials: &ParsedSecret,
        params: &TokenRequestParameters,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let grant_type = params.get("grant_type").unwrap_or_default().to_string();
        let result = self.issue_token(ctx, credentials, params).await;

        match &result {
            Ok((client, subject_id, _)) => self.emit(GrantEvent::token_issued(
                client.as_str(),
                subject_id.as_deref(),
                grant_type,
            )),
            Err(error) => self.emit(GrantEvent::token_request_failed(
                credentials.id.as_str(),
                grant_type,
                error.error.as_str(),
            )),
        }
        result.map(|(_, _, response)| response)
    }

    async fn issue_token(
        &self,
        ctx: &CallContext,
        credentials: &ParsedSecret,
        params: &TokenRequestParameters,
    ) -> std::result::Result<(String, Option<String>, TokenResponse), OAuthError> {
        let client = self.client_authenticator.authenticate(ctx, credentials).await?;
        let validated = self.token_validator.validate(ctx, params, &client).await?;
        let response = self.token_generator.generate(ctx, &validated).await?;
        Ok((client.client.client_id, validated.subject_id, response))
    }

    // ========================================================================
    // 撤销与内省
    // ========================================================================

    /// 撤销端点
    ///
    /// 撤销他人的令牌在协议上成功，但会写入一条失败事件
    pub async fn revoke(
        &self,
        ctx: &CallContext,
        credentials: &ParsedSecret,
        request: &RevocationRequest,
    ) -> std::result::Result<RevocationOutcome, OAuthError> {
        let client = self.client_authenticator.authenticate(ctx, credentials).await?;
        self.revoke_for(ctx, &client, request).await
    }

    /// 以已认证的客户端身份撤销
    pub async fn revoke_for(
        &self,
        ctx: &CallContext,
        client: &AuthenticatedClient,
        request: &RevocationRequest,
    ) -> std::result::Result<RevocationOutcome, OAuthError> {
        let outcome = self.revocation.revoke(ctx, request, client).await?;
        match outcome {
            RevocationOutcome::Revoked(kind) => {
                self.emit(GrantEvent::token_revoked(client.client_id(), kind.as_str()))
            }
            RevocationOutcome::ClientMismatch(kind) => self.emit(
                GrantEvent::token_revocation_failed(client.client_id(), kind.as_str()),
            ),
            RevocationOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    /// 内省端点
    pub async fn introspect(
        &self,
        ctx: &CallContext,
        credentials: &ParsedSecret,
        request: &IntrospectionRequest,
    ) -> std::result::Result<IntrospectionResponse, IntrospectionError> {
        match self.introspection.introspect(ctx, credentials, request).await {
            Ok(response) => {
                self.emit(GrantEvent::token_introspected(
                    credentials.id.as_str(),
                    response.active,
                ));
                Ok(response)
            }
            Err(error) => {
                let code = match &error {
                    IntrospectionError::Unauthorized => "invalid_client",
                    IntrospectionError::Protocol(err) => err.error.as_str(),
                };
                self.emit(GrantEvent::token_introspection_failed(
                    credentials.id.as_str(),
                    code,
                ));
                Err(error)
            }
        }
    }

    /// 删除某主体在某客户端下的全部 grant（含 consent）
    pub async fn revoke_all_grants(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client_id: &str,
    ) -> std::result::Result<usize, OAuthError> {
        let removed = self.repository.remove_all(ctx, subject_id, client_id).await?;
        info!(client_id, removed, "grants revoked for subject");
        self.emit(GrantEvent::grants_revoked(client_id, subject_id, removed));
        Ok(removed)
    }

    /// 清理已过期的 grant
    pub async fn remove_expired(&self, ctx: &CallContext) -> std::result::Result<usize, OAuthError> {
        Ok(self.repository.remove_expired(ctx).await?)
    }
}

impl std::fmt::Debug for GrantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
