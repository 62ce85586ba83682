//! 交互决策
//!
//! 在请求通过校验之后决定下一步：要求登录、要求 consent、跳转到自定义页面、
//! 返回错误，或者直接授权。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{AuthorizeError, AuthorizeRequest, Prompt, ValidatedAuthorizeRequest};
use crate::clock::Clock;
use crate::consent::ConsentService;
use crate::context::CallContext;
use crate::error::Result;
use crate::profile::{ProfileCaller, ProfileService};
use crate::protocol::{OAuthError, OAuthErrorCode};
use crate::session::{SessionPort, UserSession};

/// 交互状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionState {
    /// 需要用户登录
    NeedsLogin,
    /// 需要用户同意
    NeedsConsent,
    /// 跳转到自定义交互页面
    Redirect(String),
    /// 错误
    Error(AuthorizeError),
    /// 可以签发响应
    Authorized,
}

/// 交互决策结果
///
/// `request` 在 consent 收窄 scope 之后反映实际授予的范围
#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub state: InteractionState,
    pub request: Option<ValidatedAuthorizeRequest>,
    pub session: Option<UserSession>,
    /// 本次是否展示过 consent 页面
    pub consent_shown: bool,
}

impl InteractionOutcome {
    fn new(state: InteractionState, request: Option<ValidatedAuthorizeRequest>) -> Self {
        Self {
            state,
            request,
            session: None,
            consent_shown: false,
        }
    }

    fn with_session(mut self, session: Option<UserSession>) -> Self {
        self.session = session;
        self
    }

    /// 是否已授权
    pub fn is_authorized(&self) -> bool {
        self.state == InteractionState::Authorized
    }

    /// 登录完成后应重新提交的请求，仅在 `NeedsLogin` 时返回
    pub fn login_return_request(&self) -> Option<AuthorizeRequest> {
        match (&self.state, &self.request) {
            (InteractionState::NeedsLogin, Some(request)) => Some(request.login_return_request()),
            _ => None,
        }
    }
}

/// 用户在 consent 页面上的选择
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentResponse {
    pub granted: bool,
    /// 同意的 scope
    #[serde(default)]
    pub scopes: Vec<String>,
    /// 是否记住本次选择
    #[serde(default)]
    pub remember: bool,
}

impl ConsentResponse {
    /// 同意给定 scope
    pub fn grant<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: true,
            scopes: scopes.into_iter().map(Into::into).collect(),
            remember: false,
        }
    }

    /// 拒绝
    pub fn deny() -> Self {
        Self {
            granted: false,
            scopes: Vec::new(),
            remember: false,
        }
    }

    /// 记住本次选择
    pub fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }
}

/// 自定义交互钩子
#[async_trait]
pub trait InteractionCustomizer: Send + Sync {
    /// 登录检查通过后调用；返回绝对 URL 时把用户重定向过去
    async fn process(
        &self,
        ctx: &CallContext,
        request: &ValidatedAuthorizeRequest,
        session: &UserSession,
    ) -> Result<Option<String>>;
}

/// 交互决策器
#[derive(Clone)]
pub struct InteractionResolver {
    sessions: Arc<dyn SessionPort>,
    profile: Arc<dyn ProfileService>,
    consent: ConsentService,
    clock: Arc<dyn Clock>,
    customizer: Option<Arc<dyn InteractionCustomizer>>,
}

impl InteractionResolver {
    /// 创建决策器
    pub fn new(
        sessions: Arc<dyn SessionPort>,
        profile: Arc<dyn ProfileService>,
        consent: ConsentService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            profile,
            consent,
            clock,
            customizer: None,
        }
    }

    /// 设置自定义交互钩子
    pub fn with_customizer(mut self, customizer: Arc<dyn InteractionCustomizer>) -> Self {
        self.customizer = Some(customizer);
        self
    }

    /// 决定下一步交互
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        ctx: &CallContext,
        request: std::result::Result<ValidatedAuthorizeRequest, AuthorizeError>,
        consent: Option<&ConsentResponse>,
    ) -> InteractionOutcome {
        let request = match request {
            Ok(request) => request,
            Err(error) => return InteractionOutcome::new(InteractionState::Error(error), None),
        };

        match self.resolve_validated(ctx, request.clone(), consent).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let error = AuthorizeError::for_request(err.into(), &request);
                InteractionOutcome::new(InteractionState::Error(error), Some(request))
            }
        }
    }

    async fn resolve_validated(
        &self,
        ctx: &CallContext,
        mut request: ValidatedAuthorizeRequest,
        consent: Option<&ConsentResponse>,
    ) -> Result<InteractionOutcome> {
        let session = ctx.run(self.sessions.current_session(ctx)).await?;
        let prompt_none = request.has_prompt(Prompt::None);

        let reason = self.login_reason(ctx, &request, session.as_ref()).await?;
        let session = match (reason, session) {
            (None, Some(session)) => session,
            (reason, session) => {
                debug!(reason = reason.unwrap_or("no session"), "login required");
                let state = if prompt_none {
                    InteractionState::Error(AuthorizeError::for_request(
                        OAuthError::new(OAuthErrorCode::LoginRequired)
                            .with_description("User is not logged in"),
                        &request,
                    ))
                } else {
                    InteractionState::NeedsLogin
                };
                return Ok(InteractionOutcome::new(state, Some(request)).with_session(session));
            }
        };

        if let Some(customizer) = &self.customizer {
            if let Some(target) = ctx
                .run(customizer.process(ctx, &request, &session))
                .await?
            {
                let state = match Url::parse(&target) {
                    Err(_) => {
                        warn!("custom interaction returned an invalid URL");
                        InteractionState::Error(AuthorizeError::for_request(
                            OAuthError::server_error(),
                            &request,
                        ))
                    }
                    Ok(_) if prompt_none => InteractionState::Error(AuthorizeError::for_request(
                        OAuthError::new(OAuthErrorCode::InteractionRequired),
                        &request,
                    )),
                    Ok(_) => InteractionState::Redirect(target),
                };
                return Ok(InteractionOutcome::new(state, Some(request)).with_session(Some(session)));
            }
        }

        let mut consent_shown = false;
        if let Some(response) = consent {
            if let Err(error) = self
                .apply_consent(ctx, &mut request, &session, response)
                .await?
            {
                let state = InteractionState::Error(AuthorizeError::for_request(error, &request));
                return Ok(InteractionOutcome::new(state, Some(request)).with_session(Some(session)));
            }
            consent_shown = true;
        } else if self.consent_required(ctx, &request, &session).await? {
            let state = if prompt_none {
                InteractionState::Error(AuthorizeError::for_request(
                    OAuthError::new(OAuthErrorCode::ConsentRequired),
                    &request,
                ))
            } else {
                InteractionState::NeedsConsent
            };
            return Ok(InteractionOutcome::new(state, Some(request)).with_session(Some(session)));
        }

        info!(client_id = %request.client.client_id, "authorize request authorized");
        Ok(InteractionOutcome {
            state: InteractionState::Authorized,
            request: Some(request),
            session: Some(session),
            consent_shown,
        })
    }

    async fn login_reason(
        &self,
        ctx: &CallContext,
        request: &ValidatedAuthorizeRequest,
        session: Option<&UserSession>,
    ) -> Result<Option<&'static str>> {
        let Some(session) = session else {
            return Ok(Some("no session"));
        };

        if request.has_prompt(Prompt::Login) || request.has_prompt(Prompt::SelectAccount) {
            return Ok(Some("prompt"));
        }

        let active = ctx
            .run(self.profile.is_active(
                ctx,
                &session.subject_id,
                &request.client,
                ProfileCaller::AuthorizeEndpoint,
            ))
            .await?;
        if !active {
            return Ok(Some("inactive subject"));
        }

        let now = self.clock.now();
        if let Some(max_age) = request.max_age {
            if session.auth_time + Duration::seconds(max_age) < now {
                return Ok(Some("max_age exceeded"));
            }
        }

        if session.identity_provider != UserSession::LOCAL_IDP
            && !request
                .client
                .allows_identity_provider(&session.identity_provider)
        {
            return Ok(Some("identity provider not allowed"));
        }

        if let Some(lifetime) = request.client.user_sso_lifetime {
            if session.auth_time + Duration::seconds(lifetime) < now {
                return Ok(Some("user_sso_lifetime exceeded"));
            }
        }

        Ok(None)
    }

    async fn consent_required(
        &self,
        ctx: &CallContext,
        request: &ValidatedAuthorizeRequest,
        session: &UserSession,
    ) -> Result<bool> {
        if !request.client.require_consent {
            return Ok(false);
        }
        if request.has_prompt(Prompt::Consent) {
            return Ok(true);
        }
        self.consent
            .requires_consent(
                ctx,
                &session.subject_id,
                &request.client,
                &request.requested_scopes,
            )
            .await
    }

    /// 应用 consent 响应；协议错误作为内层 `Err` 返回
    async fn apply_consent(
        &self,
        ctx: &CallContext,
        request: &mut ValidatedAuthorizeRequest,
        session: &UserSession,
        response: &ConsentResponse,
    ) -> Result<std::result::Result<(), OAuthError>> {
        if !response.granted {
            info!(client_id = %request.client.client_id, "user denied consent");
            return Ok(Err(OAuthError::access_denied("User denied consent")));
        }

        let mut granted = request.resources.required_scope_names();
        for scope in &response.scopes {
            if !granted.contains(scope) {
                granted.push(scope.clone());
            }
        }

        if response.scopes.is_empty() {
            return Ok(Err(OAuthError::access_denied("No scopes were consented")));
        }
        if !granted.iter().all(|s| request.requested_scopes.contains(s)) {
            return Ok(Err(OAuthError::invalid_scope(
                "Consented scopes exceed the requested scopes",
            )));
        }

        request.resources = request.resources.filter(&granted);
        request.requested_scopes = granted;
        request.mark_consent_completed();

        if response.remember {
            self.consent
                .remember(
                    ctx,
                    &session.subject_id,
                    &request.client,
                    &request.requested_scopes,
                )
                .await?;
        }
        Ok(Ok(()))
    }
}

impl std::fmt::Debug for InteractionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionResolver")
            .field("consent", &self.consent)
            .field("customizer", &self.customizer.is_some())
            .finish_non_exhaustive()
    }
}
