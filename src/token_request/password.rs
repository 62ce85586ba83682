//! `password` 授权（资源所有者密码凭证）

use async_trait::async_trait;
use tracing::warn;

use super::{
    GrantContext, GrantValidationResult, TokenRequestParameters, TokenRequestValidator,
    ValidatedTokenRequest, bounded,
};
use crate::client::{Client, GrantType};
use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::OAuthError;

/// 用户名与密码的校验协作者
#[async_trait]
pub trait ResourceOwnerPasswordValidator: Send + Sync {
    /// 校验凭证；失败时返回 [`GrantValidationResult::Error`]
    async fn validate(
        &self,
        ctx: &CallContext,
        client: &Client,
        username: &str,
        password: &str,
    ) -> Result<GrantValidationResult>;
}

impl TokenRequestValidator {
    pub(super) async fn validate_password(
        &self,
        ctx: &CallContext,
        params: &TokenRequestParameters,
        client: &Client,
    ) -> std::result::Result<ValidatedTokenRequest, OAuthError> {
        let Some(validator) = self.password.clone() else {
            warn!("password grant requested but no validator is configured");
            return Err(OAuthError::unsupported_grant_type());
        };

        let username = bounded(params, "username", self.lengths.username)?;
        let password = match params.get_raw("password") {
            None => return Err(OAuthError::invalid_request("password is missing")),
            Some(p) if p.len() > self.lengths.password => {
                return Err(OAuthError::invalid_request("password is too long"));
            }
            Some(p) => p,
        };

        let scopes = self
            .requested_scopes(params)?
            .unwrap_or_else(|| client.allowed_scopes.clone());
        let resources = self.resolve_scopes(ctx, client, &scopes).await?;
        if resources.is_empty() {
            return Err(OAuthError::invalid_scope("No valid scopes requested"));
        }

        let result = ctx
            .run(validator.validate(ctx, client, username, password))
            .await?;
        let (subject_id, claims) = match result {
            GrantValidationResult::Success {
                subject_id: Some(subject_id),
                claims,
            } => (subject_id, claims),
            GrantValidationResult::Success {
                subject_id: None, ..
            } => {
                warn!("password validator succeeded without a subject");
                return Err(OAuthError::invalid_grant("Invalid username or password"));
            }
            GrantValidationResult::Error(error) => {
                warn!(error = %error.error, "resource owner credentials rejected");
                return Err(error);
            }
        };

        self.ensure_active(ctx, &subject_id, client).await?;

        Ok(ValidatedTokenRequest {
            client: client.clone(),
            grant_type: GrantType::Password,
            subject_id: Some(subject_id),
            session_id: None,
            resources,
            confirmation: None,
            auth_time: Some(self.repository.now()),
            context: GrantContext::Password { claims },
        })
    }
}
